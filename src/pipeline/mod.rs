// ABOUTME: Generic extract -> detect -> load pipeline shared by every entity type
// ABOUTME: Tracks lifecycle state, connectivity and cumulative run statistics

mod events;
pub mod hybrid;
mod watermark;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::cache::{CacheAdapter, SnapshotCache};
use crate::detector::{ChangeCriteria, ChangeDetector};
use crate::error::SyncError;
use crate::offset::{Offset, OffsetStore};
use crate::record::{Record, RecordKey};
use crate::sink::{EventPublisher, PublishMode, SinkAdapter};
use crate::source::SourceAdapter;
use crate::utils::with_timeout;

use events::EventQueue;

pub use hybrid::{HybridPull, HybridSyncEngine};
pub use watermark::advance_offset;

/// Lifecycle state of one pipeline instance. Not persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineState {
    Stopped,
    Running,
    Error,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Stopped => "STOPPED",
            EngineState::Running => "RUNNING",
            EngineState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Cumulative counters, safe to read from control-surface calls at any time.
#[derive(Debug, Default)]
pub struct PipelineStats {
    total_extracted: AtomicU64,
    total_loaded: AtomicU64,
    total_execution_time_ms: AtomicU64,
    runs: AtomicU64,
    last_execution_time: Mutex<Option<DateTime<Utc>>>,
}

impl PipelineStats {
    fn record_run(&self, extracted: usize, loaded: usize, elapsed: Duration) {
        self.total_extracted
            .fetch_add(extracted as u64, Ordering::Relaxed);
        self.total_loaded.fetch_add(loaded as u64, Ordering::Relaxed);
        self.total_execution_time_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
        self.runs.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut last) = self.last_execution_time.lock() {
            *last = Some(Utc::now());
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let total_execution_time_ms = self.total_execution_time_ms.load(Ordering::Relaxed);
        let runs = self.runs.load(Ordering::Relaxed);
        let average_processing_time_ms = if runs == 0 {
            0.0
        } else {
            total_execution_time_ms as f64 / runs as f64
        };

        StatsSnapshot {
            total_extracted: self.total_extracted.load(Ordering::Relaxed),
            total_loaded: self.total_loaded.load(Ordering::Relaxed),
            total_execution_time_ms,
            runs,
            average_processing_time_ms,
            last_execution_time: self.last_execution_time.lock().ok().and_then(|t| *t),
        }
    }
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub total_extracted: u64,
    pub total_loaded: u64,
    pub total_execution_time_ms: u64,
    pub runs: u64,
    pub average_processing_time_ms: f64,
    pub last_execution_time: Option<DateTime<Utc>>,
}

/// How a pipeline extracts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    /// Cursor over `(event_time, entity_id)`, persisted in the offset store
    Watermark,
    /// Conditional pulls plus a full reconciliation every `full_sync_interval`
    Hybrid { full_sync_interval: Duration },
}

impl Strategy {
    pub fn name(&self) -> &'static str {
        match self {
            Strategy::Watermark => "watermark",
            Strategy::Hybrid { .. } => "hybrid",
        }
    }
}

/// Static description of one entity pipeline.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Job name; keys the offset and names the pipeline in logs and control calls
    pub name: String,
    /// Entity type; names the snapshot namespace together with the job name
    pub entity_type: String,
    pub strategy: Strategy,
    pub criteria: ChangeCriteria,
    /// Whether the entity's reported time is part of "same data"
    pub compare_event_time: bool,
    pub topic: String,
    pub publish_mode: PublishMode,
    pub page_size: usize,
    /// Page cap for one incremental pass; bootstrap passes are not capped
    pub max_pages_per_run: usize,
    pub io_timeout: Duration,
    pub cache_prefix: String,
}

impl PipelineSettings {
    pub fn new(name: &str, entity_type: &str) -> Self {
        Self {
            name: name.to_string(),
            entity_type: entity_type.to_string(),
            strategy: Strategy::Watermark,
            criteria: ChangeCriteria::Fields(Default::default()),
            compare_event_time: false,
            topic: entity_type.to_string(),
            publish_mode: PublishMode::FireAndForget,
            page_size: 1000,
            max_pages_per_run: 10,
            io_timeout: Duration::from_secs(30),
            cache_prefix: "wsync".to_string(),
        }
    }
}

/// Which extraction a run performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Resume from the persisted offset (watermark) or conditional pull (hybrid)
    Incremental,
    /// Extract everything, bypassing the stored watermark
    Bootstrap,
}

/// What one run did.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub mode: RunMode,
    pub extracted: usize,
    pub suppressed: usize,
    #[serde(skip)]
    pub accepted: Vec<Record>,
    pub accepted_count: usize,
    /// Watermark after the run
    pub offset: Option<RecordKey>,
    /// Set when extraction failed; the run then loaded nothing new
    pub extraction_error: Option<String>,
}

/// Diagnostic view of a pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub name: String,
    pub entity_type: String,
    pub strategy: &'static str,
    pub state: EngineState,
    pub connected: bool,
    pub stats: StatsSnapshot,
    pub offset: Option<Offset>,
    pub snapshot_namespace: String,
    /// Snapshot cache entries (watermark) or mirror entries (hybrid)
    pub cached_entities: Option<u64>,
}

enum Extraction {
    Watermark,
    Hybrid(HybridSyncEngine),
}

/// Accumulates what a run has done so far, including when it fails part way.
#[derive(Default)]
struct Progress {
    extracted: usize,
    suppressed: usize,
    accepted: Vec<Record>,
    offset: Option<RecordKey>,
    extraction_error: Option<String>,
}

/// Result of pushing one batch through the load stage.
struct LoadedBatch {
    loaded: Vec<Record>,
    /// Key of the last record loaded or suppressed before any failure
    safe_key: Option<RecordKey>,
    /// Records processed up to `safe_key`
    processed: usize,
    failure: Option<anyhow::Error>,
}

/// One entity pipeline: source, change detection, sink and publisher wired together.
pub struct EtlPipeline {
    settings: PipelineSettings,
    source: Arc<dyn SourceAdapter>,
    sink: Arc<dyn SinkAdapter>,
    events: Option<EventQueue>,
    offsets: Arc<dyn OffsetStore>,
    snapshots: SnapshotCache,
    detector: ChangeDetector,
    extraction: tokio::sync::Mutex<Extraction>,
    state: Mutex<EngineState>,
    connected: AtomicBool,
    stats: PipelineStats,
}

impl EtlPipeline {
    pub fn new(
        settings: PipelineSettings,
        source: Arc<dyn SourceAdapter>,
        sink: Arc<dyn SinkAdapter>,
        cache: Arc<dyn CacheAdapter>,
        offsets: Arc<dyn OffsetStore>,
    ) -> Self {
        let snapshots = SnapshotCache::new(
            cache,
            &settings.cache_prefix,
            &settings.entity_type,
            &settings.name,
        );
        let detector = ChangeDetector::new(settings.criteria.clone(), settings.compare_event_time);
        let extraction = match &settings.strategy {
            Strategy::Watermark => Extraction::Watermark,
            Strategy::Hybrid { full_sync_interval } => Extraction::Hybrid(HybridSyncEngine::new(
                &settings.entity_type,
                *full_sync_interval,
                settings.compare_event_time,
                settings.io_timeout,
            )),
        };

        Self {
            settings,
            source,
            sink,
            events: None,
            offsets,
            snapshots,
            detector,
            extraction: tokio::sync::Mutex::new(extraction),
            state: Mutex::new(EngineState::Stopped),
            connected: AtomicBool::new(false),
            stats: PipelineStats::default(),
        }
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(EventQueue::new(
            &self.settings.name,
            &self.settings.topic,
            self.settings.publish_mode,
            self.settings.io_timeout,
            publisher,
        ));
        self
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn state(&self) -> EngineState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(EngineState::Error)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Single entry point for lifecycle changes.
    fn transition(&self, next: EngineState) {
        let previous = match self.state.lock() {
            Ok(mut state) => std::mem::replace(&mut *state, next),
            Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), next),
        };
        if previous != next {
            tracing::debug!("Pipeline {}: {} -> {}", self.settings.name, previous, next);
        }
    }

    /// Fail the pipeline after a run the caller treats as unsuccessful.
    pub(crate) fn mark_failed(&self) {
        self.transition(EngineState::Error);
    }

    fn set_connected(&self, connected: bool) {
        let was = self.connected.swap(connected, Ordering::Relaxed);
        if was && !connected {
            tracing::warn!("Pipeline {} lost connectivity", self.settings.name);
        }
    }

    /// True only while a run is in progress and both ends answer a health check.
    pub async fn is_healthy(&self) -> bool {
        self.state() == EngineState::Running && self.check_connectivity().await
    }

    /// Health-check source and sink, updating the connectivity flag.
    pub async fn check_connectivity(&self) -> bool {
        let timeout = self.settings.io_timeout;
        let source = with_timeout("source health check", timeout, self.source.health_check()).await;
        let sink = with_timeout("sink health check", timeout, self.sink.health_check()).await;
        let healthy = source.is_ok() && sink.is_ok();
        self.set_connected(healthy);
        healthy
    }

    /// Connectivity and schema pre-checks run before the first load.
    ///
    /// On failure the pipeline is left in `ERROR`.
    pub async fn preflight(&self) -> Result<()> {
        let result = self.run_preflight().await;
        match &result {
            Ok(()) => {
                self.set_connected(true);
                tracing::info!(
                    "Pipeline {} pre-checks passed ({} -> {})",
                    self.settings.name,
                    self.source.name(),
                    self.sink.name()
                );
            }
            Err(e) => {
                if crate::error::is_transient(e) {
                    self.set_connected(false);
                }
                self.transition(EngineState::Error);
            }
        }
        result
    }

    async fn run_preflight(&self) -> Result<()> {
        let timeout = self.settings.io_timeout;

        with_timeout("source health check", timeout, self.source.health_check())
            .await
            .map_err(|e| SyncError::Connectivity {
                component: "source",
                reason: format!("{:#}", e),
            })?;
        let exists = with_timeout("source table check", timeout, self.source.table_exists())
            .await
            .context("Failed to check source table")?;
        if !exists {
            return Err(SyncError::SchemaMissing(self.source.name().to_string()).into());
        }

        with_timeout("sink health check", timeout, self.sink.health_check())
            .await
            .map_err(|e| SyncError::Connectivity {
                component: "sink",
                reason: format!("{:#}", e),
            })?;
        let exists = with_timeout("sink table check", timeout, self.sink.table_exists())
            .await
            .context("Failed to check sink table")?;
        if !exists {
            return Err(SyncError::SchemaMissing(self.sink.name().to_string()).into());
        }

        Ok(())
    }

    /// Persisted resume point, if this pipeline has one.
    ///
    /// Hybrid pipelines keep their state in process and never have one.
    pub async fn resume_point(&self) -> Result<Option<Offset>> {
        match self.settings.strategy {
            Strategy::Watermark => self.offsets.get(&self.settings.name).await,
            Strategy::Hybrid { .. } => Ok(None),
        }
    }

    /// Run one extract -> detect -> load pass.
    ///
    /// Extraction failures do not fail the run: they come back as an empty outcome
    /// with `extraction_error` set. A failed load returns `SyncError::PartialLoad`
    /// after the offset has been moved to the last safe record.
    pub async fn run(&self, mode: RunMode) -> Result<RunOutcome> {
        self.transition(EngineState::Running);
        let start = Instant::now();
        let mut progress = Progress::default();

        let result = {
            let mut extraction = self.extraction.lock().await;
            match &mut *extraction {
                Extraction::Watermark => self.run_watermark(mode, &mut progress).await,
                Extraction::Hybrid(engine) => self.run_hybrid(engine, mode, &mut progress).await,
            }
        };

        let elapsed = start.elapsed();
        self.stats
            .record_run(progress.extracted, progress.accepted.len(), elapsed);

        match result {
            Ok(()) => {
                self.transition(EngineState::Stopped);
                if progress.extracted > 0 {
                    tracing::info!(
                        "Pipeline {} {:?} run: {} extracted, {} loaded, {} unchanged in {}ms",
                        self.settings.name,
                        mode,
                        progress.extracted,
                        progress.accepted.len(),
                        progress.suppressed,
                        elapsed.as_millis()
                    );
                }
                Ok(RunOutcome {
                    mode,
                    extracted: progress.extracted,
                    suppressed: progress.suppressed,
                    accepted_count: progress.accepted.len(),
                    accepted: progress.accepted,
                    offset: progress.offset,
                    extraction_error: progress.extraction_error,
                })
            }
            Err(e) => {
                self.transition(EngineState::Error);
                tracing::error!("Pipeline {} {:?} run failed: {:?}", self.settings.name, mode, e);
                Err(e)
            }
        }
    }

    async fn run_hybrid(
        &self,
        engine: &mut HybridSyncEngine,
        mode: RunMode,
        progress: &mut Progress,
    ) -> Result<()> {
        if mode == RunMode::Bootstrap {
            engine.reset();
        }

        let pull = engine.pull(self.source.as_ref(), Instant::now()).await;
        progress.extracted += pull.fetched;
        if let Some(error) = pull.error {
            self.set_connected(false);
            progress.extraction_error = Some(error);
            return Ok(());
        }
        self.set_connected(true);

        let batch = self.load_batch(&pull.records, false, progress).await;
        engine.accept(&batch.loaded);
        progress.accepted.extend(batch.loaded);

        match batch.failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Load stage: detect, upsert, publish, in extraction order.
    ///
    /// Stops at the first failed upsert. Everything before it stays loaded and is
    /// reflected in `safe_key`; nothing after it is touched.
    async fn load_batch(&self, records: &[Record], detect: bool, progress: &mut Progress) -> LoadedBatch {
        let mut batch = LoadedBatch {
            loaded: Vec::new(),
            safe_key: None,
            processed: 0,
            failure: None,
        };
        let timeout = self.settings.io_timeout;

        for record in records {
            if detect {
                let emit = match self.detector.evaluate(&self.snapshots, record).await {
                    Ok(emit) => emit,
                    Err(e) => {
                        batch.failure = Some(self.partial_load(&batch, records.len(), record, e));
                        break;
                    }
                };
                if !emit {
                    progress.suppressed += 1;
                    batch.safe_key = Some(record.key());
                    batch.processed += 1;
                    continue;
                }
            }

            if let Err(e) = with_timeout("upsert", timeout, self.sink.upsert(record)).await {
                batch.failure = Some(self.partial_load(&batch, records.len(), record, e));
                break;
            }

            self.publish(record).await;

            if detect {
                if let Err(e) = self.detector.accept(&self.snapshots, record).await {
                    tracing::warn!(
                        "Failed to cache snapshot of {} in {}: {:?}",
                        record.entity_id,
                        self.snapshots.namespace(),
                        e
                    );
                }
            }

            batch.safe_key = Some(record.key());
            batch.processed += 1;
            batch.loaded.push(record.clone());
        }

        batch
    }

    fn partial_load(
        &self,
        batch: &LoadedBatch,
        attempted: usize,
        record: &Record,
        cause: anyhow::Error,
    ) -> anyhow::Error {
        if crate::error::is_transient(&cause) {
            self.set_connected(false);
        }
        SyncError::PartialLoad {
            loaded: batch.loaded.len(),
            attempted,
            entity_id: record.entity_id.clone(),
            reason: format!("{:#}", cause),
        }
        .into()
    }

    /// Publish one loaded record. Failures are logged and never fail the batch.
    async fn publish(&self, record: &Record) {
        if let Some(events) = &self.events {
            events.publish(record).await;
        }
    }

    /// Wait for queued fire-and-forget events to be delivered.
    pub async fn flush_events(&self) {
        if let Some(events) = &self.events {
            events.flush().await;
        }
    }

    /// Forget which entity states were already emitted.
    ///
    /// Watermark pipelines flush their snapshot namespace, hybrid pipelines their
    /// mirror. The durable offset is untouched.
    pub async fn clear_snapshots(&self) -> Result<u64> {
        let mut extraction = self.extraction.lock().await;
        match &mut *extraction {
            Extraction::Watermark => self.snapshots.clear().await,
            Extraction::Hybrid(engine) => {
                let size = engine.mirror_len() as u64;
                engine.reset();
                Ok(size)
            }
        }
    }

    /// Forget the durable offset so the next pass extracts from the beginning.
    pub async fn reset_offset(&self) -> Result<bool> {
        self.offsets.clear(&self.settings.name).await
    }

    pub async fn status(&self) -> PipelineStatus {
        let offset = match self.resume_point().await {
            Ok(offset) => offset,
            Err(e) => {
                tracing::warn!("Failed to read offset of {}: {:?}", self.settings.name, e);
                None
            }
        };
        // The mirror is only readable between runs
        let cached_entities = match self.settings.strategy {
            Strategy::Watermark => self.snapshots.len().await.ok(),
            Strategy::Hybrid { .. } => match self.extraction.try_lock() {
                Ok(extraction) => match &*extraction {
                    Extraction::Hybrid(engine) => Some(engine.mirror_len() as u64),
                    Extraction::Watermark => None,
                },
                Err(_) => None,
            },
        };

        PipelineStatus {
            name: self.settings.name.clone(),
            entity_type: self.settings.entity_type.clone(),
            strategy: self.settings.strategy.name(),
            state: self.state(),
            connected: self.is_connected(),
            stats: self.stats(),
            offset,
            snapshot_namespace: self.snapshots.namespace().to_string(),
            cached_entities,
        }
    }
}
