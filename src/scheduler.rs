// ABOUTME: Per-pipeline scheduler - initialization, bootstrap, incremental ticks, reprocessing
// ABOUTME: Also resolves each pipeline's schedule from configured defaults and durable overrides

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::SyncError;
use crate::pipeline::{EtlPipeline, PipelineStatus, RunMode, RunOutcome};
use crate::postgres::PgConnection;
use crate::utils::quote_ident;

/// When and whether a pipeline runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub initial_delay: Duration,
    pub description: Option<String>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_millis(5000),
            initial_delay: Duration::ZERO,
            description: None,
        }
    }
}

/// Durable per-pipeline schedule overrides.
///
/// `Ok(None)` means "no override, use the configured default".
#[async_trait]
pub trait ScheduleConfigRepository: Send + Sync {
    async fn load(&self, pipeline: &str) -> Result<Option<ScheduleConfig>>;
}

/// Overrides held in memory (tests, or deployments without an override table).
#[derive(Debug, Clone, Default)]
pub struct StaticScheduleRepository {
    overrides: HashMap<String, ScheduleConfig>,
}

impl StaticScheduleRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_override(mut self, pipeline: &str, config: ScheduleConfig) -> Self {
        self.overrides.insert(pipeline.to_string(), config);
        self
    }
}

#[async_trait]
impl ScheduleConfigRepository for StaticScheduleRepository {
    async fn load(&self, pipeline: &str) -> Result<Option<ScheduleConfig>> {
        Ok(self.overrides.get(pipeline).cloned())
    }
}

/// Overrides read from a `sync_schedule_config` style table.
///
/// A missing table is treated like a missing row.
pub struct PostgresScheduleRepository {
    conn: Arc<PgConnection>,
    table: String,
}

impl PostgresScheduleRepository {
    pub fn new(conn: Arc<PgConnection>, table: &str) -> Result<Self> {
        crate::utils::validate_postgres_identifier(table)
            .context("Invalid schedule override table name")?;
        Ok(Self {
            conn,
            table: table.to_string(),
        })
    }
}

#[async_trait]
impl ScheduleConfigRepository for PostgresScheduleRepository {
    async fn load(&self, pipeline: &str) -> Result<Option<ScheduleConfig>> {
        let client = self.conn.client().await?;

        let exists = client
            .query_one("SELECT to_regclass($1::text) IS NOT NULL", &[&self.table])
            .await
            .context("Failed to look up schedule override table")?;
        let exists: bool = exists
            .try_get(0)
            .context("Failed to read schedule override table flag")?;
        if !exists {
            return Ok(None);
        }

        let query = format!(
            "SELECT enabled, interval_ms::bigint, initial_delay_ms::bigint, description::text \
             FROM {} WHERE pipeline_name = $1",
            quote_ident(&self.table)
        );
        let row = client
            .query_opt(&query, &[&pipeline])
            .await
            .with_context(|| format!("Failed to read schedule override for {}", pipeline))?;

        let Some(row) = row else {
            return Ok(None);
        };

        // NULL columns fall back to the built-in schedule
        let fallback = ScheduleConfig::default();
        let enabled: Option<bool> = row.try_get(0).context("Invalid enabled column")?;
        let interval_ms: Option<i64> = row.try_get(1).context("Invalid interval_ms column")?;
        let initial_delay_ms: Option<i64> =
            row.try_get(2).context("Invalid initial_delay_ms column")?;

        Ok(Some(ScheduleConfig {
            enabled: enabled.unwrap_or(fallback.enabled),
            interval: interval_ms
                .map(|ms| Duration::from_millis(ms.max(1) as u64))
                .unwrap_or(fallback.interval),
            initial_delay: initial_delay_ms
                .map(|ms| Duration::from_millis(ms.max(0) as u64))
                .unwrap_or(fallback.initial_delay),
            description: row.try_get(3).context("Invalid description column")?,
        }))
    }
}

/// What a tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TickKind {
    /// First tick: pre-checks passed, full load performed
    Bootstrap,
    /// First tick: pre-checks passed, a persisted offset exists, nothing replayed
    Resume,
    /// Forced reprocessing: snapshots cleared, full load repeated
    Reprocess,
    /// Steady state
    Incremental,
}

/// Outcome of one tick, reported to callers instead of an error.
#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    pub pipeline: String,
    pub kind: TickKind,
    pub success: bool,
    pub extracted: usize,
    pub accepted: usize,
    pub suppressed: usize,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub finished_at: DateTime<Utc>,
}

/// Diagnostic view of a scheduler and its pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub initialized: bool,
    pub force_reprocess: bool,
    pub last_processed_time: Option<DateTime<Utc>>,
    pub last_tick: Option<TickReport>,
    pub pipeline: PipelineStatus,
}

/// Drives one pipeline through its lifecycle.
///
/// Ticks are serialised by an async mutex, so a manual trigger never overlaps a
/// timer tick. The bookkeeping flags are atomics and may be read at any time.
pub struct PipelineScheduler {
    pipeline: Arc<EtlPipeline>,
    defaults: ScheduleConfig,
    schedules: Arc<dyn ScheduleConfigRepository>,
    initialized: AtomicBool,
    force_reprocess: AtomicBool,
    last_processed_time: Mutex<Option<DateTime<Utc>>>,
    last_tick: Mutex<Option<TickReport>>,
    tick_lock: tokio::sync::Mutex<()>,
}

impl PipelineScheduler {
    pub fn new(
        pipeline: Arc<EtlPipeline>,
        defaults: ScheduleConfig,
        schedules: Arc<dyn ScheduleConfigRepository>,
    ) -> Self {
        Self {
            pipeline,
            defaults,
            schedules,
            initialized: AtomicBool::new(false),
            force_reprocess: AtomicBool::new(false),
            last_processed_time: Mutex::new(None),
            last_tick: Mutex::new(None),
            tick_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        self.pipeline.name()
    }

    pub fn pipeline(&self) -> &Arc<EtlPipeline> {
        &self.pipeline
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn reprocess_requested(&self) -> bool {
        self.force_reprocess.load(Ordering::SeqCst)
    }

    pub fn last_processed_time(&self) -> Option<DateTime<Utc>> {
        self.last_processed_time.lock().ok().and_then(|t| *t)
    }

    pub fn last_tick(&self) -> Option<TickReport> {
        self.last_tick.lock().ok().and_then(|t| t.clone())
    }

    /// The schedule to run with: the durable override when present, else defaults.
    pub async fn resolve_schedule(&self) -> ScheduleConfig {
        match self.schedules.load(self.name()).await {
            Ok(Some(config)) => {
                tracing::info!(
                    "Pipeline {} uses schedule override: enabled={}, interval={:?}, initial_delay={:?}",
                    self.name(),
                    config.enabled,
                    config.interval,
                    config.initial_delay
                );
                config
            }
            Ok(None) => self.defaults.clone(),
            Err(e) => {
                tracing::warn!(
                    "Failed to load schedule override for {}, using defaults: {:?}",
                    self.name(),
                    e
                );
                self.defaults.clone()
            }
        }
    }

    /// Forget in-process bookkeeping. Durable offsets and caches are untouched.
    pub fn reset(&self) {
        self.initialized.store(false, Ordering::SeqCst);
        self.force_reprocess.store(false, Ordering::SeqCst);
        if let Ok(mut last) = self.last_processed_time.lock() {
            *last = None;
        }
    }

    /// Ask the next tick to repeat the bootstrap load.
    pub fn request_reprocess(&self) {
        tracing::info!("Reprocessing requested for pipeline {}", self.name());
        self.force_reprocess.store(true, Ordering::SeqCst);
    }

    /// Clear the pipeline's snapshots and, with `reset_offset`, its durable offset.
    ///
    /// Waits for an in-flight tick; the next tick starts over with initialization.
    pub async fn reset_cache(&self, reset_offset: bool) -> Result<ResetReport> {
        let _guard = self.tick_lock.lock().await;
        let cleared_snapshots = self.pipeline.clear_snapshots().await?;
        let offset_cleared = if reset_offset {
            self.pipeline.reset_offset().await?
        } else {
            false
        };
        self.reset();

        tracing::info!(
            "Reset pipeline {}: {} snapshots cleared, offset cleared: {}",
            self.name(),
            cleared_snapshots,
            offset_cleared
        );
        Ok(ResetReport {
            pipeline: self.name().to_string(),
            cleared_snapshots,
            offset_cleared,
        })
    }

    /// Run one tick. Never fails; the outcome is in the report.
    pub async fn tick(&self) -> TickReport {
        let _guard = self.tick_lock.lock().await;
        let start = Instant::now();

        let (kind, result) = if !self.is_initialized() {
            self.initialize().await
        } else if self.reprocess_requested() {
            (TickKind::Reprocess, self.reprocess().await)
        } else {
            (TickKind::Incremental, self.incremental().await)
        };

        let report = self.report(kind, result, start.elapsed());
        if let Ok(mut last) = self.last_tick.lock() {
            *last = Some(report.clone());
        }
        report
    }

    async fn initialize(&self) -> (TickKind, Result<Option<RunOutcome>>) {
        if let Err(e) = self.pipeline.preflight().await {
            return (TickKind::Bootstrap, Err(e.context("Initialization pre-checks failed")));
        }

        match self.pipeline.resume_point().await {
            Ok(Some(offset)) => {
                tracing::info!(
                    "Pipeline {} resumes from persisted offset {}",
                    self.name(),
                    offset.key()
                );
                self.initialized.store(true, Ordering::SeqCst);
                (TickKind::Resume, Ok(None))
            }
            Ok(None) => {
                let result = self.bootstrap().await;
                if result.is_ok() {
                    self.initialized.store(true, Ordering::SeqCst);
                }
                (TickKind::Bootstrap, result.map(Some))
            }
            Err(e) => (TickKind::Bootstrap, Err(e.context("Failed to read resume point"))),
        }
    }

    async fn reprocess(&self) -> Result<Option<RunOutcome>> {
        let cleared = self
            .pipeline
            .clear_snapshots()
            .await
            .context("Failed to clear snapshots")?;
        tracing::info!(
            "Pipeline {} reprocessing: {} snapshots cleared",
            self.name(),
            cleared
        );

        let outcome = self.bootstrap().await?;
        self.force_reprocess.store(false, Ordering::SeqCst);
        Ok(Some(outcome))
    }

    async fn bootstrap(&self) -> Result<RunOutcome> {
        let outcome = self.pipeline.run(RunMode::Bootstrap).await?;
        if let Some(error) = &outcome.extraction_error {
            self.pipeline.mark_failed();
            return Err(SyncError::Connectivity {
                component: "source",
                reason: error.clone(),
            })
            .context("Bootstrap load could not read the source");
        }
        Ok(outcome)
    }

    async fn incremental(&self) -> Result<Option<RunOutcome>> {
        let outcome = self.pipeline.run(RunMode::Incremental).await?;
        if outcome.extraction_error.is_none() {
            if let Ok(mut last) = self.last_processed_time.lock() {
                *last = Some(Utc::now());
            }
        }
        Ok(Some(outcome))
    }

    fn report(
        &self,
        kind: TickKind,
        result: Result<Option<RunOutcome>>,
        elapsed: Duration,
    ) -> TickReport {
        let mut report = TickReport {
            pipeline: self.name().to_string(),
            kind,
            success: true,
            extracted: 0,
            accepted: 0,
            suppressed: 0,
            error: None,
            duration_ms: elapsed.as_millis() as u64,
            finished_at: Utc::now(),
        };

        match result {
            Ok(outcome) => {
                if let Some(outcome) = outcome {
                    report.extracted = outcome.extracted;
                    report.accepted = outcome.accepted_count;
                    report.suppressed = outcome.suppressed;
                    if let Some(error) = outcome.extraction_error {
                        report.success = false;
                        report.error = Some(error);
                    }
                }
                if report.success {
                    tracing::info!(
                        "Pipeline {} {:?} tick: {} accepted of {} extracted in {}ms",
                        report.pipeline,
                        kind,
                        report.accepted,
                        report.extracted,
                        report.duration_ms
                    );
                } else {
                    tracing::warn!(
                        "Pipeline {} {:?} tick skipped: {}",
                        report.pipeline,
                        kind,
                        report.error.as_deref().unwrap_or("unknown error")
                    );
                }
            }
            Err(e) => {
                tracing::error!("Pipeline {} {:?} tick failed: {:?}", report.pipeline, kind, e);
                report.success = false;
                report.error = Some(format!("{:#}", e));
            }
        }

        report
    }

    pub async fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            initialized: self.is_initialized(),
            force_reprocess: self.reprocess_requested(),
            last_processed_time: self.last_processed_time(),
            last_tick: self.last_tick(),
            pipeline: self.pipeline.status().await,
        }
    }
}

/// What a cache reset removed.
#[derive(Debug, Clone, Serialize)]
pub struct ResetReport {
    pub pipeline: String,
    pub cleared_snapshots: u64,
    pub offset_cleared: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_repository_override_and_miss() {
        let repo = StaticScheduleRepository::new().with_override(
            "robots",
            ScheduleConfig {
                enabled: false,
                interval: Duration::from_secs(60),
                initial_delay: Duration::from_secs(5),
                description: Some("paused for maintenance".to_string()),
            },
        );

        let config = repo.load("robots").await.unwrap().unwrap();
        assert!(!config.enabled);
        assert_eq!(config.interval, Duration::from_secs(60));
        assert!(repo.load("pods").await.unwrap().is_none());
    }

    #[test]
    fn test_schedule_config_default() {
        let config = ScheduleConfig::default();
        assert!(config.enabled);
        assert_eq!(config.interval, Duration::from_millis(5000));
        assert_eq!(config.initial_delay, Duration::ZERO);
    }

    #[test]
    fn test_tick_kind_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&TickKind::Incremental).unwrap(),
            "\"incremental\""
        );
    }
}
