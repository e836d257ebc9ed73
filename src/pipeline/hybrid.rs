// ABOUTME: Hybrid sync engine - conditional pulls plus periodic full reconciliation
// ABOUTME: Keeps an in-process mirror per pipeline and self-heals missed updates

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::record::Record;
use crate::source::SourceAdapter;
use crate::utils::with_timeout;

/// Result of one hybrid pull.
#[derive(Debug, Default)]
pub struct HybridPull {
    /// New or changed records, ascending by key
    pub records: Vec<Record>,
    /// Rows returned by the source before diffing
    pub fetched: usize,
    /// Whether this was a full reconciliation
    pub full: bool,
    /// Mirror entries dropped because the source no longer has them
    pub removed: usize,
    /// Set when the source could not be read; `records` is then empty
    pub error: Option<String>,
}

/// Full/incremental puller for sources without a reliable cursor.
///
/// The mirror holds the last *loaded* state of every entity. Pulls only diff
/// against it; the pipeline commits records with [`HybridSyncEngine::accept`]
/// after they reach the sink, so anything that failed to load is detected again.
#[derive(Debug)]
pub struct HybridSyncEngine {
    entity_type: String,
    mirror: HashMap<String, Record>,
    /// Highest event time committed to the mirror
    high_water: Option<DateTime<Utc>>,
    last_full_sync: Option<Instant>,
    full_sync_interval: Duration,
    compare_event_time: bool,
    io_timeout: Duration,
}

impl HybridSyncEngine {
    pub fn new(
        entity_type: &str,
        full_sync_interval: Duration,
        compare_event_time: bool,
        io_timeout: Duration,
    ) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            mirror: HashMap::new(),
            high_water: None,
            last_full_sync: None,
            full_sync_interval,
            compare_event_time,
            io_timeout,
        }
    }

    /// Drop the mirror; the next pull is a full one that emits every row.
    pub fn reset(&mut self) {
        self.mirror.clear();
        self.high_water = None;
        self.last_full_sync = None;
    }

    pub fn mirror_len(&self) -> usize {
        self.mirror.len()
    }

    pub fn mirrored(&self, entity_id: &str) -> Option<&Record> {
        self.mirror.get(entity_id)
    }

    pub fn full_sync_due(&self, now: Instant) -> bool {
        match self.last_full_sync {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.full_sync_interval,
        }
    }

    /// Pull from the source, choosing a full reconciliation when one is due.
    ///
    /// Never fails: source errors are logged and reported in `HybridPull::error`.
    pub async fn pull(&mut self, source: &dyn SourceAdapter, now: Instant) -> HybridPull {
        if self.full_sync_due(now) {
            self.pull_full(source, now).await
        } else {
            self.pull_changed(source).await
        }
    }

    async fn pull_full(&mut self, source: &dyn SourceAdapter, now: Instant) -> HybridPull {
        let rows = match with_timeout("fetch_all", self.io_timeout, source.fetch_all()).await {
            Ok(rows) => rows,
            Err(e) => return self.failed_pull(source, true, e),
        };

        let present: HashSet<&str> = rows.iter().map(|r| r.entity_id.as_str()).collect();
        let before = self.mirror.len();
        self.mirror.retain(|id, _| present.contains(id.as_str()));
        let removed = before - self.mirror.len();

        let fetched = rows.len();
        let records = self.diff(rows);
        self.last_full_sync = Some(now);

        tracing::info!(
            "Full reconciliation of {} from {}: {} rows, {} changed, {} dropped from mirror",
            self.entity_type,
            source.name(),
            fetched,
            records.len(),
            removed
        );

        HybridPull {
            records,
            fetched,
            full: true,
            removed,
            error: None,
        }
    }

    async fn pull_changed(&mut self, source: &dyn SourceAdapter) -> HybridPull {
        let since = self.high_water.unwrap_or_default();
        let rows = match with_timeout(
            "fetch_changed_since",
            self.io_timeout,
            source.fetch_changed_since(since),
        )
        .await
        {
            Ok(rows) => rows,
            Err(e) => return self.failed_pull(source, false, e),
        };

        let fetched = rows.len();
        let records = self.diff(rows);
        tracing::debug!(
            "Conditional pull of {} since {}: {} rows, {} changed",
            self.entity_type,
            since.to_rfc3339(),
            fetched,
            records.len()
        );

        HybridPull {
            records,
            fetched,
            full: false,
            removed: 0,
            error: None,
        }
    }

    fn failed_pull(&self, source: &dyn SourceAdapter, full: bool, e: anyhow::Error) -> HybridPull {
        tracing::error!(
            "{} pull of {} from {} failed: {:?}",
            if full { "Full" } else { "Conditional" },
            self.entity_type,
            source.name(),
            e
        );
        HybridPull {
            full,
            error: Some(format!("{:#}", e)),
            ..HybridPull::default()
        }
    }

    /// Rows that are absent from the mirror or differ from their mirrored state.
    fn diff(&self, mut rows: Vec<Record>) -> Vec<Record> {
        rows.retain(|row| match self.mirror.get(&row.entity_id) {
            Some(known) => !known.same_as(row, self.compare_event_time),
            None => true,
        });
        rows.sort_by_key(Record::key);
        rows
    }

    /// Commit loaded records to the mirror.
    pub fn accept(&mut self, records: &[Record]) {
        for record in records {
            self.high_water = Some(match self.high_water {
                Some(hw) => hw.max(record.event_time),
                None => record.event_time,
            });
            self.mirror.insert(record.entity_id.clone(), record.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemorySource;
    use chrono::TimeZone;

    fn pod(id: &str, secs: i64, state: &str) -> Record {
        Record::new(id, Utc.timestamp_opt(secs, 0).unwrap()).with_field("state", state)
    }

    fn engine() -> HybridSyncEngine {
        HybridSyncEngine::new("pod", Duration::from_secs(600), true, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_first_pull_is_full_and_emits_everything() {
        let source = MemorySource::new("pods");
        source
            .upsert_all([pod("P1", 1, "IDLE"), pod("P2", 2, "IDLE")])
            .await;

        let mut engine = engine();
        let pull = engine.pull(&source, Instant::now()).await;

        assert!(pull.full);
        assert_eq!(pull.records.len(), 2);
        assert_eq!(source.full_pulls(), 1);
        // Nothing is mirrored until the records are accepted
        assert_eq!(engine.mirror_len(), 0);
    }

    #[tokio::test]
    async fn test_full_reconciliation_heals_missed_update() {
        let source = MemorySource::new("pods");
        source.upsert(pod("X", 1, "S1")).await;

        let mut engine = engine();
        let t0 = Instant::now();
        let pull = engine.pull(&source, t0).await;
        engine.accept(&pull.records);
        assert_eq!(engine.mirrored("X").unwrap().field("state"), pod("X", 1, "S1").field("state"));

        // The conditional query misses X's update
        source.upsert(pod("X", 2, "S2")).await;
        source.hide_from_incremental("X").await;
        let pull = engine.pull(&source, t0 + Duration::from_secs(60)).await;
        assert!(!pull.full);
        assert!(pull.records.is_empty());

        // The next scheduled full pass emits it exactly once
        let pull = engine.pull(&source, t0 + Duration::from_secs(601)).await;
        assert!(pull.full);
        assert_eq!(pull.records, vec![pod("X", 2, "S2")]);
        engine.accept(&pull.records);
        assert_eq!(engine.mirrored("X"), Some(&pod("X", 2, "S2")));

        source.reveal("X").await;
        let pull = engine.pull(&source, t0 + Duration::from_secs(660)).await;
        assert!(!pull.full);
        assert!(pull.records.is_empty());
    }

    #[tokio::test]
    async fn test_unaccepted_record_is_detected_again() {
        let source = MemorySource::new("pods");
        source.upsert(pod("A", 1, "IDLE")).await;

        let mut engine = engine();
        let t0 = Instant::now();
        let pull = engine.pull(&source, t0).await;
        engine.accept(&pull.records);

        source.upsert(pod("A", 5, "BUSY")).await;
        let pull = engine.pull(&source, t0 + Duration::from_secs(1)).await;
        assert_eq!(pull.records.len(), 1);

        // Load failed: not accepted, so the following pull still sees the change
        let pull = engine.pull(&source, t0 + Duration::from_secs(2)).await;
        assert_eq!(pull.records, vec![pod("A", 5, "BUSY")]);
    }

    #[tokio::test]
    async fn test_full_reconciliation_drops_deleted_entities() {
        let source = MemorySource::new("pods");
        source.upsert_all([pod("A", 1, "IDLE"), pod("B", 1, "IDLE")]).await;

        let mut engine = engine();
        let t0 = Instant::now();
        let pull = engine.pull(&source, t0).await;
        engine.accept(&pull.records);

        source.remove("B").await;
        let pull = engine.pull(&source, t0 + Duration::from_secs(600)).await;

        assert!(pull.full);
        assert_eq!(pull.removed, 1);
        assert!(pull.records.is_empty());
        assert_eq!(engine.mirror_len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_source_returns_empty_pull() {
        let source = MemorySource::new("pods");
        source.set_available(false).await;

        let mut engine = engine();
        let pull = engine.pull(&source, Instant::now()).await;

        assert!(pull.records.is_empty());
        assert!(pull.error.is_some());
        // A failed full pull does not count as a reconciliation
        assert!(engine.full_sync_due(Instant::now()));
    }

    #[tokio::test]
    async fn test_event_time_only_change_respects_comparison_policy() {
        let source = MemorySource::new("pods");
        source.upsert(pod("A", 1, "IDLE")).await;

        let mut ignoring_time =
            HybridSyncEngine::new("pod", Duration::from_secs(600), false, Duration::from_secs(5));
        let t0 = Instant::now();
        let pull = ignoring_time.pull(&source, t0).await;
        ignoring_time.accept(&pull.records);

        source.upsert(pod("A", 9, "IDLE")).await;
        let pull = ignoring_time.pull(&source, t0 + Duration::from_secs(1)).await;
        assert!(pull.records.is_empty());
    }
}
