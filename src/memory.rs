// ABOUTME: In-memory source, sink and publisher adapters with fault injection
// ABOUTME: Test doubles for the adapter traits; not wired into any configured pipeline

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::error::SyncError;
use crate::record::{Record, RecordKey};
use crate::sink::{EventPublisher, SinkAdapter};
use crate::source::SourceAdapter;

#[derive(Debug, Default)]
struct SourceInner {
    /// Current row per entity id
    rows: BTreeMap<String, Record>,
    /// Ids invisible to incremental and changed-since queries
    hidden: HashSet<String>,
    unavailable: bool,
    missing_table: bool,
    latency: Option<Duration>,
}

/// Source table kept in memory.
///
/// Holds one current row per entity id, like a relational table keyed by id.
#[derive(Debug, Clone)]
pub struct MemorySource {
    name: String,
    inner: Arc<Mutex<SourceInner>>,
    full_pulls: Arc<AtomicUsize>,
    incremental_pulls: Arc<AtomicUsize>,
}

impl MemorySource {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            inner: Arc::new(Mutex::new(SourceInner::default())),
            full_pulls: Arc::new(AtomicUsize::new(0)),
            incremental_pulls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Insert or replace the current row of an entity.
    pub async fn upsert(&self, record: Record) {
        let mut inner = self.inner.lock().await;
        inner.rows.insert(record.entity_id.clone(), record);
    }

    pub async fn upsert_all(&self, records: impl IntoIterator<Item = Record>) {
        let mut inner = self.inner.lock().await;
        for record in records {
            inner.rows.insert(record.entity_id.clone(), record);
        }
    }

    pub async fn remove(&self, entity_id: &str) -> Option<Record> {
        self.inner.lock().await.rows.remove(entity_id)
    }

    /// Make every call fail with a connectivity error.
    pub async fn set_available(&self, available: bool) {
        self.inner.lock().await.unavailable = !available;
    }

    pub async fn set_table_exists(&self, exists: bool) {
        self.inner.lock().await.missing_table = !exists;
    }

    /// Delay every fetch, to exercise I/O deadlines.
    pub async fn set_latency(&self, latency: Option<Duration>) {
        self.inner.lock().await.latency = latency;
    }

    /// Hide an entity from narrow queries; only a full pull still sees it.
    pub async fn hide_from_incremental(&self, entity_id: &str) {
        self.inner.lock().await.hidden.insert(entity_id.to_string());
    }

    pub async fn reveal(&self, entity_id: &str) {
        self.inner.lock().await.hidden.remove(entity_id);
    }

    pub fn full_pulls(&self) -> usize {
        self.full_pulls.load(Ordering::SeqCst)
    }

    pub fn incremental_pulls(&self) -> usize {
        self.incremental_pulls.load(Ordering::SeqCst)
    }

    async fn visible_rows(&self, include_hidden: bool) -> Result<Vec<Record>> {
        let latency = {
            let inner = self.inner.lock().await;
            if inner.unavailable {
                return Err(SyncError::Connectivity {
                    component: "source",
                    reason: format!("{} is offline", self.name),
                }
                .into());
            }
            inner.latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let inner = self.inner.lock().await;
        let mut rows: Vec<Record> = inner
            .rows
            .values()
            .filter(|r| include_hidden || !inner.hidden.contains(&r.entity_id))
            .cloned()
            .collect();
        rows.sort_by_key(Record::key);
        Ok(rows)
    }
}

#[async_trait]
impl SourceAdapter for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_incremental(
        &self,
        after: Option<&RecordKey>,
        limit: usize,
    ) -> Result<Vec<Record>> {
        self.incremental_pulls.fetch_add(1, Ordering::SeqCst);
        let rows = self.visible_rows(false).await?;
        Ok(rows
            .into_iter()
            .filter(|r| after.map_or(true, |cursor| r.key() > *cursor))
            .take(limit)
            .collect())
    }

    async fn fetch_all(&self) -> Result<Vec<Record>> {
        self.full_pulls.fetch_add(1, Ordering::SeqCst);
        self.visible_rows(true).await
    }

    async fn fetch_changed_since(&self, since: DateTime<Utc>) -> Result<Vec<Record>> {
        self.incremental_pulls.fetch_add(1, Ordering::SeqCst);
        let rows = self.visible_rows(false).await?;
        Ok(rows.into_iter().filter(|r| r.event_time >= since).collect())
    }

    async fn health_check(&self) -> Result<()> {
        if self.inner.lock().await.unavailable {
            return Err(SyncError::Connectivity {
                component: "source",
                reason: format!("{} is offline", self.name),
            }
            .into());
        }
        Ok(())
    }

    async fn table_exists(&self) -> Result<bool> {
        Ok(!self.inner.lock().await.missing_table)
    }
}

#[derive(Debug, Default)]
struct SinkInner {
    rows: BTreeMap<String, Record>,
    /// Every successful upsert in call order
    writes: Vec<RecordKey>,
    fail_on: HashSet<String>,
    unavailable: bool,
    missing_table: bool,
}

/// Sink table kept in memory.
#[derive(Debug, Clone)]
pub struct MemorySink {
    name: String,
    inner: Arc<Mutex<SinkInner>>,
}

impl MemorySink {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            inner: Arc::new(Mutex::new(SinkInner::default())),
        }
    }

    /// Make upserts of this entity fail until cleared.
    pub async fn fail_on(&self, entity_id: &str) {
        self.inner.lock().await.fail_on.insert(entity_id.to_string());
    }

    pub async fn clear_failures(&self) {
        self.inner.lock().await.fail_on.clear();
    }

    pub async fn set_available(&self, available: bool) {
        self.inner.lock().await.unavailable = !available;
    }

    pub async fn set_table_exists(&self, exists: bool) {
        self.inner.lock().await.missing_table = !exists;
    }

    pub async fn get(&self, entity_id: &str) -> Option<Record> {
        self.inner.lock().await.rows.get(entity_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.rows.is_empty()
    }

    /// Keys of all successful upserts, oldest first.
    pub async fn writes(&self) -> Vec<RecordKey> {
        self.inner.lock().await.writes.clone()
    }
}

#[async_trait]
impl SinkAdapter for MemorySink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn upsert(&self, record: &Record) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        if inner.unavailable {
            return Err(SyncError::Connectivity {
                component: "sink",
                reason: format!("{} is offline", self.name),
            }
            .into());
        }
        if inner.fail_on.contains(&record.entity_id) {
            bail!("Rejected upsert of {} into {}", record.entity_id, self.name);
        }
        inner.writes.push(record.key());
        inner.rows.insert(record.entity_id.clone(), record.clone());
        Ok(1)
    }

    async fn health_check(&self) -> Result<()> {
        if self.inner.lock().await.unavailable {
            return Err(SyncError::Connectivity {
                component: "sink",
                reason: format!("{} is offline", self.name),
            }
            .into());
        }
        Ok(())
    }

    async fn table_exists(&self) -> Result<bool> {
        Ok(!self.inner.lock().await.missing_table)
    }
}

/// Event stream kept in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryPublisher {
    published: Arc<Mutex<Vec<(String, Record)>>>,
    failing: Arc<Mutex<bool>>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_failing(&self, failing: bool) {
        *self.failing.lock().await = failing;
    }

    /// `(topic, record)` pairs in publish order.
    pub async fn published(&self) -> Vec<(String, Record)> {
        self.published.lock().await.clone()
    }
}

#[async_trait]
impl EventPublisher for MemoryPublisher {
    async fn publish(&self, topic: &str, record: &Record) -> Result<()> {
        if *self.failing.lock().await {
            bail!("Broker rejected event for {} on {}", record.entity_id, topic);
        }
        self.published
            .lock()
            .await
            .push((topic.to_string(), record.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn rec(secs: i64, id: &str) -> Record {
        Record::new(id, Utc.timestamp_opt(secs, 0).unwrap())
    }

    #[tokio::test]
    async fn test_memory_source_incremental_is_ordered_and_bounded() {
        let source = MemorySource::new("robots");
        source
            .upsert_all([rec(2, "B"), rec(1, "Z"), rec(2, "A"), rec(3, "C")])
            .await;

        let page = source.fetch_incremental(None, 3).await.unwrap();
        let ids: Vec<_> = page.iter().map(|r| r.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["Z", "A", "B"]);

        let cursor = page.last().unwrap().key();
        let page = source.fetch_incremental(Some(&cursor), 3).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].entity_id, "C");
    }

    #[tokio::test]
    async fn test_memory_source_hidden_rows_only_in_full_pull() {
        let source = MemorySource::new("robots");
        source.upsert_all([rec(1, "A"), rec(2, "B")]).await;
        source.hide_from_incremental("B").await;

        assert_eq!(source.fetch_incremental(None, 10).await.unwrap().len(), 1);
        assert_eq!(
            source
                .fetch_changed_since(Utc.timestamp_opt(0, 0).unwrap())
                .await
                .unwrap()
                .len(),
            1
        );
        assert_eq!(source.fetch_all().await.unwrap().len(), 2);
        assert_eq!(source.full_pulls(), 1);
        assert_eq!(source.incremental_pulls(), 2);
    }

    #[tokio::test]
    async fn test_memory_source_unavailable() {
        let source = MemorySource::new("robots");
        source.set_available(false).await;

        let err = source.fetch_all().await.unwrap_err();
        assert!(crate::error::is_transient(&err));
        assert!(source.health_check().await.is_err());
    }

    #[tokio::test]
    async fn test_memory_sink_injected_failure() {
        let sink = MemorySink::new("robot_status");
        sink.fail_on("B").await;

        assert_eq!(sink.upsert(&rec(1, "A")).await.unwrap(), 1);
        assert!(sink.upsert(&rec(1, "B")).await.is_err());
        assert_eq!(sink.len().await, 1);
        assert_eq!(sink.writes().await, vec![rec(1, "A").key()]);
    }
}
