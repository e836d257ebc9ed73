// ABOUTME: Source read adapter contract - turns source rows of one entity type into records
// ABOUTME: Incremental reads are ordered ascending by (event_time, entity_id)

pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::record::{Record, RecordKey};

pub use postgres::PostgresSource;

/// Read side of one entity type.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Human-readable name used in logs and errors (usually the qualified table).
    fn name(&self) -> &str;

    /// Rows strictly after `after` in `(event_time, entity_id)` order, at most `limit`.
    ///
    /// `None` means "from the beginning". The result must be sorted ascending by key
    /// so the caller can use the last row as the next cursor.
    async fn fetch_incremental(
        &self,
        after: Option<&RecordKey>,
        limit: usize,
    ) -> Result<Vec<Record>>;

    /// Every row of the entity type, sorted ascending by key.
    async fn fetch_all(&self) -> Result<Vec<Record>>;

    /// Rows whose event time is at or after `since`, sorted ascending by key.
    async fn fetch_changed_since(&self, since: DateTime<Utc>) -> Result<Vec<Record>>;

    /// Cheap round-trip proving the source is reachable.
    async fn health_check(&self) -> Result<()>;

    /// Whether the backing table exists.
    async fn table_exists(&self) -> Result<bool>;
}
