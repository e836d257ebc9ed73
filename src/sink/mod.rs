// ABOUTME: Downstream sink contracts - relational upsert and change event publishing
// ABOUTME: The load stage upserts first, then publishes, for every accepted record

pub mod postgres;
pub mod redis_stream;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::record::Record;

pub use postgres::PostgresSink;
pub use redis_stream::RedisStreamPublisher;

/// System-of-record write side of one entity type.
///
/// `upsert` conflicts on the entity's natural identifier and must be idempotent:
/// writing the same record twice leaves the same final state.
#[async_trait]
pub trait SinkAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Insert or update one record. Returns the affected row count.
    async fn upsert(&self, record: &Record) -> Result<u64>;

    async fn health_check(&self) -> Result<()>;

    async fn table_exists(&self) -> Result<bool>;
}

/// Change event stream.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, topic: &str, record: &Record) -> Result<()>;
}

/// How the load stage waits for event delivery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishMode {
    /// Queue the publish on the pipeline's event worker and log its outcome; the batch never waits for it.
    #[default]
    FireAndForget,
    /// Await delivery before moving to the next record. Failures are still only logged.
    Confirmed,
}
