// ABOUTME: RedisStreamPublisher - appends change events to Redis streams
// ABOUTME: One stream per topic, entries carry entity id, event time and JSON payload

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::StreamMaxlen;
use redis::AsyncCommands;

use super::EventPublisher;
use crate::record::Record;

/// Publishes each record as one `XADD` on `<prefix>:<topic>`.
#[derive(Clone)]
pub struct RedisStreamPublisher {
    conn: ConnectionManager,
    prefix: String,
    /// Approximate stream length cap; `None` keeps every entry
    max_len: Option<usize>,
}

impl RedisStreamPublisher {
    pub fn new(conn: ConnectionManager, prefix: &str, max_len: Option<usize>) -> Self {
        Self {
            conn,
            prefix: prefix.to_string(),
            max_len,
        }
    }

    pub async fn connect(url: &str, prefix: &str, max_len: Option<usize>) -> Result<Self> {
        let client = redis::Client::open(url)
            .with_context(|| format!("Invalid Redis URL {}", crate::utils::sanitize_url(url)))?;
        let conn = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis event stream")?;
        Ok(Self::new(conn, prefix, max_len))
    }

    pub fn stream_key(&self, topic: &str) -> String {
        format!("{}:{}", self.prefix, topic)
    }
}

/// Stream entry fields for one record.
fn event_fields(record: &Record) -> Result<[(&'static str, String); 3]> {
    let payload = serde_json::to_string(record).context("Failed to encode event payload")?;
    Ok([
        ("entity_id", record.entity_id.clone()),
        ("event_time", record.event_time.to_rfc3339()),
        ("payload", payload),
    ])
}

#[async_trait]
impl EventPublisher for RedisStreamPublisher {
    async fn publish(&self, topic: &str, record: &Record) -> Result<()> {
        let key = self.stream_key(topic);
        let fields = event_fields(record)?;
        let mut conn = self.conn.clone();

        let appended: redis::RedisResult<String> = match self.max_len {
            Some(max_len) => {
                conn.xadd_maxlen(&key, StreamMaxlen::Approx(max_len), "*", &fields)
                    .await
            }
            None => conn.xadd(&key, "*", &fields).await,
        };
        let id = appended
            .with_context(|| format!("Failed to append {} to stream {}", record.entity_id, key))?;

        tracing::debug!("Published {} to {} as {}", record.entity_id, key, id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_event_fields() {
        let record = Record::new("pod-3", Utc.timestamp_opt(60, 0).unwrap()).with_field("face", "A");
        let fields = event_fields(&record).unwrap();

        assert_eq!(fields[0], ("entity_id", "pod-3".to_string()));
        assert_eq!(fields[1], ("event_time", "1970-01-01T00:01:00+00:00".to_string()));

        let payload: Record = serde_json::from_str(&fields[2].1).unwrap();
        assert_eq!(payload, record);
    }
}
