// ABOUTME: Namespaced key-value cache used for snapshots and offsets
// ABOUTME: Defines the cache adapter contract, the typed snapshot cache and in-memory and Redis backends

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::record::Record;

/// Namespaced key-value store holding arbitrary structured values.
///
/// Namespaces partition the key space so that pipelines never see each other's
/// state. Implementations must be safe to share across pipeline tasks.
#[async_trait]
pub trait CacheAdapter: Send + Sync {
    /// Look up a value. A miss is `Ok(None)`, never an error.
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<serde_json::Value>>;

    /// Insert or overwrite a value.
    async fn set(&self, namespace: &str, key: &str, value: serde_json::Value) -> Result<()>;

    /// Remove a single key. Returns whether the key existed.
    async fn remove(&self, namespace: &str, key: &str) -> Result<bool>;

    /// Drop every key of a namespace. Returns the number of keys removed when the
    /// backend can tell, otherwise 0.
    async fn clear_namespace(&self, namespace: &str) -> Result<u64>;

    /// Number of keys in a namespace.
    async fn len(&self, namespace: &str) -> Result<u64>;
}

/// Last accepted record per entity, one namespace per pipeline.
///
/// Holds the record most recently judged "changed" by the change detector. It is
/// never written for suppressed records.
#[derive(Clone)]
pub struct SnapshotCache {
    cache: Arc<dyn CacheAdapter>,
    namespace: String,
}

impl SnapshotCache {
    pub fn new(cache: Arc<dyn CacheAdapter>, prefix: &str, entity_type: &str, job_name: &str) -> Self {
        Self {
            cache,
            namespace: snapshot_namespace(prefix, entity_type, job_name),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub async fn get(&self, entity_id: &str) -> Result<Option<Record>> {
        let value = self.cache.get(&self.namespace, entity_id).await?;
        match value {
            Some(value) => {
                let record = serde_json::from_value(value).with_context(|| {
                    format!(
                        "Failed to decode cached snapshot {} in {}",
                        entity_id, self.namespace
                    )
                })?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    pub async fn put(&self, record: &Record) -> Result<()> {
        let value = serde_json::to_value(record).context("Failed to encode snapshot")?;
        self.cache
            .set(&self.namespace, &record.entity_id, value)
            .await
    }

    /// Flush the whole namespace (manual cache reset or forced reprocessing).
    pub async fn clear(&self) -> Result<u64> {
        self.cache.clear_namespace(&self.namespace).await
    }

    pub async fn len(&self) -> Result<u64> {
        self.cache.len(&self.namespace).await
    }
}

/// Namespace holding snapshots for one pipeline.
///
/// Keyed by job name as well as entity type: two pipelines over the same entity
/// type from different sources must not suppress each other's records.
pub fn snapshot_namespace(prefix: &str, entity_type: &str, job_name: &str) -> String {
    format!("{}:snapshot:{}:{}", prefix, entity_type, job_name)
}

/// Namespace holding watermark offsets for all jobs.
pub fn offset_namespace(prefix: &str) -> String {
    format!("{}:offset", prefix)
}

/// Namespaced cache kept in process memory.
///
/// Used when no Redis is configured; its contents are lost on restart.
#[derive(Debug, Clone, Default)]
pub struct MemoryCache {
    inner: Arc<Mutex<HashMap<String, HashMap<String, serde_json::Value>>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheAdapter for MemoryCache {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<serde_json::Value>> {
        let inner = self.inner.lock().await;
        Ok(inner.get(namespace).and_then(|ns| ns.get(key)).cloned())
    }

    async fn set(&self, namespace: &str, key: &str, value: serde_json::Value) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, namespace: &str, key: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        Ok(inner
            .get_mut(namespace)
            .is_some_and(|ns| ns.remove(key).is_some()))
    }

    async fn clear_namespace(&self, namespace: &str) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        Ok(inner
            .remove(namespace)
            .map(|ns| ns.len() as u64)
            .unwrap_or(0))
    }

    async fn len(&self, namespace: &str) -> Result<u64> {
        let inner = self.inner.lock().await;
        Ok(inner.get(namespace).map(|ns| ns.len() as u64).unwrap_or(0))
    }
}

/// Redis-backed cache.
///
/// Each namespace is one Redis hash, so clearing a namespace is a single `DEL`
/// and never touches another pipeline's keys. Values are stored as JSON text.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Open a managed connection to the given Redis URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .with_context(|| format!("Invalid Redis URL {}", crate::utils::sanitize_url(url)))?;
        let conn = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;
        Ok(Self::new(conn))
    }
}

#[async_trait]
impl CacheAdapter for RedisCache {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<serde_json::Value>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .hget(namespace, key)
            .await
            .with_context(|| format!("Failed to read {} from {}", key, namespace))?;

        match raw {
            Some(text) => {
                let value = serde_json::from_str(&text)
                    .with_context(|| format!("Corrupt cache entry {} in {}", key, namespace))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, namespace: &str, key: &str, value: serde_json::Value) -> Result<()> {
        let mut conn = self.conn.clone();
        let text = serde_json::to_string(&value).context("Failed to encode cache entry")?;
        conn.hset::<_, _, _, ()>(namespace, key, text)
            .await
            .with_context(|| format!("Failed to write {} to {}", key, namespace))?;
        Ok(())
    }

    async fn remove(&self, namespace: &str, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: u64 = conn
            .hdel(namespace, key)
            .await
            .with_context(|| format!("Failed to remove {} from {}", key, namespace))?;
        Ok(removed > 0)
    }

    async fn clear_namespace(&self, namespace: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let size: u64 = conn
            .hlen(namespace)
            .await
            .with_context(|| format!("Failed to size namespace {}", namespace))?;
        conn.del::<_, ()>(namespace)
            .await
            .with_context(|| format!("Failed to clear namespace {}", namespace))?;
        tracing::info!("Cleared {} cached entries from {}", size, namespace);
        Ok(size)
    }

    async fn len(&self, namespace: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let size: u64 = conn
            .hlen(namespace)
            .await
            .with_context(|| format!("Failed to size namespace {}", namespace))?;
        Ok(size)
    }
}
