// ABOUTME: Watermark offset store - persists the highest extracted (event_time, entity_id) per job
// ABOUTME: Offsets live in the shared cache or in a JSON state file and only ever move forward

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;

use crate::cache::{offset_namespace, CacheAdapter};
use crate::record::RecordKey;

/// Resume point of one pipeline job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offset {
    pub job_name: String,
    /// Event time of the last extracted row
    pub last_event_time: DateTime<Utc>,
    /// Tie-breaker among rows sharing `last_event_time`
    pub last_entity_id: String,
    /// When this offset was written
    pub updated_at: DateTime<Utc>,
    /// Number of rows processed in the batch that produced this offset
    pub last_row_count: u64,
}

impl Offset {
    pub fn new(job_name: &str, key: RecordKey, row_count: u64) -> Self {
        Self {
            job_name: job_name.to_string(),
            last_event_time: key.event_time,
            last_entity_id: key.entity_id,
            updated_at: Utc::now(),
            last_row_count: row_count,
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.last_event_time, self.last_entity_id.clone())
    }
}

/// Per-job watermark storage.
///
/// There is no merge on write: callers compute the new maximum before calling
/// `set`. A miss on `get` means "start from the beginning".
#[async_trait]
pub trait OffsetStore: Send + Sync {
    async fn get(&self, job: &str) -> Result<Option<Offset>>;
    async fn set(&self, job: &str, offset: Offset) -> Result<()>;
    /// Forget the offset of a job so the next extraction starts from scratch.
    async fn clear(&self, job: &str) -> Result<bool>;
}

/// Offsets kept in their own namespace of the shared cache, keyed by job name.
#[derive(Clone)]
pub struct CacheOffsetStore {
    cache: Arc<dyn CacheAdapter>,
    namespace: String,
}

impl CacheOffsetStore {
    pub fn new(cache: Arc<dyn CacheAdapter>, prefix: &str) -> Self {
        Self {
            cache,
            namespace: offset_namespace(prefix),
        }
    }
}

#[async_trait]
impl OffsetStore for CacheOffsetStore {
    async fn get(&self, job: &str) -> Result<Option<Offset>> {
        match self.cache.get(&self.namespace, job).await? {
            Some(value) => {
                let offset = serde_json::from_value(value)
                    .with_context(|| format!("Failed to decode offset for {}", job))?;
                Ok(Some(offset))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, job: &str, offset: Offset) -> Result<()> {
        let value = serde_json::to_value(&offset).context("Failed to encode offset")?;
        self.cache.set(&self.namespace, job, value).await
    }

    async fn clear(&self, job: &str) -> Result<bool> {
        self.cache.remove(&self.namespace, job).await
    }
}

/// On-disk document holding the offsets of every job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OffsetState {
    /// Version of the state format for future migrations
    pub version: u32,
    pub offsets: HashMap<String, Offset>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OffsetState {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            version: 1,
            offsets: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Load state from a JSON file
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read offset state from {:?}", path))?;
        let state: OffsetState = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse offset state from {:?}", path))?;
        Ok(state)
    }

    /// Save state to a JSON file
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create directory {:?}", parent))?;
            }
        }

        let contents =
            serde_json::to_string_pretty(self).context("Failed to serialize offset state")?;

        // Replace atomically: sibling file, then rename
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, contents)
            .await
            .with_context(|| format!("Failed to write offset state to {:?}", tmp_path))?;
        fs::rename(&tmp_path, path)
            .await
            .with_context(|| format!("Failed to move offset state into {:?}", path))?;
        Ok(())
    }

    /// Default state file path for the current directory
    pub fn default_path() -> PathBuf {
        PathBuf::from(".warehouse-sync/offsets.json")
    }
}

impl Default for OffsetState {
    fn default() -> Self {
        Self::new()
    }
}

/// Offsets persisted to a JSON file after every write.
pub struct FileOffsetStore {
    path: PathBuf,
    state: Mutex<OffsetState>,
}

impl FileOffsetStore {
    /// Open the store, loading existing state or starting empty.
    ///
    /// An unreadable file is logged and replaced by fresh state on the next write.
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = if path.exists() {
            match OffsetState::load(&path).await {
                Ok(state) => {
                    tracing::info!("Loaded offset state from {:?}", path);
                    state
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to load offset state from {:?}: {}. Starting with empty state.",
                        path,
                        e
                    );
                    OffsetState::new()
                }
            }
        } else {
            tracing::info!("Creating new offset state at {:?}", path);
            OffsetState::new()
        };

        Self {
            path,
            state: Mutex::new(state),
        }
    }
}

#[async_trait]
impl OffsetStore for FileOffsetStore {
    async fn get(&self, job: &str) -> Result<Option<Offset>> {
        let state = self.state.lock().await;
        Ok(state.offsets.get(job).cloned())
    }

    async fn set(&self, job: &str, offset: Offset) -> Result<()> {
        let mut state = self.state.lock().await;
        state.offsets.insert(job.to_string(), offset);
        state.updated_at = Utc::now();
        state.save(&self.path).await
    }

    async fn clear(&self, job: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let removed = state.offsets.remove(job).is_some();
        if removed {
            state.updated_at = Utc::now();
            state.save(&self.path).await?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn key(secs: i64, id: &str) -> RecordKey {
        RecordKey::new(Utc.timestamp_opt(secs, 0).unwrap(), id)
    }

    #[test]
    fn test_offset_key_round_trip() {
        let offset = Offset::new("sync-x", key(42, "B"), 3);
        assert_eq!(offset.key(), key(42, "B"));
        assert_eq!(offset.last_row_count, 3);
    }

    #[tokio::test]
    async fn test_cache_offset_store_miss_is_not_error() {
        let store = CacheOffsetStore::new(Arc::new(MemoryCache::new()), "wsync");
        assert!(store.get("sync-x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cache_offset_store_set_get_clear() {
        let store = CacheOffsetStore::new(Arc::new(MemoryCache::new()), "wsync");
        store
            .set("sync-x", Offset::new("sync-x", key(5, "A"), 1))
            .await
            .unwrap();

        let offset = store.get("sync-x").await.unwrap().unwrap();
        assert_eq!(offset.key(), key(5, "A"));
        assert!(store.get("sync-y").await.unwrap().is_none());

        assert!(store.clear("sync-x").await.unwrap());
        assert!(store.get("sync-x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_offset_store_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state").join("offsets.json");

        let store = FileOffsetStore::open(&path).await;
        store
            .set("robots", Offset::new("robots", key(100, "r-9"), 10))
            .await
            .unwrap();
        drop(store);

        let store = FileOffsetStore::open(&path).await;
        let offset = store.get("robots").await.unwrap().unwrap();
        assert_eq!(offset.key(), key(100, "r-9"));
        assert_eq!(offset.last_row_count, 10);
    }

    #[tokio::test]
    async fn test_file_offset_store_recovers_from_corrupt_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("offsets.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = FileOffsetStore::open(&path).await;
        assert!(store.get("robots").await.unwrap().is_none());

        store
            .set("robots", Offset::new("robots", key(1, "a"), 1))
            .await
            .unwrap();
        let state = OffsetState::load(&path).await.unwrap();
        assert_eq!(state.offsets.len(), 1);
    }
}
