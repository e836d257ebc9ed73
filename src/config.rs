// ABOUTME: TOML application configuration - connections, stores and the pipeline list
// ABOUTME: Validates settings and builds the orchestrator with concrete adapters

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{CacheAdapter, MemoryCache, RedisCache};
use crate::detector::{ChangeCriteria, WatchedFields};
use crate::error::SyncError;
use crate::offset::{CacheOffsetStore, FileOffsetStore, OffsetState, OffsetStore};
use crate::orchestrator::Orchestrator;
use crate::pipeline::{EtlPipeline, PipelineSettings, Strategy};
use crate::postgres::PgConnection;
use crate::scheduler::{PipelineScheduler, PostgresScheduleRepository, ScheduleConfig};
use crate::sink::{EventPublisher, PostgresSink, PublishMode, RedisStreamPublisher};
use crate::source::PostgresSource;
use crate::utils::{validate_postgres_identifier, TableRef};

pub const DEFAULT_CONFIG_PATH: &str = "warehouse-sync.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    pub source: DatabaseConfig,
    pub sink: SinkConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub pipelines: Vec<PipelineConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SinkConfig {
    pub url: String,
    /// Table holding per-pipeline schedule overrides
    #[serde(default = "default_schedule_table")]
    pub schedule_table: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Snapshots and offsets live in Redis when set, in memory plus the state file otherwise
    pub redis_url: Option<String>,
    #[serde(default = "default_cache_prefix")]
    pub prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            prefix: default_cache_prefix(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventsConfig {
    /// Change events are only published when set
    pub redis_url: Option<String>,
    #[serde(default = "default_stream_prefix")]
    pub stream_prefix: String,
    pub stream_maxlen: Option<usize>,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            stream_prefix: default_stream_prefix(),
            stream_maxlen: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateConfig {
    #[serde(default = "OffsetState::default_path")]
    pub path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: OffsetState::default_path(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Watermark,
    Hybrid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriteriaKind {
    #[default]
    WatchedFields,
    FullRecord,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub name: String,
    pub entity_type: String,
    #[serde(default = "default_strategy")]
    pub strategy: StrategyKind,
    pub source_table: String,
    pub id_column: String,
    pub time_column: String,
    /// Business columns to extract; empty extracts every column
    #[serde(default)]
    pub columns: Vec<String>,
    pub sink_table: String,
    pub sink_id_column: Option<String>,
    pub sink_time_column: Option<String>,
    /// Defaults to the entity type
    pub topic: Option<String>,
    #[serde(default)]
    pub publish_mode: PublishMode,
    #[serde(default)]
    pub criteria: CriteriaKind,
    #[serde(default)]
    pub watched_fields: Vec<String>,
    /// Defaults to false for watermark pipelines and true for hybrid ones
    pub compare_event_time: Option<bool>,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_max_pages_per_run")]
    pub max_pages_per_run: usize,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default)]
    pub initial_delay_ms: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_full_sync_interval_secs")]
    pub full_sync_interval_secs: u64,
    #[serde(default = "default_io_timeout_secs")]
    pub io_timeout_secs: u64,
}

fn default_schedule_table() -> String {
    "sync_schedule_config".to_string()
}

fn default_cache_prefix() -> String {
    "wsync".to_string()
}

fn default_stream_prefix() -> String {
    "wsync:events".to_string()
}

fn default_strategy() -> StrategyKind {
    StrategyKind::Watermark
}

fn default_page_size() -> usize {
    1000
}

fn default_max_pages_per_run() -> usize {
    10
}

fn default_interval_ms() -> u64 {
    5000
}

fn default_enabled() -> bool {
    true
}

fn default_full_sync_interval_secs() -> u64 {
    600
}

fn default_io_timeout_secs() -> u64 {
    30
}

impl PipelineConfig {
    pub fn settings(&self, cache_prefix: &str) -> PipelineSettings {
        let mut settings = PipelineSettings::new(&self.name, &self.entity_type);
        settings.strategy = match self.strategy {
            StrategyKind::Watermark => Strategy::Watermark,
            StrategyKind::Hybrid => Strategy::Hybrid {
                full_sync_interval: Duration::from_secs(self.full_sync_interval_secs),
            },
        };
        settings.criteria = match self.criteria {
            CriteriaKind::WatchedFields => {
                ChangeCriteria::Fields(WatchedFields::new(self.watched_fields.iter().cloned()))
            }
            CriteriaKind::FullRecord => ChangeCriteria::FullRecord,
        };
        settings.compare_event_time = self
            .compare_event_time
            .unwrap_or(self.strategy == StrategyKind::Hybrid);
        if let Some(topic) = &self.topic {
            settings.topic = topic.clone();
        }
        settings.publish_mode = self.publish_mode;
        settings.page_size = self.page_size;
        settings.max_pages_per_run = self.max_pages_per_run;
        settings.io_timeout = Duration::from_secs(self.io_timeout_secs);
        settings.cache_prefix = cache_prefix.to_string();
        settings
    }

    pub fn schedule(&self) -> ScheduleConfig {
        ScheduleConfig {
            enabled: self.enabled,
            interval: Duration::from_millis(self.interval_ms),
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            description: None,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("Pipeline name cannot be empty");
        }
        if self.entity_type.trim().is_empty() {
            bail!("Pipeline '{}' has an empty entity_type", self.name);
        }
        TableRef::parse(&self.source_table)
            .with_context(|| format!("Pipeline '{}' has an invalid source_table", self.name))?;
        TableRef::parse(&self.sink_table)
            .with_context(|| format!("Pipeline '{}' has an invalid sink_table", self.name))?;

        let columns = [&self.id_column, &self.time_column]
            .into_iter()
            .chain(self.sink_id_column.iter())
            .chain(self.sink_time_column.iter())
            .chain(self.columns.iter());
        for column in columns {
            validate_postgres_identifier(column)
                .with_context(|| format!("Pipeline '{}' has an invalid column", self.name))?;
        }

        if self.page_size == 0 {
            bail!("Pipeline '{}': page_size must be greater than zero", self.name);
        }
        if self.max_pages_per_run == 0 {
            bail!(
                "Pipeline '{}': max_pages_per_run must be greater than zero",
                self.name
            );
        }
        if self.interval_ms == 0 {
            bail!("Pipeline '{}': interval_ms must be greater than zero", self.name);
        }
        if self.io_timeout_secs == 0 {
            bail!("Pipeline '{}': io_timeout_secs must be greater than zero", self.name);
        }
        if self.strategy == StrategyKind::Hybrid && self.full_sync_interval_secs == 0 {
            bail!(
                "Pipeline '{}': full_sync_interval_secs must be greater than zero",
                self.name
            );
        }
        if self.criteria == CriteriaKind::FullRecord && !self.watched_fields.is_empty() {
            tracing::warn!(
                "Pipeline '{}' compares full records; watched_fields are ignored",
                self.name
            );
        }
        Ok(())
    }
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config = Self::parse(&contents)
            .with_context(|| format!("Invalid config file {:?}", path))?;
        tracing::debug!(
            "Loaded {} pipelines from {:?}",
            config.pipelines.len(),
            path
        );
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.source.url.trim().is_empty() {
            bail!("[source] url cannot be empty");
        }
        if self.sink.url.trim().is_empty() {
            bail!("[sink] url cannot be empty");
        }
        validate_postgres_identifier(&self.sink.schedule_table)
            .context("Invalid [sink] schedule_table")?;
        if self.pipelines.is_empty() {
            bail!("At least one [[pipelines]] entry is required");
        }

        let mut names = HashSet::new();
        for pipeline in &self.pipelines {
            pipeline.validate()?;
            if !names.insert(pipeline.name.as_str()) {
                return Err(SyncError::InvalidConfig(format!(
                    "pipeline name '{}' is used more than once",
                    pipeline.name
                ))
                .into());
            }
        }
        Ok(())
    }

    async fn build_stores(&self) -> Result<(Arc<dyn CacheAdapter>, Arc<dyn OffsetStore>)> {
        match &self.cache.redis_url {
            Some(url) => {
                let cache: Arc<dyn CacheAdapter> = Arc::new(RedisCache::connect(url).await?);
                let offsets: Arc<dyn OffsetStore> =
                    Arc::new(CacheOffsetStore::new(cache.clone(), &self.cache.prefix));
                Ok((cache, offsets))
            }
            None => {
                tracing::info!(
                    "No Redis cache configured; snapshots stay in memory, offsets go to {:?}",
                    self.state.path
                );
                let cache: Arc<dyn CacheAdapter> = Arc::new(MemoryCache::new());
                let offsets: Arc<dyn OffsetStore> =
                    Arc::new(FileOffsetStore::open(&self.state.path).await);
                Ok((cache, offsets))
            }
        }
    }

    async fn build_publisher(&self) -> Result<Option<Arc<dyn EventPublisher>>> {
        let Some(url) = &self.events.redis_url else {
            tracing::info!("No event stream configured; change events are not published");
            return Ok(None);
        };
        let publisher = RedisStreamPublisher::connect(
            url,
            &self.events.stream_prefix,
            self.events.stream_maxlen,
        )
        .await?;
        Ok(Some(Arc::new(publisher)))
    }

    /// Wire every configured pipeline to its adapters.
    ///
    /// Database connections are opened lazily by the first tick, so a source that
    /// is down at startup only delays that pipeline's initialization.
    pub async fn build(&self) -> Result<Orchestrator> {
        let source_conn = Arc::new(PgConnection::new("source", &self.source.url));
        let sink_conn = Arc::new(PgConnection::new("sink", &self.sink.url));
        let (cache, offsets) = self.build_stores().await?;
        let publisher = self.build_publisher().await?;
        let schedules = Arc::new(PostgresScheduleRepository::new(
            sink_conn.clone(),
            &self.sink.schedule_table,
        )?);

        let mut orchestrator = Orchestrator::new();
        for config in &self.pipelines {
            let source = PostgresSource::new(
                source_conn.clone(),
                TableRef::parse(&config.source_table)?,
                &config.id_column,
                &config.time_column,
                config.columns.clone(),
            )?;
            let sink = PostgresSink::new(
                sink_conn.clone(),
                TableRef::parse(&config.sink_table)?,
                config.sink_id_column.as_deref().unwrap_or(&config.id_column),
                Some(
                    config
                        .sink_time_column
                        .as_deref()
                        .unwrap_or(&config.time_column),
                ),
            )?;

            let mut pipeline = EtlPipeline::new(
                config.settings(&self.cache.prefix),
                Arc::new(source),
                Arc::new(sink),
                cache.clone(),
                offsets.clone(),
            );
            if let Some(publisher) = &publisher {
                pipeline = pipeline.with_publisher(publisher.clone());
            }

            orchestrator.register(PipelineScheduler::new(
                Arc::new(pipeline),
                config.schedule(),
                schedules.clone(),
            ))?;
        }

        Ok(orchestrator)
    }
}
