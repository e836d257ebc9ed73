// ABOUTME: Orchestrator - registry of pipeline schedulers and their periodic timer tasks
// ABOUTME: Exposes the control operations: status, trigger, cache reset and reprocessing

use anyhow::Result;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::{interval, sleep, MissedTickBehavior};

use crate::error::SyncError;
use crate::scheduler::{PipelineScheduler, ResetReport, ScheduleConfig, SchedulerStatus, TickReport};

/// All pipelines of one process.
///
/// Each enabled pipeline runs on its own task and timer; a failing pipeline never
/// affects another one.
#[derive(Default)]
pub struct Orchestrator {
    schedulers: BTreeMap<String, Arc<PipelineScheduler>>,
}

impl Orchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, scheduler: PipelineScheduler) -> Result<()> {
        let name = scheduler.name().to_string();
        if self.schedulers.contains_key(&name) {
            return Err(SyncError::InvalidConfig(format!(
                "pipeline '{}' is registered twice",
                name
            ))
            .into());
        }
        self.schedulers.insert(name, Arc::new(scheduler));
        Ok(())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.schedulers.keys().map(String::as_str)
    }

    pub fn get(&self, name: &str) -> Result<&Arc<PipelineScheduler>> {
        self.schedulers
            .get(name)
            .ok_or_else(|| SyncError::UnknownPipeline(name.to_string()).into())
    }

    pub fn schedulers(&self) -> impl Iterator<Item = &Arc<PipelineScheduler>> {
        self.schedulers.values()
    }

    /// Startup coordination: every scheduler forgets its in-process bookkeeping.
    ///
    /// Durable offsets and caches survive, so pipelines with a persisted offset
    /// resume instead of replaying.
    pub fn reset_all(&self) {
        for scheduler in self.schedulers.values() {
            scheduler.reset();
        }
        tracing::info!("Reset {} pipeline schedulers", self.schedulers.len());
    }

    /// Run every enabled pipeline until a shutdown signal arrives.
    pub async fn run(&self, shutdown: &broadcast::Sender<()>) -> Result<()> {
        self.reset_all();

        let mut tasks = JoinSet::new();
        for scheduler in self.schedulers.values() {
            let schedule = scheduler.resolve_schedule().await;
            if !schedule.enabled {
                tracing::info!("Pipeline {} is disabled, not scheduling", scheduler.name());
                continue;
            }
            tasks.spawn(run_pipeline_loop(
                scheduler.clone(),
                schedule,
                shutdown.subscribe(),
            ));
        }

        if tasks.is_empty() {
            tracing::warn!("No enabled pipelines to run");
            return Ok(());
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!("Pipeline task ended abnormally: {}", e);
            }
        }

        tracing::info!("All pipelines stopped");
        Ok(())
    }

    pub async fn status(&self) -> Vec<SchedulerStatus> {
        join_all(self.schedulers.values().map(|s| s.status())).await
    }

    /// Run one tick of a pipeline now, serialised with its timer ticks.
    pub async fn trigger(&self, name: &str) -> Result<TickReport> {
        let scheduler = self.get(name)?;
        tracing::info!("Manual trigger of pipeline {}", name);
        Ok(scheduler.tick().await)
    }

    /// Clear a pipeline's snapshots; with `reset_offset` also its durable offset
    /// so the next bootstrap is a true full replay.
    pub async fn reset_cache(&self, name: &str, reset_offset: bool) -> Result<ResetReport> {
        self.get(name)?.reset_cache(reset_offset).await
    }

    pub fn request_reprocess(&self, name: &str) -> Result<()> {
        self.get(name)?.request_reprocess();
        Ok(())
    }
}

/// Timer loop of one pipeline.
///
/// Ticks never overlap: the next interval tick is only awaited after the previous
/// tick finished, and late ticks are delayed rather than bunched up. A shutdown
/// signal lets the running tick complete and drains queued events before returning.
async fn run_pipeline_loop(
    scheduler: Arc<PipelineScheduler>,
    schedule: ScheduleConfig,
    mut shutdown: broadcast::Receiver<()>,
) {
    let name = scheduler.name().to_string();
    tracing::info!(
        "Starting pipeline {} with interval={:?}, initial_delay={:?}",
        name,
        schedule.interval,
        schedule.initial_delay
    );

    if !schedule.initial_delay.is_zero() {
        tokio::select! {
            biased;
            _ = shutdown.recv() => {
                tracing::info!("Shutdown signal received, pipeline {} never started", name);
                return;
            }
            _ = sleep(schedule.initial_delay) => {}
        }
    }

    let mut ticker = interval(schedule.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut ticks = 0u64;

    loop {
        tokio::select! {
            biased; // Check shutdown first

            _ = shutdown.recv() => {
                tracing::info!("Shutdown signal received, stopping pipeline {}", name);
                break;
            }
            _ = ticker.tick() => {
                ticks += 1;
                tracing::debug!("Pipeline {} tick {}", name, ticks);

                // A started tick always finishes; shutdown is only honoured between ticks
                let report = scheduler.tick().await;
                if !report.success {
                    tracing::debug!("Pipeline {} will retry on its next tick", name);
                }
            }
        }
    }

    scheduler.pipeline().flush_events().await;
    tracing::info!("Pipeline {} stopped after {} ticks", name, ticks);
}
