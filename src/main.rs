// ABOUTME: CLI entry point for warehouse-sync
// ABOUTME: Parses commands and routes them to the orchestrator's control operations

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::sync::broadcast;
use warehouse_sync::config::{AppConfig, DEFAULT_CONFIG_PATH};
use warehouse_sync::orchestrator::Orchestrator;
use warehouse_sync::scheduler::TickKind;

#[derive(Parser)]
#[command(name = "warehouse-sync")]
#[command(about = "Incremental change capture into a warehouse sink and event stream", long_about = None)]
#[command(version)]
struct Cli {
    /// Allow self-signed TLS certificates (insecure - use only for testing)
    #[arg(
        long = "allow-self-signed-certs",
        global = true,
        default_value_t = false
    )]
    allow_self_signed_certs: bool,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    /// Path to the configuration file
    #[arg(
        long,
        global = true,
        env = "WAREHOUSE_SYNC_CONFIG",
        default_value = DEFAULT_CONFIG_PATH
    )]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every enabled pipeline until Ctrl+C
    Run,
    /// Run one tick of a pipeline now and print its report
    Trigger {
        #[arg(long)]
        pipeline: String,
    },
    /// Show offsets, cache namespaces and statistics of every pipeline
    Status,
    /// Clear a pipeline's snapshot cache
    Reset {
        #[arg(long)]
        pipeline: String,
        /// Also clear the persisted offset, forcing a full replay
        #[arg(long, default_value_t = false)]
        offset: bool,
    },
    /// Check connectivity and table presence for every pipeline
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG has precedence over --log
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    warehouse_sync::postgres::init_tls_policy(cli.allow_self_signed_certs);

    let config = AppConfig::load(&cli.config)?;
    let orchestrator = config
        .build()
        .await
        .context("Failed to set up pipelines")?;

    match cli.command {
        Commands::Run => run(orchestrator).await,
        Commands::Trigger { pipeline } => trigger(&orchestrator, &pipeline).await,
        Commands::Status => {
            let status = orchestrator.status().await;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Commands::Reset { pipeline, offset } => {
            let report = orchestrator.reset_cache(&pipeline, offset).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Validate => validate(&orchestrator).await,
    }
}

async fn run(orchestrator: Orchestrator) -> anyhow::Result<()> {
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Received shutdown signal"),
            Err(e) => tracing::error!("Failed to listen for Ctrl+C: {}", e),
        }
        let _ = shutdown_tx_clone.send(());
    });

    tracing::info!(
        "Starting pipelines: {}",
        orchestrator.names().collect::<Vec<_>>().join(", ")
    );
    orchestrator.run(&shutdown_tx).await
}

async fn trigger(orchestrator: &Orchestrator, pipeline: &str) -> anyhow::Result<()> {
    let mut report = orchestrator.trigger(pipeline).await?;
    // A fresh process resumes without loading anything; follow up with a real pass
    if report.success && report.kind == TickKind::Resume {
        report = orchestrator.trigger(pipeline).await?;
    }
    orchestrator.get(pipeline)?.pipeline().flush_events().await;

    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.success {
        anyhow::bail!(
            "Pipeline {} failed: {}",
            pipeline,
            report.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

async fn validate(orchestrator: &Orchestrator) -> anyhow::Result<()> {
    let mut failed = Vec::new();
    for scheduler in orchestrator.schedulers() {
        match scheduler.pipeline().preflight().await {
            Ok(()) => println!("✓ {}", scheduler.name()),
            Err(e) => {
                println!("✗ {}: {:#}", scheduler.name(), e);
                failed.push(scheduler.name().to_string());
            }
        }
    }

    if !failed.is_empty() {
        anyhow::bail!("Pre-checks failed for: {}", failed.join(", "));
    }
    Ok(())
}
