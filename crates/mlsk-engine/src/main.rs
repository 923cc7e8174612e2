//! MLSK Engine
//!
//! Boots the compute engine (worker pool, stuck-worker monitor, request
//! registry) and keeps it running until the process is asked to stop.

use std::path::PathBuf;

use clap::Parser;
use tracing::info;

use mlsk_core::config::load_config;
use mlsk_core::tracing_init::{crate_filter, init_tracing};
use mlsk_engine::ComputeEngine;

#[derive(Parser, Debug)]
#[command(name = "mlsk-engine")]
#[command(version, about = "MLSK compute engine - worker pool and request lifecycle")]
struct Args {
    /// Path to a JSON config file (defaults to `$XDG_CONFIG_HOME/mlsk/engine.json`)
    #[arg(long, env = "MLSK_CONFIG")]
    config: Option<PathBuf>,

    /// Number of worker slots
    #[arg(long)]
    workers: Option<usize>,

    /// Capacity of the shared task queue
    #[arg(long)]
    queue_capacity: Option<usize>,

    /// Seconds between two stuck-worker checks
    #[arg(long)]
    monitor_interval: Option<u64>,

    /// Seconds a worker may stay BUSY without a transition before it is reported
    #[arg(long)]
    stuck_threshold: Option<u64>,

    /// Start with the stuck-worker monitor paused
    #[arg(long)]
    no_monitor: bool,

    /// Log level filter for the engine (e.g. "info", "debug", "warn").
    #[arg(long)]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "MLSK_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    if let Some(workers) = args.workers {
        config.engine.worker_count = workers;
    }
    if let Some(capacity) = args.queue_capacity {
        config.engine.task_queue_capacity = capacity;
    }
    if let Some(secs) = args.monitor_interval {
        config.engine.monitor_interval_secs = secs;
    }
    if let Some(secs) = args.stuck_threshold {
        config.engine.stuck_threshold_secs = secs;
    }
    if args.no_monitor {
        config.engine.monitor_enabled = false;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    config.engine.validate()?;

    init_tracing(
        &crate_filter(env!("CARGO_PKG_NAME"), &config.logging.level),
        args.log_json || config.logging.json,
    );

    info!(
        version = env!("CARGO_PKG_VERSION"),
        workers = config.engine.worker_count,
        queue_capacity = config.engine.task_queue_capacity,
        monitor_enabled = config.engine.monitor_enabled,
        "Starting mlsk-engine"
    );

    let engine = ComputeEngine::new(&config.engine);
    engine.start()?;

    let snapshot = engine.admin_snapshot().await;
    info!(snapshot = %serde_json::to_string(&snapshot)?, "Engine ready");

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    engine.shutdown().await;
    info!("Engine stopped");
    Ok(())
}
