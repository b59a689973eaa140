#![forbid(unsafe_code)]

//! `horde-scheduler` daemon binary.
//!
//! Bootstraps configuration and the ledgers, wires the scheduler service
//! and runs its background maintenance (expired-session sweep, idle
//! listener tick, retention purge) until a shutdown signal arrives.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use horde_scheduler::clock::{Clock, SystemClock};
use horde_scheduler::config::GlobalConfig;
use horde_scheduler::downtime::{DowntimeProvider, DowntimeSchedule, DowntimeWatcher};
use horde_scheduler::persistence::{db, retention};
use horde_scheduler::scheduler::service::AgentService;
use horde_scheduler::scheduler::sweeper;
use horde_scheduler::task_source::queue::QueueTaskSource;
use horde_scheduler::task_source::{TaskSource, TaskSources};
use horde_scheduler::{AppError, Result};

/// Payload type of the built-in in-process queue.
const QUEUE_PAYLOAD_TYPE: &str = "horde.scheduler.QueuedTask";

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "horde-scheduler", about = "Build-farm agent session and lease scheduler", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("horde-scheduler bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let config = GlobalConfig::load_from_path(&args.config)?;
    info!(
        expiry_seconds = config.session.expiry_seconds,
        long_poll_seconds = config.session.long_poll_seconds,
        downtime_windows = config.downtime.len(),
        "configuration loaded"
    );

    // ── Initialize database ─────────────────────────────
    let db = Arc::new(db::connect(config.db_path()).await?);
    info!(path = %config.db_path().display(), "database connected");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // ── Downtime windows (hot-reloaded) ─────────────────
    let downtime: Arc<dyn DowntimeProvider> =
        match DowntimeWatcher::new(&args.config, config.downtime.clone(), Arc::clone(&clock)) {
            Ok(watcher) => Arc::new(watcher),
            Err(err) => {
                warn!(%err, "downtime hot-reload unavailable, using windows from startup config");
                Arc::new(DowntimeSchedule::new(config.downtime.clone(), Arc::clone(&clock)))
            }
        };

    // ── Task sources ────────────────────────────────────
    let queue: Arc<dyn TaskSource> = Arc::new(QueueTaskSource::new("queue", QUEUE_PAYLOAD_TYPE));
    let sources = TaskSources::new(vec![queue]);
    info!(sources = sources.len(), "task sources registered");

    // ── Scheduler service and background tasks ─────────
    let ct = CancellationToken::new();
    let service = Arc::new(AgentService::new(
        Arc::clone(&db),
        sources,
        Arc::clone(&clock),
        config.session.clone(),
        downtime,
        ct.clone(),
    ));

    let sweeper_handle = sweeper::spawn_expiry_sweeper(
        Arc::clone(&service),
        config.session.expiry_sweep_interval(),
        ct.clone(),
    );
    let listener_handle = sweeper::spawn_listener_tick(Arc::clone(&service), ct.clone());
    let retention_handle =
        retention::spawn_retention_task(Arc::clone(&db), clock, config.retention_days, ct.clone());
    info!("scheduler ready");

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();

    // ── Wait for background tasks ───────────────────────
    let _ = tokio::join!(sweeper_handle, listener_handle, retention_handle);
    db.close().await;
    info!("horde-scheduler shut down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
