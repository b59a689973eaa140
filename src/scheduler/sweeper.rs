//! Background maintenance tasks for the scheduler.
//!
//! - the expiry sweep terminates sessions whose agent stopped renewing;
//! - the listener tick fires connection-lost callbacks past their idle
//!   deadline.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};

use super::service::AgentService;

/// Cadence of the idle-listener check.
pub const LISTENER_TICK: Duration = Duration::from_secs(1);

/// Spawn the expired-session sweep, running every `interval` until
/// `cancel` fires.
#[must_use]
pub fn spawn_expiry_sweeper(
    service: Arc<AgentService>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            let mut interval = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("expiry sweeper shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        match service.terminate_expired_sessions().await {
                            Ok(0) => {}
                            Ok(terminated) => debug!(terminated, "expiry sweep completed"),
                            Err(err) => error!(%err, "expiry sweep failed"),
                        }
                    }
                }
            }
        }
        .instrument(info_span!("expiry_sweeper")),
    )
}

/// Spawn the idle-listener tick, running every [`LISTENER_TICK`] until
/// `cancel` fires.
#[must_use]
pub fn spawn_listener_tick(service: Arc<AgentService>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            let mut interval = tokio::time::interval(LISTENER_TICK);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("listener tick shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        if let Err(err) = service.expire_idle_listeners() {
                            error!(%err, "connection-lost callback failed");
                        }
                    }
                }
            }
        }
        .instrument(info_span!("listener_tick")),
    )
}
