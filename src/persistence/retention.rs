//! Retention service for time-based ledger purge.
//!
//! Runs as a background task deleting finalized leases and sessions whose
//! finish time is older than `retention_days`. Outstanding records are
//! never touched.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::db::Database;
use super::encode_time;
use crate::clock::Clock;
use crate::Result;

const PURGE_INTERVAL: Duration = Duration::from_secs(3600);

/// Rows removed by one purge pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeCounts {
    /// Finalized leases deleted.
    pub leases: u64,
    /// Finished sessions deleted.
    pub sessions: u64,
}

/// Spawn the retention purge background task.
///
/// The task runs hourly until `cancel` fires.
#[must_use]
pub fn spawn_retention_task(
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
    retention_days: u32,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("retention task shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(err) = purge(&db, retention_days, clock.now()).await {
                        error!(?err, "retention purge failed");
                    }
                }
            }
        }
    })
}

/// Delete ledger entries finalized more than `retention_days` before `now`.
///
/// # Errors
///
/// Returns `AppError::Db` if a delete statement fails.
pub async fn purge(db: &Database, retention_days: u32, now: DateTime<Utc>) -> Result<PurgeCounts> {
    let cutoff = encode_time(now - chrono::Duration::days(i64::from(retention_days)));

    let leases = sqlx::query("DELETE FROM lease WHERE finish_time IS NOT NULL AND finish_time < ?1")
        .bind(&cutoff)
        .execute(db)
        .await?
        .rows_affected();

    let sessions =
        sqlx::query("DELETE FROM session WHERE finish_time IS NOT NULL AND finish_time < ?1")
            .bind(&cutoff)
            .execute(db)
            .await?
            .rows_affected();

    info!(retention_days, leases, sessions, "retention purge completed");
    Ok(PurgeCounts { leases, sessions })
}
