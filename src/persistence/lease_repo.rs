//! Lease ledger for `SQLite` persistence.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::models::lease::{Lease, LeaseOutcome, LeasePayload};
use crate::{AppError, Result};

use super::db::Database;
use super::{decode_time, encode_time};

const INSERT_LEASE: &str = "INSERT INTO lease (id, name, agent_id, session_id, stream_id, pool_id,
     log_id, start_time, finish_time, outcome, payload_type, payload)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)";

const INSERT_LEASE_UNLESS_TAKEN: &str = "INSERT INTO lease (id, name, agent_id, session_id, stream_id,
     pool_id, log_id, start_time, finish_time, outcome, payload_type, payload)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
     ON CONFLICT(id) DO NOTHING";

/// Repository wrapper around `SQLite` for lease ledger entries.
#[derive(Clone)]
pub struct LeaseRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct LeaseRow {
    id: String,
    name: String,
    agent_id: String,
    session_id: String,
    stream_id: Option<String>,
    pool_id: Option<String>,
    log_id: Option<String>,
    start_time: String,
    finish_time: Option<String>,
    outcome: String,
    payload_type: String,
    payload: Vec<u8>,
}

impl LeaseRow {
    fn into_lease(self) -> Result<Lease> {
        Ok(Lease {
            id: self.id,
            name: self.name,
            agent_id: self.agent_id,
            session_id: self.session_id,
            stream_id: self.stream_id,
            pool_id: self.pool_id,
            log_id: self.log_id,
            start_time: decode_time("start_time", &self.start_time)?,
            finish_time: self
                .finish_time
                .as_deref()
                .map(|raw| decode_time("finish_time", raw))
                .transpose()?,
            outcome: parse_outcome(&self.outcome)?,
            payload: LeasePayload {
                type_url: self.payload_type,
                data: self.payload,
            },
        })
    }
}

fn parse_outcome(s: &str) -> Result<LeaseOutcome> {
    match s {
        "unspecified" => Ok(LeaseOutcome::Unspecified),
        "success" => Ok(LeaseOutcome::Success),
        "failed" => Ok(LeaseOutcome::Failed),
        "cancelled" => Ok(LeaseOutcome::Cancelled),
        other => Err(AppError::Db(format!("invalid lease outcome: {other}"))),
    }
}

fn outcome_str(outcome: LeaseOutcome) -> &'static str {
    match outcome {
        LeaseOutcome::Unspecified => "unspecified",
        LeaseOutcome::Success => "success",
        LeaseOutcome::Failed => "failed",
        LeaseOutcome::Cancelled => "cancelled",
    }
}

impl LeaseRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new, outstanding lease entry.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the database insert fails (including a
    /// duplicate lease id).
    pub async fn add(&self, lease: &Lease) -> Result<Lease> {
        self.insert(INSERT_LEASE, lease).await?;
        Ok(lease.clone())
    }

    /// Insert a new, outstanding lease entry unless the id is already taken.
    ///
    /// Returns `false` when a lease with the same id exists, finished or
    /// not; the existing entry is left untouched.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the database insert fails.
    pub async fn try_add(&self, lease: &Lease) -> Result<bool> {
        let inserted = self.insert(INSERT_LEASE_UNLESS_TAKEN, lease).await?;
        Ok(inserted == 1)
    }

    /// Delete an entry that was never finalized, undoing a
    /// [`try_add`](Self::try_add) whose assignment did not go through.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn remove_outstanding(&self, id: &str, agent_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM lease WHERE id = ?1 AND agent_id = ?2 AND finish_time IS NULL",
        )
        .bind(id)
        .bind(agent_id)
        .execute(self.db.as_ref())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn insert(&self, sql: &str, lease: &Lease) -> Result<u64> {
        let result = sqlx::query(sql)
            .bind(&lease.id)
            .bind(&lease.name)
            .bind(&lease.agent_id)
            .bind(&lease.session_id)
            .bind(&lease.stream_id)
            .bind(&lease.pool_id)
            .bind(&lease.log_id)
            .bind(encode_time(lease.start_time))
            .bind(lease.finish_time.map(encode_time))
            .bind(outcome_str(lease.outcome))
            .bind(&lease.payload.type_url)
            .bind(&lease.payload.data)
            .execute(self.db.as_ref())
            .await?;

        Ok(result.rows_affected())
    }

    /// Retrieve a lease by identifier.
    ///
    /// Returns `Ok(None)` if the lease does not exist.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get(&self, id: &str) -> Result<Option<Lease>> {
        let row: Option<LeaseRow> = sqlx::query_as("SELECT * FROM lease WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.db.as_ref())
            .await?;

        row.map(LeaseRow::into_lease).transpose()
    }

    /// List every lease assigned to an agent, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_for_agent(&self, agent_id: &str) -> Result<Vec<Lease>> {
        let rows: Vec<LeaseRow> =
            sqlx::query_as("SELECT * FROM lease WHERE agent_id = ?1 ORDER BY start_time ASC")
                .bind(agent_id)
                .fetch_all(self.db.as_ref())
                .await?;

        rows.into_iter().map(LeaseRow::into_lease).collect()
    }

    /// Finalize a lease with its outcome and finish time.
    ///
    /// Returns `false` if the lease is unknown or already finalized; a
    /// finalized entry is never rewritten.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn try_set_outcome(
        &self,
        id: &str,
        outcome: LeaseOutcome,
        finish_time: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE lease SET outcome = ?1, finish_time = ?2 \
             WHERE id = ?3 AND finish_time IS NULL",
        )
        .bind(outcome_str(outcome))
        .bind(encode_time(finish_time))
        .bind(id)
        .execute(self.db.as_ref())
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
