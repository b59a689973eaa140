//! Agent repository for `SQLite` persistence.
//!
//! Every write is a compare-and-swap on `update_index`: the row is only
//! replaced if it still carries the index the caller read. A lost race is
//! reported as `Ok(None)`, never as an error.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::models::agent::{Agent, AgentCapabilities, AgentLease, AgentStatus};
use crate::{AppError, Result};

use super::db::Database;
use super::{decode_time, encode_time};

/// Repository wrapper around `SQLite` for agent records.
#[derive(Clone)]
pub struct AgentRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct AgentRow {
    id: String,
    enabled: i64,
    status: String,
    session_id: Option<String>,
    session_expires_at: Option<String>,
    leases: String,
    capabilities: String,
    version: Option<String>,
    update_index: i64,
}

impl AgentRow {
    fn into_agent(self) -> Result<Agent> {
        let session_expires_at = self
            .session_expires_at
            .as_deref()
            .map(|raw| decode_time("session_expires_at", raw))
            .transpose()?;
        let leases: Vec<AgentLease> = serde_json::from_str(&self.leases)?;
        let capabilities: AgentCapabilities = serde_json::from_str(&self.capabilities)?;

        Ok(Agent {
            id: self.id,
            enabled: self.enabled != 0,
            status: parse_status(&self.status)?,
            session_id: self.session_id,
            session_expires_at,
            leases,
            capabilities,
            version: self.version,
            update_index: self.update_index,
        })
    }
}

fn parse_status(s: &str) -> Result<AgentStatus> {
    match s {
        "unspecified" => Ok(AgentStatus::Unspecified),
        "ok" => Ok(AgentStatus::Ok),
        "unhealthy" => Ok(AgentStatus::Unhealthy),
        "stopping" => Ok(AgentStatus::Stopping),
        other => Err(AppError::Db(format!("invalid agent status: {other}"))),
    }
}

fn status_str(status: AgentStatus) -> &'static str {
    match status {
        AgentStatus::Unspecified => "unspecified",
        AgentStatus::Ok => "ok",
        AgentStatus::Unhealthy => "unhealthy",
        AgentStatus::Stopping => "stopping",
    }
}

impl AgentRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new agent record.
    ///
    /// Returns `Ok(None)` if an agent with the same id already exists.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the database insert fails.
    pub async fn add(&self, agent: &Agent) -> Result<Option<Agent>> {
        let leases = serde_json::to_string(&agent.leases)?;
        let capabilities = serde_json::to_string(&agent.capabilities)?;

        let result = sqlx::query(
            "INSERT INTO agent (id, enabled, status, session_id, session_expires_at,
             leases, capabilities, version, update_index)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(&agent.id)
        .bind(i64::from(agent.enabled))
        .bind(status_str(agent.status))
        .bind(&agent.session_id)
        .bind(agent.session_expires_at.map(encode_time))
        .bind(&leases)
        .bind(&capabilities)
        .bind(&agent.version)
        .bind(agent.update_index)
        .execute(self.db.as_ref())
        .await?;

        Ok((result.rows_affected() == 1).then(|| agent.clone()))
    }

    /// Retrieve an agent by identifier.
    ///
    /// Returns `Ok(None)` if the agent does not exist.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get(&self, id: &str) -> Result<Option<Agent>> {
        let row: Option<AgentRow> = sqlx::query_as("SELECT * FROM agent WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.db.as_ref())
            .await?;

        row.map(AgentRow::into_agent).transpose()
    }

    /// Retrieve at most `limit` agents whose session expired before `now`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn find_expired(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Agent>> {
        let rows: Vec<AgentRow> = sqlx::query_as(
            "SELECT * FROM agent \
             WHERE session_expires_at IS NOT NULL AND session_expires_at < ?1 \
             ORDER BY session_expires_at ASC LIMIT ?2",
        )
        .bind(encode_time(now))
        .bind(i64::from(limit))
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter().map(AgentRow::into_agent).collect()
    }

    /// Replace `current` with `updated` if nobody else wrote the agent since
    /// `current` was read.
    ///
    /// Returns the stored agent with its bumped `update_index`, or `Ok(None)`
    /// if the compare-and-swap lost.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails or `updated` breaks the
    /// session invariant.
    pub async fn try_update(&self, current: &Agent, updated: &Agent) -> Result<Option<Agent>> {
        if updated.session_id.is_some() != updated.session_expires_at.is_some() {
            return Err(AppError::Db(format!(
                "agent {} session id and expiry must be set together",
                updated.id
            )));
        }

        let leases = serde_json::to_string(&updated.leases)?;
        let capabilities = serde_json::to_string(&updated.capabilities)?;
        let next_index = current.update_index + 1;

        let result = sqlx::query(
            "UPDATE agent SET enabled = ?1, status = ?2, session_id = ?3,
             session_expires_at = ?4, leases = ?5, capabilities = ?6, version = ?7,
             update_index = ?8
             WHERE id = ?9 AND update_index = ?10",
        )
        .bind(i64::from(updated.enabled))
        .bind(status_str(updated.status))
        .bind(&updated.session_id)
        .bind(updated.session_expires_at.map(encode_time))
        .bind(&leases)
        .bind(&capabilities)
        .bind(&updated.version)
        .bind(next_index)
        .bind(&current.id)
        .bind(current.update_index)
        .execute(self.db.as_ref())
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        let mut stored = updated.clone();
        stored.update_index = next_index;
        Ok(Some(stored))
    }

    /// Write `updated` if the stored agent still carries the
    /// `update_index` that `updated` was derived from.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn try_replace(&self, updated: Agent) -> Result<Option<Agent>> {
        self.try_update(&updated, &updated).await
    }

    /// Append a lease to the agent's outstanding list.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn try_add_lease(&self, agent: &Agent, lease: AgentLease) -> Result<Option<Agent>> {
        let mut updated = agent.clone();
        updated.leases.push(lease);
        self.try_update(agent, &updated).await
    }
}
