//! Session ledger for `SQLite` persistence.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::models::agent::AgentCapabilities;
use crate::models::session::Session;
use crate::Result;

use super::db::Database;
use super::{decode_time, encode_time};

/// Repository wrapper around `SQLite` for session records.
#[derive(Clone)]
pub struct SessionRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    agent_id: String,
    start_time: String,
    finish_time: Option<String>,
    capabilities: String,
    version: Option<String>,
}

impl SessionRow {
    fn into_session(self) -> Result<Session> {
        let capabilities: AgentCapabilities = serde_json::from_str(&self.capabilities)?;
        Ok(Session {
            id: self.id,
            agent_id: self.agent_id,
            start_time: decode_time("start_time", &self.start_time)?,
            finish_time: self
                .finish_time
                .as_deref()
                .map(|raw| decode_time("finish_time", raw))
                .transpose()?,
            capabilities,
            version: self.version,
        })
    }
}

impl SessionRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new session record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the database insert fails.
    pub async fn add(&self, session: &Session) -> Result<Session> {
        let capabilities = serde_json::to_string(&session.capabilities)?;

        sqlx::query(
            "INSERT INTO session (id, agent_id, start_time, finish_time, capabilities, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&session.id)
        .bind(&session.agent_id)
        .bind(encode_time(session.start_time))
        .bind(session.finish_time.map(encode_time))
        .bind(&capabilities)
        .bind(&session.version)
        .execute(self.db.as_ref())
        .await?;

        Ok(session.clone())
    }

    /// Retrieve a session by identifier.
    ///
    /// Returns `Ok(None)` if the session does not exist.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get(&self, id: &str) -> Result<Option<Session>> {
        let row: Option<SessionRow> = sqlx::query_as("SELECT * FROM session WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.db.as_ref())
            .await?;

        row.map(SessionRow::into_session).transpose()
    }

    /// List every session ever opened by an agent, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_for_agent(&self, agent_id: &str) -> Result<Vec<Session>> {
        let rows: Vec<SessionRow> =
            sqlx::query_as("SELECT * FROM session WHERE agent_id = ?1 ORDER BY start_time ASC")
                .bind(agent_id)
                .fetch_all(self.db.as_ref())
                .await?;

        rows.into_iter().map(SessionRow::into_session).collect()
    }

    /// Set the finish time of a live session.
    ///
    /// Returns `false` if the session is unknown or was already finished;
    /// a finished session is never rewritten.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn try_finish(&self, id: &str, finish_time: DateTime<Utc>) -> Result<bool> {
        let result =
            sqlx::query("UPDATE session SET finish_time = ?1 WHERE id = ?2 AND finish_time IS NULL")
                .bind(encode_time(finish_time))
                .bind(id)
                .execute(self.db.as_ref())
                .await?;

        Ok(result.rows_affected() == 1)
    }
}
