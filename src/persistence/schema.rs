//! `SQLite` schema bootstrap logic.
//!
//! All definitions use `IF NOT EXISTS` and are safe to re-run on every
//! startup.

use sqlx::SqlitePool;

use crate::Result;

/// Apply the agent, session and lease table definitions.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS agent (
    id                  TEXT PRIMARY KEY NOT NULL,
    enabled             INTEGER NOT NULL DEFAULT 1,
    status              TEXT NOT NULL CHECK(status IN ('unspecified','ok','unhealthy','stopping')),
    session_id          TEXT,
    session_expires_at  TEXT,
    leases              TEXT NOT NULL DEFAULT '[]',
    capabilities        TEXT NOT NULL DEFAULT '{}',
    version             TEXT,
    update_index        INTEGER NOT NULL DEFAULT 0,
    CHECK ((session_id IS NULL) = (session_expires_at IS NULL))
);

CREATE TABLE IF NOT EXISTS session (
    id              TEXT PRIMARY KEY NOT NULL,
    agent_id        TEXT NOT NULL,
    start_time      TEXT NOT NULL,
    finish_time     TEXT,
    capabilities    TEXT NOT NULL DEFAULT '{}',
    version         TEXT
);

CREATE TABLE IF NOT EXISTS lease (
    id              TEXT PRIMARY KEY NOT NULL,
    name            TEXT NOT NULL,
    agent_id        TEXT NOT NULL,
    session_id      TEXT NOT NULL,
    stream_id       TEXT,
    pool_id         TEXT,
    log_id          TEXT,
    start_time      TEXT NOT NULL,
    finish_time     TEXT,
    outcome         TEXT NOT NULL CHECK(outcome IN ('unspecified','success','failed','cancelled')),
    payload_type    TEXT NOT NULL,
    payload         BLOB NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_agent_session_expiry ON agent(session_expires_at);
CREATE INDEX IF NOT EXISTS idx_session_agent ON session(agent_id);
CREATE INDEX IF NOT EXISTS idx_lease_agent ON lease(agent_id);
CREATE INDEX IF NOT EXISTS idx_lease_session ON lease(session_id);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}
