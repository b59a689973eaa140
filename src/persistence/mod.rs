//! Persistence layer modules.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::{AppError, Result};

pub mod agent_repo;
pub mod db;
pub mod lease_repo;
pub mod retention;
pub mod schema;
pub mod session_repo;

/// Re-export the database pool type for convenience.
pub use sqlx::SqlitePool;

/// Encode a timestamp as fixed-width RFC 3339 UTC text.
///
/// The fixed width keeps lexical order equal to chronological order, which
/// the expiry and retention range scans rely on.
pub(crate) fn encode_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Decode a timestamp column written by [`encode_time`].
pub(crate) fn decode_time(column: &str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| AppError::Db(format!("invalid {column}: {e}")))
}
