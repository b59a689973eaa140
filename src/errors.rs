//! Error types shared across the scheduler.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all scheduler failure modes.
///
/// Optimistic-concurrency conflicts are deliberately absent: repository
/// compare-and-swap methods report them as `Ok(None)` and callers retry.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Persistence failure when interacting with `SQLite`.
    Db(String),
    /// Requested agent, session or lease does not exist.
    NotFound(String),
    /// Caller presented a session that is unknown, superseded or expired.
    InvalidSession(String),
    /// A task source failed to subscribe, offer or abort work.
    TaskSource(String),
    /// A connection-loss callback returned an error.
    Listener(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::InvalidSession(msg) => write!(f, "invalid session: {msg}"),
            Self::TaskSource(msg) => write!(f, "task source: {msg}"),
            Self::Listener(msg) => write!(f, "listener: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Db(format!("invalid json column: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
