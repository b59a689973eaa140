//! Global configuration parsing and validation.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::{AppError, Result};

/// Longest accepted value for any session timing knob (one week).
const MAX_TIMING_SECONDS: u32 = 7 * 24 * 60 * 60;

/// Session, long-poll and sweep timing (seconds).
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SessionConfig {
    /// Lifetime granted to a session by each renewal.
    #[serde(default = "default_expiry_seconds")]
    pub expiry_seconds: u32,
    /// Longest time an `UpdateSession` long poll is held open.
    #[serde(default = "default_long_poll_seconds")]
    pub long_poll_seconds: u32,
    /// Renewal slack: the expiry is only rewritten once it has fallen this
    /// far behind a freshly computed one.
    #[serde(default = "default_renew_seconds")]
    pub renew_seconds: u32,
    /// Idle grace before connection-loss callbacks of a silent agent fire.
    #[serde(default = "default_listener_idle_seconds")]
    pub listener_idle_seconds: u32,
    /// Cadence of the expired-session sweep.
    #[serde(default = "default_expiry_sweep_seconds")]
    pub expiry_sweep_seconds: u32,
    /// Agents terminated per page by the expired-session sweep.
    #[serde(default = "default_expiry_page_size")]
    pub expiry_page_size: u32,
}

fn default_expiry_seconds() -> u32 {
    300
}

fn default_long_poll_seconds() -> u32 {
    55
}

fn default_renew_seconds() -> u32 {
    50
}

fn default_listener_idle_seconds() -> u32 {
    20
}

fn default_expiry_sweep_seconds() -> u32 {
    30
}

fn default_expiry_page_size() -> u32 {
    100
}

fn default_retention_days() -> u32 {
    30
}

fn default_db_path() -> PathBuf {
    PathBuf::from("horde-scheduler.db")
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            expiry_seconds: default_expiry_seconds(),
            long_poll_seconds: default_long_poll_seconds(),
            renew_seconds: default_renew_seconds(),
            listener_idle_seconds: default_listener_idle_seconds(),
            expiry_sweep_seconds: default_expiry_sweep_seconds(),
            expiry_page_size: default_expiry_page_size(),
        }
    }
}

impl SessionConfig {
    /// Session lifetime granted on creation and renewal.
    #[must_use]
    pub fn expiry(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::from(self.expiry_seconds))
    }

    /// Maximum long-poll duration.
    #[must_use]
    pub fn long_poll(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::from(self.long_poll_seconds))
    }

    /// Renewal slack.
    #[must_use]
    pub fn renew(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::from(self.renew_seconds))
    }

    /// Connection listener idle grace.
    #[must_use]
    pub fn listener_idle(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::from(self.listener_idle_seconds))
    }

    /// Interval between expired-session sweeps.
    #[must_use]
    pub fn expiry_sweep_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.expiry_sweep_seconds))
    }

    fn validate(&self) -> Result<()> {
        let knobs = [
            ("expiry_seconds", self.expiry_seconds),
            ("long_poll_seconds", self.long_poll_seconds),
            ("renew_seconds", self.renew_seconds),
            ("listener_idle_seconds", self.listener_idle_seconds),
            ("expiry_sweep_seconds", self.expiry_sweep_seconds),
        ];
        for (name, value) in knobs {
            if value == 0 || value > MAX_TIMING_SECONDS {
                return Err(AppError::Config(format!(
                    "session.{name} must be between 1 and {MAX_TIMING_SECONDS}"
                )));
            }
        }

        if self.long_poll_seconds >= self.expiry_seconds {
            return Err(AppError::Config(
                "session.long_poll_seconds must be shorter than session.expiry_seconds".into(),
            ));
        }

        if self.renew_seconds >= self.expiry_seconds {
            return Err(AppError::Config(
                "session.renew_seconds must be shorter than session.expiry_seconds".into(),
            ));
        }

        if self.expiry_page_size == 0 {
            return Err(AppError::Config(
                "session.expiry_page_size must be greater than zero".into(),
            ));
        }

        Ok(())
    }
}

/// A maintenance window during which no new leases are handed out.
///
/// Timestamps are RFC 3339 strings, e.g. `"2026-10-18T02:00:00Z"`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct DowntimeWindow {
    /// Optional label shown in logs.
    #[serde(default)]
    pub name: Option<String>,
    /// Inclusive window start.
    pub start: DateTime<Utc>,
    /// Exclusive window end.
    pub finish: DateTime<Utc>,
}

impl DowntimeWindow {
    /// Whether `now` falls inside the window.
    #[must_use]
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        self.start <= now && now < self.finish
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.finish <= self.start {
            return Err(AppError::Config(format!(
                "downtime window {} finishes before it starts",
                self.name.as_deref().unwrap_or("<unnamed>")
            )));
        }
        Ok(())
    }
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// `SQLite` database file backing the agent, session and lease ledgers.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Days after a session or lease is finalized before it is purged.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Session timing.
    #[serde(default)]
    pub session: SessionConfig,
    /// Scheduled maintenance windows.
    #[serde(default)]
    pub downtime: Vec<DowntimeWindow>,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Path of the database file.
    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn validate(&self) -> Result<()> {
        if self.db_path.as_os_str().is_empty() {
            return Err(AppError::Config("db_path must not be empty".into()));
        }

        if self.retention_days == 0 {
            return Err(AppError::Config(
                "retention_days must be greater than zero".into(),
            ));
        }

        self.session.validate()?;

        for window in &self.downtime {
            window.validate()?;
        }

        Ok(())
    }
}
