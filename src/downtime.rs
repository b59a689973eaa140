//! Scheduled downtime: while a window is active no new leases are handed
//! out, but sessions keep being renewed and reported leases reconciled.
//!
//! [`DowntimeWatcher`] uses the `notify` crate to watch `config.toml` and
//! re-parses only the `[[downtime]]` entries on change. Everything else in
//! the file requires a restart.
//!
//! ## Thread safety
//!
//! The window list is updated from inside a synchronous `notify` callback,
//! so it lives behind a `std::sync::RwLock` rather than a tokio lock.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::DowntimeWindow;
use crate::{AppError, Result};

/// Answers whether the farm is currently in a maintenance window.
pub trait DowntimeProvider: Send + Sync {
    /// Whether new work must be withheld right now.
    fn is_downtime_active(&self) -> bool;
}

/// Fixed list of downtime windows.
pub struct DowntimeSchedule {
    windows: Vec<DowntimeWindow>,
    clock: Arc<dyn Clock>,
}

impl DowntimeSchedule {
    /// Build a schedule from configured windows.
    #[must_use]
    pub fn new(windows: Vec<DowntimeWindow>, clock: Arc<dyn Clock>) -> Self {
        Self { windows, clock }
    }
}

impl DowntimeProvider for DowntimeSchedule {
    fn is_downtime_active(&self) -> bool {
        let now = self.clock.now();
        self.windows.iter().any(|window| window.contains(now))
    }
}

/// Manual on/off switch.
#[derive(Debug, Default)]
pub struct DowntimeSwitch {
    active: AtomicBool,
}

impl DowntimeSwitch {
    /// Turn downtime on or off.
    pub fn set(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }
}

impl DowntimeProvider for DowntimeSwitch {
    fn is_downtime_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// Minimal TOML structure used for hot-reload parsing.
///
/// Only the `[[downtime]]` array is extracted; other keys are ignored, so a
/// config that no longer passes full validation still reloads its windows.
#[derive(Debug, Deserialize)]
struct DowntimeOnlyConfig {
    #[serde(default)]
    downtime: Vec<DowntimeWindow>,
}

/// Parse only the `[[downtime]]` entries from a TOML file.
///
/// # Errors
///
/// Returns `AppError::Config` if the file cannot be read, the TOML is
/// invalid or a window finishes before it starts.
pub fn parse_downtime_windows(path: &Path) -> Result<Vec<DowntimeWindow>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|err| AppError::Config(format!("failed to read config for downtime reload: {err}")))?;
    let parsed: DowntimeOnlyConfig = toml::from_str(&raw)
        .map_err(|err| AppError::Config(format!("failed to parse downtime windows: {err}")))?;
    for window in &parsed.downtime {
        window.validate()?;
    }
    Ok(parsed.downtime)
}

fn is_config_change(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

/// Downtime windows hot-reloaded from the config file.
///
/// Dropping the watcher stops the underlying OS watch; the last loaded
/// windows stay in effect.
pub struct DowntimeWatcher {
    _watcher: Mutex<RecommendedWatcher>,
    windows: Arc<RwLock<Vec<DowntimeWindow>>>,
    clock: Arc<dyn Clock>,
}

impl DowntimeWatcher {
    /// Watch `config_path`, starting from `initial` windows.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the `notify` watcher cannot be created
    /// or the config directory cannot be watched.
    pub fn new(
        config_path: &Path,
        initial: Vec<DowntimeWindow>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let windows = Arc::new(RwLock::new(initial));
        let windows_for_callback = Arc::clone(&windows);
        let path_for_callback: PathBuf = config_path.to_path_buf();

        let mut watcher = notify::recommended_watcher(
            move |result: std::result::Result<Event, notify::Error>| match result {
                Ok(event) if is_config_change(&event) => {
                    match parse_downtime_windows(&path_for_callback) {
                        Ok(reloaded) => {
                            let count = reloaded.len();
                            *windows_for_callback
                                .write()
                                .unwrap_or_else(PoisonError::into_inner) = reloaded;
                            info!(path = %path_for_callback.display(), windows = count, "reloaded downtime windows");
                        }
                        Err(err) => {
                            warn!(
                                %err,
                                path = %path_for_callback.display(),
                                "failed to reload downtime windows, keeping previous values"
                            );
                        }
                    }
                }
                Err(err) => warn!(%err, "config file watcher error"),
                _ => {}
            },
        )
        .map_err(|err| AppError::Config(format!("failed to create config file watcher: {err}")))?;

        // Watch the directory so rename-based saves are picked up.
        let watch_target = config_path
            .parent()
            .filter(|parent| parent != &Path::new(""))
            .unwrap_or(config_path);

        watcher
            .watch(watch_target, RecursiveMode::NonRecursive)
            .map_err(|err| {
                AppError::Config(format!(
                    "failed to watch config path '{}': {err}",
                    watch_target.display()
                ))
            })?;

        info!(path = %config_path.display(), "downtime watcher started");

        Ok(Self {
            _watcher: Mutex::new(watcher),
            windows,
            clock,
        })
    }

    /// Snapshot of the current windows.
    #[must_use]
    pub fn windows(&self) -> Vec<DowntimeWindow> {
        self.windows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl DowntimeProvider for DowntimeWatcher {
    fn is_downtime_active(&self) -> bool {
        let now = self.clock.now();
        self.windows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|window| window.contains(now))
    }
}
