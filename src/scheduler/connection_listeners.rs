//! Connection-loss callbacks for leases bound to a live agent connection.
//!
//! Some leases only make sense while the agent that holds them keeps
//! talking to the server. Their task source asks for a callback when that
//! connection is lost. The registry fires a callback when either
//!
//! - the agent sends an update that no longer reports the lease, or
//! - the agent stays silent past its idle deadline.
//!
//! Entries are sharded by agent id. A shard lock is only held to move
//! callbacks in or out of the map, never while a callback runs.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::task_source::ConnectionLostCallback;
use crate::{AppError, Result};

const SHARD_COUNT: usize = 16;

#[derive(Default)]
struct AgentListeners {
    callbacks: Vec<(String, ConnectionLostCallback)>,
    deadline: Option<DateTime<Utc>>,
}

type Shard = HashMap<String, AgentListeners>;

/// Per-agent connection-loss callbacks with idle deadlines.
pub struct ConnectionListenerRegistry {
    shards: Vec<Mutex<Shard>>,
    clock: Arc<dyn Clock>,
    idle: chrono::Duration,
}

impl ConnectionListenerRegistry {
    /// Create an empty registry. Silent agents lose their listeners
    /// `idle` after their last update finished.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, idle: chrono::Duration) -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(Shard::new())).collect(),
            clock,
            idle,
        }
    }

    /// Track `lease_id` on `agent_id`'s connection.
    pub fn register(&self, agent_id: &str, lease_id: &str, callback: ConnectionLostCallback) {
        self.shard(agent_id)
            .entry(agent_id.to_owned())
            .or_default()
            .callbacks
            .push((lease_id.to_owned(), callback));
        debug!(agent_id, lease_id, "connection listener registered");
    }

    /// Drop the callback of a lease that left the agent normally.
    pub fn unregister(&self, agent_id: &str, lease_id: &str) {
        let mut shard = self.shard(agent_id);
        let Some(entry) = shard.get_mut(agent_id) else {
            return;
        };
        entry.callbacks.retain(|(id, _)| id != lease_id);
        if entry.callbacks.is_empty() {
            shard.remove(agent_id);
        }
    }

    /// An update from `agent_id` started.
    ///
    /// Fires the callbacks of leases missing from `reported` and suspends
    /// the idle deadline until [`end_update`](Self::end_update). Returns the
    /// number of callbacks fired.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Listener` with the first callback failure; every
    /// due callback still runs.
    pub fn begin_update<'a>(
        &self,
        agent_id: &str,
        reported: impl IntoIterator<Item = &'a str>,
    ) -> Result<usize> {
        let reported: HashSet<&str> = reported.into_iter().collect();

        let lost = {
            let mut shard = self.shard(agent_id);
            let Some(entry) = shard.get_mut(agent_id) else {
                return Ok(0);
            };
            entry.deadline = None;
            let (kept, lost): (Vec<_>, Vec<_>) = std::mem::take(&mut entry.callbacks)
                .into_iter()
                .partition(|(lease_id, _)| reported.contains(lease_id.as_str()));
            entry.callbacks = kept;
            if entry.callbacks.is_empty() {
                shard.remove(agent_id);
            }
            lost
        };

        fire(agent_id, lost)
    }

    /// An update from `agent_id` finished; arm its idle deadline.
    pub fn end_update(&self, agent_id: &str) {
        let deadline = self.clock.now() + self.idle;
        if let Some(entry) = self.shard(agent_id).get_mut(agent_id) {
            entry.deadline = Some(deadline);
        }
    }

    /// Fire every callback of agents whose idle deadline has passed.
    ///
    /// Returns the number of callbacks fired.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Listener` with the first callback failure; every
    /// due callback still runs.
    pub fn expire_idle(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut fired = 0;
        let mut first_error = None;

        for shard in &self.shards {
            let expired: Vec<(String, AgentListeners)> = {
                let mut shard = lock(shard);
                let due: Vec<String> = shard
                    .iter()
                    .filter(|(_, entry)| entry.deadline.is_some_and(|deadline| deadline <= now))
                    .map(|(agent_id, _)| agent_id.clone())
                    .collect();
                due.into_iter()
                    .filter_map(|agent_id| shard.remove_entry(&agent_id))
                    .collect()
            };

            for (agent_id, entry) in expired {
                info!(agent_id, leases = entry.callbacks.len(), "agent connection idle, firing listeners");
                fired += entry.callbacks.len();
                if let Err(err) = fire(&agent_id, entry.callbacks) {
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(fired),
        }
    }

    /// Number of callbacks registered for `agent_id`.
    #[must_use]
    pub fn registered(&self, agent_id: &str) -> usize {
        self.shard(agent_id)
            .get(agent_id)
            .map_or(0, |entry| entry.callbacks.len())
    }

    fn shard(&self, agent_id: &str) -> MutexGuard<'_, Shard> {
        let mut hasher = DefaultHasher::new();
        agent_id.hash(&mut hasher);
        let index = usize::from(hasher.finish().to_le_bytes()[0]) % SHARD_COUNT;
        lock(&self.shards[index])
    }
}

fn lock(shard: &Mutex<Shard>) -> MutexGuard<'_, Shard> {
    shard.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Run callbacks outside any lock, keeping the first failure.
fn fire(agent_id: &str, callbacks: Vec<(String, ConnectionLostCallback)>) -> Result<usize> {
    let mut fired = 0;
    let mut first_error = None;

    for (lease_id, callback) in callbacks {
        fired += 1;
        info!(agent_id, lease_id, "lease connection lost");
        if let Err(err) = callback() {
            warn!(agent_id, lease_id, %err, "connection-lost callback failed");
            first_error.get_or_insert(AppError::Listener(format!(
                "lease {lease_id} on agent {agent_id}: {err}"
            )));
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(fired),
    }
}
