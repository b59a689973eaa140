//! Lease model: state machine, outcome, payload and ledger entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a lease attached to an agent.
///
/// States only move forward: `Pending → Active → {Cancelled, Completed}`.
/// A pending lease may also go straight to a terminal state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LeaseState {
    /// Assigned by the server, not yet acknowledged by the agent.
    Pending,
    /// Being executed by the agent.
    Active,
    /// Cancelled by the server or the agent.
    Cancelled,
    /// Finished by the agent.
    Completed,
}

impl LeaseState {
    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Active => 1,
            Self::Cancelled | Self::Completed => 2,
        }
    }

    /// Whether the lease has reached a terminal state.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Completed)
    }

    /// Whether moving from `self` to `next` is a forward transition.
    #[must_use]
    pub fn can_advance_to(self, next: Self) -> bool {
        next.rank() > self.rank()
    }
}

/// Recorded result of a finished lease.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LeaseOutcome {
    /// No outcome recorded yet.
    #[default]
    Unspecified,
    /// The work finished successfully.
    Success,
    /// The work failed, or the agent went away while holding it.
    Failed,
    /// The work was cancelled.
    Cancelled,
}

/// Opaque, type-tagged lease payload.
///
/// The scheduler never looks inside `data`; `type_url` routes abort
/// requests to the task source that produced the payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeasePayload {
    /// Payload type descriptor, matched against `TaskSource::payload_type`.
    pub type_url: String,
    /// Serialized payload body.
    pub data: Vec<u8>,
}

impl LeasePayload {
    /// Construct a payload from a type descriptor and body.
    #[must_use]
    pub fn new(type_url: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            type_url: type_url.into(),
            data: data.into(),
        }
    }
}

/// Durable ledger entry for a lease, keyed by lease id.
///
/// Created when the lease is first attached to an agent and finalized once,
/// with an outcome and finish time, when it is removed from the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// Globally unique lease identifier.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Agent the lease was assigned to.
    pub agent_id: String,
    /// Session during which the lease was assigned.
    pub session_id: String,
    /// Routing metadata: stream.
    pub stream_id: Option<String>,
    /// Routing metadata: pool.
    pub pool_id: Option<String>,
    /// Log identifier for the lease output.
    pub log_id: Option<String>,
    /// Assignment time.
    pub start_time: DateTime<Utc>,
    /// Finalization time; `None` while outstanding.
    pub finish_time: Option<DateTime<Utc>>,
    /// Final outcome; `Unspecified` while outstanding.
    pub outcome: LeaseOutcome,
    /// Opaque payload.
    pub payload: LeasePayload,
}

impl Lease {
    /// Whether the ledger entry has been finalized.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finish_time.is_some()
    }
}
