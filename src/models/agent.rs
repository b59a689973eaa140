//! Agent model and its outstanding leases.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::lease::{LeaseOutcome, LeasePayload, LeaseState};

/// Health reported by an agent on every session update.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Nothing reported yet.
    #[default]
    Unspecified,
    /// Healthy and able to take work.
    Ok,
    /// Running but should not be given new work.
    Unhealthy,
    /// Draining: finish or cancel current leases, then end the session.
    Stopping,
}

/// Capabilities advertised by an agent, opaque to the scheduler.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentCapabilities {
    /// `KEY=VALUE` property strings.
    #[serde(default)]
    pub properties: Vec<String>,
}

impl AgentCapabilities {
    /// Build capabilities from property strings.
    #[must_use]
    pub fn new<I, S>(properties: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            properties: properties.into_iter().map(Into::into).collect(),
        }
    }
}

/// A lease while it is outstanding on an agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentLease {
    /// Globally unique lease identifier.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Current state.
    pub state: LeaseState,
    /// Outcome reported by the agent once terminal.
    #[serde(default)]
    pub outcome: LeaseOutcome,
    /// Routing metadata: stream.
    #[serde(default)]
    pub stream_id: Option<String>,
    /// Routing metadata: pool.
    #[serde(default)]
    pub pool_id: Option<String>,
    /// Log identifier for the lease output.
    #[serde(default)]
    pub log_id: Option<String>,
    /// Assignment time.
    pub start_time: DateTime<Utc>,
    /// Latest time the lease may be considered running.
    #[serde(default)]
    pub expiry_time: Option<DateTime<Utc>>,
    /// Opaque payload.
    pub payload: LeasePayload,
}

impl AgentLease {
    /// Agent-side view of this lease with a different state, as carried in
    /// an `UpdateSession` report.
    #[must_use]
    pub fn reported(&self, state: LeaseState, outcome: LeaseOutcome) -> Self {
        Self {
            state,
            outcome,
            ..self.clone()
        }
    }
}

/// A worker agent as stored in the agent ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Agent {
    /// Agent identifier (usually the host name).
    pub id: String,
    /// Disabled agents keep their session but are not handed new work.
    pub enabled: bool,
    /// Last reported health.
    pub status: AgentStatus,
    /// Live session, if any.
    pub session_id: Option<String>,
    /// Expiry of the live session; set exactly when `session_id` is.
    pub session_expires_at: Option<DateTime<Utc>>,
    /// Outstanding leases in assignment order.
    pub leases: Vec<AgentLease>,
    /// Last advertised capabilities.
    pub capabilities: AgentCapabilities,
    /// Agent software version.
    pub version: Option<String>,
    /// Compare-and-swap version tag, bumped by every successful write.
    pub update_index: i64,
}

impl Agent {
    /// Construct a freshly registered, sessionless agent.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            enabled: true,
            status: AgentStatus::Unspecified,
            session_id: None,
            session_expires_at: None,
            leases: Vec::new(),
            capabilities: AgentCapabilities::default(),
            version: None,
            update_index: 0,
        }
    }

    /// Whether a session is attached.
    #[must_use]
    pub fn has_session(&self) -> bool {
        self.session_id.is_some()
    }

    /// Whether `session_id` names the attached session and it has not expired.
    #[must_use]
    pub fn is_session_valid(&self, session_id: &str, now: DateTime<Utc>) -> bool {
        self.session_id.as_deref() == Some(session_id)
            && self.session_expires_at.is_some_and(|expires| expires > now)
    }

    /// Look up an outstanding lease.
    #[must_use]
    pub fn lease(&self, lease_id: &str) -> Option<&AgentLease> {
        self.leases.iter().find(|lease| lease.id == lease_id)
    }

    /// Whether the agent should be offered new work.
    #[must_use]
    pub fn can_accept_work(&self) -> bool {
        self.enabled
            && self.status == AgentStatus::Ok
            && self.has_session()
            && self.leases.is_empty()
    }
}
