//! Session ledger model.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::agent::AgentCapabilities;

/// The live connection context between one agent and the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Unique session identifier.
    pub id: String,
    /// Owning agent.
    pub agent_id: String,
    /// Creation time.
    pub start_time: DateTime<Utc>,
    /// Termination time; `None` while live.
    pub finish_time: Option<DateTime<Utc>>,
    /// Capabilities reported when the session was created.
    pub capabilities: AgentCapabilities,
    /// Agent software version.
    pub version: Option<String>,
}

impl Session {
    /// Construct a new live session with a generated identifier.
    #[must_use]
    pub fn new(
        agent_id: String,
        start_time: DateTime<Utc>,
        capabilities: AgentCapabilities,
        version: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            agent_id,
            start_time,
            finish_time: None,
            capabilities,
            version,
        }
    }
}
