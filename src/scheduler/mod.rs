//! Scheduler core: session lifecycle, lease reconciliation, long-poll
//! dispatch and connection-loss tracking.
//!
//! [`service::AgentService`] composes the pieces. Every agent mutation goes
//! through [`retry::update_with_retry`], which re-reads the record and
//! retries when a concurrent writer won the compare-and-swap.

pub mod connection_listeners;
pub mod lease_dispatcher;
pub mod lease_tracker;
pub mod retry;
pub mod service;
pub mod session_manager;
pub mod sweeper;

use std::sync::Arc;

use crate::models::agent::Agent;
use crate::persistence::agent_repo::AgentRepo;
use crate::persistence::db::Database;
use crate::persistence::lease_repo::LeaseRepo;
use crate::persistence::session_repo::SessionRepo;
use crate::{AppError, Result};

/// The three ledgers the scheduler reads and writes.
#[derive(Clone)]
pub struct Ledgers {
    /// Agent records.
    pub agents: AgentRepo,
    /// Session history.
    pub sessions: SessionRepo,
    /// Lease history.
    pub leases: LeaseRepo,
}

impl Ledgers {
    /// Build all ledgers over one pool.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            agents: AgentRepo::new(Arc::clone(&db)),
            sessions: SessionRepo::new(Arc::clone(&db)),
            leases: LeaseRepo::new(db),
        }
    }
}

/// Read an agent that must exist.
pub(crate) async fn load_agent(agents: &AgentRepo, agent_id: &str) -> Result<Agent> {
    agents
        .get(agent_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("agent {agent_id} not found")))
}
