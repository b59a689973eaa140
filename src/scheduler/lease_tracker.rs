//! Lease lifecycle reconciliation.
//!
//! On every `UpdateSession` the agent reports the leases it knows about.
//! [`LeaseTracker::reconcile`] merges that report into the stored agent:
//! it renews the session, promotes acknowledged leases, removes finished
//! or cancelled ones and, for a draining agent, cancels whatever is left.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::SessionConfig;
use crate::models::agent::{Agent, AgentCapabilities, AgentLease, AgentStatus};
use crate::models::lease::{LeaseOutcome, LeaseState};
use crate::task_source::TaskSources;
use crate::{AppError, Result};

use super::retry::{update_with_retry, Mutation};
use super::{load_agent, Ledgers};

/// What to do with one attached lease given the agent's report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseAction {
    /// Leave it as it is.
    Keep,
    /// The agent acknowledged a pending lease.
    Promote,
    /// Take it off the agent and finalize it with this outcome.
    Remove(LeaseOutcome),
}

/// Decide the fate of `lease` given the matching entry of the agent's
/// report, if any.
#[must_use]
pub fn lease_action(lease: &AgentLease, report: Option<&AgentLease>) -> LeaseAction {
    if lease.state == LeaseState::Cancelled {
        let still_running = report.is_some_and(|reported| {
            matches!(reported.state, LeaseState::Pending | LeaseState::Active)
        });
        return if still_running {
            LeaseAction::Keep
        } else {
            LeaseAction::Remove(LeaseOutcome::Cancelled)
        };
    }

    let Some(report) = report else {
        return LeaseAction::Keep;
    };

    if report.state.is_terminal() {
        return LeaseAction::Remove(reported_outcome(report));
    }

    if report.state == LeaseState::Active && lease.state.can_advance_to(LeaseState::Active) {
        return LeaseAction::Promote;
    }

    LeaseAction::Keep
}

/// Outcome recorded for a lease the agent reported as terminal.
fn reported_outcome(report: &AgentLease) -> LeaseOutcome {
    match (report.state, report.outcome) {
        (LeaseState::Cancelled, LeaseOutcome::Unspecified) => LeaseOutcome::Cancelled,
        (_, outcome) => outcome,
    }
}

/// Result of one reconciliation.
#[derive(Debug, Clone)]
pub struct Reconciled {
    /// Agent as stored after the update.
    pub agent: Agent,
    /// Leases taken off the agent by this update.
    pub removed: Vec<String>,
    /// The agent is draining and holds no more leases; end its session.
    pub terminate: bool,
}

/// Merges agent lease reports into the stored agent.
#[derive(Clone)]
pub struct LeaseTracker {
    ledgers: Ledgers,
    sources: TaskSources,
    clock: Arc<dyn Clock>,
    config: SessionConfig,
}

impl LeaseTracker {
    /// Create a tracker.
    #[must_use]
    pub fn new(
        ledgers: Ledgers,
        sources: TaskSources,
        clock: Arc<dyn Clock>,
        config: SessionConfig,
    ) -> Self {
        Self {
            ledgers,
            sources,
            clock,
            config,
        }
    }

    /// Reconcile the stored agent with what it just reported.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidSession` if `session_id` is not the
    /// agent's live session, `AppError::NotFound` if the agent disappeared
    /// while retrying, or `AppError::Db` on a ledger failure.
    pub async fn reconcile(
        &self,
        agent: Agent,
        session_id: &str,
        status: AgentStatus,
        capabilities: Option<&AgentCapabilities>,
        reported: &[AgentLease],
    ) -> Result<Reconciled> {
        let agent_id = agent.id.clone();
        let (agent, (removed, terminate)) = update_with_retry(
            "reconcile_leases",
            agent,
            || load_agent(&self.ledgers.agents, &agent_id),
            |agent| self.reconcile_once(agent, session_id, status, capabilities, reported),
            |updated| self.ledgers.agents.try_replace(updated),
        )
        .await?;

        Ok(Reconciled {
            agent,
            removed,
            terminate,
        })
    }

    async fn reconcile_once(
        &self,
        agent: Agent,
        session_id: &str,
        status: AgentStatus,
        capabilities: Option<&AgentCapabilities>,
        reported: &[AgentLease],
    ) -> Result<Mutation<Agent, (Vec<String>, bool)>> {
        let now = self.clock.now();
        if !agent.is_session_valid(session_id, now) {
            return Err(AppError::InvalidSession(format!(
                "session {session_id} is not the live session of agent {}",
                agent.id
            )));
        }

        let mut updated = agent.clone();

        let renewed = now + self.config.expiry();
        if updated
            .session_expires_at
            .is_some_and(|expires| expires < renewed - self.config.renew())
        {
            updated.session_expires_at = Some(renewed);
            debug!(agent_id = %agent.id, session_id, expires = %renewed, "session renewed");
        }

        let mut removed = Vec::new();
        for lease in &agent.leases {
            let report = reported.iter().find(|entry| entry.id == lease.id);
            match lease_action(lease, report) {
                LeaseAction::Keep => {}
                LeaseAction::Promote => {
                    if let Some(attached) = updated.leases.iter_mut().find(|l| l.id == lease.id) {
                        attached.state = LeaseState::Active;
                    }
                    info!(agent_id = %agent.id, lease_id = %lease.id, "lease active");
                }
                LeaseAction::Remove(outcome) => {
                    if self.remove_lease(&mut updated, &lease.id, now, outcome).await? {
                        removed.push(lease.id.clone());
                    }
                }
            }
        }

        if status == AgentStatus::Stopping {
            for lease in updated.leases.iter_mut().filter(|l| !l.state.is_terminal()) {
                info!(agent_id = %agent.id, lease_id = %lease.id, "cancelling lease of stopping agent");
                lease.state = LeaseState::Cancelled;
            }
        }

        updated.status = status;
        if let Some(capabilities) = capabilities {
            updated.capabilities = capabilities.clone();
        }

        let terminate = status == AgentStatus::Stopping && updated.leases.is_empty();

        if updated == agent {
            Ok(Mutation::Keep(agent, (removed, terminate)))
        } else {
            Ok(Mutation::Write(updated, (removed, terminate)))
        }
    }

    /// Take a lease off `agent` and finalize its ledger entry.
    ///
    /// The owning task source is told to abort the lease; a failure there is
    /// logged and ignored. The finish time is clamped to the session and
    /// lease expiry so a lease never outlives the session that held it.
    /// Only the in-memory `agent` changes; the caller persists it.
    ///
    /// Returns `false` if the agent holds no such lease.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the ledger update fails.
    pub async fn remove_lease(
        &self,
        agent: &mut Agent,
        lease_id: &str,
        now: DateTime<Utc>,
        outcome: LeaseOutcome,
    ) -> Result<bool> {
        let Some(position) = agent.leases.iter().position(|lease| lease.id == lease_id) else {
            return Ok(false);
        };
        let lease = agent.leases.remove(position);

        match self.sources.for_payload(&lease.payload) {
            Some(source) => {
                if let Err(err) = source.abort_task(agent, &lease.id, &lease.payload).await {
                    warn!(
                        agent_id = %agent.id,
                        lease_id = %lease.id,
                        source = source.name(),
                        %err,
                        "failed to abort lease"
                    );
                }
            }
            None => {
                debug!(lease_id = %lease.id, payload_type = %lease.payload.type_url, "no task source owns lease payload");
            }
        }

        let mut finish = now;
        if let Some(expires) = agent.session_expires_at {
            finish = finish.min(expires);
        }
        if let Some(expires) = lease.expiry_time {
            finish = finish.min(expires);
        }

        if !self
            .ledgers
            .leases
            .try_set_outcome(&lease.id, outcome, finish)
            .await?
        {
            debug!(lease_id = %lease.id, "lease ledger entry missing or already finalized");
        }

        info!(agent_id = %agent.id, lease_id = %lease.id, ?outcome, "lease removed");
        Ok(true)
    }
}
