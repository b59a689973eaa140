//! Agent-facing scheduler service.
//!
//! Composes the session manager, lease tracker, dispatcher and connection
//! listener registry into the operations an agent transport calls:
//! `CreateSession` and `UpdateSession`, plus the periodic maintenance the
//! background tasks drive.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, Instrument};

use crate::clock::Clock;
use crate::config::SessionConfig;
use crate::downtime::DowntimeProvider;
use crate::models::agent::{Agent, AgentCapabilities, AgentLease, AgentStatus};
use crate::models::lease::LeaseState;
use crate::persistence::db::Database;
use crate::task_source::TaskSources;
use crate::{AppError, Result};

use super::connection_listeners::ConnectionListenerRegistry;
use super::lease_dispatcher::LeaseDispatcher;
use super::lease_tracker::LeaseTracker;
use super::retry::{update_with_retry, Mutation};
use super::session_manager::SessionManager;
use super::{load_agent, Ledgers};

/// One `UpdateSession` call from an agent.
#[derive(Debug, Clone)]
pub struct UpdateSessionRequest {
    /// Calling agent.
    pub agent_id: String,
    /// Session the agent believes is live.
    pub session_id: String,
    /// Reported health.
    pub status: AgentStatus,
    /// Updated capabilities, if they changed.
    pub capabilities: Option<AgentCapabilities>,
    /// Every lease the agent currently knows about, with its state.
    pub leases: Vec<AgentLease>,
}

/// The scheduler as seen by agents.
pub struct AgentService {
    ledgers: Ledgers,
    sessions: SessionManager,
    tracker: LeaseTracker,
    dispatcher: LeaseDispatcher,
    listeners: ConnectionListenerRegistry,
}

impl AgentService {
    /// Wire up the scheduler over `db`.
    ///
    /// Long polls in flight end as soon as `shutdown` fires.
    #[must_use]
    pub fn new(
        db: Arc<Database>,
        sources: TaskSources,
        clock: Arc<dyn Clock>,
        config: SessionConfig,
        downtime: Arc<dyn DowntimeProvider>,
        shutdown: CancellationToken,
    ) -> Self {
        let ledgers = Ledgers::new(db);
        let tracker = LeaseTracker::new(
            ledgers.clone(),
            sources.clone(),
            Arc::clone(&clock),
            config.clone(),
        );
        let sessions = SessionManager::new(
            ledgers.clone(),
            tracker.clone(),
            Arc::clone(&clock),
            config.clone(),
        );
        let listeners = ConnectionListenerRegistry::new(Arc::clone(&clock), config.listener_idle());
        let dispatcher = LeaseDispatcher::new(ledgers.clone(), sources, clock, config, downtime, shutdown);

        Self {
            ledgers,
            sessions,
            tracker,
            dispatcher,
            listeners,
        }
    }

    /// Start a session, replacing any session the agent still holds.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if a ledger read or write fails.
    pub async fn create_session(
        &self,
        agent_id: &str,
        status: AgentStatus,
        capabilities: AgentCapabilities,
        version: Option<String>,
    ) -> Result<Agent> {
        let previous = self.ledgers.agents.get(agent_id).await?;
        let agent = self
            .sessions
            .create_session(agent_id, status, capabilities, version)
            .await?;
        if let Some(previous) = previous {
            self.forget_listeners(&previous, &agent);
        }
        Ok(agent)
    }

    /// Reconcile the agent's report and, if it is idle, long-poll for work.
    ///
    /// `abort` fires when the caller goes away; the poll then returns
    /// without assigning anything.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown agent,
    /// `AppError::InvalidSession` if the session is not the agent's live
    /// one, `AppError::Listener` if a connection-lost callback failed, or
    /// `AppError::Db` on a ledger failure.
    pub async fn update_session(
        &self,
        request: UpdateSessionRequest,
        abort: &CancellationToken,
    ) -> Result<Agent> {
        let span = info_span!(
            "update_session",
            agent_id = %request.agent_id,
            session_id = %request.session_id
        );
        async {
            let result = match self.listeners.begin_update(
                &request.agent_id,
                request.leases.iter().map(|lease| lease.id.as_str()),
            ) {
                Ok(_) => self.run_update(&request, abort).await,
                Err(err) => Err(err),
            };
            self.listeners.end_update(&request.agent_id);
            result
        }
        .instrument(span)
        .await
    }

    async fn run_update(
        &self,
        request: &UpdateSessionRequest,
        abort: &CancellationToken,
    ) -> Result<Agent> {
        let agent = load_agent(&self.ledgers.agents, &request.agent_id).await?;

        let reconciled = self
            .tracker
            .reconcile(
                agent,
                &request.session_id,
                request.status,
                request.capabilities.as_ref(),
                &request.leases,
            )
            .await?;

        for lease_id in &reconciled.removed {
            self.listeners.unregister(&request.agent_id, lease_id);
        }

        if reconciled.terminate {
            info!("agent stopped with no leases left, ending session");
            let before = reconciled.agent.clone();
            let agent = self.sessions.terminate_session(reconciled.agent).await?;
            self.forget_listeners(&before, &agent);
            return Ok(agent);
        }

        if !reconciled.agent.can_accept_work() {
            return Ok(reconciled.agent);
        }

        let dispatched = self.dispatcher.wait_for_lease(reconciled.agent, abort).await?;
        if let (Some(lease_id), Some(callback)) = (&dispatched.assigned, dispatched.connection_lost) {
            self.listeners.register(&request.agent_id, lease_id, callback);
        }
        Ok(dispatched.agent)
    }

    /// End an agent's session, failing the leases it still holds.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown agent or `AppError::Db`
    /// on a ledger failure.
    pub async fn terminate_session(&self, agent_id: &str) -> Result<Agent> {
        let before = load_agent(&self.ledgers.agents, agent_id).await?;
        let agent = self.sessions.terminate_session(before.clone()).await?;
        self.forget_listeners(&before, &agent);
        Ok(agent)
    }

    /// Terminate every session past its expiry.
    ///
    /// Listeners of leases failed this way are left to their idle deadline:
    /// an expired agent has lost its connection.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` on a ledger failure.
    pub async fn terminate_expired_sessions(&self) -> Result<usize> {
        self.sessions.terminate_expired_sessions().await
    }

    /// Fire the listeners of agents that went silent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Listener` with the first callback failure.
    pub fn expire_idle_listeners(&self) -> Result<usize> {
        self.listeners.expire_idle()
    }

    /// Enable or disable an agent. A disabled agent keeps its session and
    /// leases but is not offered new work.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown agent or `AppError::Db`
    /// on a ledger failure.
    pub async fn set_agent_enabled(&self, agent_id: &str, enabled: bool) -> Result<Agent> {
        let agent = load_agent(&self.ledgers.agents, agent_id).await?;
        let (agent, ()) = update_with_retry(
            "set_agent_enabled",
            agent,
            || load_agent(&self.ledgers.agents, agent_id),
            |mut agent| async move {
                if agent.enabled == enabled {
                    return Ok(Mutation::Keep(agent, ()));
                }
                agent.enabled = enabled;
                Ok(Mutation::Write(agent, ()))
            },
            |updated| self.ledgers.agents.try_replace(updated),
        )
        .await?;
        info!(agent_id, enabled, "agent enablement changed");
        Ok(agent)
    }

    /// Ask an agent to cancel one of its leases.
    ///
    /// The lease is marked cancelled on the agent; it is removed once the
    /// agent stops reporting it as running.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the agent does not hold the lease, or
    /// `AppError::Db` on a ledger failure.
    pub async fn cancel_lease(&self, agent_id: &str, lease_id: &str) -> Result<Agent> {
        let agent = load_agent(&self.ledgers.agents, agent_id).await?;
        let (agent, ()) = update_with_retry(
            "cancel_lease",
            agent,
            || load_agent(&self.ledgers.agents, agent_id),
            |mut agent| async move {
                let Some(lease) = agent.leases.iter_mut().find(|lease| lease.id == lease_id) else {
                    return Err(AppError::NotFound(format!(
                        "lease {lease_id} not held by agent {agent_id}"
                    )));
                };
                if lease.state.is_terminal() {
                    return Ok(Mutation::Keep(agent, ()));
                }
                lease.state = LeaseState::Cancelled;
                Ok(Mutation::Write(agent, ()))
            },
            |updated| self.ledgers.agents.try_replace(updated),
        )
        .await?;
        info!(agent_id, lease_id, "lease cancellation requested");
        Ok(agent)
    }

    /// Current state of an agent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the read fails.
    pub async fn agent(&self, agent_id: &str) -> Result<Option<Agent>> {
        self.ledgers.agents.get(agent_id).await
    }

    /// Ledgers backing the service.
    #[must_use]
    pub fn ledgers(&self) -> &Ledgers {
        &self.ledgers
    }

    /// Connection listeners registered for `agent_id`.
    #[must_use]
    pub fn registered_listeners(&self, agent_id: &str) -> usize {
        self.listeners.registered(agent_id)
    }

    /// Drop listeners of leases that `before` held and `after` no longer
    /// does; their task sources were already told through abort.
    fn forget_listeners(&self, before: &Agent, after: &Agent) {
        for lease in &before.leases {
            if after.lease(&lease.id).is_none() {
                self.listeners.unregister(&before.id, &lease.id);
            }
        }
    }
}
