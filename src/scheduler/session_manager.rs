//! Session lifecycle: create, terminate, expire.
//!
//! An agent holds at most one live session. Creating a session while one is
//! attached terminates the old one first; terminating fails every lease the
//! session still held.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, info_span, warn, Instrument};

use crate::clock::Clock;
use crate::config::SessionConfig;
use crate::models::agent::{Agent, AgentCapabilities, AgentStatus};
use crate::models::lease::LeaseOutcome;
use crate::models::session::Session;
use crate::Result;

use super::lease_tracker::LeaseTracker;
use super::retry::{update_with_retry, Mutation};
use super::{load_agent, Ledgers};

/// Creates and ends agent sessions.
#[derive(Clone)]
pub struct SessionManager {
    ledgers: Ledgers,
    tracker: LeaseTracker,
    clock: Arc<dyn Clock>,
    config: SessionConfig,
}

impl SessionManager {
    /// Create a session manager.
    #[must_use]
    pub fn new(
        ledgers: Ledgers,
        tracker: LeaseTracker,
        clock: Arc<dyn Clock>,
        config: SessionConfig,
    ) -> Self {
        Self {
            ledgers,
            tracker,
            clock,
            config,
        }
    }

    /// Start a new session for `agent_id`, registering the agent on first
    /// contact.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if a ledger read or write fails. When the
    /// session record itself cannot be written the agent is left
    /// sessionless.
    pub async fn create_session(
        &self,
        agent_id: &str,
        status: AgentStatus,
        capabilities: AgentCapabilities,
        version: Option<String>,
    ) -> Result<Agent> {
        let span = info_span!("create_session", agent_id);
        async {
            let agent = self.find_or_register(agent_id).await?;

            let (agent, session) = update_with_retry(
                "create_session",
                agent,
                || load_agent(&self.ledgers.agents, agent_id),
                |agent| self.attach_session(agent, status, &capabilities, version.as_deref()),
                |updated| self.ledgers.agents.try_replace(updated),
            )
            .await?;

            if let Err(err) = self.ledgers.sessions.add(&session).await {
                warn!(session_id = %session.id, %err, "failed to record session, detaching it");
                self.detach_unrecorded(agent, &session.id).await?;
                return Err(err);
            }
            info!(session_id = %session.id, expires = ?agent.session_expires_at, "session created");
            Ok(agent)
        }
        .instrument(span)
        .await
    }

    /// End the agent's session, failing every lease it still holds.
    ///
    /// Returns the stored agent. A sessionless agent is returned unchanged
    /// without any write, so terminating twice is harmless.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if a ledger read or write fails.
    pub async fn terminate_session(&self, agent: Agent) -> Result<Agent> {
        self.terminate(agent, None).await
    }

    /// Terminate every session that expired before now.
    ///
    /// Works through the expired agents one page at a time and stops once a
    /// page comes back short. Returns the number of sessions ended.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if a ledger read or write fails.
    pub async fn terminate_expired_sessions(&self) -> Result<usize> {
        let now = self.clock.now();
        let page_size = self.config.expiry_page_size;
        let full_page = usize::try_from(page_size).unwrap_or(usize::MAX);
        let mut terminated = 0;

        loop {
            let page = self.ledgers.agents.find_expired(now, page_size).await?;
            let count = page.len();

            for agent in page {
                let stored = self.terminate(agent, Some(now)).await?;
                if !stored.has_session() {
                    terminated += 1;
                }
            }

            if count < full_page {
                break;
            }
        }

        if terminated > 0 {
            info!(terminated, "expired sessions terminated");
        }
        Ok(terminated)
    }

    /// Take `session_id` off the agent again after its record could not be
    /// written. A session that was replaced in the meantime is left alone.
    async fn detach_unrecorded(&self, agent: Agent, session_id: &str) -> Result<Agent> {
        let agent_id = agent.id.clone();
        let (agent, _) = update_with_retry(
            "detach_unrecorded_session",
            agent,
            || load_agent(&self.ledgers.agents, &agent_id),
            |agent| async move {
                if agent.session_id.as_deref() != Some(session_id) {
                    return Ok(Mutation::Keep(agent, None));
                }
                self.detach_session(agent, None).await
            },
            |updated| self.ledgers.agents.try_replace(updated),
        )
        .await?;
        Ok(agent)
    }

    async fn find_or_register(&self, agent_id: &str) -> Result<Agent> {
        if let Some(agent) = self.ledgers.agents.get(agent_id).await? {
            return Ok(agent);
        }

        match self.ledgers.agents.add(&Agent::new(agent_id)).await? {
            Some(agent) => {
                info!(agent_id, "agent registered");
                Ok(agent)
            }
            None => load_agent(&self.ledgers.agents, agent_id).await,
        }
    }

    async fn attach_session(
        &self,
        agent: Agent,
        status: AgentStatus,
        capabilities: &AgentCapabilities,
        version: Option<&str>,
    ) -> Result<Mutation<Agent, Session>> {
        let mut agent = if agent.has_session() {
            warn!(agent_id = %agent.id, session_id = ?agent.session_id, "replacing live session");
            self.terminate_session(agent).await?
        } else {
            agent
        };

        let now = self.clock.now();
        let session = Session::new(
            agent.id.clone(),
            now,
            capabilities.clone(),
            version.map(str::to_owned),
        );

        agent.session_id = Some(session.id.clone());
        agent.session_expires_at = Some(now + self.config.expiry());
        agent.status = status;
        agent.capabilities = capabilities.clone();
        agent.version = version.map(str::to_owned);
        agent.leases.clear();

        Ok(Mutation::Write(agent, session))
    }

    /// Terminate `agent`'s session. With `expired_before` set, a session
    /// renewed past that time in the meantime is left alone.
    async fn terminate(&self, agent: Agent, expired_before: Option<DateTime<Utc>>) -> Result<Agent> {
        if !agent.has_session() {
            return Ok(agent);
        }

        let agent_id = agent.id.clone();
        let span = info_span!("terminate_session", agent_id = %agent_id);
        async {
            let (agent, finished) = update_with_retry(
                "terminate_session",
                agent,
                || load_agent(&self.ledgers.agents, &agent_id),
                |agent| self.detach_session(agent, expired_before),
                |updated| self.ledgers.agents.try_replace(updated),
            )
            .await?;

            if let Some((session_id, finish)) = finished {
                if !self.ledgers.sessions.try_finish(&session_id, finish).await? {
                    warn!(session_id, "session record missing or already finished");
                }
                info!(session_id, %finish, "session terminated");
            }
            Ok(agent)
        }
        .instrument(span)
        .await
    }

    async fn detach_session(
        &self,
        mut agent: Agent,
        expired_before: Option<DateTime<Utc>>,
    ) -> Result<Mutation<Agent, Option<(String, DateTime<Utc>)>>> {
        let (Some(session_id), Some(expires)) = (agent.session_id.clone(), agent.session_expires_at)
        else {
            return Ok(Mutation::Keep(agent, None));
        };

        if expired_before.is_some_and(|cutoff| expires >= cutoff) {
            return Ok(Mutation::Keep(agent, None));
        }

        let now = self.clock.now();
        let finish = now.min(expires);

        let lease_ids: Vec<String> = agent.leases.iter().map(|lease| lease.id.clone()).collect();
        for lease_id in lease_ids {
            self.tracker
                .remove_lease(&mut agent, &lease_id, now, LeaseOutcome::Failed)
                .await?;
        }

        agent.session_id = None;
        agent.session_expires_at = None;

        Ok(Mutation::Write(agent, Some((session_id, finish))))
    }
}
