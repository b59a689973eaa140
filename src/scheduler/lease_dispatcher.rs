//! Long-poll lease dispatch.
//!
//! An idle agent's `UpdateSession` call is held open while every task
//! source is asked for work. The first source to answer, in registration
//! order, wins; the lease is appended to the agent with compare-and-swap
//! and every other subscription is disposed. The poll gives up when the
//! session is about to need renewal, the caller goes away or the server
//! shuts down.

use std::future::{poll_fn, Future};
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::SessionConfig;
use crate::downtime::DowntimeProvider;
use crate::models::agent::{Agent, AgentLease};
use crate::models::lease::Lease;
use crate::task_source::{ConnectionLostCallback, LeaseOffer, TaskSources, TaskSubscription};
use crate::Result;

use super::Ledgers;

/// How a long poll ended.
#[derive(Debug)]
pub enum PollResult {
    /// The subscription at this index produced an offer.
    Offered(usize, LeaseOffer),
    /// Nothing arrived before the poll deadline.
    TimedOut,
    /// The caller abandoned the request.
    Aborted,
    /// The server is shutting down.
    ShuttingDown,
}

/// Result of [`LeaseDispatcher::wait_for_lease`].
pub struct Dispatched {
    /// Agent as stored after the poll.
    pub agent: Agent,
    /// Lease assigned by this poll, if any.
    pub assigned: Option<String>,
    /// Connection-loss callback the assigned lease asked for.
    pub connection_lost: Option<ConnectionLostCallback>,
}

impl Dispatched {
    fn idle(agent: Agent) -> Self {
        Self {
            agent,
            assigned: None,
            connection_lost: None,
        }
    }
}

/// Matches idle agents with work from the registered task sources.
#[derive(Clone)]
pub struct LeaseDispatcher {
    ledgers: Ledgers,
    sources: TaskSources,
    clock: Arc<dyn Clock>,
    config: SessionConfig,
    downtime: Arc<dyn DowntimeProvider>,
    shutdown: CancellationToken,
}

impl LeaseDispatcher {
    /// Create a dispatcher. Polls in flight end when `shutdown` fires.
    #[must_use]
    pub fn new(
        ledgers: Ledgers,
        sources: TaskSources,
        clock: Arc<dyn Clock>,
        config: SessionConfig,
        downtime: Arc<dyn DowntimeProvider>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            ledgers,
            sources,
            clock,
            config,
            downtime,
            shutdown,
        }
    }

    /// Longest time a poll may be held for `agent`: until the session's
    /// last renewal plus the long-poll allowance. `None` when there is no
    /// time left or no session.
    #[must_use]
    pub fn max_wait(&self, agent: &Agent) -> Option<Duration> {
        let expires = agent.session_expires_at?;
        let deadline = expires - self.config.expiry() + self.config.long_poll();
        let remaining = (deadline - self.clock.now()).to_std().ok()?;
        (!remaining.is_zero()).then_some(remaining)
    }

    /// Hold the poll open until work arrives for `agent` or the poll ends.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if recording or attaching the offered lease
    /// fails; the agent is left untouched and the offer is returned to its
    /// source.
    pub async fn wait_for_lease(&self, agent: Agent, abort: &CancellationToken) -> Result<Dispatched> {
        let Some(max_wait) = self.max_wait(&agent) else {
            return Ok(Dispatched::idle(agent));
        };

        if self.downtime.is_downtime_active() {
            debug!(agent_id = %agent.id, "downtime active, holding poll without work");
            tokio::select! {
                () = tokio::time::sleep(max_wait) => {}
                () = abort.cancelled() => {}
                () = self.shutdown.cancelled() => {}
            }
            return Ok(Dispatched::idle(agent));
        }

        let mut subscriptions = Vec::with_capacity(self.sources.len());
        for source in self.sources.iter() {
            match source.subscribe(&agent).await {
                Ok(subscription) => subscriptions.push(subscription),
                Err(err) => warn!(agent_id = %agent.id, source = source.name(), %err, "task source subscribe failed"),
            }
        }

        let result = self.race(&mut subscriptions, max_wait, abort).await;
        debug!(agent_id = %agent.id, ?result, "long poll finished");

        match result {
            PollResult::Offered(index, offer) => {
                self.assign(agent, offer, &mut subscriptions[index]).await
            }
            PollResult::TimedOut | PollResult::Aborted | PollResult::ShuttingDown => {
                Ok(Dispatched::idle(agent))
            }
        }
    }

    async fn race(
        &self,
        subscriptions: &mut Vec<TaskSubscription>,
        max_wait: Duration,
        abort: &CancellationToken,
    ) -> PollResult {
        let timeout = tokio::time::sleep(max_wait);
        tokio::pin!(timeout);

        loop {
            let (index, offer) = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => return PollResult::ShuttingDown,
                () = abort.cancelled() => return PollResult::Aborted,
                () = &mut timeout => return PollResult::TimedOut,
                ready = first_ready(subscriptions) => ready,
            };

            match offer {
                Some(offer) => return PollResult::Offered(index, offer),
                None => {
                    subscriptions.remove(index);
                }
            }
        }
    }

    /// Record the offered lease in the ledger, then attach it to the agent.
    ///
    /// The ledger's primary key rejects an id that is already taken before
    /// the agent is touched. The subscription is only accepted once both
    /// writes went through; otherwise it is dropped and the source re-offers.
    async fn assign(
        &self,
        agent: Agent,
        offer: LeaseOffer,
        subscription: &mut TaskSubscription,
    ) -> Result<Dispatched> {
        let (lease, connection_lost) = offer.into_agent_lease(self.clock.now());
        let lease_id = lease.id.clone();
        let session_id = agent.session_id.clone().unwrap_or_default();
        let entry = ledger_entry(&agent.id, &session_id, &lease);

        if !self.ledgers.leases.try_add(&entry).await? {
            warn!(
                agent_id = %agent.id,
                lease_id,
                source = subscription.source(),
                "offered lease id is already taken, rejecting offer"
            );
            return Ok(Dispatched::idle(agent));
        }

        let stored = match self.ledgers.agents.try_add_lease(&agent, lease).await {
            Ok(Some(stored)) => stored,
            Ok(None) => {
                self.discard_entry(&agent.id, &lease_id).await?;
                info!(
                    agent_id = %agent.id,
                    lease_id,
                    source = subscription.source(),
                    "agent changed during long poll, returning offer to source"
                );
                return Ok(Dispatched::idle(agent));
            }
            Err(err) => {
                if let Err(undo) = self.discard_entry(&agent.id, &lease_id).await {
                    warn!(agent_id = %agent.id, lease_id, err = %undo, "failed to discard lease entry");
                }
                return Err(err);
            }
        };
        subscription.accept();

        info!(agent_id = %stored.id, lease_id, source = subscription.source(), "lease assigned");
        Ok(Dispatched {
            agent: stored,
            assigned: Some(lease_id),
            connection_lost,
        })
    }

    async fn discard_entry(&self, agent_id: &str, lease_id: &str) -> Result<()> {
        if !self.ledgers.leases.remove_outstanding(lease_id, agent_id).await? {
            debug!(agent_id, lease_id, "lease entry already gone");
        }
        Ok(())
    }
}

/// Resolves with the first subscription, in order, whose offer is ready.
/// Never resolves when `subscriptions` is empty.
fn first_ready(
    subscriptions: &mut [TaskSubscription],
) -> impl Future<Output = (usize, Option<LeaseOffer>)> + '_ {
    poll_fn(move |cx| {
        for (index, subscription) in subscriptions.iter_mut().enumerate() {
            if let Poll::Ready(offer) = subscription.poll_offer(cx) {
                return Poll::Ready((index, offer));
            }
        }
        Poll::Pending
    })
}

fn ledger_entry(agent_id: &str, session_id: &str, lease: &AgentLease) -> Lease {
    Lease {
        id: lease.id.clone(),
        name: lease.name.clone(),
        agent_id: agent_id.to_owned(),
        session_id: session_id.to_owned(),
        stream_id: lease.stream_id.clone(),
        pool_id: lease.pool_id.clone(),
        log_id: lease.log_id.clone(),
        start_time: lease.start_time,
        finish_time: None,
        outcome: lease.outcome,
        payload: lease.payload.clone(),
    }
}
