//! Pluggable producers of lease work.
//!
//! The [`TaskSource`] trait decouples the scheduler core from whatever
//! produces work (job graphs, conform requests, remote execution). The core
//! subscribes on behalf of an idle agent, races every subscription, accepts
//! at most one offer and disposes the rest, and routes abort requests back by
//! matching the lease payload's type descriptor. It never looks inside a
//! payload.

pub mod queue;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use tracing::warn;

use crate::models::agent::{Agent, AgentLease};
use crate::models::lease::{LeaseOutcome, LeasePayload, LeaseState};
use crate::Result;

/// Boxed future returned by task source methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Callback fired when the connection a lease is bound to is lost.
pub type ConnectionLostCallback = Box<dyn FnOnce() -> Result<()> + Send>;

/// A unit of work offered to one agent.
pub struct LeaseOffer {
    /// Globally unique lease identifier chosen by the source.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Routing metadata: stream.
    pub stream_id: Option<String>,
    /// Routing metadata: pool.
    pub pool_id: Option<String>,
    /// Log identifier for the lease output.
    pub log_id: Option<String>,
    /// Latest time the lease may be considered running.
    pub expiry_time: Option<DateTime<Utc>>,
    /// Opaque payload.
    pub payload: LeasePayload,
    /// Set for leases bound to the live connection that cannot migrate.
    pub on_connection_lost: Option<ConnectionLostCallback>,
}

impl LeaseOffer {
    /// Construct an offer with no routing metadata.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, payload: LeasePayload) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            stream_id: None,
            pool_id: None,
            log_id: None,
            expiry_time: None,
            payload,
            on_connection_lost: None,
        }
    }

    /// Request a connection-loss callback for this lease.
    #[must_use]
    pub fn with_connection_lost(mut self, callback: ConnectionLostCallback) -> Self {
        self.on_connection_lost = Some(callback);
        self
    }

    /// Split the offer into the pending agent lease and its optional
    /// connection-loss callback.
    #[must_use]
    pub fn into_agent_lease(self, now: DateTime<Utc>) -> (AgentLease, Option<ConnectionLostCallback>) {
        let lease = AgentLease {
            id: self.id,
            name: self.name,
            state: LeaseState::Pending,
            outcome: LeaseOutcome::Unspecified,
            stream_id: self.stream_id,
            pool_id: self.pool_id,
            log_id: self.log_id,
            start_time: now,
            expiry_time: self.expiry_time,
            payload: self.payload,
        };
        (lease, self.on_connection_lost)
    }
}

impl fmt::Debug for LeaseOffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseOffer")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("payload_type", &self.payload.type_url)
            .field("tracks_connection", &self.on_connection_lost.is_some())
            .finish_non_exhaustive()
    }
}

/// One source's pending answer to "is there work for this agent?".
///
/// Resolves at most once. Dropping the subscription disposes it; the
/// dispose hook learns whether the offer was accepted, so a source can
/// re-offer work whose subscription lost the race or whose assignment
/// could not be persisted.
pub struct TaskSubscription {
    source: String,
    offer: Option<BoxFuture<'static, Result<Option<LeaseOffer>>>>,
    accepted: bool,
    on_dispose: Option<Box<dyn FnOnce(bool) + Send>>,
}

impl TaskSubscription {
    /// Wrap a future that yields at most one offer.
    pub fn new<F>(source: impl Into<String>, offer: F) -> Self
    where
        F: Future<Output = Result<Option<LeaseOffer>>> + Send + 'static,
    {
        Self {
            source: source.into(),
            offer: Some(Box::pin(offer)),
            accepted: false,
            on_dispose: None,
        }
    }

    /// A subscription that already knows its answer.
    #[must_use]
    pub fn ready(source: impl Into<String>, offer: Option<LeaseOffer>) -> Self {
        Self::new(source, std::future::ready(Ok(offer)))
    }

    /// Install the hook run when the subscription is dropped.
    #[must_use]
    pub fn on_dispose(mut self, hook: impl FnOnce(bool) + Send + 'static) -> Self {
        self.on_dispose = Some(Box::new(hook));
        self
    }

    /// Name of the source that produced the subscription.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Mark the resolved offer as taken by an agent.
    pub fn accept(&mut self) {
        self.accepted = true;
    }

    /// Whether the offer was accepted.
    #[must_use]
    pub fn is_accepted(&self) -> bool {
        self.accepted
    }

    /// Wait for the offer. A failed offer is logged and reported as no
    /// offer; once resolved, further calls return `None` immediately.
    pub async fn next_offer(&mut self) -> Option<LeaseOffer> {
        std::future::poll_fn(|cx| self.poll_offer(cx)).await
    }

    /// Poll the offer. A failed offer is logged and reported as no offer.
    pub(crate) fn poll_offer(&mut self, cx: &mut Context<'_>) -> Poll<Option<LeaseOffer>> {
        let Some(offer) = self.offer.as_mut() else {
            return Poll::Ready(None);
        };
        match offer.poll_unpin(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(result) => {
                self.offer = None;
                match result {
                    Ok(offer) => Poll::Ready(offer),
                    Err(err) => {
                        warn!(source = %self.source, %err, "task source offer failed");
                        Poll::Ready(None)
                    }
                }
            }
        }
    }
}

impl Drop for TaskSubscription {
    fn drop(&mut self) {
        if let Some(hook) = self.on_dispose.take() {
            hook(self.accepted);
        }
    }
}

impl fmt::Debug for TaskSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSubscription")
            .field("source", &self.source)
            .field("resolved", &self.offer.is_none())
            .field("accepted", &self.accepted)
            .finish_non_exhaustive()
    }
}

/// A pluggable provider of one category of lease work.
pub trait TaskSource: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Payload type descriptor this source produces and can abort.
    fn payload_type(&self) -> &str;

    /// Ask for work on behalf of an idle agent.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::TaskSource`](crate::AppError::TaskSource) if the
    /// source cannot subscribe; the scheduler skips it for this turn.
    fn subscribe<'a>(&'a self, agent: &'a Agent) -> BoxFuture<'a, Result<TaskSubscription>>;

    /// Tell the source a lease it produced left the agent.
    ///
    /// Called for every removed lease, whatever its outcome; sources treat
    /// aborting finished work as a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::TaskSource`](crate::AppError::TaskSource) on
    /// failure; the scheduler logs it and carries on.
    fn abort_task<'a>(
        &'a self,
        agent: &'a Agent,
        lease_id: &'a str,
        payload: &'a LeasePayload,
    ) -> BoxFuture<'a, Result<()>>;
}

/// Ordered set of registered task sources.
#[derive(Clone, Default)]
pub struct TaskSources {
    sources: Vec<Arc<dyn TaskSource>>,
}

impl TaskSources {
    /// Build from sources in subscription order.
    #[must_use]
    pub fn new(sources: Vec<Arc<dyn TaskSource>>) -> Self {
        Self { sources }
    }

    /// Sources in subscription order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn TaskSource>> {
        self.sources.iter()
    }

    /// Source owning payloads of this type.
    #[must_use]
    pub fn for_payload(&self, payload: &LeasePayload) -> Option<&Arc<dyn TaskSource>> {
        self.sources
            .iter()
            .find(|source| source.payload_type() == payload.type_url)
    }

    /// Number of registered sources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Whether no source is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}
