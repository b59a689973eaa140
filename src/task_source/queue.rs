//! In-memory FIFO task source.
//!
//! Hands queued tasks to subscribed agents one at a time. A task offered to
//! a subscription that is disposed without accepting it goes back to the
//! front of the queue (or straight to the next waiting agent), so work lost
//! in a dispatch race is never dropped.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tracing::{debug, info};

use crate::models::agent::Agent;
use crate::models::lease::LeasePayload;
use crate::Result;

use super::{BoxFuture, LeaseOffer, TaskSource, TaskSubscription};

/// A unit of work waiting in a [`QueueTaskSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedTask {
    /// Lease id the task is offered under.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Payload body.
    pub data: Vec<u8>,
    /// Bind the lease to the agent's connection.
    pub track_connection: bool,
}

impl QueuedTask {
    /// Construct a task with an empty payload body.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            data: Vec::new(),
            track_connection: false,
        }
    }

    /// Set the payload body.
    #[must_use]
    pub fn with_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = data.into();
        self
    }

    /// Request connection-loss tracking for the lease.
    #[must_use]
    pub fn tracking_connection(mut self) -> Self {
        self.track_connection = true;
        self
    }
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<QueuedTask>,
    waiters: VecDeque<(u64, watch::Sender<Option<QueuedTask>>)>,
    next_waiter: u64,
    aborted: Vec<String>,
    connection_lost: Vec<String>,
}

impl QueueState {
    /// Hand `task` to the oldest live waiter, or park it in the queue.
    fn deliver(&mut self, task: QueuedTask, front: bool) {
        while let Some((_, waiter)) = self.waiters.pop_front() {
            if !waiter.is_closed() {
                waiter.send_replace(Some(task));
                return;
            }
        }
        if front {
            self.pending.push_front(task);
        } else {
            self.pending.push_back(task);
        }
    }
}

/// FIFO task source backed by an in-process queue.
#[derive(Clone)]
pub struct QueueTaskSource {
    name: String,
    payload_type: String,
    state: Arc<Mutex<QueueState>>,
}

impl QueueTaskSource {
    /// Create an empty source producing payloads of `payload_type`.
    #[must_use]
    pub fn new(name: impl Into<String>, payload_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload_type: payload_type.into(),
            state: Arc::new(Mutex::new(QueueState::default())),
        }
    }

    /// Queue a task, handing it straight to a waiting agent if there is one.
    pub fn enqueue(&self, task: QueuedTask) {
        debug!(source = %self.name, task_id = %task.id, "task queued");
        self.lock().deliver(task, false);
    }

    /// Tasks not yet offered to any agent.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Agents currently subscribed and waiting.
    #[must_use]
    pub fn waiting_len(&self) -> usize {
        self.lock().waiters.len()
    }

    /// Lease ids the scheduler asked this source to abort, in order.
    #[must_use]
    pub fn aborted(&self) -> Vec<String> {
        self.lock().aborted.clone()
    }

    /// Lease ids whose connection-loss callback fired, in order.
    #[must_use]
    pub fn connection_lost(&self) -> Vec<String> {
        self.lock().connection_lost.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn offer_for(&self, task: &QueuedTask) -> LeaseOffer {
        let payload = LeasePayload::new(self.payload_type.clone(), task.data.clone());
        let offer = LeaseOffer::new(task.id.clone(), task.name.clone(), payload);
        if !task.track_connection {
            return offer;
        }
        let state = Arc::clone(&self.state);
        let lease_id = task.id.clone();
        offer.with_connection_lost(Box::new(move || {
            state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .connection_lost
                .push(lease_id);
            Ok(())
        }))
    }
}

impl TaskSource for QueueTaskSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn payload_type(&self) -> &str {
        &self.payload_type
    }

    fn subscribe<'a>(&'a self, _agent: &'a Agent) -> BoxFuture<'a, Result<TaskSubscription>> {
        Box::pin(async move {
            let mut state = self.lock();

            if let Some(task) = state.pending.pop_front() {
                drop(state);
                let offer = self.offer_for(&task);
                let requeue = Arc::clone(&self.state);
                return Ok(TaskSubscription::ready(self.name.clone(), Some(offer)).on_dispose(
                    move |accepted| {
                        if !accepted {
                            requeue
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .deliver(task, true);
                        }
                    },
                ));
            }

            let (tx, mut rx) = watch::channel(None::<QueuedTask>);
            let waiter_id = state.next_waiter;
            state.next_waiter += 1;
            state.waiters.push_back((waiter_id, tx));
            drop(state);

            let source = self.clone();
            let delivered = rx.clone();
            let requeue = Arc::clone(&self.state);
            let offer = async move {
                let task = rx
                    .wait_for(Option::is_some)
                    .await
                    .ok()
                    .and_then(|task| task.clone());
                Ok(task.map(|task| source.offer_for(&task)))
            };

            Ok(TaskSubscription::new(self.name.clone(), offer).on_dispose(move |accepted| {
                let mut state = requeue.lock().unwrap_or_else(PoisonError::into_inner);
                state.waiters.retain(|(id, _)| *id != waiter_id);
                if accepted {
                    return;
                }
                let task = delivered.borrow().clone();
                if let Some(task) = task {
                    state.deliver(task, true);
                }
            }))
        })
    }

    fn abort_task<'a>(
        &'a self,
        agent: &'a Agent,
        lease_id: &'a str,
        _payload: &'a LeasePayload,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            info!(source = %self.name, agent_id = %agent.id, lease_id, "lease left agent");
            self.lock().aborted.push(lease_id.to_owned());
            Ok(())
        })
    }
}
