use std::collections::VecDeque;
use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tracing::debug;

use crate::bail;
use crate::error::{AudienceResult, ErrorKind};
use crate::messages::{AudienceChangeMessage, ReconciliationTask};
use crate::queue::{ChangePublisher, TaskConsumer, TaskDelivery, TaskOutcome, TaskQueue};

#[derive(Debug, Clone)]
struct QueuedMessage {
    payload: Vec<u8>,
    redelivered: bool,
}

/// Settlement recorded by the memory queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub payload: Vec<u8>,
    pub redelivered: bool,
    pub outcome: TaskOutcome,
}

#[derive(Debug, Default)]
struct State {
    ready: VecDeque<QueuedMessage>,
    unsettled: usize,
    settlements: Vec<Settlement>,
    dead_letters: Vec<Vec<u8>>,
    changes: Vec<AudienceChangeMessage>,
    published_tasks: u64,
    closed: bool,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    notify: Notify,
    settled: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn requeue(&self, message: QueuedMessage) {
        let mut state = self.lock();
        state.unsettled = state.unsettled.saturating_sub(1);
        state.ready.push_back(QueuedMessage {
            payload: message.payload,
            redelivered: true,
        });
        drop(state);

        self.notify.notify_waiters();
    }
}

/// In-memory queue for tests and local development.
///
/// It mirrors the broker semantics the workers rely on: each message is handed to one consumer
/// at a time, requeued messages come back flagged as redelivered, dropped messages are
/// dead-lettered, and deliveries dropped without being settled return to the queue.
#[derive(Debug, Clone, Default)]
pub struct MemoryQueue {
    shared: Arc<Shared>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a raw payload, bypassing task serialization.
    pub fn push_raw(&self, payload: Vec<u8>) {
        let mut state = self.shared.lock();
        state.ready.push_back(QueuedMessage {
            payload,
            redelivered: false,
        });
        drop(state);

        self.shared.notify.notify_waiters();
    }

    /// Closes the queue. Consumers return `None` once no ready message is left.
    pub fn close(&self) {
        self.shared.lock().closed = true;
        self.shared.notify.notify_waiters();
    }

    /// Number of messages waiting for a consumer.
    pub fn ready_len(&self) -> usize {
        self.shared.lock().ready.len()
    }

    /// Number of messages handed to a consumer and not settled yet.
    pub fn unsettled_len(&self) -> usize {
        self.shared.lock().unsettled
    }

    /// Tasks waiting for a consumer, decoded.
    pub fn ready_tasks(&self) -> Vec<ReconciliationTask> {
        self.shared
            .lock()
            .ready
            .iter()
            .filter_map(|message| ReconciliationTask::from_payload(&message.payload).ok())
            .collect()
    }

    /// Total number of tasks published through [`TaskQueue::publish_task`].
    pub fn published_tasks(&self) -> u64 {
        self.shared.lock().published_tasks
    }

    pub fn settlements(&self) -> Vec<Settlement> {
        self.shared.lock().settlements.clone()
    }

    /// Waits until at least `count` deliveries have been settled.
    pub async fn wait_for_settlements(&self, count: usize) {
        loop {
            let mut settled = pin!(self.shared.settled.notified());
            settled.as_mut().enable();

            if self.shared.lock().settlements.len() >= count {
                return;
            }

            settled.await;
        }
    }

    pub fn dead_letters(&self) -> Vec<Vec<u8>> {
        self.shared.lock().dead_letters.clone()
    }

    /// Change messages published through [`ChangePublisher::publish_change`].
    pub fn changes(&self) -> Vec<AudienceChangeMessage> {
        self.shared.lock().changes.clone()
    }
}

impl TaskQueue for MemoryQueue {
    type Consumer = MemoryConsumer;

    async fn publish_task(&self, task: &ReconciliationTask) -> AudienceResult<()> {
        let payload = task.to_payload()?;

        let mut state = self.shared.lock();
        if state.closed {
            bail!(ErrorKind::QueueConnectionFailed, "Memory queue is closed");
        }
        state.published_tasks += 1;
        state.ready.push_back(QueuedMessage {
            payload,
            redelivered: false,
        });
        drop(state);

        self.shared.notify.notify_waiters();

        Ok(())
    }

    async fn consumer(&self, tag: &str) -> AudienceResult<MemoryConsumer> {
        debug!(consumer_tag = tag, "created memory task consumer");

        Ok(MemoryConsumer {
            shared: self.shared.clone(),
        })
    }
}

impl ChangePublisher for MemoryQueue {
    async fn publish_change(&self, message: &AudienceChangeMessage) -> AudienceResult<()> {
        let mut state = self.shared.lock();
        if state.closed {
            bail!(ErrorKind::QueueConnectionFailed, "Memory queue is closed");
        }
        state.changes.push(message.clone());

        Ok(())
    }
}

#[derive(Debug)]
pub struct MemoryConsumer {
    shared: Arc<Shared>,
}

impl TaskConsumer for MemoryConsumer {
    type Delivery = MemoryDelivery;

    async fn next(&mut self) -> Option<AudienceResult<MemoryDelivery>> {
        loop {
            // Registered before checking the state so that a publish in between is not missed.
            let mut notified = pin!(self.shared.notify.notified());
            notified.as_mut().enable();

            {
                let mut state = self.shared.lock();
                if let Some(message) = state.ready.pop_front() {
                    state.unsettled += 1;
                    return Some(Ok(MemoryDelivery {
                        shared: self.shared.clone(),
                        message: Some(message),
                    }));
                }

                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }
}

/// Delivery handed out by a [`MemoryConsumer`].
///
/// Dropping it unsettled puts the message back, like a broker does for a closed channel.
#[derive(Debug)]
pub struct MemoryDelivery {
    shared: Arc<Shared>,
    message: Option<QueuedMessage>,
}

impl TaskDelivery for MemoryDelivery {
    fn payload(&self) -> &[u8] {
        self.message
            .as_ref()
            .map(|message| message.payload.as_slice())
            .unwrap_or_default()
    }

    fn redelivered(&self) -> bool {
        self.message
            .as_ref()
            .is_some_and(|message| message.redelivered)
    }

    async fn settle(mut self, outcome: TaskOutcome) -> AudienceResult<()> {
        let Some(message) = self.message.take() else {
            bail!(ErrorKind::InvalidState, "Delivery was already settled");
        };

        {
            let mut state = self.shared.lock();
            state.settlements.push(Settlement {
                payload: message.payload.clone(),
                redelivered: message.redelivered,
                outcome,
            });
        }

        match outcome {
            TaskOutcome::Committed => {
                let mut state = self.shared.lock();
                state.unsettled = state.unsettled.saturating_sub(1);
            }
            TaskOutcome::Requeue => self.shared.requeue(message),
            TaskOutcome::Drop => {
                let mut state = self.shared.lock();
                state.unsettled = state.unsettled.saturating_sub(1);
                state.dead_letters.push(message.payload);
            }
        }
        self.shared.settled.notify_waiters();

        Ok(())
    }
}

impl Drop for MemoryDelivery {
    fn drop(&mut self) {
        if let Some(message) = self.message.take() {
            self.shared.requeue(message);
        }
    }
}
