use std::fmt;
use std::future::Future;

use crate::error::AudienceResult;
use crate::messages::{AudienceChangeMessage, ReconciliationTask};

/// How a delivered task is settled with the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskOutcome {
    /// The result is durable, the task is acknowledged.
    Committed,
    /// The task failed transiently and is handed back for redelivery.
    Requeue,
    /// The task can never succeed and is rejected without redelivery.
    Drop,
}

impl TaskOutcome {
    pub fn as_static_str(&self) -> &'static str {
        match self {
            TaskOutcome::Committed => "committed",
            TaskOutcome::Requeue => "requeue",
            TaskOutcome::Drop => "drop",
        }
    }
}

impl fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_static_str())
    }
}

/// A task handed to exactly one consumer until it is settled.
///
/// A delivery dropped without being settled is eventually redelivered by the queue.
pub trait TaskDelivery {
    /// Raw message body.
    fn payload(&self) -> &[u8];

    /// Whether the queue delivered this message before.
    fn redelivered(&self) -> bool;

    /// Acknowledges or rejects the delivery according to `outcome`.
    fn settle(self, outcome: TaskOutcome) -> impl Future<Output = AudienceResult<()>> + Send;
}

/// A competing consumer of the task queue.
pub trait TaskConsumer {
    type Delivery: TaskDelivery + Send;

    /// Waits for the next delivery.
    ///
    /// Returns `None` once the consumer has been cancelled or the queue closed.
    fn next(&mut self) -> impl Future<Output = Option<AudienceResult<Self::Delivery>>> + Send;
}

/// Durable queue of reconciliation tasks.
pub trait TaskQueue {
    type Consumer: TaskConsumer + Send;

    /// Enqueues a task.
    fn publish_task(
        &self,
        task: &ReconciliationTask,
    ) -> impl Future<Output = AudienceResult<()>> + Send;

    /// Creates a new consumer identified by `tag`.
    ///
    /// Each consumer competes with the others for deliveries.
    fn consumer(&self, tag: &str) -> impl Future<Output = AudienceResult<Self::Consumer>> + Send;
}

/// Publisher of audience change notifications for downstream integration services.
pub trait ChangePublisher {
    fn publish_change(
        &self,
        message: &AudienceChangeMessage,
    ) -> impl Future<Output = AudienceResult<()>> + Send;
}
