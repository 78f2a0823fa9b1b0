//! Message queue carrying reconciliation tasks and audience change notifications.

pub mod amqp;
mod base;
pub mod memory;

pub use base::{ChangePublisher, TaskConsumer, TaskDelivery, TaskOutcome, TaskQueue};
