//! Audience update pipeline.
//!
//! Audiences are named segments of lead requests defined by an [`filter::AudienceFilter`]. Once a
//! day the [`workers::scheduler`] enqueues one reconciliation task per audience. Task workers
//! query the analytical source for requests matching the filter, append the new ones to the
//! audience in the audience store and announce the change on the notification exchange.
//!
//! Membership only grows through reconciliation, so redelivered or duplicated tasks are
//! harmless. Removing members is the separate, audited [`prune`] operation.

pub mod concurrency;
pub mod error;
pub mod export;
#[cfg(feature = "failpoints")]
pub mod failpoints;
pub mod filter;
mod macros;
pub mod messages;
pub mod metrics;
pub mod pipeline;
pub mod prune;
pub mod queue;
pub mod reconcile;
pub mod source;
pub mod store;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod types;
pub mod workers;
