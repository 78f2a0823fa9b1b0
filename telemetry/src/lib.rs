//! Logging and metrics initialization shared by the audience updater binaries and tests.

pub mod metrics;
pub mod tracing;
