//! Concurrency primitives shared by the scheduler and the task workers.
//!
//! The [`shutdown`] module broadcasts a single shutdown request to every component. Workers
//! observe it between deliveries and the scheduler between publishes, so nothing is cancelled
//! in the middle of settling a task or publishing one.
//!
//! The [`signal`] module carries payload-less notifications, such as an ad hoc request to run a
//! scheduler dispatch outside of its daily cadence.

pub mod shutdown;
pub mod signal;
