//! Test utilities for the audience pipeline.
//!
//! - [`database`] spawns migrated Postgres audience stores in throwaway databases.
//! - [`fixtures`] builds filters, candidates and memberships used across tests.
//! - [`fault`] wraps sources, stores and queues to inject failures on demand.
//! - [`notifying_publisher`] records change messages and notifies on conditions.
//! - [`notify`] bounds every wait with a timeout so that a broken test fails instead of hanging.
//! - [`failpoints`] configures `fail` scenarios for crash tests.

pub mod database;
pub mod failpoints;
pub mod fault;
pub mod fixtures;
pub mod notify;
pub mod notifying_publisher;
