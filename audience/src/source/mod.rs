//! Read-only access to the analytical database that candidates are matched against.

mod base;
pub mod memory;
pub mod mysql;

pub use base::AnalyticalSource;
