//! Transactional audience store, the single source of truth for membership.

mod base;
pub mod memory;
pub mod postgres;

pub use base::AudienceStore;
