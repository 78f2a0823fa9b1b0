mod base;
mod connection;
mod queue;
mod scheduler;
mod source;
mod store;
mod updater;
mod worker;

pub use base::*;
pub use connection::*;
pub use queue::*;
pub use scheduler::*;
pub use source::*;
pub use store::*;
pub use updater::*;
pub use worker::*;
