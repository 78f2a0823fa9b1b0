pub mod policy;
pub mod pool;
pub mod scheduler;
pub mod task;
