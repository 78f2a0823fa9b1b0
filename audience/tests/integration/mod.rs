mod pipeline_test;
mod postgres_store_test;
mod scheduler_test;
mod worker_test;
