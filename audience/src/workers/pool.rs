use std::sync::Arc;

use config::shared::WorkerConfig;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info};

use crate::audience_error;
use crate::concurrency::shutdown::ShutdownRx;
use crate::error::{AudienceError, AudienceResult, ErrorKind};
use crate::queue::{ChangePublisher, TaskQueue};
use crate::source::AnalyticalSource;
use crate::store::AudienceStore;
use crate::workers::task::TaskWorker;

/// Pool of task workers consuming the same task queue.
///
/// Every worker opens its own consumer, so the queue hands each delivery to exactly one of them.
#[derive(Debug, Default)]
pub struct TaskWorkerPool {
    join_set: JoinSet<(u16, AudienceResult<()>)>,
    errors: Vec<AudienceError>,
}

impl TaskWorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns `config.concurrency` workers sharing the given handles.
    pub fn spawn_workers<Q, St, So, P>(
        &mut self,
        config: Arc<WorkerConfig>,
        queue: Q,
        store: St,
        source: So,
        publisher: P,
        shutdown_rx: ShutdownRx,
    ) where
        Q: TaskQueue + Clone + Send + Sync + 'static,
        St: AudienceStore + Clone + Send + Sync + 'static,
        So: AnalyticalSource + Clone + Send + Sync + 'static,
        P: ChangePublisher + Clone + Send + Sync + 'static,
    {
        for worker_id in 0..config.concurrency {
            let worker = TaskWorker::new(
                worker_id,
                config.clone(),
                queue.clone(),
                store.clone(),
                source.clone(),
                publisher.clone(),
                shutdown_rx.clone(),
            );

            let span = tracing::info_span!("task_worker", worker_id, source = So::name());
            self.join_set
                .spawn(async move { (worker_id, worker.run().await) }.instrument(span));
            debug!(worker_id, "spawned task worker in pool");
        }

        info!(concurrency = config.concurrency, "task workers started");
    }

    /// Number of workers that have not been joined yet.
    pub fn len(&self) -> usize {
        self.join_set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.join_set.is_empty()
    }

    /// Waits for every worker to stop and returns the errors they stopped with.
    ///
    /// Cancel safe: errors of workers joined before the future was dropped are kept and reported
    /// by the next call.
    pub async fn wait_all(&mut self) -> AudienceResult<()> {
        while let Some(result) = self.join_set.join_next().await {
            match result {
                Ok((worker_id, Ok(()))) => debug!(worker_id, "task worker stopped"),
                Ok((worker_id, Err(err))) => {
                    error!(worker_id, error = %err, "task worker stopped with error");
                    self.errors.push(err);
                }
                Err(join_err) => {
                    if join_err.is_cancelled() {
                        debug!("task worker was cancelled");
                    } else {
                        self.errors.push(audience_error!(
                            ErrorKind::TaskWorkerPanic,
                            "Task worker panicked",
                            source: join_err
                        ));
                    }
                }
            }
        }

        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(std::mem::take(&mut self.errors).into())
        }
    }
}
