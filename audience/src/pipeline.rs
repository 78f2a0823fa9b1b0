use std::sync::Arc;

use config::shared::{SchedulerConfig, WorkerConfig};
use tracing::{error, info};

use crate::audience_error;
use crate::concurrency::shutdown::{ShutdownTx, create_shutdown_channel};
use crate::error::{AudienceError, AudienceResult, ErrorKind};
use crate::queue::{ChangePublisher, TaskQueue};
use crate::source::AnalyticalSource;
use crate::store::AudienceStore;
use crate::workers::pool::TaskWorkerPool;
use crate::workers::scheduler::{Scheduler, SchedulerHandle, SchedulerState};

/// Components a pipeline runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineRole {
    /// Scheduler and task workers.
    All,
    /// Only the scheduler, workers run elsewhere.
    Scheduler,
    /// Only the task workers, the scheduler runs elsewhere.
    Workers,
}

impl PipelineRole {
    fn runs_scheduler(self) -> bool {
        matches!(self, PipelineRole::All | PipelineRole::Scheduler)
    }

    fn runs_workers(self) -> bool {
        matches!(self, PipelineRole::All | PipelineRole::Workers)
    }
}

#[derive(Debug)]
enum PipelineState {
    NotStarted,
    Started {
        scheduler: Option<SchedulerHandle>,
        pool: TaskWorkerPool,
    },
}

/// Audience update pipeline wiring the scheduler and the task workers to shared handles.
///
/// Handles are injected once and cloned into every component, there is no global connection
/// state. A single shutdown channel stops all components.
#[derive(Debug)]
pub struct AudiencePipeline<Q, St, So, P> {
    role: PipelineRole,
    scheduler_config: Arc<SchedulerConfig>,
    worker_config: Arc<WorkerConfig>,
    queue: Q,
    store: St,
    source: So,
    publisher: P,
    state: PipelineState,
    shutdown_tx: ShutdownTx,
}

impl<Q, St, So, P> AudiencePipeline<Q, St, So, P>
where
    Q: TaskQueue + Clone + Send + Sync + 'static,
    St: AudienceStore + Clone + Send + Sync + 'static,
    So: AnalyticalSource + Clone + Send + Sync + 'static,
    P: ChangePublisher + Clone + Send + Sync + 'static,
{
    pub fn new(
        role: PipelineRole,
        scheduler_config: SchedulerConfig,
        worker_config: WorkerConfig,
        queue: Q,
        store: St,
        source: So,
        publisher: P,
    ) -> Self {
        // The receiver is not kept, every component subscribes on start.
        let (shutdown_tx, _) = create_shutdown_channel();

        Self {
            role,
            scheduler_config: Arc::new(scheduler_config),
            worker_config: Arc::new(worker_config),
            queue,
            store,
            source,
            publisher,
            state: PipelineState::NotStarted,
            shutdown_tx,
        }
    }

    pub fn role(&self) -> PipelineRole {
        self.role
    }

    pub fn shutdown_tx(&self) -> ShutdownTx {
        self.shutdown_tx.clone()
    }

    /// Starts the components of the pipeline role.
    pub async fn start(&mut self) -> AudienceResult<()> {
        if let PipelineState::Started { .. } = self.state {
            info!("pipeline already started");
            return Ok(());
        }

        info!(role = ?self.role, source = So::name(), "starting audience pipeline");

        let mut pool = TaskWorkerPool::new();
        if self.role.runs_workers() {
            pool.spawn_workers(
                self.worker_config.clone(),
                self.queue.clone(),
                self.store.clone(),
                self.source.clone(),
                self.publisher.clone(),
                self.shutdown_tx.subscribe(),
            );
        }

        let scheduler = if self.role.runs_scheduler() {
            let scheduler = Scheduler::new(
                self.scheduler_config.clone(),
                self.store.clone(),
                self.queue.clone(),
                self.shutdown_tx.subscribe(),
            );

            match scheduler.start() {
                Ok(handle) => Some(handle),
                Err(err) => {
                    // Workers are already running, stop them before reporting the failure.
                    let _ = self.shutdown_tx.shutdown();
                    if let Err(pool_err) = pool.wait_all().await {
                        error!(error = %pool_err, "task workers failed while aborting start");
                    }

                    return Err(err);
                }
            }
        } else {
            None
        };

        self.state = PipelineState::Started { scheduler, pool };

        Ok(())
    }

    /// Requests an ad hoc scheduler run. Returns `false` if this pipeline runs no scheduler.
    pub fn trigger(&self) -> bool {
        match &self.state {
            PipelineState::Started {
                scheduler: Some(scheduler),
                ..
            } => {
                scheduler.trigger();
                true
            }
            _ => false,
        }
    }

    /// Returns the scheduler state, if this pipeline runs a started scheduler.
    pub fn scheduler_state(&self) -> Option<SchedulerState> {
        match &self.state {
            PipelineState::Started {
                scheduler: Some(scheduler),
                ..
            } => Some(scheduler.state()),
            _ => None,
        }
    }

    /// Waits for every component to stop.
    ///
    /// The scheduler and the task workers are watched together. A failing scheduler shuts the
    /// workers down, since without it no new tasks arrive from this process. Workers that stop
    /// while no shutdown was requested, e.g. because the broker connection dropped, shut the
    /// scheduler down and fail the pipeline, so the process exits instead of enqueuing tasks
    /// nobody consumes. Errors of all components are aggregated.
    pub async fn wait(self) -> AudienceResult<()> {
        let PipelineState::Started { scheduler, mut pool } = self.state else {
            info!("pipeline was not started, nothing to wait for");

            return Ok(());
        };

        let mut errors = vec![];
        let mut scheduler_wait = scheduler.map(|scheduler| Box::pin(scheduler.wait()));
        let mut workers_running = !pool.is_empty();

        if workers_running && let Some(scheduler_wait_ref) = scheduler_wait.as_mut() {
            info!("waiting for scheduler and task workers to complete");

            let completed = tokio::select! {
                result = scheduler_wait_ref => Completed::Scheduler(result),
                result = pool.wait_all() => Completed::Workers(result),
            };

            match completed {
                Completed::Scheduler(result) => {
                    scheduler_wait = None;
                    record_scheduler_result(&self.shutdown_tx, result, &mut errors);
                }
                Completed::Workers(result) => {
                    workers_running = false;
                    record_workers_result(&self.shutdown_tx, result, &mut errors);
                }
            }
        }

        if let Some(scheduler_wait) = scheduler_wait {
            info!("waiting for scheduler to complete");

            record_scheduler_result(&self.shutdown_tx, scheduler_wait.await, &mut errors);
        }

        if workers_running {
            info!("waiting for task workers to complete");

            record_workers_result(&self.shutdown_tx, pool.wait_all().await, &mut errors);
        }

        if !errors.is_empty() {
            return Err(errors.into());
        }

        Ok(())
    }

    /// Requests shutdown of every component.
    ///
    /// In-flight tasks are settled before their worker stops.
    pub fn shutdown(&self) {
        info!("shutting down audience pipeline");

        if let Err(err) = self.shutdown_tx.shutdown() {
            error!("failed to send shutdown signal to the pipeline: {}", err);
        }
    }

    pub async fn shutdown_and_wait(self) -> AudienceResult<()> {
        self.shutdown();
        self.wait().await
    }
}

/// Component of a pipeline that stopped first.
enum Completed {
    Scheduler(AudienceResult<()>),
    Workers(AudienceResult<()>),
}

fn record_scheduler_result(
    shutdown_tx: &ShutdownTx,
    result: AudienceResult<()>,
    errors: &mut Vec<AudienceError>,
) {
    if let Err(err) = result {
        errors.push(err);

        // Fails only if no worker is listening anymore.
        let _ = shutdown_tx.shutdown();

        info!("scheduler completed with an error, shutting down task workers");
    }
}

fn record_workers_result(
    shutdown_tx: &ShutdownTx,
    result: AudienceResult<()>,
    errors: &mut Vec<AudienceError>,
) {
    let shutdown_requested = shutdown_tx.is_shutdown();

    if let Err(err) = result {
        let errors_number = err.kinds().len();
        errors.push(err);

        info!("{} task workers failed with an error", errors_number);
    }

    if !shutdown_requested {
        errors.push(audience_error!(
            ErrorKind::TaskWorkersStopped,
            "Task workers stopped without a shutdown request",
            "no task of the queue is consumed by this process anymore"
        ));

        let _ = shutdown_tx.shutdown();

        error!("task workers stopped unexpectedly, shutting down the pipeline");
    }
}
