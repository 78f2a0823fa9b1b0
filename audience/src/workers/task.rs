//! Task worker consuming reconciliation tasks.
//!
//! Each task goes through `Received → Processing → Committed | Requeue | Drop`. Processing
//! returns the [`TaskOutcome`] as a value and the consumer loop settles the delivery with it, so
//! a delivery is only acknowledged once the membership it produced is durable.

use std::sync::Arc;
use std::time::{Duration, Instant};

use config::shared::WorkerConfig;
use metrics::{counter, histogram};
use rand::Rng;
use tokio::time::sleep;
use tracing::{Instrument, debug, error, info, warn};

use crate::concurrency::shutdown::ShutdownRx;
use crate::error::{AudienceError, AudienceResult};
#[cfg(feature = "failpoints")]
use crate::failpoints::{
    TASK_WORKER__AFTER_PERSIST, TASK_WORKER__BEFORE_SOURCE_QUERY, audience_fail_point,
};
use crate::messages::{AudienceChangeMessage, ChangeStatus, ReconciliationTask};
use crate::metrics::{
    AUDIENCE_CHANGE_PUBLISH_FAILURES_TOTAL, AUDIENCE_CHANGES_PUBLISHED_TOTAL,
    AUDIENCE_MEMBERS_APPENDED_TOTAL, AUDIENCE_TASK_DURATION_SECONDS, AUDIENCE_TASKS_SETTLED_TOTAL,
    ERROR_KIND_LABEL, OUTCOME_LABEL, STATUS_LABEL,
};
use crate::queue::{ChangePublisher, TaskConsumer, TaskDelivery, TaskOutcome, TaskQueue};
use crate::reconcile::reconcile;
use crate::source::AnalyticalSource;
use crate::store::AudienceStore;
use crate::types::{Audience, AudienceId, PendingChange, RequestId};
use crate::workers::policy::build_task_outcome_policy;

/// Age after which a claim on a pending change is considered abandoned by a dead worker.
const PENDING_CHANGE_LEASE: Duration = Duration::from_secs(10 * 60);

/// Summary of one successful reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub audience_id: AudienceId,
    /// Candidates that were not members when the audience was read.
    pub delta: usize,
    /// Ids this reconciliation actually inserted.
    pub inserted: Vec<RequestId>,
    pub member_count: u64,
    /// Whether a change message was published.
    pub published: bool,
}

/// Reconciles one audience: reads it, queries new candidates, appends them and announces the
/// change.
///
/// A change message is published only when the store reports inserted ids, so a worker that
/// loses a race against another worker for the same audience stays silent. A failed publish is
/// logged and does not fail the reconciliation, since the membership is already durable: the
/// store keeps the change pending and the next reconciliation without new candidates announces
/// it again. The same holds for a worker dying before it published, once its claim on the
/// change is older than the lease.
pub async fn reconcile_audience<St, So, P>(
    store: &St,
    source: &So,
    publisher: &P,
    audience_id: AudienceId,
) -> AudienceResult<ReconcileReport>
where
    St: AudienceStore + Sync,
    So: AnalyticalSource + Sync,
    P: ChangePublisher + Sync,
{
    let audience = store.get_audience(audience_id).await?;

    #[cfg(feature = "failpoints")]
    audience_fail_point(TASK_WORKER__BEFORE_SOURCE_QUERY)?;

    let candidates = source
        .find_new(&audience.filter, &audience.membership)
        .await?;
    let reconciliation = reconcile(
        &audience.membership,
        candidates.iter().map(|candidate| candidate.id),
    );

    if reconciliation.is_noop() {
        let member_count = audience.membership.len() as u64;
        let published = match audience.pending_change {
            None => {
                debug!(%audience_id, "no new candidates");

                false
            }
            Some(pending) => {
                let claimed = store
                    .claim_pending_change(audience_id, audience.updated_at, PENDING_CHANGE_LEASE)
                    .await?;

                if claimed {
                    info!(
                        %audience_id,
                        status = pending.status.as_str(),
                        updated_at = %audience.updated_at,
                        "announcing pending audience change"
                    );

                    let message = pending_change_message(audience, pending);
                    publish_change(store, publisher, message).await
                } else {
                    debug!(%audience_id, "pending audience change is being announced elsewhere");

                    false
                }
            }
        };

        return Ok(ReconcileReport {
            audience_id,
            delta: 0,
            inserted: Vec::new(),
            member_count,
            published,
        });
    }

    let delta: Vec<RequestId> = reconciliation.delta.iter().collect();
    let appended = store.append_members(audience_id, &delta).await?;
    counter!(AUDIENCE_MEMBERS_APPENDED_TOTAL).increment(appended.inserted.len() as u64);

    #[cfg(feature = "failpoints")]
    audience_fail_point(TASK_WORKER__AFTER_PERSIST)?;

    if appended.inserted.is_empty() {
        info!(
            %audience_id,
            delta = delta.len(),
            "delta was already appended by a concurrent reconciliation"
        );

        return Ok(ReconcileReport {
            audience_id,
            delta: delta.len(),
            inserted: Vec::new(),
            member_count: appended.member_count,
            published: false,
        });
    }

    let message = AudienceChangeMessage::updated(
        audience_id,
        appended.updated_at,
        appended.member_count,
        appended.last_inserted(),
        audience.filter,
        Vec::new(),
    );
    let published = publish_change(store, publisher, message).await;

    Ok(ReconcileReport {
        audience_id,
        delta: delta.len(),
        inserted: appended.inserted,
        member_count: appended.member_count,
        published,
    })
}

/// Builds the message announcing the pending change of `audience` in its current state.
fn pending_change_message(audience: Audience, pending: PendingChange) -> AudienceChangeMessage {
    let request_count = audience.membership.len() as u64;

    match pending.status {
        ChangeStatus::Updated => AudienceChangeMessage::updated(
            audience.id,
            audience.updated_at,
            request_count,
            pending.last_request_id,
            audience.filter,
            Vec::new(),
        ),
        ChangeStatus::Pruned => AudienceChangeMessage::pruned(
            audience.id,
            audience.updated_at,
            request_count,
            audience.filter,
            Vec::new(),
        ),
    }
}

/// Attaches the audience integrations to `message`, publishes it and settles the claim on the
/// pending change it announces.
///
/// The caller must hold the claim. Returns whether the message was published. Failures are
/// logged and counted only. A change that cannot be settled is announced again once the claim
/// expires, which consumers deduplicate on `(audience_id, updated_at)`.
pub(crate) async fn publish_change<St, P>(
    store: &St,
    publisher: &P,
    mut message: AudienceChangeMessage,
) -> bool
where
    St: AudienceStore + Sync,
    P: ChangePublisher + Sync,
{
    let audience_id = message.audience_id;
    let status = message.status.as_str();

    let result = async {
        message.integrations = store.get_integration_names(audience_id).await?;
        publisher.publish_change(&message).await
    }
    .await;

    let published = match result {
        Ok(()) => {
            counter!(AUDIENCE_CHANGES_PUBLISHED_TOTAL, STATUS_LABEL => status).increment(1);
            debug!(%audience_id, status, "published audience change");

            true
        }
        Err(err) => {
            counter!(
                AUDIENCE_CHANGE_PUBLISH_FAILURES_TOTAL,
                STATUS_LABEL => status,
                ERROR_KIND_LABEL => format!("{:?}", err.kind())
            )
            .increment(1);
            error!(
                %audience_id,
                status,
                error = %err,
                "failed to publish audience change, membership is already committed"
            );

            false
        }
    };

    match store
        .settle_pending_change(audience_id, message.updated_at, published)
        .await
    {
        Ok(true) => {}
        Ok(false) => debug!(
            %audience_id,
            "audience changed again, keeping the newer change pending"
        ),
        Err(err) => warn!(
            %audience_id,
            error = %err,
            "failed to settle pending audience change, it is announced again after the lease"
        ),
    }

    published
}

/// Maps a task failure to the outcome its delivery is settled with, logging it.
fn outcome_for_error(err: &AudienceError, audience_id: Option<AudienceId>) -> TaskOutcome {
    let policy = build_task_outcome_policy(err);
    let audience_id = audience_id.map(|id| id.to_string()).unwrap_or_default();

    match policy.outcome() {
        TaskOutcome::Requeue => warn!(
            audience_id = %audience_id,
            error = %err,
            "reconciliation failed transiently, requeueing task"
        ),
        _ => error!(
            audience_id = %audience_id,
            error = %err,
            solution = policy.solution().unwrap_or_default(),
            "reconciliation failed permanently, dropping task"
        ),
    }

    policy.outcome()
}

/// Jittered exponential pause applied after a task was requeued.
#[derive(Debug, Clone)]
struct RequeueBackoff {
    min: Duration,
    max: Duration,
    jitter_percent: u8,
    consecutive_requeues: u32,
}

impl RequeueBackoff {
    fn new(config: &WorkerConfig) -> Self {
        Self {
            min: Duration::from_millis(config.min_backoff_ms),
            max: Duration::from_millis(config.max_backoff_ms),
            jitter_percent: config.jitter_percent.min(100),
            consecutive_requeues: 0,
        }
    }

    /// Returns the base delay for the current streak of requeues and extends the streak.
    fn next_base_delay(&mut self) -> Duration {
        let exponent = self.consecutive_requeues.min(16);
        self.consecutive_requeues = self.consecutive_requeues.saturating_add(1);

        self.min.saturating_mul(1 << exponent).min(self.max)
    }

    fn next_delay(&mut self) -> Duration {
        let base = self.next_base_delay();
        let jitter_range = base.as_secs_f64() * self.jitter_percent as f64 / 100.0;

        let mut rng = rand::rng();
        let jitter = rng.random_range(-jitter_range..=jitter_range);

        Duration::from_secs_f64((base.as_secs_f64() + jitter).max(0.0))
    }

    fn reset(&mut self) {
        self.consecutive_requeues = 0;
    }
}

/// Worker that consumes reconciliation tasks until shutdown.
#[derive(Debug)]
pub struct TaskWorker<Q, St, So, P> {
    worker_id: u16,
    config: Arc<WorkerConfig>,
    queue: Q,
    store: St,
    source: So,
    publisher: P,
    shutdown_rx: ShutdownRx,
}

impl<Q, St, So, P> TaskWorker<Q, St, So, P>
where
    Q: TaskQueue + Send + Sync + 'static,
    St: AudienceStore + Send + Sync + 'static,
    So: AnalyticalSource + Send + Sync + 'static,
    P: ChangePublisher + Send + Sync + 'static,
{
    #[expect(clippy::too_many_arguments)]
    pub fn new(
        worker_id: u16,
        config: Arc<WorkerConfig>,
        queue: Q,
        store: St,
        source: So,
        publisher: P,
        shutdown_rx: ShutdownRx,
    ) -> Self {
        Self {
            worker_id,
            config,
            queue,
            store,
            source,
            publisher,
            shutdown_rx,
        }
    }

    /// Consumes tasks until shutdown is requested or the queue closes.
    ///
    /// Shutdown is only observed between deliveries: a task being processed is always settled
    /// before the worker returns. Errors of the queue itself end the worker.
    pub async fn run(mut self) -> AudienceResult<()> {
        let consumer_tag = format!("audience-worker-{}", self.worker_id);
        let mut consumer = self.queue.consumer(&consumer_tag).await?;
        let mut backoff = RequeueBackoff::new(&self.config);

        info!(worker_id = self.worker_id, "task worker started");

        loop {
            let next = tokio::select! {
                biased;

                _ = self.shutdown_rx.wait_for_shutdown() => {
                    info!(worker_id = self.worker_id, "task worker shutting down");
                    break;
                }
                next = consumer.next() => next,
            };

            let Some(delivery) = next else {
                info!(worker_id = self.worker_id, "task queue closed, stopping task worker");
                break;
            };
            let delivery = delivery?;
            let payload = delivery.payload().to_vec();

            let outcome = self.process(&payload, delivery.redelivered()).await;
            delivery.settle(outcome).await?;
            counter!(AUDIENCE_TASKS_SETTLED_TOTAL, OUTCOME_LABEL => outcome.as_static_str())
                .increment(1);

            if outcome != TaskOutcome::Requeue {
                backoff.reset();
                continue;
            }

            let delay = backoff.next_delay();
            debug!(worker_id = self.worker_id, ?delay, "backing off after requeue");
            tokio::select! {
                _ = sleep(delay) => {}
                _ = self.shutdown_rx.wait_for_shutdown() => {
                    info!(worker_id = self.worker_id, "task worker shutting down during backoff");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Processes one delivery payload into the outcome it must be settled with.
    async fn process(&self, payload: &[u8], redelivered: bool) -> TaskOutcome {
        let task = match ReconciliationTask::from_payload(payload) {
            Ok(task) => task,
            Err(err) => return outcome_for_error(&err, None),
        };
        let audience_id = task.audience_id;

        let span = tracing::info_span!(
            "reconcile_audience",
            worker_id = self.worker_id,
            %audience_id,
            redelivered
        );
        let started = Instant::now();
        let result = reconcile_audience(&self.store, &self.source, &self.publisher, audience_id)
            .instrument(span.or_current())
            .await;
        histogram!(AUDIENCE_TASK_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

        match result {
            Ok(report) => {
                info!(
                    %audience_id,
                    delta = report.delta,
                    inserted = report.inserted.len(),
                    member_count = report.member_count,
                    published = report.published,
                    "audience reconciled"
                );

                TaskOutcome::Committed
            }
            Err(err) => outcome_for_error(&err, Some(audience_id)),
        }
    }
}
