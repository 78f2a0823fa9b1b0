//! Daily fan-out of reconciliation tasks.
//!
//! The scheduler holds no per-audience state: every run lists all audiences and enqueues one
//! [`ReconciliationTask`] per audience. Runs happen once a day at a fixed UTC time of day,
//! optionally once at start-up, and whenever [`SchedulerHandle::trigger`] is called.

use std::future::pending;
use std::sync::Arc;

use chrono::{DateTime, NaiveTime, TimeDelta, Utc};
use config::shared::SchedulerConfig;
use metrics::{counter, gauge};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{Instrument, debug, error, info, warn};

use crate::audience_error;
use crate::concurrency::shutdown::ShutdownRx;
use crate::concurrency::signal::{SignalRx, SignalTx, create_signal};
use crate::error::{AudienceResult, ErrorKind};
#[cfg(feature = "failpoints")]
use crate::failpoints::{SCHEDULER__BETWEEN_PUBLISHES, audience_fail_point};
use crate::messages::ReconciliationTask;
use crate::metrics::{
    AUDIENCE_SCHEDULER_LAST_RUN_TIMESTAMP, AUDIENCE_TASK_DISPATCH_FAILURES_TOTAL,
    AUDIENCE_TASKS_DISPATCHED_TOTAL, ERROR_KIND_LABEL,
};
use crate::queue::TaskQueue;
use crate::store::AudienceStore;

/// Observable state of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Waiting for the next run.
    Idle,
    /// Listing the audiences of a run.
    Enumerating,
    /// Enqueueing the tasks of a run.
    Dispatching,
}

/// Summary of one dispatch run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Audiences listed by the store.
    pub enumerated: usize,
    /// Tasks enqueued.
    pub dispatched: usize,
    /// Tasks that failed to enqueue.
    pub failed: usize,
    /// Audiences left out because shutdown was requested mid-run.
    pub skipped: usize,
}

/// Lists every audience and enqueues one reconciliation task per audience.
///
/// A failed publish is logged and counted, the remaining audiences are still dispatched. Shutdown
/// is checked between publishes: a publish in flight always completes and the audiences after it
/// are reported as skipped.
pub async fn dispatch_once<St, Q>(
    store: &St,
    queue: &Q,
    shutdown_rx: &ShutdownRx,
) -> AudienceResult<DispatchReport>
where
    St: AudienceStore + Sync,
    Q: TaskQueue + Sync,
{
    let (state_tx, _) = watch::channel(SchedulerState::Idle);
    dispatch(store, queue, shutdown_rx, &state_tx).await
}

async fn dispatch<St, Q>(
    store: &St,
    queue: &Q,
    shutdown_rx: &ShutdownRx,
    state_tx: &watch::Sender<SchedulerState>,
) -> AudienceResult<DispatchReport>
where
    St: AudienceStore + Sync,
    Q: TaskQueue + Sync,
{
    state_tx.send_replace(SchedulerState::Enumerating);
    let audience_ids = match store.list_audience_ids().await {
        Ok(audience_ids) => audience_ids,
        Err(err) => {
            state_tx.send_replace(SchedulerState::Idle);
            return Err(err);
        }
    };

    state_tx.send_replace(SchedulerState::Dispatching);
    let issued_at = Utc::now();
    let mut report = DispatchReport {
        enumerated: audience_ids.len(),
        ..Default::default()
    };

    for (index, audience_id) in audience_ids.iter().copied().enumerate() {
        if shutdown_rx.is_shutdown() {
            report.skipped = audience_ids.len() - index;
            info!(
                skipped = report.skipped,
                "shutdown requested, skipping remaining audiences of this run"
            );
            break;
        }

        let task = ReconciliationTask::new(audience_id, issued_at);
        let result = async {
            #[cfg(feature = "failpoints")]
            audience_fail_point(SCHEDULER__BETWEEN_PUBLISHES)?;

            queue.publish_task(&task).await
        }
        .await;

        match result {
            Ok(()) => {
                report.dispatched += 1;
                counter!(AUDIENCE_TASKS_DISPATCHED_TOTAL).increment(1);
                debug!(%audience_id, "dispatched reconciliation task");
            }
            Err(err) => {
                report.failed += 1;
                counter!(
                    AUDIENCE_TASK_DISPATCH_FAILURES_TOTAL,
                    ERROR_KIND_LABEL => format!("{:?}", err.kind())
                )
                .increment(1);
                error!(%audience_id, error = %err, "failed to dispatch reconciliation task");
            }
        }
    }

    gauge!(AUDIENCE_SCHEDULER_LAST_RUN_TIMESTAMP).set(Utc::now().timestamp() as f64);
    state_tx.send_replace(SchedulerState::Idle);

    Ok(report)
}

/// Returns the first occurrence of `run_at` (UTC) strictly after `now`.
fn next_run_after(now: DateTime<Utc>, run_at: NaiveTime) -> DateTime<Utc> {
    let today = now.date_naive().and_time(run_at).and_utc();
    if today > now {
        today
    } else {
        today + TimeDelta::days(1)
    }
}

/// Converts a UTC datetime to a tokio [`Instant`], saturating to now for past datetimes.
fn date_time_to_instant(date_time: DateTime<Utc>) -> Instant {
    let now = Utc::now();
    match (date_time - now).to_std() {
        Ok(duration) => Instant::now() + duration,
        Err(_) => Instant::now(),
    }
}

/// Waits for the next trigger. Once every trigger sender is gone, waits forever.
async fn triggered(trigger_rx: &mut Option<SignalRx>) {
    let Some(rx) = trigger_rx else {
        return pending().await;
    };

    if rx.changed().await.is_err() {
        *trigger_rx = None;
        pending::<()>().await;
    }
}

/// Handle of a running [`Scheduler`].
#[derive(Debug)]
pub struct SchedulerHandle {
    handle: Option<JoinHandle<AudienceResult<()>>>,
    trigger_tx: SignalTx,
    state_rx: watch::Receiver<SchedulerState>,
}

impl SchedulerHandle {
    /// Requests an ad hoc run. Triggers sent while a run is in progress coalesce into one run.
    pub fn trigger(&self) {
        self.trigger_tx.send_replace(());
    }

    /// Returns the current state of the scheduler.
    pub fn state(&self) -> SchedulerState {
        *self.state_rx.borrow()
    }

    /// Returns a receiver observing the state transitions of the scheduler.
    pub fn state_receiver(&self) -> watch::Receiver<SchedulerState> {
        self.state_rx.clone()
    }

    /// Waits for the scheduler to stop.
    pub async fn wait(mut self) -> AudienceResult<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        handle.await.map_err(|err| {
            audience_error!(
                ErrorKind::SchedulerPanic,
                "Scheduler panicked",
                source: err
            )
        })?
    }
}

/// Timer-driven producer of reconciliation tasks.
#[derive(Debug)]
pub struct Scheduler<St, Q> {
    config: Arc<SchedulerConfig>,
    store: St,
    queue: Q,
    shutdown_rx: ShutdownRx,
}

impl<St, Q> Scheduler<St, Q>
where
    St: AudienceStore + Send + Sync + 'static,
    Q: TaskQueue + Send + Sync + 'static,
{
    pub fn new(config: Arc<SchedulerConfig>, store: St, queue: Q, shutdown_rx: ShutdownRx) -> Self {
        Self {
            config,
            store,
            queue,
            shutdown_rx,
        }
    }

    /// Spawns the scheduler loop and returns its handle.
    pub fn start(self) -> AudienceResult<SchedulerHandle> {
        let run_at = self.config.run_at_time().map_err(|err| {
            audience_error!(
                ErrorKind::ConfigError,
                "Invalid scheduler configuration",
                err
            )
        })?;

        let (state_tx, state_rx) = watch::channel(SchedulerState::Idle);
        let (trigger_tx, trigger_rx) = create_signal();

        info!(%run_at, run_on_start = self.config.run_on_start, "starting scheduler");

        let span = tracing::info_span!("scheduler", %run_at);
        let handle = tokio::spawn(self.run(run_at, state_tx, trigger_rx).instrument(span));

        Ok(SchedulerHandle {
            handle: Some(handle),
            trigger_tx,
            state_rx,
        })
    }

    async fn run(
        mut self,
        run_at: NaiveTime,
        state_tx: watch::Sender<SchedulerState>,
        trigger_rx: SignalRx,
    ) -> AudienceResult<()> {
        let mut trigger_rx = Some(trigger_rx);

        if self.config.run_on_start {
            self.run_dispatch(&state_tx, "start-up").await;
        }

        loop {
            let next_run = next_run_after(Utc::now(), run_at);
            debug!(%next_run, "waiting for next run");

            let reason = tokio::select! {
                biased;

                _ = self.shutdown_rx.wait_for_shutdown() => {
                    info!("scheduler shutting down");
                    break;
                }
                _ = triggered(&mut trigger_rx) => "trigger",
                _ = sleep_until(date_time_to_instant(next_run)) => "timer",
            };

            self.run_dispatch(&state_tx, reason).await;
        }

        Ok(())
    }

    /// Runs one dispatch. A failed run is logged and the next run is awaited as usual.
    async fn run_dispatch(&self, state_tx: &watch::Sender<SchedulerState>, reason: &'static str) {
        match dispatch(&self.store, &self.queue, &self.shutdown_rx, state_tx).await {
            Ok(report) if report.failed > 0 => warn!(
                reason,
                enumerated = report.enumerated,
                dispatched = report.dispatched,
                failed = report.failed,
                skipped = report.skipped,
                "dispatch completed with failures"
            ),
            Ok(report) => info!(
                reason,
                enumerated = report.enumerated,
                dispatched = report.dispatched,
                skipped = report.skipped,
                "dispatch completed"
            ),
            Err(err) => error!(reason, error = %err, "failed to list audiences for dispatch"),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(hour: u32, minute: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(hour, minute, 0).unwrap()
    }

    #[test]
    fn next_run_is_later_today() {
        let now = Utc.with_ymd_and_hms(2025, 3, 10, 0, 30, 0).unwrap();

        assert_eq!(
            next_run_after(now, at(1, 0)),
            Utc.with_ymd_and_hms(2025, 3, 10, 1, 0, 0).unwrap()
        );
    }

    #[test]
    fn next_run_rolls_over_to_tomorrow() {
        let now = Utc.with_ymd_and_hms(2025, 12, 31, 1, 0, 0).unwrap();

        // Exactly at the run time counts as already run.
        assert_eq!(
            next_run_after(now, at(1, 0)),
            Utc.with_ymd_and_hms(2026, 1, 1, 1, 0, 0).unwrap()
        );
    }

    #[test]
    fn past_datetimes_fire_immediately() {
        let before = Instant::now();
        let instant = date_time_to_instant(Utc::now() - TimeDelta::hours(1));

        assert!(instant >= before);
        assert!(instant <= Instant::now());
    }
}
