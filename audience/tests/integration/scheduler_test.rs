use std::sync::Arc;
use std::time::Duration;

use audience::concurrency::shutdown::create_shutdown_channel;
use audience::error::ErrorKind;
use audience::queue::memory::MemoryQueue;
use audience::store::memory::MemoryAudienceStore;
use audience::test_utils::fault::{FaultyQueue, FaultyStore};
use audience::test_utils::fixtures::{fixture_filter, membership};
use audience::test_utils::notify::within_timeout;
use audience::types::AudienceId;
use audience::workers::scheduler::{Scheduler, SchedulerState, dispatch_once};
use chrono::{TimeDelta, Utc};
use config::shared::SchedulerConfig;
use telemetry::tracing::init_test_tracing;

async fn create_audiences(store: &MemoryAudienceStore, count: usize) -> Vec<AudienceId> {
    let mut ids = Vec::with_capacity(count);
    for index in 0..count {
        let id = store
            .create_audience(&format!("audience-{index}"), fixture_filter(), membership(&[]))
            .await;
        ids.push(id);
    }

    ids
}

/// Scheduler configuration whose daily run is far away from now.
fn scheduler_config(run_on_start: bool) -> SchedulerConfig {
    let run_at = (Utc::now() + TimeDelta::hours(12)).format("%H:%M").to_string();

    SchedulerConfig {
        run_at,
        run_on_start,
    }
}

async fn wait_for_published_tasks(queue: &MemoryQueue, count: u64) {
    within_timeout("published tasks", async {
        while queue.published_tasks() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn dispatch_enqueues_one_task_per_audience() {
    init_test_tracing();
    let store = MemoryAudienceStore::new();
    let queue = MemoryQueue::new();
    let audience_ids = create_audiences(&store, 3).await;
    let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();

    let report = dispatch_once(&store, &queue, &shutdown_rx).await.unwrap();

    assert_eq!(report.enumerated, 3);
    assert_eq!(report.dispatched, 3);
    assert_eq!(report.failed, 0);
    let tasks = queue.ready_tasks();
    assert_eq!(
        tasks.iter().map(|task| task.audience_id).collect::<Vec<_>>(),
        audience_ids
    );
    // All tasks of one run carry the same issuance time.
    assert!(tasks.iter().all(|task| task.timestamp == tasks[0].timestamp));
}

#[tokio::test(flavor = "multi_thread")]
async fn dispatch_continues_past_failed_publish() {
    init_test_tracing();
    let store = MemoryAudienceStore::new();
    let queue = FaultyQueue::wrap(MemoryQueue::new());
    let audience_ids = create_audiences(&store, 3).await;
    queue.fail_tasks_for(audience_ids[1]);
    let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();

    let report = dispatch_once(&store, &queue, &shutdown_rx).await.unwrap();

    assert_eq!(report.dispatched, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(
        queue
            .get_inner()
            .ready_tasks()
            .iter()
            .map(|task| task.audience_id)
            .collect::<Vec<_>>(),
        vec![audience_ids[0], audience_ids[2]]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn dispatch_after_shutdown_skips_every_audience() {
    init_test_tracing();
    let store = MemoryAudienceStore::new();
    let queue = MemoryQueue::new();
    create_audiences(&store, 3).await;
    let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
    shutdown_tx.shutdown().unwrap();

    let report = dispatch_once(&store, &queue, &shutdown_rx).await.unwrap();

    assert_eq!(report.enumerated, 3);
    assert_eq!(report.dispatched, 0);
    assert_eq!(report.skipped, 3);
    assert_eq!(queue.ready_len(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_listing_is_reported() {
    init_test_tracing();
    let store = FaultyStore::wrap(MemoryAudienceStore::new());
    let queue = MemoryQueue::new();
    store.lists().fail_next(ErrorKind::StoreUnavailable, 1);
    let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();

    let err = dispatch_once(&store, &queue, &shutdown_rx)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::StoreUnavailable);
    assert_eq!(queue.published_tasks(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn scheduler_runs_on_start_and_on_trigger() {
    init_test_tracing();
    let store = MemoryAudienceStore::new();
    let queue = MemoryQueue::new();
    create_audiences(&store, 2).await;
    let (shutdown_tx, shutdown_rx) = create_shutdown_channel();

    let handle = Scheduler::new(
        Arc::new(scheduler_config(true)),
        store.clone(),
        queue.clone(),
        shutdown_rx,
    )
    .start()
    .unwrap();

    wait_for_published_tasks(&queue, 2).await;

    let mut state_rx = handle.state_receiver();
    handle.trigger();
    wait_for_published_tasks(&queue, 4).await;
    within_timeout(
        "scheduler to become idle",
        state_rx.wait_for(|state| *state == SchedulerState::Idle),
    )
    .await
    .unwrap();

    shutdown_tx.shutdown().unwrap();
    within_timeout("scheduler to stop", handle.wait())
        .await
        .unwrap();
    assert_eq!(queue.published_tasks(), 4);
}

#[tokio::test(flavor = "multi_thread")]
async fn scheduler_stops_on_shutdown_without_dispatching() {
    init_test_tracing();
    let store = MemoryAudienceStore::new();
    let queue = MemoryQueue::new();
    create_audiences(&store, 2).await;
    let (shutdown_tx, shutdown_rx) = create_shutdown_channel();

    let handle = Scheduler::new(
        Arc::new(scheduler_config(false)),
        store.clone(),
        queue.clone(),
        shutdown_rx,
    )
    .start()
    .unwrap();
    assert_eq!(handle.state(), SchedulerState::Idle);

    shutdown_tx.shutdown().unwrap();
    within_timeout("scheduler to stop", handle.wait())
        .await
        .unwrap();

    assert_eq!(queue.published_tasks(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_run_at_fails_to_start() {
    init_test_tracing();
    let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();
    let config = SchedulerConfig {
        run_at: "noon".to_string(),
        run_on_start: false,
    };

    let err = Scheduler::new(
        Arc::new(config),
        MemoryAudienceStore::new(),
        MemoryQueue::new(),
        shutdown_rx,
    )
    .start()
    .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ConfigError);
}
