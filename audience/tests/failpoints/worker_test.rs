use std::sync::Arc;

use audience::concurrency::shutdown::create_shutdown_channel;
use audience::failpoints::{
    SCHEDULER__BETWEEN_PUBLISHES, TASK_WORKER__AFTER_PERSIST, TASK_WORKER__BEFORE_SOURCE_QUERY,
};
use audience::messages::ReconciliationTask;
use audience::queue::memory::MemoryQueue;
use audience::queue::{TaskOutcome, TaskQueue};
use audience::source::memory::MemoryAnalyticalSource;
use audience::store::AudienceStore;
use audience::store::memory::MemoryAudienceStore;
use audience::test_utils::failpoints::CustomFailScenario;
use audience::test_utils::fixtures::{fixture_candidates, fixture_filter, membership};
use audience::test_utils::notify::within_timeout;
use audience::test_utils::notifying_publisher::NotifyingPublisher;
use audience::types::{AudienceId, RequestId};
use audience::workers::pool::TaskWorkerPool;
use audience::workers::scheduler::dispatch_once;
use audience::workers::task::reconcile_audience;
use chrono::Utc;
use config::shared::WorkerConfig;
use telemetry::tracing::init_test_tracing;

struct Fixture {
    store: MemoryAudienceStore,
    source: MemoryAnalyticalSource,
    queue: MemoryQueue,
    publisher: NotifyingPublisher,
    audience_id: AudienceId,
}

async fn fixture() -> Fixture {
    let store = MemoryAudienceStore::new();
    let source = MemoryAnalyticalSource::new();
    source.upsert_records(fixture_candidates(&[1, 2, 3, 4, 5])).await;
    let audience_id = store
        .create_audience("rejected", fixture_filter(), membership(&[1, 2, 3]))
        .await;

    Fixture {
        store,
        source,
        queue: MemoryQueue::new(),
        publisher: NotifyingPublisher::new(),
        audience_id,
    }
}

async fn process_tasks(fixture: &Fixture, settlements: usize) {
    fixture
        .queue
        .publish_task(&ReconciliationTask::new(fixture.audience_id, Utc::now()))
        .await
        .unwrap();

    let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
    let mut pool = TaskWorkerPool::new();
    pool.spawn_workers(
        Arc::new(WorkerConfig {
            concurrency: 1,
            min_backoff_ms: 10,
            max_backoff_ms: 50,
            jitter_percent: 0,
        }),
        fixture.queue.clone(),
        fixture.store.clone(),
        fixture.source.clone(),
        fixture.publisher.clone(),
        shutdown_rx,
    );

    within_timeout(
        "task settlements",
        fixture.queue.wait_for_settlements(settlements),
    )
    .await;
    let _ = shutdown_tx.shutdown();
    within_timeout("task workers to stop", pool.wait_all())
        .await
        .unwrap();
}

fn outcomes(queue: &MemoryQueue) -> Vec<(bool, TaskOutcome)> {
    queue
        .settlements()
        .into_iter()
        .map(|settlement| (settlement.redelivered, settlement.outcome))
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn crash_after_persist_is_redelivered_without_loss() {
    init_test_tracing();
    let _scenario = CustomFailScenario::setup(&[(TASK_WORKER__AFTER_PERSIST, "1*return(requeue)")]);
    let fixture = fixture().await;

    process_tasks(&fixture, 2).await;

    assert_eq!(
        outcomes(&fixture.queue),
        vec![(false, TaskOutcome::Requeue), (true, TaskOutcome::Committed)]
    );
    // Same membership as a single successful run, the redelivery appends nothing.
    assert_eq!(
        fixture.store.membership(fixture.audience_id).await.unwrap(),
        membership(&[1, 2, 3, 4, 5])
    );
    // The crashed attempt still holds its claim, so the redelivery stays silent.
    assert!(fixture.publisher.changes().await.is_empty());
    let audience = fixture.store.get_audience(fixture.audience_id).await.unwrap();
    assert!(audience.pending_change.is_some());

    // Once the claim expired, the next reconciliation announces the lost change.
    fixture.store.expire_pending_claims().await;
    let report = reconcile_audience(
        &fixture.store,
        &fixture.source,
        &fixture.publisher,
        fixture.audience_id,
    )
    .await
    .unwrap();

    assert!(report.published);
    let changes = fixture.publisher.changes().await;
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].request_count, 5);
    assert_eq!(changes[0].last_request_id, Some(RequestId::new(5)));
    assert_eq!(changes[0].updated_at, audience.updated_at);
    let audience = fixture.store.get_audience(fixture.audience_id).await.unwrap();
    assert_eq!(audience.pending_change, None);
}

#[tokio::test(flavor = "multi_thread")]
async fn permanent_failure_before_query_dead_letters_task() {
    init_test_tracing();
    let _scenario =
        CustomFailScenario::setup(&[(TASK_WORKER__BEFORE_SOURCE_QUERY, "1*return(drop)")]);
    let fixture = fixture().await;

    process_tasks(&fixture, 1).await;

    assert_eq!(
        outcomes(&fixture.queue),
        vec![(false, TaskOutcome::Drop)]
    );
    assert_eq!(fixture.queue.dead_letters().len(), 1);
    assert_eq!(fixture.source.queries().await, 0);
    assert_eq!(
        fixture.store.membership(fixture.audience_id).await.unwrap(),
        membership(&[1, 2, 3])
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_failure_before_query_is_retried() {
    init_test_tracing();
    let _scenario =
        CustomFailScenario::setup(&[(TASK_WORKER__BEFORE_SOURCE_QUERY, "2*return(requeue)")]);
    let fixture = fixture().await;

    process_tasks(&fixture, 3).await;

    assert_eq!(
        outcomes(&fixture.queue),
        vec![
            (false, TaskOutcome::Requeue),
            (true, TaskOutcome::Requeue),
            (true, TaskOutcome::Committed),
        ]
    );
    assert_eq!(
        fixture.store.membership(fixture.audience_id).await.unwrap(),
        membership(&[1, 2, 3, 4, 5])
    );
    assert_eq!(fixture.publisher.changes().await.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn scheduler_fan_out_survives_failing_publish() {
    init_test_tracing();
    let _scenario = CustomFailScenario::setup(&[(SCHEDULER__BETWEEN_PUBLISHES, "1*return")]);
    let store = MemoryAudienceStore::new();
    let queue = MemoryQueue::new();
    for name in ["a", "b", "c"] {
        store
            .create_audience(name, fixture_filter(), membership(&[]))
            .await;
    }
    let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();

    let report = dispatch_once(&store, &queue, &shutdown_rx).await.unwrap();

    assert_eq!(report.enumerated, 3);
    assert_eq!(report.failed, 1);
    assert_eq!(report.dispatched, 2);
    assert_eq!(queue.ready_len(), 2);
}
