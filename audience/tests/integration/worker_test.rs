use std::sync::Arc;

use audience::concurrency::shutdown::create_shutdown_channel;
use audience::error::ErrorKind;
use audience::filter::AudienceFilter;
use audience::messages::ReconciliationTask;
use audience::queue::memory::MemoryQueue;
use audience::queue::{ChangePublisher, TaskOutcome, TaskQueue};
use audience::source::AnalyticalSource;
use audience::source::memory::MemoryAnalyticalSource;
use audience::store::AudienceStore;
use audience::store::memory::MemoryAudienceStore;
use audience::test_utils::fault::{FaultyQueue, FaultySource, FaultyStore};
use audience::test_utils::fixtures::{
    fixture_candidate, fixture_candidates, fixture_filter, membership, request_ids,
};
use audience::test_utils::notify::within_timeout;
use audience::test_utils::notifying_publisher::NotifyingPublisher;
use audience::types::{AudienceId, RequestId};
use audience::workers::pool::TaskWorkerPool;
use audience::workers::task::reconcile_audience;
use chrono::Utc;
use config::shared::WorkerConfig;
use telemetry::tracing::init_test_tracing;

fn worker_config(concurrency: u16) -> Arc<WorkerConfig> {
    Arc::new(WorkerConfig {
        concurrency,
        min_backoff_ms: 10,
        max_backoff_ms: 50,
        jitter_percent: 0,
    })
}

/// Runs a worker pool until `settlements` deliveries were settled, then shuts it down.
async fn run_workers<St, So, P>(
    queue: &MemoryQueue,
    store: St,
    source: So,
    publisher: P,
    concurrency: u16,
    settlements: usize,
) where
    St: AudienceStore + Clone + Send + Sync + 'static,
    So: AnalyticalSource + Clone + Send + Sync + 'static,
    P: ChangePublisher + Clone + Send + Sync + 'static,
{
    let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
    let mut pool = TaskWorkerPool::new();
    pool.spawn_workers(
        worker_config(concurrency),
        queue.clone(),
        store,
        source,
        publisher,
        shutdown_rx,
    );

    within_timeout("task settlements", queue.wait_for_settlements(settlements)).await;

    let _ = shutdown_tx.shutdown();
    within_timeout("task workers to stop", pool.wait_all())
        .await
        .unwrap();
}

async fn enqueue(queue: &MemoryQueue, audience_id: AudienceId) {
    queue
        .publish_task(&ReconciliationTask::new(audience_id, Utc::now()))
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
async fn reconciliation_appends_only_new_candidates() {
    init_test_tracing();
    let store = MemoryAudienceStore::new();
    let source = MemoryAnalyticalSource::new();
    let publisher = NotifyingPublisher::new();
    source.upsert_records(fixture_candidates(&[2, 3, 4, 5])).await;
    let audience_id = store
        .create_audience("rejected", fixture_filter(), membership(&[1, 2, 3]))
        .await;

    let report = reconcile_audience(&store, &source, &publisher, audience_id)
        .await
        .unwrap();

    assert_eq!(report.inserted, request_ids(&[4, 5]));
    assert_eq!(report.member_count, 5);
    assert!(report.published);
    assert_eq!(
        store.membership(audience_id).await.unwrap(),
        membership(&[1, 2, 3, 4, 5])
    );

    let changes = publisher.changes().await;
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].audience_id, audience_id);
    assert_eq!(changes[0].request_count, 5);
    assert_eq!(changes[0].last_request_id, Some(RequestId::new(5)));
    assert_eq!(changes[0].filter, fixture_filter());
}

#[tokio::test(flavor = "multi_thread")]
async fn reconciliation_without_new_candidates_publishes_nothing() {
    init_test_tracing();
    let store = MemoryAudienceStore::new();
    let source = MemoryAnalyticalSource::new();
    let publisher = NotifyingPublisher::new();
    source.upsert_records(fixture_candidates(&[1, 2])).await;
    let audience_id = store
        .create_audience("rejected", fixture_filter(), membership(&[1, 2, 3]))
        .await;
    let before = store.get_audience(audience_id).await.unwrap();

    let report = reconcile_audience(&store, &source, &publisher, audience_id)
        .await
        .unwrap();

    assert!(report.inserted.is_empty());
    assert!(!report.published);
    assert!(publisher.changes().await.is_empty());
    let after = store.get_audience(audience_id).await.unwrap();
    assert_eq!(after.updated_at, before.updated_at);
}

#[tokio::test(flavor = "multi_thread")]
async fn membership_only_grows_across_runs() {
    init_test_tracing();
    let store = MemoryAudienceStore::new();
    let source = MemoryAnalyticalSource::new();
    let publisher = NotifyingPublisher::new();
    source.upsert_records(fixture_candidates(&[1, 2])).await;
    let audience_id = store
        .create_audience("rejected", fixture_filter(), membership(&[]))
        .await;

    reconcile_audience(&store, &source, &publisher, audience_id)
        .await
        .unwrap();
    let first = store.membership(audience_id).await.unwrap();

    // A member leaving the filter is not removed, new matches are still appended.
    source.set_status(RequestId::new(1), "converted").await;
    source.upsert_records([fixture_candidate(7)]).await;
    reconcile_audience(&store, &source, &publisher, audience_id)
        .await
        .unwrap();
    let second = store.membership(audience_id).await.unwrap();

    assert!(first.is_subset(&second));
    assert_eq!(second, membership(&[1, 2, 7]));
}

#[tokio::test(flavor = "multi_thread")]
async fn identical_tasks_produce_a_single_change() {
    init_test_tracing();
    let store = MemoryAudienceStore::new();
    let source = MemoryAnalyticalSource::new();
    let publisher = NotifyingPublisher::new();
    let queue = MemoryQueue::new();
    source.upsert_records(fixture_candidates(&[10, 11])).await;
    let audience_id = store
        .create_audience("rejected", fixture_filter(), membership(&[]))
        .await;

    enqueue(&queue, audience_id).await;
    enqueue(&queue, audience_id).await;
    run_workers(
        &queue,
        store.clone(),
        source.clone(),
        publisher.clone(),
        2,
        2,
    )
    .await;

    assert_eq!(
        store.membership(audience_id).await.unwrap(),
        membership(&[10, 11])
    );
    let changes = publisher.changes().await;
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].request_count, 2);
    assert_eq!(changes[0].last_request_id, Some(RequestId::new(11)));
    assert!(
        outcomes(&queue)
            .iter()
            .all(|(_, outcome)| *outcome == TaskOutcome::Committed)
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_audiences_do_not_affect_each_other() {
    init_test_tracing();
    let store = MemoryAudienceStore::new();
    let source = MemoryAnalyticalSource::new();
    let publisher = NotifyingPublisher::new();
    let queue = MemoryQueue::new();

    let mut spam_filter = AudienceFilter {
        statuses: Default::default(),
        ..fixture_filter()
    };
    spam_filter.statuses.insert("spam".to_string());

    source.upsert_records(fixture_candidates(&[1, 2, 3])).await;
    source
        .upsert_records((4..=6).map(|id| {
            let mut record = fixture_candidate(id);
            record.status = "spam".to_string();
            record
        }))
        .await;
    let rejected = store
        .create_audience("rejected", fixture_filter(), membership(&[100]))
        .await;
    let spam = store
        .create_audience("spam", spam_filter, membership(&[200]))
        .await;

    for _ in 0..3 {
        enqueue(&queue, rejected).await;
        enqueue(&queue, spam).await;
    }
    run_workers(
        &queue,
        store.clone(),
        source.clone(),
        publisher.clone(),
        4,
        6,
    )
    .await;

    assert_eq!(
        store.membership(rejected).await.unwrap(),
        membership(&[1, 2, 3, 100])
    );
    assert_eq!(
        store.membership(spam).await.unwrap(),
        membership(&[4, 5, 6, 200])
    );
    assert_eq!(publisher.changes().await.len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_task_is_dropped() {
    init_test_tracing();
    let queue = MemoryQueue::new();
    queue.push_raw(br#"{"audience":"seven"}"#.to_vec());

    run_workers(
        &queue,
        MemoryAudienceStore::new(),
        MemoryAnalyticalSource::new(),
        NotifyingPublisher::new(),
        1,
        1,
    )
    .await;

    assert_eq!(outcomes(&queue), vec![(false, TaskOutcome::Drop)]);
    assert_eq!(queue.dead_letters().len(), 1);
    assert_eq!(queue.ready_len(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn task_for_deleted_audience_is_dropped() {
    init_test_tracing();
    let store = MemoryAudienceStore::new();
    let queue = MemoryQueue::new();
    let audience_id = store
        .create_audience("rejected", fixture_filter(), membership(&[1]))
        .await;
    enqueue(&queue, audience_id).await;
    store.delete_audience(audience_id).await.unwrap();

    run_workers(
        &queue,
        store.clone(),
        MemoryAnalyticalSource::new(),
        NotifyingPublisher::new(),
        1,
        1,
    )
    .await;

    assert_eq!(outcomes(&queue), vec![(false, TaskOutcome::Drop)]);
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_filter_is_dropped_before_querying() {
    init_test_tracing();
    let store = MemoryAudienceStore::new();
    let source = MemoryAnalyticalSource::new();
    let queue = MemoryQueue::new();
    source.upsert_records(fixture_candidates(&[1])).await;

    let unbounded = AudienceFilter {
        creation_date_from: None,
        ..fixture_filter()
    };
    let audience_id = store
        .create_audience("unbounded", unbounded, membership(&[]))
        .await;
    enqueue(&queue, audience_id).await;

    run_workers(
        &queue,
        store.clone(),
        source.clone(),
        NotifyingPublisher::new(),
        1,
        1,
    )
    .await;

    assert_eq!(outcomes(&queue), vec![(false, TaskOutcome::Drop)]);
    assert_eq!(source.queries().await, 0);
    assert!(store.membership(audience_id).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn unavailable_source_requeues_until_it_recovers() {
    init_test_tracing();
    let store = MemoryAudienceStore::new();
    let source = FaultySource::wrap(MemoryAnalyticalSource::new());
    let publisher = NotifyingPublisher::new();
    let queue = MemoryQueue::new();
    source
        .get_inner()
        .upsert_records(fixture_candidates(&[1, 2]))
        .await;
    source.queries().fail_next(ErrorKind::SourceUnavailable, 1);
    source.queries().fail_next(ErrorKind::SourceTimeout, 1);
    let audience_id = store
        .create_audience("rejected", fixture_filter(), membership(&[]))
        .await;
    enqueue(&queue, audience_id).await;

    run_workers(&queue, store.clone(), source.clone(), publisher.clone(), 1, 3).await;

    assert_eq!(
        outcomes(&queue),
        vec![
            (false, TaskOutcome::Requeue),
            (true, TaskOutcome::Requeue),
            (true, TaskOutcome::Committed),
        ]
    );
    assert_eq!(source.queries().injected(), 2);
    assert_eq!(
        store.membership(audience_id).await.unwrap(),
        membership(&[1, 2])
    );
    assert_eq!(publisher.changes().await.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_persistence_requeues_without_partial_state() {
    init_test_tracing();
    let store = FaultyStore::wrap(MemoryAudienceStore::new());
    let source = MemoryAnalyticalSource::new();
    let publisher = NotifyingPublisher::new();
    let queue = MemoryQueue::new();
    source.upsert_records(fixture_candidates(&[1, 2])).await;
    store.writes().fail_next(ErrorKind::PersistenceFailed, 1);
    let audience_id = store
        .get_inner()
        .create_audience("rejected", fixture_filter(), membership(&[]))
        .await;
    enqueue(&queue, audience_id).await;

    run_workers(&queue, store.clone(), source.clone(), publisher.clone(), 1, 2).await;

    assert_eq!(
        outcomes(&queue),
        vec![(false, TaskOutcome::Requeue), (true, TaskOutcome::Committed)]
    );
    assert_eq!(
        store.get_inner().membership(audience_id).await.unwrap(),
        membership(&[1, 2])
    );
    assert_eq!(publisher.changes().await.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_publish_still_commits() {
    init_test_tracing();
    let store = MemoryAudienceStore::new();
    let source = MemoryAnalyticalSource::new();
    let publisher = FaultyQueue::wrap(MemoryQueue::new());
    let queue = MemoryQueue::new();
    source.upsert_records(fixture_candidates(&[1, 2])).await;
    publisher
        .changes()
        .fail_next(ErrorKind::QueueOperationFailed, 1);
    let audience_id = store
        .create_audience("rejected", fixture_filter(), membership(&[]))
        .await;
    enqueue(&queue, audience_id).await;

    run_workers(&queue, store.clone(), source.clone(), publisher.clone(), 1, 1).await;

    assert_eq!(outcomes(&queue), vec![(false, TaskOutcome::Committed)]);
    assert_eq!(
        store.membership(audience_id).await.unwrap(),
        membership(&[1, 2])
    );
    assert!(publisher.get_inner().changes().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_publish_is_announced_by_next_reconciliation() {
    init_test_tracing();
    let store = MemoryAudienceStore::new();
    let source = MemoryAnalyticalSource::new();
    let publisher = FaultyQueue::wrap(MemoryQueue::new());
    source.upsert_records(fixture_candidates(&[1, 2])).await;
    publisher
        .changes()
        .fail_next(ErrorKind::QueueOperationFailed, 1);
    let audience_id = store
        .create_audience("rejected", fixture_filter(), membership(&[]))
        .await;
    store.add_integration(audience_id, "cabinet-3").await.unwrap();

    let first = reconcile_audience(&store, &source, &publisher, audience_id)
        .await
        .unwrap();
    assert_eq!(first.inserted, request_ids(&[1, 2]));
    assert!(!first.published);
    assert!(publisher.get_inner().changes().is_empty());
    let appended = store.get_audience(audience_id).await.unwrap();

    // Nothing new matches, the change lost by the first run is announced instead.
    let second = reconcile_audience(&store, &source, &publisher, audience_id)
        .await
        .unwrap();
    assert!(second.inserted.is_empty());
    assert!(second.published);

    let changes = publisher.get_inner().changes();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].updated_at, appended.updated_at);
    assert_eq!(changes[0].request_count, 2);
    assert_eq!(changes[0].last_request_id, Some(RequestId::new(2)));
    assert_eq!(changes[0].integrations, vec!["cabinet-3".to_string()]);

    // Announced once, the third run has nothing to say.
    let third = reconcile_audience(&store, &source, &publisher, audience_id)
        .await
        .unwrap();
    assert!(!third.published);
    assert_eq!(publisher.get_inner().changes().len(), 1);
}
