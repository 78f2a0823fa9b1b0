use audience::error::ErrorKind;
use audience::pipeline::{AudiencePipeline, PipelineRole};
use audience::prune::{PRUNE_REASON, prune_audience};
use audience::queue::TaskOutcome;
use audience::queue::memory::MemoryQueue;
use audience::source::memory::MemoryAnalyticalSource;
use audience::store::memory::MemoryAudienceStore;
use audience::test_utils::fixtures::{fixture_candidates, fixture_filter, membership};
use audience::test_utils::notify::within_timeout;
use audience::test_utils::notifying_publisher::NotifyingPublisher;
use audience::types::RequestId;
use audience::workers::task::reconcile_audience;
use chrono::{TimeDelta, Utc};
use config::shared::{SchedulerConfig, WorkerConfig};
use telemetry::tracing::init_test_tracing;

fn configs() -> (SchedulerConfig, WorkerConfig) {
    let scheduler = SchedulerConfig {
        run_at: (Utc::now() + TimeDelta::hours(12)).format("%H:%M").to_string(),
        run_on_start: true,
    };
    let worker = WorkerConfig {
        concurrency: 2,
        min_backoff_ms: 10,
        max_backoff_ms: 50,
        jitter_percent: 0,
    };

    (scheduler, worker)
}

#[tokio::test(flavor = "multi_thread")]
async fn pipeline_reconciles_every_audience_on_start() {
    init_test_tracing();
    let store = MemoryAudienceStore::new();
    let source = MemoryAnalyticalSource::new();
    let queue = MemoryQueue::new();
    let publisher = NotifyingPublisher::new();
    source.upsert_records(fixture_candidates(&[2, 3, 4, 5])).await;
    let first = store
        .create_audience("first", fixture_filter(), membership(&[1, 2, 3]))
        .await;
    let second = store
        .create_audience("second", fixture_filter(), membership(&[]))
        .await;
    store.add_integration(second, "cabinet-7").await.unwrap();

    let changes_notify = publisher.wait_for_changes(2).await;
    let (scheduler_config, worker_config) = configs();
    let mut pipeline = AudiencePipeline::new(
        PipelineRole::All,
        scheduler_config,
        worker_config,
        queue.clone(),
        store.clone(),
        source.clone(),
        publisher.clone(),
    );
    pipeline.start().await.unwrap();

    changes_notify.notified().await;
    within_timeout("task settlements", queue.wait_for_settlements(2)).await;
    within_timeout("pipeline to stop", pipeline.shutdown_and_wait())
        .await
        .unwrap();

    assert_eq!(
        store.membership(first).await.unwrap(),
        membership(&[1, 2, 3, 4, 5])
    );
    assert_eq!(
        store.membership(second).await.unwrap(),
        membership(&[2, 3, 4, 5])
    );

    let mut changes = publisher.changes().await;
    changes.sort_by_key(|change| change.audience_id);
    assert_eq!(changes[0].audience_id, first);
    assert_eq!(changes[0].request_count, 5);
    assert_eq!(changes[0].last_request_id, Some(RequestId::new(5)));
    assert_eq!(changes[1].audience_id, second);
    assert_eq!(changes[1].request_count, 4);
    assert_eq!(changes[1].integrations, vec!["cabinet-7".to_string()]);

    assert!(
        queue
            .settlements()
            .iter()
            .all(|settlement| settlement.outcome == TaskOutcome::Committed)
    );
    assert_eq!(queue.unsettled_len(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn worker_only_pipeline_does_not_dispatch() {
    init_test_tracing();
    let store = MemoryAudienceStore::new();
    let queue = MemoryQueue::new();
    store
        .create_audience("first", fixture_filter(), membership(&[]))
        .await;

    let (scheduler_config, worker_config) = configs();
    let mut pipeline = AudiencePipeline::new(
        PipelineRole::Workers,
        scheduler_config,
        worker_config,
        queue.clone(),
        store.clone(),
        MemoryAnalyticalSource::new(),
        NotifyingPublisher::new(),
    );
    pipeline.start().await.unwrap();

    assert!(!pipeline.trigger());
    assert_eq!(pipeline.scheduler_state(), None);
    within_timeout("pipeline to stop", pipeline.shutdown_and_wait())
        .await
        .unwrap();

    assert_eq!(queue.published_tasks(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn pipeline_fails_when_task_workers_stop_on_their_own() {
    init_test_tracing();
    let queue = MemoryQueue::new();

    let (scheduler_config, worker_config) = configs();
    let mut pipeline = AudiencePipeline::new(
        PipelineRole::All,
        scheduler_config,
        worker_config,
        queue.clone(),
        MemoryAudienceStore::new(),
        MemoryAnalyticalSource::new(),
        NotifyingPublisher::new(),
    );
    pipeline.start().await.unwrap();

    // Consumers stop as if the broker connection dropped, the scheduler keeps running.
    queue.close();

    let err = within_timeout("pipeline to stop", pipeline.wait())
        .await
        .unwrap_err();

    assert!(err.kinds().contains(&ErrorKind::TaskWorkersStopped));
}

#[tokio::test(flavor = "multi_thread")]
async fn pruned_members_are_not_appended_again() {
    init_test_tracing();
    let store = MemoryAudienceStore::new();
    let source = MemoryAnalyticalSource::new();
    let publisher = NotifyingPublisher::new();
    source.upsert_records(fixture_candidates(&[1, 2, 3])).await;
    let audience_id = store
        .create_audience("rejected", fixture_filter(), membership(&[]))
        .await;

    reconcile_audience(&store, &source, &publisher, audience_id)
        .await
        .unwrap();
    source.set_status(RequestId::new(3), "converted").await;

    let report = prune_audience(&store, &source, &publisher, audience_id, false)
        .await
        .unwrap();
    assert_eq!(report.removed, vec![RequestId::new(3)]);

    reconcile_audience(&store, &source, &publisher, audience_id)
        .await
        .unwrap();

    assert_eq!(
        store.membership(audience_id).await.unwrap(),
        membership(&[1, 2])
    );
    let removals = store.removals().await;
    assert_eq!(removals.len(), 1);
    assert_eq!(removals[0].request_id, RequestId::new(3));
    assert_eq!(removals[0].reason, PRUNE_REASON);
    // One update from the first reconciliation, one prune, nothing from the second run.
    assert_eq!(publisher.changes().await.len(), 2);
}
