use std::time::Duration;

use audience::error::ErrorKind;
use audience::messages::ChangeStatus;
use audience::prune::PRUNE_REASON;
use audience::store::AudienceStore;
use audience::test_utils::database::spawn_store_database;
use audience::test_utils::fixtures::{fixture_filter, membership, request_ids};
use audience::types::{AudienceId, PendingChange, RequestId};
use postgres::audience::get_member_removals;
use telemetry::tracing::init_test_tracing;

#[tokio::test(flavor = "multi_thread")]
async fn created_audience_reads_back_with_filter_and_integrations() {
    init_test_tracing();
    let database = spawn_store_database().await;
    let store = database.store.clone();

    let audience_id = store
        .create_audience("rejected", &fixture_filter())
        .await
        .unwrap();
    store.add_integration(audience_id, "cabinet-2").await.unwrap();
    store.add_integration(audience_id, "cabinet-1").await.unwrap();
    store.add_integration(audience_id, "cabinet-1").await.unwrap();

    let audience = store.get_audience(audience_id).await.unwrap();
    assert_eq!(audience.name, "rejected");
    assert_eq!(audience.filter, fixture_filter());
    assert!(audience.membership.is_empty());
    assert_eq!(audience.pending_change, None);

    assert_eq!(store.list_audience_ids().await.unwrap(), vec![audience_id]);
    assert_eq!(
        store.get_integration_names(audience_id).await.unwrap(),
        vec!["cabinet-1".to_string(), "cabinet-2".to_string()]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_appends_store_the_union() {
    init_test_tracing();
    let database = spawn_store_database().await;
    let store = database.store.clone();
    let audience_id = store
        .create_audience("rejected", &fixture_filter())
        .await
        .unwrap();

    let first_store = store.clone();
    let second_store = store.clone();
    let first = tokio::spawn(async move {
        first_store
            .append_members(audience_id, &request_ids(&[1, 2, 3]))
            .await
    });
    let second = tokio::spawn(async move {
        second_store
            .append_members(audience_id, &request_ids(&[2, 3, 4]))
            .await
    });
    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();

    // Each id is reported inserted by exactly one caller.
    let mut inserted: Vec<RequestId> = first
        .inserted
        .iter()
        .chain(&second.inserted)
        .copied()
        .collect();
    inserted.sort_unstable();
    assert_eq!(inserted, request_ids(&[1, 2, 3, 4]));
    assert_eq!(first.member_count.max(second.member_count), 4);

    let audience = store.get_audience(audience_id).await.unwrap();
    assert_eq!(audience.membership, membership(&[1, 2, 3, 4]));
    assert_eq!(audience.updated_at, first.updated_at.max(second.updated_at));
}

#[tokio::test(flavor = "multi_thread")]
async fn identical_concurrent_appends_insert_once() {
    init_test_tracing();
    let database = spawn_store_database().await;
    let store = database.store.clone();
    let audience_id = store
        .create_audience("rejected", &fixture_filter())
        .await
        .unwrap();

    let appends: Vec<_> = (0..4)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .append_members(audience_id, &request_ids(&[10, 11, 12]))
                    .await
            })
        })
        .collect();

    let mut outcomes = Vec::new();
    for append in appends {
        outcomes.push(append.await.unwrap().unwrap());
    }

    let winners: Vec<_> = outcomes
        .iter()
        .filter(|outcome| !outcome.inserted.is_empty())
        .collect();
    assert_eq!(winners.len(), 1);
    assert_eq!(winners[0].inserted, request_ids(&[10, 11, 12]));
    assert!(outcomes.iter().all(|outcome| outcome.member_count == 3));
    assert_eq!(
        store.get_audience(audience_id).await.unwrap().membership,
        membership(&[10, 11, 12])
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn audiences_are_isolated() {
    init_test_tracing();
    let database = spawn_store_database().await;
    let store = database.store.clone();
    let rejected = store
        .create_audience("rejected", &fixture_filter())
        .await
        .unwrap();
    let spam = store
        .create_audience("spam", &fixture_filter())
        .await
        .unwrap();
    store
        .append_members(spam, &request_ids(&[100]))
        .await
        .unwrap();
    let spam_before = store.get_audience(spam).await.unwrap();

    store
        .append_members(rejected, &request_ids(&[1, 2, 100]))
        .await
        .unwrap();
    store
        .remove_members(rejected, &request_ids(&[100]), PRUNE_REASON)
        .await
        .unwrap();

    let spam_after = store.get_audience(spam).await.unwrap();
    assert_eq!(spam_after, spam_before);

    store.delete_audience(rejected).await.unwrap();
    assert_eq!(store.list_audience_ids().await.unwrap(), vec![spam]);
    assert_eq!(
        store.get_audience(spam).await.unwrap().membership,
        membership(&[100])
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn removal_writes_one_audit_row_per_removed_member() {
    init_test_tracing();
    let database = spawn_store_database().await;
    let store = database.store.clone();
    let audience_id = store
        .create_audience("rejected", &fixture_filter())
        .await
        .unwrap();
    let appended = store
        .append_members(audience_id, &request_ids(&[1, 2, 3]))
        .await
        .unwrap();

    let removal = store
        .remove_members(audience_id, &request_ids(&[3, 2, 9]), PRUNE_REASON)
        .await
        .unwrap();

    assert_eq!(removal.removed, request_ids(&[2, 3]));
    assert_eq!(removal.member_count, 1);
    assert!(removal.updated_at > appended.updated_at);

    let mut conn = store.pool().acquire().await.unwrap();
    let mut removals = get_member_removals(&mut conn, audience_id.into_inner())
        .await
        .unwrap();
    removals.sort();
    assert_eq!(
        removals,
        vec![
            (2, PRUNE_REASON.to_string()),
            (3, PRUNE_REASON.to_string())
        ]
    );

    // Audit rows outlive the audience.
    store.delete_audience(audience_id).await.unwrap();
    let removals = get_member_removals(&mut conn, audience_id.into_inner())
        .await
        .unwrap();
    assert_eq!(removals.len(), 2);

    // Nothing removed, nothing audited.
    let other = store
        .create_audience("other", &fixture_filter())
        .await
        .unwrap();
    let removal = store
        .remove_members(other, &request_ids(&[1]), PRUNE_REASON)
        .await
        .unwrap();
    assert!(removal.removed.is_empty());
    assert!(
        get_member_removals(&mut conn, other.into_inner())
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn snapshot_never_observes_a_partial_append() {
    init_test_tracing();
    let database = spawn_store_database().await;
    let store = database.store.clone();
    let audience_id = store
        .create_audience("rejected", &fixture_filter())
        .await
        .unwrap();
    store.add_integration(audience_id, "cabinet-1").await.unwrap();

    const BATCH: i64 = 50;
    let writer_store = store.clone();
    let writer = tokio::spawn(async move {
        for batch in 0..10 {
            let ids: Vec<i64> = (batch * BATCH..(batch + 1) * BATCH).collect();
            writer_store
                .append_members(audience_id, &request_ids(&ids))
                .await
                .unwrap();
        }
    });

    let mut snapshots = Vec::new();
    while !writer.is_finished() {
        snapshots.push(store.get_snapshot(audience_id).await.unwrap());
    }
    writer.await.unwrap();
    snapshots.push(store.get_snapshot(audience_id).await.unwrap());

    for snapshot in &snapshots {
        assert_eq!(snapshot.audience.membership.len() as i64 % BATCH, 0);
        assert_eq!(snapshot.integrations, vec!["cabinet-1".to_string()]);
    }
    let last = snapshots.last().unwrap();
    assert_eq!(last.audience.membership.len() as i64, 10 * BATCH);
    assert_eq!(
        last.audience.updated_at,
        store.get_audience(audience_id).await.unwrap().updated_at
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn pending_change_is_claimed_once_and_cleared_after_publish() {
    init_test_tracing();
    let database = spawn_store_database().await;
    let store = database.store.clone();
    let audience_id = store
        .create_audience("rejected", &fixture_filter())
        .await
        .unwrap();
    let lease = Duration::from_secs(60);

    let first = store
        .append_members(audience_id, &request_ids(&[5, 1]))
        .await
        .unwrap();
    let second = store
        .append_members(audience_id, &request_ids(&[3]))
        .await
        .unwrap();
    assert!(second.updated_at > first.updated_at);

    let audience = store.get_audience(audience_id).await.unwrap();
    assert_eq!(
        audience.pending_change,
        Some(PendingChange {
            status: ChangeStatus::Updated,
            last_request_id: Some(RequestId::new(5)),
        })
    );

    // The first change was superseded, settling it leaves the newer one pending.
    assert!(
        !store
            .settle_pending_change(audience_id, first.updated_at, true)
            .await
            .unwrap()
    );
    // The appending caller holds the claim until it settles it.
    assert!(
        !store
            .claim_pending_change(audience_id, second.updated_at, lease)
            .await
            .unwrap()
    );
    assert!(
        store
            .settle_pending_change(audience_id, second.updated_at, false)
            .await
            .unwrap()
    );
    assert!(
        store
            .claim_pending_change(audience_id, second.updated_at, lease)
            .await
            .unwrap()
    );
    assert!(
        !store
            .claim_pending_change(audience_id, second.updated_at, lease)
            .await
            .unwrap()
    );
    // An expired claim is taken over.
    assert!(
        store
            .claim_pending_change(audience_id, second.updated_at, Duration::ZERO)
            .await
            .unwrap()
    );

    assert!(
        store
            .settle_pending_change(audience_id, second.updated_at, true)
            .await
            .unwrap()
    );
    assert_eq!(
        store.get_audience(audience_id).await.unwrap().pending_change,
        None
    );

    store
        .remove_members(audience_id, &request_ids(&[1]), PRUNE_REASON)
        .await
        .unwrap();
    assert_eq!(
        store.get_audience(audience_id).await.unwrap().pending_change,
        Some(PendingChange {
            status: ChangeStatus::Pruned,
            last_request_id: None,
        })
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_audience_is_not_found() {
    init_test_tracing();
    let database = spawn_store_database().await;
    let store = database.store.clone();
    let unknown = AudienceId::new(404);

    let err = store.get_audience(unknown).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AudienceNotFound);

    let err = store
        .append_members(unknown, &request_ids(&[1]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AudienceNotFound);

    let err = store.delete_audience(unknown).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AudienceNotFound);
}
