//! CorrelationStore interface tests.
//!
//! These tests verify the contract of the CorrelationStore trait.
//! Each storage implementation should run these tests. Every test uses
//! fresh correlation ids, so they can share one store.

use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde_json::json;
use uuid::Uuid;

use rendezvous::model::{NotifyResponse, ProgressUpdate, WaitInstance, WaitQueue};
use rendezvous::storage::{CorrelationStore, RecordOutcome, StorageError};

const TTL: Duration = Duration::from_secs(300);

fn cid(tag: &str) -> String {
    format!("{}-{}", tag, Uuid::new_v4())
}

async fn create<S: CorrelationStore>(store: &S, ids: &[&str]) -> WaitInstance {
    let instance = WaitInstance::new("test", ids.iter().copied());
    store
        .create_wait_instance(&instance)
        .await
        .expect("create should succeed");
    instance
}

async fn respond<S: CorrelationStore>(store: &S, id: &str, is_error: bool, ttl: Duration) {
    store
        .record_response(NotifyResponse::new(id, json!({ "id": id }), is_error, ttl))
        .await
        .expect("record should succeed");
}

async fn full_scan<S: CorrelationStore>(store: &S) -> Vec<WaitQueue> {
    let mut rows = Vec::new();
    loop {
        let page = store.page_wait_queue(rows.len(), 50).await.unwrap();
        if page.is_empty() {
            return rows;
        }
        rows.extend(page);
    }
}

// =============================================================================
// Wait instances
// =============================================================================

pub async fn test_create_and_get_wait_instance<S: CorrelationStore>(store: &S) {
    let (a, b) = (cid("create_a"), cid("create_b"));
    let instance = create(store, &[&a, &b]).await;

    let loaded = store
        .get_wait_instance(instance.id)
        .await
        .unwrap()
        .expect("instance should exist");
    assert_eq!(loaded, instance);
    assert_eq!(store.remaining_count(instance.id).await.unwrap(), 2);

    let rows = store.find_wait_queue_rows(&a).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].wait_instance_id, instance.id);
    assert_eq!(rows[0].correlation_id, a);
}

pub async fn test_get_missing_wait_instance<S: CorrelationStore>(store: &S) {
    let result = store.get_wait_instance(Uuid::new_v4()).await.unwrap();
    assert!(result.is_none(), "unknown instance should be None");
}

pub async fn test_create_duplicate_wait_instance<S: CorrelationStore>(store: &S) {
    let a = cid("dup");
    let instance = create(store, &[&a]).await;

    let result = store.create_wait_instance(&instance).await;
    assert!(
        matches!(result, Err(StorageError::DuplicateWaitInstance(id)) if id == instance.id),
        "second create should be rejected"
    );
    assert_eq!(store.find_wait_queue_rows(&a).await.unwrap().len(), 1);
}

pub async fn test_create_without_correlation_ids<S: CorrelationStore>(store: &S) {
    let instance = WaitInstance::new("test", Vec::<String>::new());
    let result = store.create_wait_instance(&instance).await;
    assert!(matches!(result, Err(StorageError::EmptyCorrelationIds(_))));
    assert!(store.get_wait_instance(instance.id).await.unwrap().is_none());
}

// =============================================================================
// Responses
// =============================================================================

pub async fn test_record_response_first_wins<S: CorrelationStore>(store: &S) {
    let a = cid("first_wins");

    let first = store
        .record_response(NotifyResponse::new(&a, json!("first"), false, TTL))
        .await
        .unwrap();
    let second = store
        .record_response(NotifyResponse::new(&a, json!("second"), true, TTL))
        .await
        .unwrap();

    assert_eq!(first, RecordOutcome::Recorded);
    assert_eq!(second, RecordOutcome::AlreadyRecorded);
    let stored = store.get_response(&a).await.unwrap().unwrap();
    assert_eq!(stored.payload, json!("first"));
    assert!(!stored.is_error);
}

pub async fn test_get_responses_returns_present_only<S: CorrelationStore>(store: &S) {
    let (a, b, missing) = (cid("get_a"), cid("get_b"), cid("get_missing"));
    respond(store, &a, false, TTL).await;
    respond(store, &b, true, TTL).await;

    let mut found = store
        .get_responses(&[a.clone(), missing, b.clone()])
        .await
        .unwrap();
    found.sort_by(|x, y| x.correlation_id.cmp(&y.correlation_id));

    let mut expected = vec![a, b];
    expected.sort();
    let ids: Vec<String> = found.iter().map(|r| r.correlation_id.clone()).collect();
    assert_eq!(ids, expected);
    assert_eq!(found.iter().filter(|r| r.is_error).count(), 1);
}

// =============================================================================
// Queue rows
// =============================================================================

pub async fn test_delete_wait_queue_row_once<S: CorrelationStore>(store: &S) {
    let (a, b) = (cid("row_a"), cid("row_b"));
    let instance = create(store, &[&a, &b]).await;
    let row = store.find_wait_queue_rows(&a).await.unwrap().remove(0);

    assert!(store.delete_wait_queue_row(row.id).await.unwrap());
    assert!(!store.delete_wait_queue_row(row.id).await.unwrap());
    assert_eq!(store.remaining_count(instance.id).await.unwrap(), 1);
}

pub async fn test_fan_out_rows_per_instance<S: CorrelationStore>(store: &S) {
    let shared = cid("fan_out");
    let first = create(store, &[&shared]).await;
    let second = create(store, &[&shared]).await;

    let rows = store.find_wait_queue_rows(&shared).await.unwrap();
    let mut owners: Vec<Uuid> = rows.iter().map(|r| r.wait_instance_id).collect();
    owners.sort();
    let mut expected = vec![first.id, second.id];
    expected.sort();
    assert_eq!(owners, expected);
}

// =============================================================================
// Instance removal
// =============================================================================

pub async fn test_delete_wait_instance_keeps_responses<S: CorrelationStore>(store: &S) {
    let (a, b) = (cid("cancel_a"), cid("cancel_b"));
    respond(store, &a, false, TTL).await;
    let instance = create(store, &[&a, &b]).await;

    let removed = store.delete_wait_instance(instance.id).await.unwrap();
    assert_eq!(removed.map(|i| i.id), Some(instance.id));
    assert!(store.delete_wait_instance(instance.id).await.unwrap().is_none());

    assert!(store.find_wait_queue_rows(&a).await.unwrap().is_empty());
    assert!(store.find_wait_queue_rows(&b).await.unwrap().is_empty());
    assert!(store.get_response(&a).await.unwrap().is_some());
}

pub async fn test_claim_single_winner<S: CorrelationStore>(store: &S) {
    let a = cid("claim");
    respond(store, &a, false, TTL).await;
    let instance = create(store, &[&a]).await;

    let first = store
        .delete_wait_instance_and_responses(instance.id)
        .await
        .unwrap();
    let second = store
        .delete_wait_instance_and_responses(instance.id)
        .await
        .unwrap();

    assert_eq!(first.map(|i| i.id), Some(instance.id));
    assert!(second.is_none());
    assert!(store.get_wait_instance(instance.id).await.unwrap().is_none());
    assert!(store.find_wait_queue_rows(&a).await.unwrap().is_empty());
    assert!(
        store.get_response(&a).await.unwrap().is_none(),
        "unreferenced response should go with the claim"
    );
}

pub async fn test_concurrent_claims_have_one_winner<S: CorrelationStore>(store: &S) {
    let a = cid("race");
    respond(store, &a, false, TTL).await;
    let instance = create(store, &[&a]).await;

    let results = join_all(
        (0..10).map(|_| store.delete_wait_instance_and_responses(instance.id)),
    )
    .await;

    let winners = results
        .into_iter()
        .map(|r| r.unwrap())
        .filter(Option::is_some)
        .count();
    assert_eq!(winners, 1);
}

pub async fn test_claim_keeps_shared_responses<S: CorrelationStore>(store: &S) {
    let (shared, own) = (cid("shared"), cid("own"));
    respond(store, &shared, false, TTL).await;
    respond(store, &own, false, TTL).await;
    let first = create(store, &[&shared, &own]).await;
    let second = create(store, &[&shared]).await;

    store
        .delete_wait_instance_and_responses(first.id)
        .await
        .unwrap()
        .expect("claim should win");

    assert!(store.get_response(&own).await.unwrap().is_none());
    assert!(
        store.get_response(&shared).await.unwrap().is_some(),
        "response still awaited by another instance must survive"
    );
    assert_eq!(store.find_wait_queue_rows(&shared).await.unwrap().len(), 1);
    assert!(store.get_wait_instance(second.id).await.unwrap().is_some());
}

// =============================================================================
// Reconciler queries
// =============================================================================

pub async fn test_page_wait_queue_is_ordered<S: CorrelationStore>(store: &S) {
    let ids: Vec<String> = (0..5).map(|i| cid(&format!("page_{}", i))).collect();
    for id in &ids {
        create(store, &[id.as_str()]).await;
    }

    let rows = full_scan(store).await;
    let keys: Vec<_> = rows.iter().map(WaitQueue::order_key).collect();
    let mut sorted = keys.clone();
    sorted.sort();
    assert_eq!(keys, sorted, "pages should follow (created_at, id)");

    let own: Vec<&String> = rows
        .iter()
        .map(|r| &r.correlation_id)
        .filter(|c| ids.contains(c))
        .collect();
    assert_eq!(own.len(), ids.len());
}

pub async fn test_count_wait_queue_through<S: CorrelationStore>(store: &S) {
    let a = cid("count");
    create(store, &[&a]).await;

    let rows = full_scan(store).await;
    let position = rows
        .iter()
        .position(|r| r.correlation_id == a)
        .expect("row should be scanned");

    let count = store.count_wait_queue_through(&rows[position]).await.unwrap();
    assert_eq!(count, position + 1);
}

pub async fn test_find_stale_responses<S: CorrelationStore>(store: &S) {
    let (orphan, fresh, waited) = (cid("orphan"), cid("fresh"), cid("waited"));
    respond(store, &orphan, false, Duration::ZERO).await;
    respond(store, &fresh, false, TTL).await;
    respond(store, &waited, false, Duration::ZERO).await;
    create(store, &[&waited]).await;

    let later = Utc::now() + chrono::Duration::seconds(1);
    let stale = store.find_stale_responses(later, 10_000).await.unwrap();
    let ids: Vec<&str> = stale.iter().map(|r| r.correlation_id.as_str()).collect();

    assert!(ids.contains(&orphan.as_str()));
    assert!(!ids.contains(&fresh.as_str()));
    assert!(!ids.contains(&waited.as_str()), "referenced responses are not orphans");
}

pub async fn test_delete_response_if_unreferenced<S: CorrelationStore>(store: &S) {
    let (orphan, waited) = (cid("gc_orphan"), cid("gc_waited"));
    respond(store, &orphan, false, TTL).await;
    respond(store, &waited, false, TTL).await;
    let instance = create(store, &[&waited]).await;

    assert!(store.delete_response_if_unreferenced(&orphan).await.unwrap());
    assert!(!store.delete_response_if_unreferenced(&orphan).await.unwrap());
    assert!(!store.delete_response_if_unreferenced(&waited).await.unwrap());

    // An instance still lists the id after its row is gone.
    let row = store.find_wait_queue_rows(&waited).await.unwrap().remove(0);
    store.delete_wait_queue_row(row.id).await.unwrap();
    assert!(!store.delete_response_if_unreferenced(&waited).await.unwrap());

    store.delete_wait_instance(instance.id).await.unwrap();
    assert!(store.delete_response_if_unreferenced(&waited).await.unwrap());
}

pub async fn test_find_drained_wait_instances<S: CorrelationStore>(store: &S) {
    let (a, b) = (cid("drained"), cid("pending"));
    let drained = create(store, &[&a]).await;
    let pending = create(store, &[&b]).await;
    let row = store.find_wait_queue_rows(&a).await.unwrap().remove(0);
    store.delete_wait_queue_row(row.id).await.unwrap();

    let later = Utc::now() + chrono::Duration::seconds(1);
    let found = store.find_drained_wait_instances(later, 10_000).await.unwrap();
    let ids: Vec<Uuid> = found.iter().map(|i| i.id).collect();
    assert!(ids.contains(&drained.id));
    assert!(!ids.contains(&pending.id));

    let earlier = drained.created_at - chrono::Duration::seconds(1);
    let found = store.find_drained_wait_instances(earlier, 10_000).await.unwrap();
    assert!(!found.iter().any(|i| i.id == drained.id), "grace period respected");
}

// =============================================================================
// Progress
// =============================================================================

pub async fn test_progress_claimed_once<S: CorrelationStore>(store: &S) {
    let a = cid("progress");
    let update = ProgressUpdate::new(&a, json!({ "pct": 40 }));
    store.record_progress(update.clone()).await.unwrap();

    let batch = store.next_progress_batch(10_000).await.unwrap();
    let found = batch
        .iter()
        .find(|u| u.id == update.id)
        .expect("update should be pending");
    assert_eq!(found.payload, json!({ "pct": 40 }));

    assert!(store.delete_progress(update.id).await.unwrap());
    assert!(!store.delete_progress(update.id).await.unwrap());
}

/// Run all CorrelationStore tests against a store implementation.
#[macro_export]
macro_rules! run_correlation_store_tests {
    ($store:expr) => {
        use $crate::storage::correlation_store_tests::*;

        // wait instances
        test_create_and_get_wait_instance($store).await;
        println!("  test_create_and_get_wait_instance: PASSED");

        test_get_missing_wait_instance($store).await;
        println!("  test_get_missing_wait_instance: PASSED");

        test_create_duplicate_wait_instance($store).await;
        println!("  test_create_duplicate_wait_instance: PASSED");

        test_create_without_correlation_ids($store).await;
        println!("  test_create_without_correlation_ids: PASSED");

        // responses
        test_record_response_first_wins($store).await;
        println!("  test_record_response_first_wins: PASSED");

        test_get_responses_returns_present_only($store).await;
        println!("  test_get_responses_returns_present_only: PASSED");

        // queue rows
        test_delete_wait_queue_row_once($store).await;
        println!("  test_delete_wait_queue_row_once: PASSED");

        test_fan_out_rows_per_instance($store).await;
        println!("  test_fan_out_rows_per_instance: PASSED");

        // instance removal
        test_delete_wait_instance_keeps_responses($store).await;
        println!("  test_delete_wait_instance_keeps_responses: PASSED");

        test_claim_single_winner($store).await;
        println!("  test_claim_single_winner: PASSED");

        test_concurrent_claims_have_one_winner($store).await;
        println!("  test_concurrent_claims_have_one_winner: PASSED");

        test_claim_keeps_shared_responses($store).await;
        println!("  test_claim_keeps_shared_responses: PASSED");

        // reconciler queries
        test_page_wait_queue_is_ordered($store).await;
        println!("  test_page_wait_queue_is_ordered: PASSED");

        test_count_wait_queue_through($store).await;
        println!("  test_count_wait_queue_through: PASSED");

        test_find_stale_responses($store).await;
        println!("  test_find_stale_responses: PASSED");

        test_delete_response_if_unreferenced($store).await;
        println!("  test_delete_response_if_unreferenced: PASSED");

        test_find_drained_wait_instances($store).await;
        println!("  test_find_drained_wait_instances: PASSED");

        // progress
        test_progress_claimed_once($store).await;
        println!("  test_progress_claimed_once: PASSED");
    };
}
