use super::*;
use crate::bus::MockEventChannel;
use crate::model::{NotifyResponse, ResponseMap, WaitInstance};
use crate::registry::{CallbackError, CallbackRegistry, NotifyCallback};
use crate::storage::MockCorrelationStore;
use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};

const TTL: Duration = Duration::from_secs(300);

#[derive(Default)]
struct CountingCallback {
    notified: AtomicUsize,
}

#[async_trait]
impl NotifyCallback for CountingCallback {
    async fn notify(&self, _: &WaitInstance, _: ResponseMap) -> std::result::Result<(), CallbackError> {
        self.notified.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn notify_error(
        &self,
        _: &WaitInstance,
        _: ResponseMap,
    ) -> std::result::Result<(), CallbackError> {
        Ok(())
    }
}

struct Fixture {
    store: Arc<MockCorrelationStore>,
    channel: Arc<MockEventChannel>,
    callback: Arc<CountingCallback>,
    reconciler: Reconciler,
}

fn fixture(config: ReconcilerConfig) -> Fixture {
    let store = Arc::new(MockCorrelationStore::new());
    let channel = Arc::new(MockEventChannel::new());
    let callback = Arc::new(CountingCallback::default());
    let registry = CallbackRegistry::builder()
        .register("pipeline", callback.clone())
        .unwrap()
        .build();
    let consumer = NotifyEventConsumer::new(store.clone(), registry);
    let reconciler = Reconciler::new(store.clone(), channel.clone(), consumer, config);
    Fixture {
        store,
        channel,
        callback,
        reconciler,
    }
}

fn fast_config() -> ReconcilerConfig {
    ReconcilerConfig {
        interval_secs: 1,
        page_size: 3,
        drained_grace_secs: 0,
        max_initial_delay_secs: 0,
        ..ReconcilerConfig::default()
    }
}

async fn register(store: &MockCorrelationStore, ids: &[&str]) -> WaitInstance {
    let instance = WaitInstance::new("pipeline", ids.iter().copied());
    store.create_wait_instance(&instance).await.unwrap();
    instance
}

async fn respond(store: &MockCorrelationStore, id: &str, ttl: Duration) {
    store
        .record_response(NotifyResponse::new(id, json!(id), false, ttl))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_republishes_ids_with_responses() {
    let f = fixture(fast_config());
    respond(&f.store, "a", TTL).await;
    register(&f.store, &["a", "b"]).await;

    let report = f.reconciler.run_once().await;

    assert_eq!(report.scanned, 2);
    assert_eq!(report.republished, 1);
    assert_eq!(f.channel.published_ids().await, vec!["a"]);
}

#[tokio::test]
async fn test_republishes_each_id_once_per_pass() {
    let f = fixture(fast_config());
    respond(&f.store, "shared", TTL).await;
    register(&f.store, &["shared"]).await;
    register(&f.store, &["shared", "x"]).await;

    let report = f.reconciler.run_once().await;

    assert_eq!(report.republished, 1);
    assert_eq!(f.channel.published_ids().await, vec!["shared"]);
}

#[tokio::test]
async fn test_scan_covers_every_page() {
    let f = fixture(fast_config());
    let mut expected = Vec::new();
    for i in 0..10 {
        let id = format!("id-{}", i);
        respond(&f.store, &id, TTL).await;
        register(&f.store, &[id.as_str()]).await;
        expected.push(id);
    }

    let report = f.reconciler.run_once().await;

    assert_eq!(report.scanned, 10);
    let mut published = f.channel.published_ids().await;
    published.sort();
    expected.sort();
    assert_eq!(published, expected);
}

#[tokio::test]
async fn test_nothing_to_republish_without_responses() {
    let f = fixture(fast_config());
    register(&f.store, &["a", "b"]).await;

    let report = f.reconciler.run_once().await;

    assert_eq!(report.republished, 0);
    assert_eq!(f.channel.published_count().await, 0);
}

#[tokio::test]
async fn test_orphan_sweep_respects_ttl_and_references() {
    let f = fixture(fast_config());
    respond(&f.store, "expired", Duration::ZERO).await;
    respond(&f.store, "fresh", TTL).await;
    respond(&f.store, "waited", Duration::ZERO).await;
    register(&f.store, &["waited", "pending"]).await;

    let later = Utc::now() + chrono::Duration::seconds(1);
    let deleted = f.reconciler.sweep_orphans(later).await.unwrap();

    assert_eq!(deleted, 1);
    assert!(f.store.get_response("expired").await.unwrap().is_none());
    assert!(f.store.get_response("fresh").await.unwrap().is_some());
    assert!(f.store.get_response("waited").await.unwrap().is_some());
}

#[tokio::test]
async fn test_drained_instance_is_completed() {
    let f = fixture(fast_config());
    let instance = register(&f.store, &["a"]).await;
    respond(&f.store, "a", TTL).await;
    // A consumer removed the last row and stopped before completing.
    let row = f.store.find_wait_queue_rows("a").await.unwrap().remove(0);
    f.store.delete_wait_queue_row(row.id).await.unwrap();

    let report = f.reconciler.run_once().await;

    assert_eq!(report.drained_completed, 1);
    assert_eq!(f.callback.notified.load(Ordering::SeqCst), 1);
    assert!(f.store.get_wait_instance(instance.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_drained_grace_period_defers_completion() {
    let f = fixture(ReconcilerConfig {
        drained_grace_secs: 3600,
        ..fast_config()
    });
    register(&f.store, &["a"]).await;
    let row = f.store.find_wait_queue_rows("a").await.unwrap().remove(0);
    f.store.delete_wait_queue_row(row.id).await.unwrap();

    let report = f.reconciler.run_once().await;

    assert_eq!(report.drained_completed, 0);
    assert_eq!(f.store.wait_instance_count().await, 1);
}

#[tokio::test]
async fn test_store_failures_are_reported_not_raised() {
    let f = fixture(fast_config());
    f.store.set_fail_on_read(true).await;

    let report = f.reconciler.run_once().await;

    assert_eq!(report.failed_sweeps, 3);
}

#[tokio::test]
async fn test_publish_failure_is_retried_next_pass() {
    let f = fixture(fast_config());
    respond(&f.store, "a", TTL).await;
    register(&f.store, &["a"]).await;
    f.channel.set_fail_on_publish(true).await;

    let report = f.reconciler.run_once().await;
    assert_eq!(report.republished, 0);
    assert_eq!(report.failed_sweeps, 0);

    f.channel.set_fail_on_publish(false).await;
    let report = f.reconciler.run_once().await;
    assert_eq!(report.republished, 1);
}

#[tokio::test]
async fn test_spawn_runs_and_stops() {
    let f = fixture(fast_config());
    respond(&f.store, "a", TTL).await;
    register(&f.store, &["a"]).await;
    let channel = f.channel.clone();

    let handle = f.reconciler.spawn();
    for _ in 0..100 {
        if channel.published_count().await > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(channel.published_count().await >= 1);
    tokio::time::timeout(Duration::from_secs(1), handle.shutdown())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_drained_sweep_removes_partial_registration_without_firing() {
    let f = fixture(fast_config());
    f.store.set_fail_after_queue_rows(Some(1)).await;
    let instance = WaitInstance::new("pipeline", ["a", "b"]);
    assert!(f.store.create_wait_instance(&instance).await.is_err());
    f.store.set_fail_after_queue_rows(None).await;
    respond(&f.store, "a", TTL).await;
    let row = f.store.find_wait_queue_rows("a").await.unwrap().remove(0);
    f.store.delete_wait_queue_row(row.id).await.unwrap();

    let report = f.reconciler.run_once().await;

    assert_eq!(report.phantoms_removed, 1);
    assert_eq!(report.drained_completed, 0);
    assert_eq!(f.callback.notified.load(Ordering::SeqCst), 0);
    assert!(f.store.get_wait_instance(instance.id).await.unwrap().is_none());
    assert!(f.store.get_response("a").await.unwrap().is_some());
}

/// Resolves each republished id's rows as soon as it is published, so the
/// queue shrinks behind the scan cursor.
struct ResolvingChannel {
    store: Arc<MockCorrelationStore>,
    published: tokio::sync::Mutex<Vec<String>>,
}

#[async_trait]
impl EventChannel for ResolvingChannel {
    async fn publish(&self, event: NotifyEvent) -> crate::bus::Result<()> {
        for row in self
            .store
            .find_wait_queue_rows(&event.correlation_id)
            .await
            .unwrap()
        {
            self.store.delete_wait_queue_row(row.id).await.unwrap();
        }
        self.published.lock().await.push(event.correlation_id);
        Ok(())
    }

    async fn subscribe(
        &self,
        _handler: Arc<dyn crate::bus::NotifyEventHandler>,
    ) -> crate::bus::Result<()> {
        Err(crate::bus::BusError::SubscribeNotSupported)
    }
}

#[tokio::test]
async fn test_scan_visits_every_row_while_queue_shrinks() {
    let store = Arc::new(MockCorrelationStore::new());
    let channel = Arc::new(ResolvingChannel {
        store: store.clone(),
        published: tokio::sync::Mutex::new(Vec::new()),
    });
    let consumer = NotifyEventConsumer::new(store.clone(), CallbackRegistry::default());
    let reconciler = Reconciler::new(store.clone(), channel.clone(), consumer, fast_config());

    let mut expected = Vec::new();
    for i in 0..30 {
        let id = format!("id-{:02}", i);
        register(&store, &[id.as_str()]).await;
        // Every third id is still waiting on its result and must stay put.
        if i % 3 != 0 {
            respond(&store, &id, TTL).await;
            expected.push(id);
        }
    }

    let (scanned, republished) =
        tokio::time::timeout(Duration::from_secs(5), reconciler.sweep_missed_events())
            .await
            .expect("scan should terminate")
            .unwrap();

    let mut published = channel.published.lock().await.clone();
    published.sort();
    assert_eq!(published, expected, "each resolvable row republished exactly once");
    assert_eq!(republished, expected.len());
    assert_eq!(scanned, 30);
    assert_eq!(store.wait_queue_count().await, 10);
}
