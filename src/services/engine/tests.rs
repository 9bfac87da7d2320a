use super::*;
use crate::bus::MockEventChannel;
use crate::storage::MockCorrelationStore;
use serde_json::json;

fn engine_with(
    store: Arc<MockCorrelationStore>,
    channel: Arc<MockEventChannel>,
) -> WaitNotifyEngine {
    WaitNotifyEngine::new(store, channel, EngineConfig::default())
}

fn setup() -> (WaitNotifyEngine, Arc<MockCorrelationStore>, Arc<MockEventChannel>) {
    let store = Arc::new(MockCorrelationStore::new());
    let channel = Arc::new(MockEventChannel::new());
    (engine_with(store.clone(), channel.clone()), store, channel)
}

#[tokio::test]
async fn test_wait_for_all_creates_instance_and_rows() {
    let (engine, store, _) = setup();

    let id = engine
        .wait_for_all("pipeline", ["a", "b", "a"])
        .await
        .unwrap();

    let instance = store.get_wait_instance(id).await.unwrap().unwrap();
    assert_eq!(instance.publisher, "pipeline");
    assert_eq!(instance.correlation_ids, vec!["a", "b"]);
    assert_eq!(store.remaining_count(id).await.unwrap(), 2);
}

#[tokio::test]
async fn test_wait_for_all_rejects_empty_ids() {
    let (engine, store, _) = setup();

    let result = engine.wait_for_all("pipeline", Vec::<String>::new()).await;

    assert!(matches!(result, Err(EngineError::NoCorrelationIds)));
    assert_eq!(store.wait_instance_count().await, 0);
}

#[tokio::test]
async fn test_wait_for_all_rejects_empty_publisher() {
    let (engine, _, _) = setup();
    let result = engine.wait_for_all("", ["a"]).await;
    assert!(matches!(result, Err(EngineError::EmptyPublisher)));
}

#[tokio::test]
async fn test_wait_for_all_rejects_empty_correlation_id() {
    let (engine, _, _) = setup();
    let result = engine.wait_for_all("pipeline", ["a", ""]).await;
    assert!(matches!(result, Err(EngineError::EmptyCorrelationId)));
}

#[tokio::test]
async fn test_partial_registration_is_compensated() {
    let (engine, store, _) = setup();
    store.set_fail_after_queue_rows(Some(2)).await;

    let result = engine.wait_for_all("pipeline", ["a", "b", "c"]).await;

    assert!(matches!(result, Err(EngineError::Storage(_))));
    assert_eq!(store.wait_instance_count().await, 0);
    assert_eq!(store.wait_queue_count().await, 0);
}

#[tokio::test]
async fn test_compensation_keeps_early_responses() {
    let (engine, store, _) = setup();
    engine.notify("a", json!(7)).await.unwrap();
    store.set_fail_after_queue_rows(Some(1)).await;

    assert!(engine.wait_for_all("pipeline", ["a", "b"]).await.is_err());

    assert!(store.get_response("a").await.unwrap().is_some());
}

#[tokio::test]
async fn test_notify_records_then_publishes() {
    let (engine, store, channel) = setup();

    let response_id = engine.notify("a", json!({"value": 42})).await.unwrap();

    assert_eq!(response_id, "a");
    let response = store.get_response("a").await.unwrap().unwrap();
    assert_eq!(response.payload, json!({"value": 42}));
    assert!(!response.is_error);
    assert_eq!(channel.published_ids().await, vec!["a"]);
}

#[tokio::test]
async fn test_notify_error_marks_response() {
    let (engine, store, _) = setup();

    engine.notify_error("a", json!("boom")).await.unwrap();

    assert!(store.get_response("a").await.unwrap().unwrap().is_error);
}

#[tokio::test]
async fn test_duplicate_notify_keeps_first_payload_and_republishes() {
    let (engine, store, channel) = setup();

    engine.notify("a", json!(1)).await.unwrap();
    engine.notify("a", json!(2)).await.unwrap();

    let response = store.get_response("a").await.unwrap().unwrap();
    assert_eq!(response.payload, json!(1));
    assert_eq!(channel.published_ids().await, vec!["a", "a"]);
}

#[tokio::test]
async fn test_notify_succeeds_when_publish_fails() {
    let (engine, store, channel) = setup();
    channel.set_fail_on_publish(true).await;

    let result = engine.notify("a", json!(1)).await;

    assert!(result.is_ok());
    assert!(store.get_response("a").await.unwrap().is_some());
    assert_eq!(channel.published_count().await, 0);
}

#[tokio::test]
async fn test_notify_store_failure_does_not_publish() {
    let (engine, store, channel) = setup();
    store.set_fail_on_write(true).await;

    let result = engine.notify("a", json!(1)).await;

    assert!(matches!(result, Err(EngineError::Storage(_))));
    assert_eq!(channel.published_count().await, 0);
}

#[tokio::test]
async fn test_cancel_removes_wait_once() {
    let (engine, store, _) = setup();
    let id = engine.wait_for_all("pipeline", ["a", "b"]).await.unwrap();

    assert!(engine.cancel(id).await.unwrap());
    assert!(!engine.cancel(id).await.unwrap());
    assert_eq!(store.wait_instance_count().await, 0);
    assert_eq!(store.wait_queue_count().await, 0);
}

#[tokio::test]
async fn test_progress_on_records_update() {
    let (engine, store, _) = setup();

    engine.progress_on("a", json!("50%")).await.unwrap();

    assert_eq!(store.progress_count().await, 1);
    assert!(matches!(
        engine.progress_on("", json!(1)).await,
        Err(EngineError::EmptyCorrelationId)
    ));
}
