//! End-to-end reliability flow: store an event, fail it, drive retries
//! through the scheduler, and observe the lifecycle in the event store.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use relay_events::{
    ErrorInfo, Event, EventStatus, EventStore, Message, MessageQueue, QueueConfig, RetryConfig,
    RetryExecutor, RetryManager, RetryOptions, RetryState, StoreConfig,
};

/// Executor that fails a fixed number of times and then succeeds.
struct FlakyExecutor {
    failures: u32,
    attempts: AtomicU32,
}

impl FlakyExecutor {
    fn new(failures: u32) -> Self {
        Self {
            failures,
            attempts: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl RetryExecutor for FlakyExecutor {
    async fn execute(&self, _event: &Event, _retry_count: u32) -> Result<(), ErrorInfo> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.failures {
            Err(ErrorInfo::new("connection timed out").with_code("TIMEOUT_ERROR"))
        } else {
            Ok(())
        }
    }
}

#[tokio::test(start_paused = true)]
async fn failed_event_recovers_through_retries() {
    let store = Arc::new(EventStore::new(StoreConfig::default()));
    store.initialize().await.unwrap();

    let executor = Arc::new(FlakyExecutor::new(2));
    let manager = Arc::new(
        RetryManager::new(RetryConfig::default(), executor.clone())
            .with_status_sink(store.clone()),
    );
    manager.initialize().await.unwrap();
    manager.start_retry_loop().await;

    // Inbound messages buffer in the queue before a consumer records them
    let queue = MessageQueue::new(QueueConfig::default());
    queue.initialize().await.unwrap();
    queue
        .enqueue(Message::new(json!({"service": "api"})).with_id("e1"))
        .await
        .unwrap();

    let message = queue.dequeue().await.unwrap().unwrap();
    assert!(queue.is_empty().await.unwrap());

    let event = Event::new("wsl2", "deployment", message.payload).with_id(message.id);
    store.store_event(event.clone()).await.unwrap();
    assert_eq!(
        store.get_event_status("e1").await.unwrap(),
        Some(EventStatus::Received)
    );

    // First processing attempt fails downstream
    let error = ErrorInfo::new("connection timed out").with_code("TIMEOUT_ERROR");
    let retry_id = manager
        .queue_for_retry(event.clone(), error, RetryOptions::default())
        .await
        .unwrap();
    assert!(retry_id.is_some());
    assert_eq!(
        store.get_event_status("e1").await.unwrap(),
        Some(EventStatus::Retrying)
    );

    // Backoff is 1s, then 2s, then 4s; give the scheduler room for each
    // attempt plus its tick.
    tokio::time::sleep(Duration::from_secs(20)).await;

    assert_eq!(executor.attempts.load(Ordering::SeqCst), 3);
    assert_eq!(
        store.get_event_status("e1").await.unwrap(),
        Some(EventStatus::Succeeded)
    );
    assert!(!manager.is_circuit_breaker_open("wsl2").await);

    let history = manager.get_retry_history("e1").await;
    assert_eq!(history.len(), 3);
    assert_eq!(history[2].outcome, Some(RetryState::Succeeded));

    let metrics = manager.get_metrics().await;
    assert_eq!(metrics.retries_succeeded, 1);
    assert_eq!(metrics.retries_failed, 0);
    assert_eq!(metrics.queue_size, 0);

    manager.shutdown().await;
    store.shutdown().await;
    queue.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn non_retryable_error_fails_immediately() {
    let store = Arc::new(EventStore::new(StoreConfig::default()));
    store.initialize().await.unwrap();

    let executor = Arc::new(FlakyExecutor::new(0));
    let manager = Arc::new(
        RetryManager::new(RetryConfig::default(), executor.clone())
            .with_status_sink(store.clone()),
    );
    manager.start_retry_loop().await;

    let event = Event::new("agentapi", "session.update", json!({"bad": true})).with_id("e2");
    store.store_event(event.clone()).await.unwrap();

    let error = ErrorInfo::new("payload failed validation").with_code("VALIDATION_ERROR");
    let retry_id = manager
        .queue_for_retry(event, error, RetryOptions::default())
        .await
        .unwrap();
    assert!(retry_id.is_none());
    assert!(manager.get_retry_history("e2").await.is_empty());

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(executor.attempts.load(Ordering::SeqCst), 0);
    assert_eq!(
        store.get_event_status("e2").await.unwrap(),
        Some(EventStatus::Received)
    );

    manager.shutdown().await;
    store.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_mark_event_failed_in_store() {
    let store = Arc::new(EventStore::new(StoreConfig::default()));
    store.initialize().await.unwrap();

    let executor = Arc::new(FlakyExecutor::new(u32::MAX));
    let manager = Arc::new(
        RetryManager::new(
            RetryConfig::default().with_max_retries(2),
            executor.clone(),
        )
        .with_status_sink(store.clone()),
    );
    manager.start_retry_loop().await;

    let event = Event::new("wsl2", "deployment", json!({"service": "api"})).with_id("e3");
    store.store_event(event.clone()).await.unwrap();

    let error = ErrorInfo::new("connection timed out").with_code("TIMEOUT_ERROR");
    manager
        .queue_for_retry(event, error, RetryOptions::default())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(20)).await;

    assert_eq!(executor.attempts.load(Ordering::SeqCst), 2);
    assert_eq!(
        store.get_event_status("e3").await.unwrap(),
        Some(EventStatus::Failed)
    );
    let errors = store.get_event_errors(Some("e3")).await.unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].error.message, "connection timed out");

    manager.shutdown().await;
    store.shutdown().await;
}
