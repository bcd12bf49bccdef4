//! Event reliability: buffering, retries, and durable lifecycle tracking.
//!
//! This crate keeps events from disappearing when downstream processing
//! fails. Key features:
//!
//! - **Message queue**: Bounded FIFO buffering with optional persistence
//! - **Retry manager**: Exponential backoff with jitter, error
//!   classification, and per-source circuit breakers
//! - **Event store**: Status lifecycle records with secondary indexes,
//!   batched flush, and retention cleanup
//!
//! # Example
//!
//! ```ignore
//! use relay_events::{
//!     Event, EventStore, RetryConfig, RetryExecutor, RetryManager, StoreConfig,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = Arc::new(EventStore::new(StoreConfig::default()));
//!     store.initialize().await.unwrap();
//!
//!     let executor: Arc<dyn RetryExecutor> = Arc::new(MyExecutor);
//!     let retries = Arc::new(
//!         RetryManager::new(RetryConfig::default(), executor)
//!             .with_status_sink(store.clone()),
//!     );
//!     retries.start_retry_loop().await;
//!
//!     let event = Event::new("wsl2", "deployment", serde_json::json!({"ok": true}));
//!     let id = store.store_event(event.clone()).await.unwrap();
//!     println!("stored {id}");
//! }
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![forbid(clippy::panic)]

pub mod breaker;
pub mod classify;
pub mod error;
pub mod queue;
pub mod retry;
pub mod store;
pub mod types;

// Re-export main types
pub use breaker::{CircuitBreaker, CircuitBreakerSnapshot, CircuitState};
pub use classify::is_retryable;
pub use error::{Error, Result};
pub use queue::{MessageQueue, QueueConfig, QueuePersistence, QueueStats};
pub use retry::{
    EventStatusSink, RetryAttempt, RetryConfig, RetryExecutor, RetryHealth, RetryManager,
    RetryMetrics, RetryOptions, RetryState, RetryStatus,
};
pub use store::{
    EventQuery, EventStore, PageOptions, StorageBackend, StoreConfig, StoreHealth, StoreMetrics,
};
pub use types::{
    generate_event_id, ErrorInfo, ErrorRecord, ErrorRecordId, Event, EventRecord, EventStatus,
    HealthState, Message, Metadata, RetryId,
};
