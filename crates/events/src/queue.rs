//! Bounded FIFO message queue with backpressure and optional persistence.
//!
//! The queue is a pure buffering primitive: no retry or event knowledge,
//! strict FIFO order, and a hard capacity that surfaces as
//! [`Error::QueueFull`] when reached. An empty queue is a normal state,
//! not an error; `dequeue` and `peek` return `None` for it.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::{generate_event_id, Message};

/// Default queue capacity.
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 10_000;

/// Message queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum number of buffered messages before `enqueue` rejects.
    pub max_queue_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
        }
    }
}

impl QueueConfig {
    /// Set the queue capacity.
    #[must_use]
    pub fn with_max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }
}

/// Durable storage hook for queued messages.
///
/// When supplied, messages are written through on `enqueue`, removed on
/// `dequeue`, reloaded on `initialize`, and the remainder is saved on
/// `shutdown`.
#[async_trait]
pub trait QueuePersistence: Send + Sync {
    /// Durably record a message.
    async fn save(&self, message: &Message) -> Result<()>;

    /// Remove the persisted copy of a message.
    async fn remove(&self, message_id: &str) -> Result<()>;

    /// Load all persisted messages, in original enqueue order.
    async fn load(&self) -> Result<Vec<Message>>;

    /// Drop all persisted messages.
    async fn clear(&self) -> Result<()>;
}

#[derive(Debug, Default)]
struct QueueState {
    messages: VecDeque<Message>,
    initialized: bool,
    total_enqueued: u64,
    total_dequeued: u64,
}

impl QueueState {
    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(Error::not_initialized("MessageQueue"))
        }
    }
}

/// Counters and current size, for monitoring.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub size: usize,
    pub total_enqueued: u64,
    pub total_dequeued: u64,
    pub max_queue_size: usize,
}

/// Bounded FIFO buffer of inbound messages awaiting processing.
pub struct MessageQueue {
    config: QueueConfig,
    state: Mutex<QueueState>,
    persistence: Option<Arc<dyn QueuePersistence>>,
}

impl MessageQueue {
    /// Create a queue with the given configuration and no persistence.
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            state: Mutex::new(QueueState::default()),
            persistence: None,
        }
    }

    /// Create a queue that writes through to the given persistence backend.
    pub fn with_persistence(config: QueueConfig, persistence: Arc<dyn QueuePersistence>) -> Self {
        Self {
            config,
            state: Mutex::new(QueueState::default()),
            persistence: Some(persistence),
        }
    }

    /// Mark the queue ready, restoring persisted messages when enabled.
    ///
    /// Must be called before any other operation.
    pub async fn initialize(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(persistence) = &self.persistence {
            let restored = persistence.load().await?;
            if !restored.is_empty() {
                debug!(count = restored.len(), "restored persisted messages");
                state.messages.extend(restored);
            }
        }
        state.initialized = true;
        Ok(())
    }

    /// Append a message to the tail.
    ///
    /// Assigns an id if the caller left it empty. Returns the message id.
    pub async fn enqueue(&self, mut message: Message) -> Result<String> {
        let mut state = self.state.lock().await;
        state.ensure_initialized()?;

        if state.messages.len() >= self.config.max_queue_size {
            return Err(Error::QueueFull {
                capacity: self.config.max_queue_size,
            });
        }

        if message.id.is_empty() {
            message.id = generate_event_id();
        }

        // Durably record before returning, so a crash after enqueue
        // cannot lose an acknowledged message.
        if let Some(persistence) = &self.persistence {
            persistence.save(&message).await?;
        }

        let id = message.id.clone();
        state.messages.push_back(message);
        state.total_enqueued = state.total_enqueued.saturating_add(1);
        debug!(message_id = %id, size = state.messages.len(), "message enqueued");
        Ok(id)
    }

    /// Remove and return the head, or `None` when empty.
    pub async fn dequeue(&self) -> Result<Option<Message>> {
        let mut state = self.state.lock().await;
        state.ensure_initialized()?;

        let Some(message) = state.messages.pop_front() else {
            return Ok(None);
        };
        state.total_dequeued = state.total_dequeued.saturating_add(1);

        if let Some(persistence) = &self.persistence {
            persistence.remove(&message.id).await?;
        }

        debug!(message_id = %message.id, size = state.messages.len(), "message dequeued");
        Ok(Some(message))
    }

    /// Read the head without removing it.
    pub async fn peek(&self) -> Result<Option<Message>> {
        let state = self.state.lock().await;
        state.ensure_initialized()?;
        Ok(state.messages.front().cloned())
    }

    /// Current number of buffered messages.
    pub async fn size(&self) -> Result<usize> {
        let state = self.state.lock().await;
        state.ensure_initialized()?;
        Ok(state.messages.len())
    }

    /// Whether the queue is empty.
    pub async fn is_empty(&self) -> Result<bool> {
        let state = self.state.lock().await;
        state.ensure_initialized()?;
        Ok(state.messages.is_empty())
    }

    /// Drop all buffered messages and any persisted copies.
    pub async fn clear(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ensure_initialized()?;
        state.messages.clear();
        if let Some(persistence) = &self.persistence {
            persistence.clear().await?;
        }
        Ok(())
    }

    /// Mark not-ready, persisting any remaining messages first.
    pub async fn shutdown(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.initialized {
            return Ok(());
        }
        if let Some(persistence) = &self.persistence {
            for message in &state.messages {
                persistence.save(message).await?;
            }
            if !state.messages.is_empty() {
                debug!(
                    count = state.messages.len(),
                    "persisted remaining messages on shutdown"
                );
            }
        }
        state.messages.clear();
        state.initialized = false;
        Ok(())
    }

    /// Counters and current size.
    pub async fn stats(&self) -> QueueStats {
        let state = self.state.lock().await;
        QueueStats {
            size: state.messages.len(),
            total_enqueued: state.total_enqueued,
            total_dequeued: state.total_dequeued,
            max_queue_size: self.config.max_queue_size,
        }
    }
}
