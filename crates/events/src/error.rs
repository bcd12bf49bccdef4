//! Error types for the events crate.

use thiserror::Error;

/// Result type alias for event operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Event reliability error types.
#[derive(Debug, Error)]
pub enum Error {
    /// Component used before `initialize()`.
    #[error("{component} not initialized: call initialize() first")]
    NotInitialized { component: &'static str },

    /// Queue is at capacity; caller must shed load or wait.
    #[error("queue full: capacity {capacity} reached")]
    QueueFull { capacity: usize },

    /// Event not found where a result is required.
    #[error("event '{event_id}' not found")]
    EventNotFound { event_id: String },

    /// Payload serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Payload compression or decompression failed.
    #[error("compression error: {0}")]
    Compression(#[from] std::io::Error),

    /// Storage backend operation failed.
    #[error("storage backend error: {reason}")]
    Backend { reason: String },

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a not-initialized error for a component.
    pub fn not_initialized(component: &'static str) -> Self {
        Self::NotInitialized { component }
    }

    /// Create a storage backend error.
    pub fn backend(reason: impl Into<String>) -> Self {
        Self::Backend {
            reason: reason.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal(reason.into())
    }
}
