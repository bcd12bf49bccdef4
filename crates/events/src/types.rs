//! Core types for the events crate.

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

/// Free-form string-keyed metadata attached to events and messages.
pub type Metadata = serde_json::Map<String, Value>;

/// Unique identifier for a retry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RetryId(Ulid);

impl RetryId {
    /// Create a new random retry ID.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Create from a ULID.
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Get the inner ULID.
    pub fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl Default for RetryId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RetryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for an error record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ErrorRecordId(Ulid);

impl ErrorRecordId {
    /// Create a new random error record ID.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Create from a ULID.
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Get the inner ULID.
    pub fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl Default for ErrorRecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ErrorRecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Generate an event/message id in the platform's `msg_<time>_<rand>` format.
pub fn generate_event_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!(
        "msg_{}_{}",
        Utc::now().timestamp_millis(),
        suffix.to_lowercase()
    )
}

/// Lifecycle status of a stored event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    /// Recorded, not yet picked up by a consumer.
    Received,
    /// A consumer is working on it.
    Processing,
    /// Terminal: processed successfully.
    Succeeded,
    /// Terminal: failed permanently.
    Failed,
    /// Scheduled for another attempt.
    Retrying,
}

impl EventStatus {
    /// Lowercase string form, as used in index keys and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Processing => "processing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
        }
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event as produced by the surrounding orchestration process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Caller-supplied or generated `msg_<time>_<rand>` id.
    pub id: String,
    /// Logical origin, e.g. "agentapi" | "claude_code" | "wsl2".
    pub source: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Metadata>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Metadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing: Option<Metadata>,
}

impl Event {
    /// Create a new event with a generated id and the current timestamp.
    pub fn new(
        source: impl Into<String>,
        event_type: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            id: generate_event_id(),
            source: source.into(),
            event_type: event_type.into(),
            payload,
            headers: None,
            timestamp: Utc::now(),
            metadata: None,
            context: None,
            routing: None,
        }
    }

    /// Replace the generated id with a caller-supplied one.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Attach metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Override the timestamp (defaults to creation time).
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// A stored event as read back from the event store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    #[serde(flatten)]
    pub event: Event,
    pub status: EventStatus,
    pub stored_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub compressed: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// The error shape reported on failures: used both for classification
/// and as the `error` field of an [`ErrorRecord`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorInfo {
    /// Create an error with just a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            name: None,
            code: None,
            stack: None,
        }
    }

    /// Set the error name, e.g. "TimeoutError".
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the error code, e.g. "TIMEOUT_ERROR".
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Set the captured stack trace.
    #[must_use]
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// One recorded failure of an event. One-to-many from event to records.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub id: ErrorRecordId,
    pub event_id: String,
    pub error: ErrorInfo,
    pub timestamp: DateTime<Utc>,
}

/// An element of the message queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub payload: Value,
    pub enqueued_at: DateTime<Utc>,
}

impl Message {
    /// Create a message with a generated id.
    pub fn new(payload: Value) -> Self {
        Self {
            id: generate_event_id(),
            payload,
            enqueued_at: Utc::now(),
        }
    }

    /// Replace the generated id with a caller-supplied one.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

/// Component health, as reported by `get_health()` on each component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => f.write_str("healthy"),
            Self::Degraded => f.write_str("degraded"),
            Self::Unhealthy => f.write_str("unhealthy"),
        }
    }
}
