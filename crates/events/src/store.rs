//! Event store: lifecycle records, secondary indexes, batched flush, and
//! retention cleanup.
//!
//! The in-memory maps are the source of truth for event status. Four
//! secondary indexes (source, type, status, hour bucket) are maintained on
//! every store/update/delete so the indexed accessors avoid full scans.
//! Mutations also append to a pending-write buffer that flushes to an
//! optional [`StorageBackend`] on a fixed interval or when it reaches the
//! batch size, keeping the hot write path decoupled from backend latency.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::retry::EventStatusSink;
use crate::types::{
    generate_event_id, ErrorInfo, ErrorRecord, ErrorRecordId, Event, EventRecord, EventStatus,
    HealthState, Metadata,
};

/// Event store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Soft capacity; health degrades at 90% of this.
    pub max_events: usize,
    /// Events older than this are eligible for cleanup.
    pub retention_days: i64,
    /// How often the retention cleanup runs.
    pub cleanup_interval: Duration,
    /// How often the pending-write buffer flushes.
    pub flush_interval: Duration,
    /// Buffer size that triggers an early flush.
    pub batch_size: usize,
    /// Compress payloads at rest.
    pub enable_compression: bool,
    /// Minimum serialized payload size worth compressing.
    pub compression_threshold: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_events: 100_000,
            retention_days: 30,
            cleanup_interval: Duration::from_secs(6 * 60 * 60),
            flush_interval: Duration::from_millis(5000),
            batch_size: 100,
            enable_compression: false,
            compression_threshold: 1024,
        }
    }
}

impl StoreConfig {
    /// Set the soft event capacity.
    #[must_use]
    pub fn with_max_events(mut self, max_events: usize) -> Self {
        self.max_events = max_events;
        self
    }

    /// Set the retention window in days.
    #[must_use]
    pub fn with_retention_days(mut self, retention_days: i64) -> Self {
        self.retention_days = retention_days;
        self
    }

    /// Set the flush interval.
    #[must_use]
    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    /// Set the flush batch size.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Enable payload compression at rest.
    #[must_use]
    pub fn with_compression(mut self) -> Self {
        self.enable_compression = true;
        self
    }
}

/// Durable backend contract. The in-memory maps act as a write-through
/// cache in front of an implementation; without one, flushed writes are
/// simply discarded.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn put(&self, key: &str, value: Value) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<Value>>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn query(&self, prefix: &str) -> Result<Vec<Value>>;
}

/// A buffered mutation awaiting flush.
#[derive(Debug, Clone)]
enum PendingWrite {
    Put { key: String, value: Value },
    Delete { key: String },
}

/// Payload at rest, possibly compressed.
#[derive(Debug, Clone)]
enum StoredPayload {
    Plain(Value),
    Compressed(Vec<u8>),
}

/// Internal representation of a stored event.
#[derive(Debug, Clone)]
struct StoredEvent {
    event: Event,
    payload: StoredPayload,
    status: EventStatus,
    stored_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl StoredEvent {
    /// Record destined for the backend: the payload is written plain, so
    /// the `compressed` flag is cleared to match it.
    fn to_flush_record(&self) -> Result<EventRecord> {
        let mut record = self.to_record()?;
        record.compressed = false;
        Ok(record)
    }

    fn to_record(&self) -> Result<EventRecord> {
        let (payload, compressed) = match &self.payload {
            StoredPayload::Plain(value) => (value.clone(), false),
            StoredPayload::Compressed(bytes) => {
                let raw = zstd::decode_all(bytes.as_slice())?;
                (serde_json::from_slice(&raw)?, true)
            }
        };
        let mut event = self.event.clone();
        event.payload = payload;
        Ok(EventRecord {
            event,
            status: self.status,
            stored_at: self.stored_at,
            updated_at: self.updated_at,
            compressed,
        })
    }
}

/// Hour-truncated timestamp key for the time index.
fn hour_key(timestamp: &DateTime<Utc>) -> String {
    timestamp.format("%Y-%m-%dT%H").to_string()
}

#[derive(Debug, Default)]
struct EventIndexes {
    by_source: HashMap<String, HashSet<String>>,
    by_type: HashMap<String, HashSet<String>>,
    by_status: HashMap<EventStatus, HashSet<String>>,
    by_hour: HashMap<String, HashSet<String>>,
}

impl EventIndexes {
    fn insert(&mut self, stored: &StoredEvent) {
        let id = stored.event.id.clone();
        self.by_source
            .entry(stored.event.source.clone())
            .or_default()
            .insert(id.clone());
        self.by_type
            .entry(stored.event.event_type.clone())
            .or_default()
            .insert(id.clone());
        self.by_status
            .entry(stored.status)
            .or_default()
            .insert(id.clone());
        self.by_hour
            .entry(hour_key(&stored.event.timestamp))
            .or_default()
            .insert(id);
    }

    fn remove(&mut self, stored: &StoredEvent) {
        let id = &stored.event.id;
        Self::drop_from(&mut self.by_source, &stored.event.source, id);
        Self::drop_from(&mut self.by_type, &stored.event.event_type, id);
        if let Some(ids) = self.by_status.get_mut(&stored.status) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_status.remove(&stored.status);
            }
        }
        Self::drop_from(&mut self.by_hour, &hour_key(&stored.event.timestamp), id);
    }

    fn update_status(&mut self, id: &str, old: EventStatus, new: EventStatus) {
        if old == new {
            return;
        }
        if let Some(ids) = self.by_status.get_mut(&old) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_status.remove(&old);
            }
        }
        self.by_status
            .entry(new)
            .or_default()
            .insert(id.to_string());
    }

    fn drop_from(index: &mut HashMap<String, HashSet<String>>, key: &str, id: &str) {
        if let Some(ids) = index.get_mut(key) {
            ids.remove(id);
            if ids.is_empty() {
                index.remove(key);
            }
        }
    }
}

#[derive(Default)]
struct StoreState {
    events: HashMap<String, StoredEvent>,
    errors: Vec<ErrorRecord>,
    indexes: EventIndexes,
    pending: Vec<PendingWrite>,
    initialized: bool,
    total_stored: u64,
}

impl StoreState {
    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(Error::not_initialized("EventStore"))
        }
    }

    fn remove_event(&mut self, event_id: &str) -> bool {
        let Some(stored) = self.events.remove(event_id) else {
            return false;
        };
        self.indexes.remove(&stored);
        self.errors.retain(|e| e.event_id != event_id);
        self.pending.push(PendingWrite::Delete {
            key: event_key(event_id),
        });
        true
    }
}

fn event_key(event_id: &str) -> String {
    format!("event:{event_id}")
}

/// Filters and pagination for `query_events`.
#[derive(Debug, Clone)]
pub struct EventQuery {
    pub source: Option<String>,
    pub event_type: Option<String>,
    pub status: Option<EventStatus>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for EventQuery {
    fn default() -> Self {
        Self {
            source: None,
            event_type: None,
            status: None,
            since: None,
            until: None,
            limit: 100,
            offset: 0,
        }
    }
}

impl EventQuery {
    /// Filter by source.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Filter by event type.
    #[must_use]
    pub fn with_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    /// Filter by status.
    #[must_use]
    pub fn with_status(mut self, status: EventStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Only events at or after this instant.
    #[must_use]
    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    /// Only events at or before this instant.
    #[must_use]
    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    /// Page size.
    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Page offset.
    #[must_use]
    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    fn matches(&self, stored: &StoredEvent) -> bool {
        if let Some(source) = &self.source {
            if stored.event.source != *source {
                return false;
            }
        }
        if let Some(event_type) = &self.event_type {
            if stored.event.event_type != *event_type {
                return false;
            }
        }
        if let Some(status) = self.status {
            if stored.status != status {
                return false;
            }
        }
        if let Some(since) = self.since {
            if stored.event.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if stored.event.timestamp > until {
                return false;
            }
        }
        true
    }
}

/// Pagination for the indexed accessors.
#[derive(Debug, Clone)]
pub struct PageOptions {
    pub limit: usize,
    pub offset: usize,
}

impl Default for PageOptions {
    fn default() -> Self {
        Self {
            limit: 100,
            offset: 0,
        }
    }
}

/// Store metrics for monitoring.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreMetrics {
    pub total_events: usize,
    pub total_stored: u64,
    pub events_by_status: HashMap<String, usize>,
    pub error_records: usize,
    pub pending_writes: usize,
    pub max_events: usize,
}

/// Store health report.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreHealth {
    pub status: HealthState,
    pub total_events: usize,
    pub pending_writes: usize,
}

/// Durable-intent record of every event's lifecycle.
pub struct EventStore {
    config: StoreConfig,
    backend: Option<Arc<dyn StorageBackend>>,
    state: RwLock<StoreState>,
    tickers: Mutex<Option<(watch::Sender<bool>, Vec<JoinHandle<()>>)>>,
}

impl EventStore {
    /// Create a store with no durable backend.
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            backend: None,
            state: RwLock::new(StoreState::default()),
            tickers: Mutex::new(None),
        }
    }

    /// Create a store that flushes to the given backend.
    pub fn with_backend(config: StoreConfig, backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            config,
            backend: Some(backend),
            state: RwLock::new(StoreState::default()),
            tickers: Mutex::new(None),
        }
    }

    /// Mark the store ready and spawn the flush and cleanup tickers.
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        self.state.write().await.initialized = true;

        let mut tickers = self.tickers.lock().await;
        if tickers.is_some() {
            return Ok(());
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        let flush = spawn_ticker(
            Arc::clone(self),
            self.config.flush_interval,
            stop_rx.clone(),
            TickerKind::Flush,
        );
        let cleanup = spawn_ticker(
            Arc::clone(self),
            self.config.cleanup_interval,
            stop_rx,
            TickerKind::Cleanup,
        );
        *tickers = Some((stop_tx, vec![flush, cleanup]));
        debug!("event store initialized");
        Ok(())
    }

    /// Record a new event with status `received`. Returns the event id.
    pub async fn store_event(&self, mut event: Event) -> Result<String> {
        let payload = self.encode_payload(std::mem::take(&mut event.payload))?;
        let mut state = self.state.write().await;
        state.ensure_initialized()?;

        if event.id.is_empty() {
            event.id = generate_event_id();
        }
        let id = event.id.clone();
        let now = Utc::now();
        let stored = StoredEvent {
            event,
            payload,
            status: EventStatus::Received,
            stored_at: now,
            updated_at: now,
        };

        // Re-storing an id replaces the old record and its index entries
        if let Some(previous) = state.events.remove(&id) {
            state.indexes.remove(&previous);
        }
        state.indexes.insert(&stored);
        state.pending.push(PendingWrite::Put {
            key: event_key(&id),
            value: serde_json::to_value(&stored.to_flush_record()?)?,
        });
        state.events.insert(id.clone(), stored);
        state.total_stored = state.total_stored.saturating_add(1);

        if state.events.len() > self.config.max_events {
            warn!(
                count = state.events.len(),
                max = self.config.max_events,
                "event store over capacity"
            );
        }
        let should_flush = state.pending.len() >= self.config.batch_size;
        drop(state);

        debug!(event_id = %id, "event stored");
        if should_flush {
            self.flush_pending_writes().await;
        }
        Ok(id)
    }

    /// Set an event's status, merging metadata into its existing map.
    /// Returns false if the event does not exist.
    pub async fn update_event_status(
        &self,
        event_id: &str,
        status: EventStatus,
        metadata: Option<Metadata>,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        state.ensure_initialized()?;

        let Some(stored) = state.events.get_mut(event_id) else {
            return Ok(false);
        };
        let old_status = stored.status;
        stored.status = status;
        stored.updated_at = Utc::now();
        if let Some(incoming) = metadata {
            let merged = stored.event.metadata.get_or_insert_with(Metadata::new);
            for (key, value) in incoming {
                merged.insert(key, value);
            }
        }
        let record = stored.to_flush_record()?;
        state.indexes.update_status(event_id, old_status, status);
        state.pending.push(PendingWrite::Put {
            key: event_key(event_id),
            value: serde_json::to_value(&record)?,
        });

        let should_flush = state.pending.len() >= self.config.batch_size;
        drop(state);

        debug!(event_id, status = %status, "event status updated");
        if should_flush {
            self.flush_pending_writes().await;
        }
        Ok(true)
    }

    /// Record a failure against an event and mark it `failed`.
    pub async fn store_event_error(
        &self,
        event_id: &str,
        error: ErrorInfo,
    ) -> Result<ErrorRecordId> {
        let record = ErrorRecord {
            id: ErrorRecordId::new(),
            event_id: event_id.to_string(),
            error,
            timestamp: Utc::now(),
        };
        let id = record.id;
        let message = record.error.message.clone();
        {
            let mut state = self.state.write().await;
            state.ensure_initialized()?;
            state.errors.push(record);
        }

        let mut metadata = Metadata::new();
        metadata.insert("errorId".to_string(), Value::String(id.to_string()));
        metadata.insert("errorMessage".to_string(), Value::String(message));
        self.update_event_status(event_id, EventStatus::Failed, Some(metadata))
            .await?;
        Ok(id)
    }

    /// Point lookup; decompresses the payload transparently.
    pub async fn get_event(&self, event_id: &str) -> Result<Option<EventRecord>> {
        let state = self.state.read().await;
        state.ensure_initialized()?;
        state
            .events
            .get(event_id)
            .map(StoredEvent::to_record)
            .transpose()
    }

    /// Current status of an event, if it exists.
    pub async fn get_event_status(&self, event_id: &str) -> Result<Option<EventStatus>> {
        let state = self.state.read().await;
        state.ensure_initialized()?;
        Ok(state.events.get(event_id).map(|e| e.status))
    }

    /// Filtered query, newest-first by event timestamp, paginated.
    ///
    /// Time-bounded queries narrow the candidate set through the hour
    /// index before filtering.
    pub async fn query_events(&self, query: &EventQuery) -> Result<Vec<EventRecord>> {
        let state = self.state.read().await;
        state.ensure_initialized()?;

        let candidates: Vec<&StoredEvent> = if query.since.is_some() || query.until.is_some() {
            let lo = query.since.map(|t| hour_key(&t));
            let hi = query.until.map(|t| hour_key(&t));
            state
                .indexes
                .by_hour
                .iter()
                .filter(|(key, _)| {
                    lo.as_deref().map_or(true, |lo| key.as_str() >= lo)
                        && hi.as_deref().map_or(true, |hi| key.as_str() <= hi)
                })
                .flat_map(|(_, ids)| ids)
                .filter_map(|id| state.events.get(id))
                .collect()
        } else {
            state.events.values().collect()
        };

        let mut matched: Vec<&StoredEvent> =
            candidates.into_iter().filter(|e| query.matches(e)).collect();
        matched.sort_by(|a, b| b.event.timestamp.cmp(&a.event.timestamp));
        matched
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .map(StoredEvent::to_record)
            .collect()
    }

    /// Index-accelerated lookup of all events from one source.
    pub async fn get_events_by_source(
        &self,
        source: &str,
        options: &PageOptions,
    ) -> Result<Vec<EventRecord>> {
        self.collect_indexed(|state| state.indexes.by_source.get(source), options)
            .await
    }

    /// Index-accelerated lookup of all events of one type.
    pub async fn get_events_by_type(
        &self,
        event_type: &str,
        options: &PageOptions,
    ) -> Result<Vec<EventRecord>> {
        self.collect_indexed(|state| state.indexes.by_type.get(event_type), options)
            .await
    }

    async fn collect_indexed<F>(&self, lookup: F, options: &PageOptions) -> Result<Vec<EventRecord>>
    where
        F: FnOnce(&StoreState) -> Option<&HashSet<String>>,
    {
        let state = self.state.read().await;
        state.ensure_initialized()?;

        let Some(ids) = lookup(&state) else {
            return Ok(Vec::new());
        };
        let mut matched: Vec<&StoredEvent> =
            ids.iter().filter_map(|id| state.events.get(id)).collect();
        matched.sort_by(|a, b| b.event.timestamp.cmp(&a.event.timestamp));
        matched
            .into_iter()
            .skip(options.offset)
            .take(options.limit)
            .map(StoredEvent::to_record)
            .collect()
    }

    /// All error records, optionally filtered to one event, newest-first.
    pub async fn get_event_errors(&self, event_id: Option<&str>) -> Result<Vec<ErrorRecord>> {
        let state = self.state.read().await;
        state.ensure_initialized()?;

        let mut errors: Vec<ErrorRecord> = state
            .errors
            .iter()
            .filter(|e| event_id.map_or(true, |id| e.event_id == id))
            .cloned()
            .collect();
        errors.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(errors)
    }

    /// Remove an event, its index entries, and its error records.
    pub async fn delete_event(&self, event_id: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        state.ensure_initialized()?;
        let removed = state.remove_event(event_id);
        if removed {
            debug!(event_id, "event deleted");
        }
        Ok(removed)
    }

    /// Delete every event older than the retention window. Returns the
    /// number of events removed. Failures only log; cleanup must never
    /// take the store down.
    pub async fn cleanup_old_events(&self) -> usize {
        let cutoff = Utc::now() - chrono::Duration::days(self.config.retention_days);
        let mut state = self.state.write().await;
        if !state.initialized {
            return 0;
        }
        let expired: Vec<String> = state
            .events
            .values()
            .filter(|e| e.event.timestamp < cutoff)
            .map(|e| e.event.id.clone())
            .collect();
        for id in &expired {
            state.remove_event(id);
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "cleaned up expired events");
        }
        expired.len()
    }

    /// Flush the pending-write buffer to the backend. Failures only log;
    /// the hot path must stay available when the backend is not.
    pub async fn flush_pending_writes(&self) {
        let writes = {
            let mut state = self.state.write().await;
            std::mem::take(&mut state.pending)
        };
        if writes.is_empty() {
            return;
        }
        let Some(backend) = &self.backend else {
            return;
        };
        let count = writes.len();
        for write in writes {
            let result = match write {
                PendingWrite::Put { key, value } => backend.put(&key, value).await,
                PendingWrite::Delete { key } => backend.delete(&key).await,
            };
            if let Err(err) = result {
                warn!(error = %err, "backend write failed");
            }
        }
        debug!(count, "flushed pending writes");
    }

    /// Number of events currently stored.
    pub async fn count(&self) -> usize {
        self.state.read().await.events.len()
    }

    /// Store metrics for monitoring.
    pub async fn get_metrics(&self) -> StoreMetrics {
        let state = self.state.read().await;
        let mut events_by_status: HashMap<String, usize> = HashMap::new();
        for (status, ids) in &state.indexes.by_status {
            events_by_status.insert(status.to_string(), ids.len());
        }
        StoreMetrics {
            total_events: state.events.len(),
            total_stored: state.total_stored,
            events_by_status,
            error_records: state.errors.len(),
            pending_writes: state.pending.len(),
            max_events: self.config.max_events,
        }
    }

    /// Health report: degraded when near capacity or the pending buffer
    /// is backing up.
    pub async fn get_health(&self) -> StoreHealth {
        let state = self.state.read().await;
        let total_events = state.events.len();
        let pending_writes = state.pending.len();
        let status = if !state.initialized {
            HealthState::Unhealthy
        } else if total_events * 10 > self.config.max_events * 9
            || pending_writes > self.config.batch_size * 5
        {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        };
        StoreHealth {
            status,
            total_events,
            pending_writes,
        }
    }

    /// Stop the tickers, flush buffered writes, and mark not-ready.
    pub async fn shutdown(&self) {
        let tickers = self.tickers.lock().await.take();
        if let Some((stop_tx, handles)) = tickers {
            let _ = stop_tx.send(true);
            for handle in handles {
                let _ = handle.await;
            }
        }
        self.flush_pending_writes().await;
        self.state.write().await.initialized = false;
        info!("event store shut down");
    }

    fn encode_payload(&self, payload: Value) -> Result<StoredPayload> {
        if !self.config.enable_compression {
            return Ok(StoredPayload::Plain(payload));
        }
        let raw = serde_json::to_vec(&payload)?;
        if raw.len() < self.config.compression_threshold {
            return Ok(StoredPayload::Plain(payload));
        }
        let compressed = zstd::encode_all(raw.as_slice(), 3)?;
        Ok(StoredPayload::Compressed(compressed))
    }
}

#[async_trait]
impl EventStatusSink for EventStore {
    async fn update_status(
        &self,
        event_id: &str,
        status: EventStatus,
        metadata: Option<Metadata>,
    ) -> Result<bool> {
        self.update_event_status(event_id, status, metadata).await
    }

    async fn record_error(&self, event_id: &str, error: &ErrorInfo) -> Result<()> {
        self.store_event_error(event_id, error.clone()).await?;
        Ok(())
    }
}

enum TickerKind {
    Flush,
    Cleanup,
}

fn spawn_ticker(
    store: Arc<EventStore>,
    period: Duration,
    mut stop_rx: watch::Receiver<bool>,
    kind: TickerKind,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // interval fires immediately; skip the initial tick
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => match kind {
                    TickerKind::Flush => store.flush_pending_writes().await,
                    TickerKind::Cleanup => {
                        store.cleanup_old_events().await;
                    }
                },
                _ = stop_rx.changed() => break,
            }
        }
    })
}
