//! Retry scheduling with exponential backoff and per-source circuit breakers.
//!
//! Consumers report failures through [`RetryManager::queue_for_retry`]; the
//! manager classifies the error, checks the source's circuit breaker, and
//! schedules re-execution with exponential backoff and jitter. A periodic
//! scheduler tick fires due entries against the injected [`RetryExecutor`].
//! Terminal outcomes are written back through the optional
//! [`EventStatusSink`] so the event store stays the source of truth for
//! event status.
//!
//! Per-entry state machine:
//! `queued -> processing -> {succeeded | queued (requeued) | failed | error}`,
//! with `queued -> cancelled` on explicit cancellation. Entries leave the
//! live set on any terminal state; a compact per-event history is retained
//! for introspection.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::breaker::{CircuitBreaker, CircuitBreakerSnapshot};
use crate::classify;
use crate::error::Result;
use crate::types::{ErrorInfo, Event, EventStatus, HealthState, Metadata, RetryId};

/// Live queue size above which health degrades.
const QUEUE_HIGH_WATER: usize = 1_000;

/// Success rate below which health degrades.
const SUCCESS_RATE_FLOOR: f64 = 0.5;

/// Retry manager configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum scheduled attempts per event.
    pub max_retries: u32,
    /// First-attempt delay and the floor for all jittered delays.
    pub base_delay: Duration,
    /// Exponential growth factor per attempt.
    pub backoff_multiplier: f64,
    /// Cap on the pre-jitter delay.
    pub max_delay: Duration,
    /// Jitter amplitude as a fraction of the computed delay.
    pub jitter_factor: f64,
    /// Scheduler tick period.
    pub retry_interval: Duration,
    /// Consecutive failures per source before the breaker trips.
    pub circuit_breaker_threshold: u32,
    /// How long a tripped breaker stays open.
    pub circuit_breaker_timeout: Duration,
    /// How long `shutdown` waits for the live queue to drain.
    pub shutdown_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(300_000),
            jitter_factor: 0.1,
            retry_interval: Duration::from_secs(1),
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout: Duration::from_millis(60_000),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Set the maximum number of attempts.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the base delay.
    #[must_use]
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Set the pre-jitter delay cap.
    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Set the jitter amplitude (0.0 disables jitter).
    #[must_use]
    pub fn with_jitter_factor(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor;
        self
    }

    /// Set the scheduler tick period.
    #[must_use]
    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    /// Set the circuit breaker trip threshold.
    #[must_use]
    pub fn with_circuit_breaker_threshold(mut self, threshold: u32) -> Self {
        self.circuit_breaker_threshold = threshold;
        self
    }

    /// Set the circuit breaker open timeout.
    #[must_use]
    pub fn with_circuit_breaker_timeout(mut self, timeout: Duration) -> Self {
        self.circuit_breaker_timeout = timeout;
        self
    }

    /// Pre-jitter backoff for the given attempt number (1-based):
    /// `min(base * multiplier^(attempt-1), max_delay)`.
    pub fn base_backoff(&self, retry_count: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let exponent = retry_count.saturating_sub(1).min(63);
        let raw = base_ms * self.backoff_multiplier.powi(exponent as i32);
        let capped = raw.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Backoff with jitter applied, floored at `base_delay`. Jitter spreads
    /// entries scheduled at the same instant so they do not all fire on the
    /// same tick.
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let capped = self.base_backoff(retry_count).as_millis() as f64;
        let jitter = capped * self.jitter_factor * (rand::random::<f64>() - 0.5);
        let base_ms = self.base_delay.as_millis() as f64;
        Duration::from_millis((capped + jitter).max(base_ms) as u64)
    }
}

/// Per-call overrides for `queue_for_retry`.
#[derive(Debug, Clone, Default)]
pub struct RetryOptions {
    pub max_retries: Option<u32>,
    pub base_delay: Option<Duration>,
}

/// The unit of work re-executed on each retry attempt. The actual
/// operation (HTTP call, shell invocation, ...) lives in an external
/// collaborator; the manager only sees success or an [`ErrorInfo`].
#[async_trait]
pub trait RetryExecutor: Send + Sync {
    async fn execute(&self, event: &Event, retry_count: u32)
        -> std::result::Result<(), ErrorInfo>;
}

/// Status write-back interface, implemented by the event store. Kept as a
/// trait so the manager and the store could run as separate services.
#[async_trait]
pub trait EventStatusSink: Send + Sync {
    /// Set an event's status, merging the metadata into its existing map.
    async fn update_status(
        &self,
        event_id: &str,
        status: EventStatus,
        metadata: Option<Metadata>,
    ) -> Result<bool>;

    /// Record a failure against an event and mark it failed.
    async fn record_error(&self, event_id: &str, error: &ErrorInfo) -> Result<()>;
}

/// State of a retry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryState {
    Queued,
    Processing,
    Succeeded,
    Failed,
    Cancelled,
    /// The retry mechanism itself failed, distinct from the wrapped
    /// operation failing.
    Error,
}

impl std::fmt::Display for RetryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// A live retry entry, owned exclusively by the manager.
#[derive(Debug, Clone)]
struct RetryEntry {
    id: RetryId,
    event: Event,
    error: ErrorInfo,
    retry_count: u32,
    max_retries: u32,
    delay: Duration,
    execute_at: Instant,
    execute_at_wall: DateTime<Utc>,
    queued_at: DateTime<Utc>,
    state: RetryState,
}

/// Read-only view of a live retry entry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryStatus {
    pub id: RetryId,
    pub event_id: String,
    pub status: RetryState,
    pub retry_count: u32,
    pub max_retries: u32,
    pub execute_at: DateTime<Utc>,
    pub queued_at: DateTime<Utc>,
    pub error: ErrorInfo,
}

/// One scheduled attempt in an event's retry history. History is retained
/// after entries leave the live set.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryAttempt {
    pub retry_id: RetryId,
    pub retry_count: u32,
    pub queued_at: DateTime<Utc>,
    pub error_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RetryState>,
}

/// Aggregated retry metrics for monitoring.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryMetrics {
    pub retries_attempted: u64,
    pub retries_succeeded: u64,
    pub retries_failed: u64,
    pub circuit_breaker_trips: u64,
    /// Mean scheduled delay in milliseconds.
    pub average_retry_delay: f64,
    pub queue_size: usize,
    pub is_running: bool,
    pub circuit_breakers: HashMap<String, CircuitBreakerSnapshot>,
}

/// Retry manager health report.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryHealth {
    pub status: HealthState,
    pub queue_size: usize,
    pub is_running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success_rate: Option<f64>,
}

#[derive(Default)]
struct RetryInner {
    entries: HashMap<RetryId, RetryEntry>,
    history: HashMap<String, Vec<RetryAttempt>>,
    breakers: HashMap<String, CircuitBreaker>,
}

impl RetryInner {
    fn finalize_attempt(&mut self, event_id: &str, retry_id: RetryId, outcome: RetryState) {
        if let Some(attempts) = self.history.get_mut(event_id) {
            if let Some(attempt) = attempts
                .iter_mut()
                .rev()
                .find(|a| a.retry_id == retry_id && a.finished_at.is_none())
            {
                attempt.finished_at = Some(Utc::now());
                attempt.outcome = Some(outcome);
            }
        }
    }
}

#[derive(Default)]
struct RetryCounters {
    retries_attempted: AtomicU64,
    retries_succeeded: AtomicU64,
    retries_failed: AtomicU64,
    circuit_breaker_trips: AtomicU64,
    total_delay_ms: AtomicU64,
    delays_recorded: AtomicU64,
}

impl RetryCounters {
    fn record_delay(&self, delay: Duration) {
        self.total_delay_ms
            .fetch_add(delay.as_millis() as u64, Ordering::Relaxed);
        self.delays_recorded.fetch_add(1, Ordering::Relaxed);
    }

    fn average_delay_ms(&self) -> f64 {
        let recorded = self.delays_recorded.load(Ordering::Relaxed);
        if recorded == 0 {
            return 0.0;
        }
        self.total_delay_ms.load(Ordering::Relaxed) as f64 / recorded as f64
    }
}

/// Schedules and drives retries of failed event processing.
pub struct RetryManager {
    config: RetryConfig,
    executor: Arc<dyn RetryExecutor>,
    status_sink: Option<Arc<dyn EventStatusSink>>,
    inner: Mutex<RetryInner>,
    counters: RetryCounters,
    running: AtomicBool,
    loop_task: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl RetryManager {
    /// Create a manager with the given config and retry executor.
    pub fn new(config: RetryConfig, executor: Arc<dyn RetryExecutor>) -> Self {
        Self {
            config,
            executor,
            status_sink: None,
            inner: Mutex::new(RetryInner::default()),
            counters: RetryCounters::default(),
            running: AtomicBool::new(false),
            loop_task: Mutex::new(None),
        }
    }

    /// Attach an event status sink for outcome write-back.
    #[must_use]
    pub fn with_status_sink(mut self, sink: Arc<dyn EventStatusSink>) -> Self {
        self.status_sink = Some(sink);
        self
    }

    /// Setup hook; the manager has no state to prepare.
    pub async fn initialize(&self) -> Result<()> {
        debug!("retry manager initialized");
        Ok(())
    }

    /// Report a failed event and schedule a retry.
    ///
    /// Returns `Ok(None)` when no retry will happen: the error is
    /// non-retryable, the source's circuit is open, or retries are
    /// exhausted. The wrapped operation's error never propagates past this
    /// call; terminal outcomes are observable via the event store and
    /// metrics.
    pub async fn queue_for_retry(
        &self,
        event: Event,
        error: ErrorInfo,
        options: RetryOptions,
    ) -> Result<Option<RetryId>> {
        if !classify::is_retryable(&error) {
            debug!(
                event_id = %event.id,
                error = %error,
                "non-retryable error, not scheduling"
            );
            return Ok(None);
        }

        let max_retries = options.max_retries.unwrap_or(self.config.max_retries);
        let event_id = event.id.clone();

        let scheduled = {
            let mut inner = self.inner.lock().await;

            if let Some(breaker) = inner.breakers.get_mut(&event.source) {
                if breaker.is_open() {
                    warn!(
                        source = %event.source,
                        event_id = %event.id,
                        "circuit open, dropping retry"
                    );
                    return Ok(None);
                }
            }

            let attempts = inner.history.get(&event.id).map_or(0, |h| h.len() as u32);
            if attempts >= max_retries {
                None
            } else {
                let retry_count = attempts.saturating_add(1);
                let delay = self.compute_delay(retry_count, &options);
                let id = RetryId::new();
                let now = Utc::now();
                let entry = RetryEntry {
                    id,
                    event,
                    error: error.clone(),
                    retry_count,
                    max_retries,
                    delay,
                    execute_at: Instant::now() + delay,
                    execute_at_wall: now + chrono::Duration::milliseconds(delay.as_millis() as i64),
                    queued_at: now,
                    state: RetryState::Queued,
                };
                inner
                    .history
                    .entry(entry.event.id.clone())
                    .or_default()
                    .push(RetryAttempt {
                        retry_id: id,
                        retry_count,
                        queued_at: now,
                        error_message: error.message.clone(),
                        finished_at: None,
                        outcome: None,
                    });
                inner.entries.insert(id, entry);
                self.counters.record_delay(delay);
                Some((id, retry_count, delay))
            }
        };

        match scheduled {
            Some((id, retry_count, delay)) => {
                info!(
                    retry_id = %id,
                    event_id = %event_id,
                    retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "retry scheduled"
                );
                self.notify_status(&event_id, EventStatus::Retrying, retry_count)
                    .await;
                Ok(Some(id))
            }
            None => {
                error!(event_id = %event_id, error = %error, "retries exhausted");
                self.notify_error(&event_id, &error).await;
                Ok(None)
            }
        }
    }

    /// Start the periodic scheduler tick.
    pub async fn start_retry_loop(self: &Arc<Self>) {
        let mut guard = self.loop_task.lock().await;
        if guard.is_some() {
            return;
        }
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let manager = Arc::clone(self);
        let period = self.config.retry_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => manager.process_retries().await,
                    _ = stop_rx.changed() => break,
                }
            }
        });
        self.running.store(true, Ordering::SeqCst);
        *guard = Some((stop_tx, handle));
        info!(interval_ms = period.as_millis() as u64, "retry loop started");
    }

    /// Stop the scheduler tick and wait for it to exit.
    pub async fn stop_retry_loop(&self) {
        let task = self.loop_task.lock().await.take();
        if let Some((stop_tx, handle)) = task {
            let _ = stop_tx.send(true);
            let _ = handle.await;
        }
        self.running.store(false, Ordering::SeqCst);
    }

    /// Process every queued entry whose deadline has passed.
    pub async fn process_retries(&self) {
        let due: Vec<RetryEntry> = {
            let mut inner = self.inner.lock().await;
            let now = Instant::now();
            let ids: Vec<RetryId> = inner
                .entries
                .values()
                .filter(|e| e.state == RetryState::Queued && e.execute_at <= now)
                .map(|e| e.id)
                .collect();
            ids.into_iter()
                .filter_map(|id| {
                    inner.entries.get_mut(&id).map(|entry| {
                        entry.state = RetryState::Processing;
                        entry.clone()
                    })
                })
                .collect()
        };

        for entry in due {
            self.process_retry(entry).await;
        }
    }

    async fn process_retry(&self, entry: RetryEntry) {
        self.counters
            .retries_attempted
            .fetch_add(1, Ordering::Relaxed);
        debug!(
            retry_id = %entry.id,
            event_id = %entry.event.id,
            retry_count = entry.retry_count,
            "processing retry"
        );

        // A panicking executor must not take the scheduler loop down with
        // it; it maps to the entry's `error` terminal state.
        let outcome = AssertUnwindSafe(self.executor.execute(&entry.event, entry.retry_count))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => self.finish_success(entry).await,
            Ok(Err(err)) if entry.retry_count < entry.max_retries => {
                self.requeue(entry, err).await;
            }
            Ok(Err(err)) => self.finish_failure(entry, err).await,
            Err(_) => self.finish_mechanism_error(entry).await,
        }
    }

    async fn finish_success(&self, entry: RetryEntry) {
        {
            let mut inner = self.inner.lock().await;
            inner.entries.remove(&entry.id);
            inner.finalize_attempt(&entry.event.id, entry.id, RetryState::Succeeded);
            if let Some(breaker) = inner.breakers.get_mut(&entry.event.source) {
                breaker.record_success();
            }
        }
        self.counters
            .retries_succeeded
            .fetch_add(1, Ordering::Relaxed);
        info!(
            retry_id = %entry.id,
            event_id = %entry.event.id,
            retry_count = entry.retry_count,
            "retry succeeded"
        );
        self.notify_status(&entry.event.id, EventStatus::Succeeded, entry.retry_count)
            .await;
    }

    async fn requeue(&self, entry: RetryEntry, err: ErrorInfo) {
        let retry_count = entry.retry_count.saturating_add(1);
        let delay = self.config.backoff_delay(retry_count);
        let now = Utc::now();
        {
            let mut inner = self.inner.lock().await;
            inner.finalize_attempt(&entry.event.id, entry.id, RetryState::Failed);
            if let Some(live) = inner.entries.get_mut(&entry.id) {
                live.retry_count = retry_count;
                live.delay = delay;
                live.execute_at = Instant::now() + delay;
                live.execute_at_wall =
                    now + chrono::Duration::milliseconds(delay.as_millis() as i64);
                live.error = err.clone();
                live.state = RetryState::Queued;
            }
            inner
                .history
                .entry(entry.event.id.clone())
                .or_default()
                .push(RetryAttempt {
                    retry_id: entry.id,
                    retry_count,
                    queued_at: now,
                    error_message: err.message.clone(),
                    finished_at: None,
                    outcome: None,
                });
        }
        self.counters.record_delay(delay);
        debug!(
            retry_id = %entry.id,
            event_id = %entry.event.id,
            retry_count,
            delay_ms = delay.as_millis() as u64,
            "retry requeued"
        );
        self.notify_status(&entry.event.id, EventStatus::Retrying, retry_count)
            .await;
    }

    async fn finish_failure(&self, entry: RetryEntry, err: ErrorInfo) {
        {
            let mut inner = self.inner.lock().await;
            inner.entries.remove(&entry.id);
            inner.finalize_attempt(&entry.event.id, entry.id, RetryState::Failed);
            self.record_breaker_failure(&mut inner, &entry.event.source);
        }
        self.counters.retries_failed.fetch_add(1, Ordering::Relaxed);
        error!(
            retry_id = %entry.id,
            event_id = %entry.event.id,
            retry_count = entry.retry_count,
            error = %err,
            "retries exhausted, permanent failure"
        );
        self.notify_error(&entry.event.id, &err).await;
    }

    async fn finish_mechanism_error(&self, entry: RetryEntry) {
        {
            let mut inner = self.inner.lock().await;
            inner.entries.remove(&entry.id);
            inner.finalize_attempt(&entry.event.id, entry.id, RetryState::Error);
            self.record_breaker_failure(&mut inner, &entry.event.source);
        }
        self.counters.retries_failed.fetch_add(1, Ordering::Relaxed);
        let err = ErrorInfo::new("retry execution panicked").with_name("RetryMechanismError");
        warn!(
            retry_id = %entry.id,
            event_id = %entry.event.id,
            "retry mechanism error"
        );
        self.notify_error(&entry.event.id, &err).await;
    }

    fn record_breaker_failure(&self, inner: &mut RetryInner, source: &str) {
        let breaker = inner.breakers.entry(source.to_string()).or_insert_with(|| {
            CircuitBreaker::new(
                self.config.circuit_breaker_threshold,
                self.config.circuit_breaker_timeout,
            )
        });
        if breaker.record_failure() {
            self.counters
                .circuit_breaker_trips
                .fetch_add(1, Ordering::Relaxed);
            warn!(source, "circuit breaker tripped");
        }
    }

    /// Cancel a queued retry. Returns false if the entry does not exist or
    /// is no longer cancellable.
    pub async fn cancel_retry(&self, retry_id: RetryId) -> bool {
        let mut inner = self.inner.lock().await;
        let cancellable = inner
            .entries
            .get(&retry_id)
            .is_some_and(|e| e.state == RetryState::Queued);
        if !cancellable {
            return false;
        }
        if let Some(entry) = inner.entries.remove(&retry_id) {
            inner.finalize_attempt(&entry.event.id, retry_id, RetryState::Cancelled);
            debug!(retry_id = %retry_id, event_id = %entry.event.id, "retry cancelled");
        }
        true
    }

    /// Whether the circuit for a source is currently open. Performs the
    /// timed open -> half-open transition as a side effect.
    pub async fn is_circuit_breaker_open(&self, source: &str) -> bool {
        let mut inner = self.inner.lock().await;
        inner
            .breakers
            .get_mut(source)
            .is_some_and(CircuitBreaker::is_open)
    }

    /// Snapshot of a live retry entry, or `None` once it reached a
    /// terminal state.
    pub async fn get_retry_status(&self, retry_id: RetryId) -> Option<RetryStatus> {
        let inner = self.inner.lock().await;
        inner.entries.get(&retry_id).map(|e| RetryStatus {
            id: e.id,
            event_id: e.event.id.clone(),
            status: e.state,
            retry_count: e.retry_count,
            max_retries: e.max_retries,
            execute_at: e.execute_at_wall,
            queued_at: e.queued_at,
            error: e.error.clone(),
        })
    }

    /// Scheduled-attempt history for an event, oldest first.
    pub async fn get_retry_history(&self, event_id: &str) -> Vec<RetryAttempt> {
        let inner = self.inner.lock().await;
        inner.history.get(event_id).cloned().unwrap_or_default()
    }

    /// Aggregated metrics, including per-source breaker snapshots.
    pub async fn get_metrics(&self) -> RetryMetrics {
        let inner = self.inner.lock().await;
        RetryMetrics {
            retries_attempted: self.counters.retries_attempted.load(Ordering::Relaxed),
            retries_succeeded: self.counters.retries_succeeded.load(Ordering::Relaxed),
            retries_failed: self.counters.retries_failed.load(Ordering::Relaxed),
            circuit_breaker_trips: self.counters.circuit_breaker_trips.load(Ordering::Relaxed),
            average_retry_delay: self.counters.average_delay_ms(),
            queue_size: inner.entries.len(),
            is_running: self.running.load(Ordering::SeqCst),
            circuit_breakers: inner
                .breakers
                .iter()
                .map(|(source, breaker)| (source.clone(), breaker.snapshot()))
                .collect(),
        }
    }

    /// Health report: unhealthy when the loop is not running, degraded on
    /// a backed-up queue or a poor success rate.
    pub async fn get_health(&self) -> RetryHealth {
        let queue_size = self.inner.lock().await.entries.len();
        let is_running = self.running.load(Ordering::SeqCst);
        let attempted = self.counters.retries_attempted.load(Ordering::Relaxed);
        let succeeded = self.counters.retries_succeeded.load(Ordering::Relaxed);
        let success_rate = (attempted > 0).then(|| succeeded as f64 / attempted as f64);

        let status = if !is_running {
            HealthState::Unhealthy
        } else if queue_size > QUEUE_HIGH_WATER
            || success_rate.is_some_and(|rate| rate < SUCCESS_RATE_FLOOR)
        {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        };

        RetryHealth {
            status,
            queue_size,
            is_running,
            success_rate,
        }
    }

    /// Stop the loop and wait (bounded) for the live queue to drain.
    pub async fn shutdown(&self) {
        self.stop_retry_loop().await;
        let deadline = Instant::now() + self.config.shutdown_timeout;
        loop {
            self.process_retries().await;
            let remaining = self.inner.lock().await.entries.len();
            if remaining == 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!(remaining, "shutdown timeout with retries still queued");
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        info!("retry manager shut down");
    }

    fn compute_delay(&self, retry_count: u32, options: &RetryOptions) -> Duration {
        match options.base_delay {
            Some(base) => {
                let mut config = self.config.clone();
                config.base_delay = base;
                config.backoff_delay(retry_count)
            }
            None => self.config.backoff_delay(retry_count),
        }
    }

    async fn notify_status(&self, event_id: &str, status: EventStatus, retry_count: u32) {
        if let Some(sink) = &self.status_sink {
            let mut metadata = Metadata::new();
            metadata.insert("retryCount".to_string(), json!(retry_count));
            if let Err(err) = sink.update_status(event_id, status, Some(metadata)).await {
                warn!(event_id, error = %err, "event status update failed");
            }
        }
    }

    async fn notify_error(&self, event_id: &str, error: &ErrorInfo) {
        if let Some(sink) = &self.status_sink {
            if let Err(err) = sink.record_error(event_id, error).await {
                warn!(event_id, error = %err, "event error write failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    /// Executor that fails a fixed number of times before succeeding.
    struct FlakyExecutor {
        failures: u32,
        attempts: AtomicU32,
    }

    impl FlakyExecutor {
        fn failing(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures,
                attempts: AtomicU32::new(0),
            })
        }

        fn attempts(&self) -> u32 {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RetryExecutor for FlakyExecutor {
        async fn execute(
            &self,
            _event: &Event,
            _retry_count: u32,
        ) -> std::result::Result<(), ErrorInfo> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt <= self.failures {
                Err(ErrorInfo::new("connection timed out").with_code("TIMEOUT_ERROR"))
            } else {
                Ok(())
            }
        }
    }

    fn test_config() -> RetryConfig {
        RetryConfig::default()
            .with_base_delay(Duration::from_millis(10))
            .with_jitter_factor(0.0)
    }

    fn event(id: &str, source: &str) -> Event {
        Event::new(source, "deploy", json!({"id": id})).with_id(id)
    }

    fn timeout_error() -> ErrorInfo {
        ErrorInfo::new("connection timed out").with_code("TIMEOUT_ERROR")
    }

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let config = RetryConfig::default();
        assert_eq!(config.base_backoff(1), Duration::from_millis(1000));
        assert_eq!(config.base_backoff(2), Duration::from_millis(2000));
        assert_eq!(config.base_backoff(3), Duration::from_millis(4000));
        assert_eq!(config.base_backoff(9), Duration::from_millis(256_000));
        // Capped at max_delay from attempt 10 onward
        assert_eq!(config.base_backoff(10), Duration::from_millis(300_000));
        assert_eq!(config.base_backoff(40), Duration::from_millis(300_000));
    }

    #[test]
    fn jittered_delay_stays_within_bounds() {
        let config = RetryConfig::default();
        for attempt in 1..=12 {
            let pre = config.base_backoff(attempt).as_millis() as f64;
            let delay = config.backoff_delay(attempt).as_millis() as f64;
            assert!(delay >= config.base_delay.as_millis() as f64);
            assert!(delay <= pre * (1.0 + config.jitter_factor / 2.0) + 1.0);
            assert!(delay >= (pre * (1.0 - config.jitter_factor / 2.0)).floor().max(1000.0));
        }
    }

    proptest! {
        #[test]
        fn backoff_is_monotonic_and_bounded(
            base_ms in 1u64..5_000,
            multiplier in 1.0f64..4.0,
            max_ms in 5_000u64..600_000,
        ) {
            let config = RetryConfig::default()
                .with_base_delay(Duration::from_millis(base_ms))
                .with_max_delay(Duration::from_millis(max_ms));
            let config = RetryConfig { backoff_multiplier: multiplier, ..config };

            let mut previous = Duration::ZERO;
            for attempt in 1..40u32 {
                let delay = config.base_backoff(attempt);
                prop_assert!(delay >= previous, "non-decreasing");
                prop_assert!(delay <= Duration::from_millis(max_ms), "bounded by max");
                previous = delay;
            }
        }
    }

    #[tokio::test]
    async fn non_retryable_error_is_not_scheduled() {
        let executor = FlakyExecutor::failing(0);
        let manager = RetryManager::new(test_config(), executor);

        let error = ErrorInfo::new("bad payload").with_code("VALIDATION_ERROR");
        let result = manager
            .queue_for_retry(event("e1", "wsl2"), error, RetryOptions::default())
            .await
            .unwrap();
        assert!(result.is_none());
        assert_eq!(manager.get_metrics().await.queue_size, 0);
        assert!(manager.get_retry_history("e1").await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn entry_succeeds_and_leaves_live_set() {
        let executor = FlakyExecutor::failing(0);
        let manager = RetryManager::new(test_config(), executor.clone());

        let id = manager
            .queue_for_retry(event("e1", "wsl2"), timeout_error(), RetryOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            manager.get_retry_status(id).await.unwrap().status,
            RetryState::Queued
        );

        tokio::time::advance(Duration::from_millis(20)).await;
        manager.process_retries().await;

        assert_eq!(executor.attempts(), 1);
        assert!(manager.get_retry_status(id).await.is_none());
        let metrics = manager.get_metrics().await;
        assert_eq!(metrics.retries_succeeded, 1);
        assert_eq!(metrics.queue_size, 0);

        let history = manager.get_retry_history("e1").await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].outcome, Some(RetryState::Succeeded));
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_entry_exhausts_after_max_retries() {
        let executor = FlakyExecutor::failing(u32::MAX);
        let config = test_config().with_max_retries(3);
        let manager = RetryManager::new(config, executor.clone());

        manager
            .queue_for_retry(event("e1", "wsl2"), timeout_error(), RetryOptions::default())
            .await
            .unwrap()
            .unwrap();

        for _ in 0..3 {
            tokio::time::advance(Duration::from_millis(200)).await;
            manager.process_retries().await;
        }

        assert_eq!(executor.attempts(), 3, "exactly max_retries attempts");
        let metrics = manager.get_metrics().await;
        assert_eq!(metrics.retries_attempted, 3);
        assert_eq!(metrics.retries_failed, 1);
        assert_eq!(metrics.queue_size, 0);

        let history = manager.get_retry_history("e1").await;
        assert_eq!(history.len(), 3);
        assert_eq!(history[2].outcome, Some(RetryState::Failed));

        // Reporting the same event again is a permanent failure.
        let again = manager
            .queue_for_retry(event("e1", "wsl2"), timeout_error(), RetryOptions::default())
            .await
            .unwrap();
        assert!(again.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn requeue_backs_off_with_incremented_count() {
        let executor = FlakyExecutor::failing(1);
        let manager = RetryManager::new(test_config(), executor.clone());

        let id = manager
            .queue_for_retry(event("e1", "wsl2"), timeout_error(), RetryOptions::default())
            .await
            .unwrap()
            .unwrap();

        tokio::time::advance(Duration::from_millis(15)).await;
        manager.process_retries().await;

        // First attempt failed; entry requeued with retry_count 2.
        let status = manager.get_retry_status(id).await.unwrap();
        assert_eq!(status.status, RetryState::Queued);
        assert_eq!(status.retry_count, 2);

        tokio::time::advance(Duration::from_millis(25)).await;
        manager.process_retries().await;
        assert_eq!(executor.attempts(), 2);
        assert!(manager.get_retry_status(id).await.is_none());
        assert_eq!(manager.get_metrics().await.retries_succeeded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_only_while_queued() {
        let executor = FlakyExecutor::failing(0);
        let manager = RetryManager::new(test_config(), executor);

        let id = manager
            .queue_for_retry(event("e1", "wsl2"), timeout_error(), RetryOptions::default())
            .await
            .unwrap()
            .unwrap();

        assert!(manager.cancel_retry(id).await);
        assert!(!manager.cancel_retry(id).await, "already removed");
        assert!(manager.get_retry_status(id).await.is_none());

        let history = manager.get_retry_history("e1").await;
        assert_eq!(history[0].outcome, Some(RetryState::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_trips_and_drops_new_retries_for_source() {
        let executor = FlakyExecutor::failing(u32::MAX);
        let config = test_config()
            .with_max_retries(1)
            .with_circuit_breaker_threshold(2)
            .with_circuit_breaker_timeout(Duration::from_secs(60));
        let manager = RetryManager::new(config, executor);

        // Two exhausted events for the same source trip the breaker.
        for i in 0..2 {
            manager
                .queue_for_retry(
                    event(&format!("e{i}"), "agentapi"),
                    timeout_error(),
                    RetryOptions::default(),
                )
                .await
                .unwrap()
                .unwrap();
            tokio::time::advance(Duration::from_millis(15)).await;
            manager.process_retries().await;
        }

        assert!(manager.is_circuit_breaker_open("agentapi").await);
        let metrics = manager.get_metrics().await;
        assert_eq!(metrics.circuit_breaker_trips, 1);
        assert_eq!(metrics.circuit_breakers["agentapi"].failure_count, 2);

        // New failures for that source are dropped while open.
        let dropped = manager
            .queue_for_retry(event("e9", "agentapi"), timeout_error(), RetryOptions::default())
            .await
            .unwrap();
        assert!(dropped.is_none());

        // Other sources are unaffected.
        let scheduled = manager
            .queue_for_retry(event("o1", "wsl2"), timeout_error(), RetryOptions::default())
            .await
            .unwrap();
        assert!(scheduled.is_some());

        // After the timeout the breaker half-opens and admits retries again.
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!manager.is_circuit_breaker_open("agentapi").await);
        let admitted = manager
            .queue_for_retry(event("e10", "agentapi"), timeout_error(), RetryOptions::default())
            .await
            .unwrap();
        assert!(admitted.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn options_override_max_retries() {
        let executor = FlakyExecutor::failing(u32::MAX);
        let manager = RetryManager::new(test_config(), executor.clone());

        let options = RetryOptions {
            max_retries: Some(1),
            base_delay: None,
        };
        manager
            .queue_for_retry(event("e1", "wsl2"), timeout_error(), options)
            .await
            .unwrap()
            .unwrap();

        tokio::time::advance(Duration::from_millis(15)).await;
        manager.process_retries().await;

        assert_eq!(executor.attempts(), 1);
        assert_eq!(manager.get_metrics().await.retries_failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_loop_drives_due_entries() {
        let executor = FlakyExecutor::failing(0);
        let config = test_config().with_retry_interval(Duration::from_millis(5));
        let manager = Arc::new(RetryManager::new(config, executor.clone()));

        manager
            .queue_for_retry(event("e1", "wsl2"), timeout_error(), RetryOptions::default())
            .await
            .unwrap()
            .unwrap();

        manager.start_retry_loop().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.stop_retry_loop().await;

        assert_eq!(executor.attempts(), 1);
        assert_eq!(manager.get_metrics().await.queue_size, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn health_reflects_loop_and_success_rate() {
        let executor = FlakyExecutor::failing(u32::MAX);
        let config = test_config()
            .with_max_retries(1)
            .with_retry_interval(Duration::from_millis(5));
        let manager = Arc::new(RetryManager::new(config, executor));

        let health = manager.get_health().await;
        assert_eq!(health.status, HealthState::Unhealthy, "loop not running");

        manager.start_retry_loop().await;
        let health = manager.get_health().await;
        assert_eq!(health.status, HealthState::Healthy);

        // An exhausted failure drops the success rate to 0.
        manager
            .queue_for_retry(event("e1", "wsl2"), timeout_error(), RetryOptions::default())
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let health = manager.get_health().await;
        assert_eq!(health.status, HealthState::Degraded);
        assert_eq!(health.success_rate, Some(0.0));

        manager.stop_retry_loop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_drains_due_entries() {
        let executor = FlakyExecutor::failing(0);
        let manager = Arc::new(RetryManager::new(test_config(), executor.clone()));

        manager
            .queue_for_retry(event("e1", "wsl2"), timeout_error(), RetryOptions::default())
            .await
            .unwrap()
            .unwrap();
        manager.start_retry_loop().await;

        tokio::time::advance(Duration::from_millis(15)).await;
        manager.shutdown().await;

        assert_eq!(executor.attempts(), 1);
        assert_eq!(manager.get_metrics().await.queue_size, 0);
        assert!(!manager.get_metrics().await.is_running);
    }

    #[tokio::test]
    async fn metrics_serialize_with_contract_field_names() {
        let executor = FlakyExecutor::failing(0);
        let manager = RetryManager::new(test_config(), executor);

        let metrics = manager.get_metrics().await;
        let value = serde_json::to_value(&metrics).unwrap();
        for key in [
            "retriesAttempted",
            "retriesSucceeded",
            "retriesFailed",
            "circuitBreakerTrips",
            "averageRetryDelay",
            "queueSize",
            "isRunning",
            "circuitBreakers",
        ] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
    }
}
