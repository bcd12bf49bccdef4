//! Per-source circuit breaker.
//!
//! One breaker exists per event source, created lazily on first failure.
//! States:
//! - Closed: failures are counted; reaching the threshold trips the breaker
//! - Open: retries for the source are dropped until the timeout elapses
//! - Half-Open: the cooldown has passed and attempts are allowed through
//!
//! Entering half-open resets the failure count to zero, so a failed probe
//! needs a full threshold of failures to re-trip. A success in any state
//! closes the breaker and clears the count.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Normal operation, failures are being counted.
    Closed,
    /// Cooldown elapsed, attempts allowed through again.
    HalfOpen,
    /// Tripped, attempts are dropped.
    Open,
}

impl CircuitState {
    /// Lowercase string form as reported in metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::HalfOpen => "half-open",
            Self::Open => "open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Circuit breaker for a single event source.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    threshold: u32,
    timeout: Duration,
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
    opened_at_wall: Option<DateTime<Utc>>,
}

impl CircuitBreaker {
    /// Create a closed breaker with the given trip threshold and open timeout.
    pub fn new(threshold: u32, timeout: Duration) -> Self {
        Self {
            threshold,
            timeout,
            state: CircuitState::Closed,
            failure_count: 0,
            opened_at: None,
            opened_at_wall: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Failures counted since the last reset.
    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Check whether the breaker is open, performing the time-triggered
    /// open -> half-open transition when the timeout has elapsed.
    pub fn is_open(&mut self) -> bool {
        if self.state == CircuitState::Open {
            let timed_out = self
                .opened_at
                .is_some_and(|opened| opened.elapsed() >= self.timeout);
            if timed_out {
                self.transition_to_half_open();
                return false;
            }
            return true;
        }
        false
    }

    /// Record a failed attempt. Returns true if this failure tripped the
    /// breaker open.
    pub fn record_failure(&mut self) -> bool {
        self.failure_count = self.failure_count.saturating_add(1);
        if self.state != CircuitState::Open && self.failure_count >= self.threshold {
            self.trip();
            return true;
        }
        false
    }

    /// Record a successful attempt: close the breaker and clear the count.
    pub fn record_success(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.opened_at = None;
        self.opened_at_wall = None;
    }

    fn trip(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.opened_at_wall = Some(Utc::now());
    }

    fn transition_to_half_open(&mut self) {
        self.state = CircuitState::HalfOpen;
        self.failure_count = 0;
        self.opened_at = None;
    }

    /// Read-only snapshot for metrics.
    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        CircuitBreakerSnapshot {
            state: self.state,
            failure_count: self.failure_count,
            opened_at: self.opened_at_wall,
        }
    }
}

/// Per-source breaker state as exposed through retry metrics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opened_at: Option<DateTime<Utc>>,
}
