//! Circuit breaker configuration and persisted state

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::{elapsed_between, sub_duration};
use crate::config::duration_millis;

/// Most recent state changes kept in metrics
pub const MAX_STATE_CHANGES: usize = 100;

/// Upper bound on timestamps kept per sliding window
pub const MAX_WINDOW_EVENTS: usize = 1000;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all calls allowed
    Closed,

    /// Failure threshold exceeded - all calls rejected
    Open,

    /// Testing if service recovered - limited calls allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit breaker configuration
///
/// Circuit breakers protect courier platforms from retry storms and the
/// dispatcher from waiting on a dead dependency. When failures exceed a
/// threshold, the circuit "opens" and calls fail fast without reaching the
/// platform.
///
/// # State Machine
///
/// ```text
/// ┌─────────┐  failure threshold  ┌─────────┐     timeout     ┌──────────┐
/// │ Closed  │ ─────────────────► │  Open   │ ──────────────► │ HalfOpen │
/// └─────────┘   or rate > 50%     └─────────┘                 └──────────┘
///      ▲                               ▲        any failure        │
///      │                               └───────────────────────────┤
///      │           half_open_requests successes                    │
///      └───────────────────────────────────────────────────────────┘
/// ```
///
/// # Example
///
/// ```
/// use dispatch_resilience::CircuitBreakerConfig;
/// use std::time::Duration;
///
/// let config = CircuitBreakerConfig::default()
///     .with_failure_threshold(5)
///     .with_timeout(Duration::from_secs(30));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Number of failures required to open the circuit
    pub failure_threshold: u32,

    /// Time to wait after the last failure before probing (open to half-open)
    #[serde(with = "duration_millis")]
    pub timeout: Duration,

    /// Probes admitted in half-open; this many successes close the circuit
    pub half_open_requests: u32,

    /// Quiet period after which a closed circuit forgets earlier failures
    #[serde(with = "duration_millis")]
    pub reset_timeout: Duration,

    /// Sliding window size for the failure rate
    #[serde(with = "duration_millis")]
    pub window_size: Duration,

    /// When false the breaker is a passthrough
    pub enabled: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(60),
            half_open_requests: 1,
            reset_timeout: Duration::from_secs(120),
            window_size: Duration::from_secs(60),
            enabled: true,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new circuit breaker configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the failure threshold to open the circuit
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Set the open timeout (time before probing after the last failure)
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the number of half-open probes
    pub fn with_half_open_requests(mut self, requests: u32) -> Self {
        self.half_open_requests = requests.max(1);
        self
    }

    /// Set the quiet period that clears the closed failure count
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    /// Set the sliding window size for the failure rate
    pub fn with_window_size(mut self, window: Duration) -> Self {
        self.window_size = window;
        self
    }

    /// Enable or disable the breaker
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// A recorded state transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub from: CircuitState,
    pub to: CircuitState,
    pub at: DateTime<Utc>,
}

/// Lifetime counters for a breaker
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitMetrics {
    pub total_requests: u64,
    pub total_failures: u64,
    pub total_successes: u64,
    pub state_changes: Vec<StateChange>,
    /// Accumulated time spent open, excluding the current open period
    #[serde(with = "duration_millis")]
    pub total_time_open: Duration,
    pub last_opened_at: Option<DateTime<Utc>>,
}

impl CircuitMetrics {
    /// Share of requests that succeeded, as a percentage
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            100.0
        } else {
            self.total_successes as f64 / self.total_requests as f64 * 100.0
        }
    }
}

/// Persisted state of one platform's breaker
///
/// Stored as JSON under `circuitbreaker:{platform}:state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub platform: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_state_change_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failure_timestamps: Vec<DateTime<Utc>>,
    #[serde(default)]
    pub success_timestamps: Vec<DateTime<Utc>>,
    pub config: CircuitBreakerConfig,
    #[serde(default)]
    pub metrics: CircuitMetrics,
    /// Incremented on every mutation
    pub revision: u64,
    pub updated_at: DateTime<Utc>,
}

impl CircuitSnapshot {
    /// Fresh closed state
    pub fn new(platform: impl Into<String>, config: CircuitBreakerConfig, now: DateTime<Utc>) -> Self {
        Self {
            platform: platform.into(),
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_at: None,
            last_state_change_at: None,
            failure_timestamps: vec![],
            success_timestamps: vec![],
            config,
            metrics: CircuitMetrics::default(),
            revision: 0,
            updated_at: now,
        }
    }

    /// Drop window entries older than `window`
    pub fn prune_window(&mut self, window: Duration, now: DateTime<Utc>) {
        let cutoff = sub_duration(now, window);
        self.failure_timestamps.retain(|at| *at > cutoff);
        self.success_timestamps.retain(|at| *at > cutoff);
    }

    /// Failure share of calls in the current window
    ///
    /// Zero until the window holds at least `min_calls` calls.
    pub fn failure_rate(&self, min_calls: u32) -> f64 {
        let failures = self.failure_timestamps.len();
        let calls = failures + self.success_timestamps.len();
        if calls == 0 || calls < min_calls as usize {
            return 0.0;
        }
        failures as f64 / calls as f64
    }

    /// Time spent open including the current open period
    pub fn time_open(&self, now: DateTime<Utc>) -> Duration {
        let current = match (self.state, self.metrics.last_opened_at) {
            (CircuitState::Open, Some(opened)) => elapsed_between(opened, now),
            _ => Duration::ZERO,
        };
        self.metrics.total_time_open + current
    }

    /// Move to `to`, resetting counters and windows
    pub fn transition(&mut self, to: CircuitState, now: DateTime<Utc>) -> StateChange {
        let from = self.state;

        if from == CircuitState::Open {
            if let Some(opened) = self.metrics.last_opened_at {
                self.metrics.total_time_open += elapsed_between(opened, now);
            }
        }
        if to == CircuitState::Open {
            self.metrics.last_opened_at = Some(now);
        }

        self.state = to;
        self.failure_count = 0;
        self.success_count = 0;
        self.failure_timestamps.clear();
        self.success_timestamps.clear();
        self.last_state_change_at = Some(now);

        let change = StateChange { from, to, at: now };
        self.metrics.state_changes.push(change.clone());
        if self.metrics.state_changes.len() > MAX_STATE_CHANGES {
            let excess = self.metrics.state_changes.len() - MAX_STATE_CHANGES;
            self.metrics.state_changes.drain(..excess);
        }
        change
    }

    /// Bump the revision after a mutation
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.revision += 1;
        self.updated_at = now;
    }
}

pub(crate) fn push_capped(window: &mut Vec<DateTime<Utc>>, at: DateTime<Utc>) {
    window.push(at);
    if window.len() > MAX_WINDOW_EVENTS {
        let excess = window.len() - MAX_WINDOW_EVENTS;
        window.drain(..excess);
    }
}
