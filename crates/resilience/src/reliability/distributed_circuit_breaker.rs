//! Per-platform circuit breaker with state shared through the StateStore
//!
//! Each process keeps a local copy of the breaker snapshot so admission and
//! rejection never wait on the store. Transitions are written through before
//! `execute` returns; counter-only updates are written from a background task.
//! The local copy is refreshed from the store at most once per refresh
//! interval, adopting newer state written by other workers.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::circuit_breaker::{
    push_capped, CircuitBreakerConfig, CircuitMetrics, CircuitSnapshot, CircuitState, StateChange,
};
use crate::clock::{elapsed_between, Clock};
use crate::persistence::StateStore;

/// Store namespace for breaker snapshots
pub const CIRCUIT_NAMESPACE: &str = "circuitbreaker";

/// TTL of persisted breaker snapshots
pub const CIRCUIT_STATE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Store key of a platform's snapshot
pub fn state_key(platform: &str) -> String {
    format!("{}:state", platform)
}

/// Error types for circuit breaker operations
#[derive(Debug, Error)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, calls are not allowed
    #[error("circuit breaker is open, retry after {}ms", retry_after.as_millis())]
    Open { retry_after: Duration },

    /// Circuit is in half-open state with no probe permits available
    #[error("circuit breaker half-open, no permits available")]
    HalfOpenExhausted,

    /// The wrapped operation failed
    #[error("operation failed: {0}")]
    Operation(E),
}

impl<E> CircuitBreakerError<E> {
    /// Whether the call was rejected without running the operation
    pub fn is_rejection(&self) -> bool {
        !matches!(self, Self::Operation(_))
    }

    /// The operation error, if the operation ran
    pub fn into_operation(self) -> Option<E> {
        match self {
            Self::Operation(e) => Some(e),
            _ => None,
        }
    }
}

/// Point-in-time view of a breaker, for admin tooling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitStatus {
    pub platform: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub window_failures: usize,
    pub window_calls: usize,
    pub failure_rate: f64,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_state_change_at: Option<DateTime<Utc>>,
    /// Time until a probe is admitted, when open
    pub retry_after_ms: Option<u64>,
    pub time_open_ms: u64,
    pub success_rate: f64,
    pub config: CircuitBreakerConfig,
    pub metrics: CircuitMetrics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Permit {
    /// Admitted while closed
    Normal,
    /// Admitted as a half-open probe
    Probe,
}

struct LocalState {
    snapshot: CircuitSnapshot,
    half_open_in_flight: u32,
    last_refresh: Option<DateTime<Utc>>,
}

/// What a mutation needs written to the store
enum Persist {
    /// Nothing changed
    Skip,
    /// Counters changed, write in the background
    Background(CircuitSnapshot),
    /// A transition happened, write before returning
    Transition(CircuitSnapshot, StateChange),
}

struct BreakerShared {
    platform: String,
    config: RwLock<CircuitBreakerConfig>,
    local: Mutex<LocalState>,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    refresh_interval: Duration,
    refreshing: AtomicBool,
    /// Highest revision written so far; serializes writes
    written: tokio::sync::Mutex<u64>,
}

/// Circuit breaker for one courier platform
///
/// Cheap to clone; clones share state.
///
/// # Example
///
/// ```ignore
/// use dispatch_resilience::reliability::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError};
///
/// let breaker = CircuitBreaker::new("swiftship", CircuitBreakerConfig::default(), store, clock);
///
/// match breaker.execute(|| client.submit_order(&order)).await {
///     Ok(receipt) => { /* delivered */ }
///     Err(CircuitBreakerError::Open { retry_after }) => { /* fail fast */ }
///     Err(CircuitBreakerError::HalfOpenExhausted) => { /* probe in flight */ }
///     Err(CircuitBreakerError::Operation(e)) => { /* classify and retry */ }
/// }
/// ```
#[derive(Clone)]
pub struct CircuitBreaker {
    shared: Arc<BreakerShared>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("platform", &self.shared.platform)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a closed breaker
    pub fn new(
        platform: impl Into<String>,
        config: CircuitBreakerConfig,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let platform = platform.into();
        let snapshot = CircuitSnapshot::new(platform.clone(), config.clone(), clock.now());
        Self::from_snapshot(snapshot, config, store, clock)
    }

    /// Create a breaker, restoring persisted state when present
    pub async fn restore(
        platform: impl Into<String>,
        config: CircuitBreakerConfig,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let platform = platform.into();
        let snapshot = match load_snapshot(store.as_ref(), &platform).await {
            Some(mut snapshot) => {
                debug!(%platform, state = %snapshot.state, "restored circuit breaker state");
                snapshot.config = config.clone();
                snapshot
            }
            None => CircuitSnapshot::new(platform.clone(), config.clone(), clock.now()),
        };
        let breaker = Self::from_snapshot(snapshot, config, store, clock);
        breaker.shared.local.lock().last_refresh = Some(breaker.shared.clock.now());
        breaker
    }

    fn from_snapshot(
        snapshot: CircuitSnapshot,
        config: CircuitBreakerConfig,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let written = snapshot.revision;
        Self {
            shared: Arc::new(BreakerShared {
                platform: snapshot.platform.clone(),
                config: RwLock::new(config),
                local: Mutex::new(LocalState {
                    snapshot,
                    half_open_in_flight: 0,
                    last_refresh: None,
                }),
                store,
                clock,
                refresh_interval: Duration::from_secs(1),
                refreshing: AtomicBool::new(false),
                written: tokio::sync::Mutex::new(written),
            }),
        }
    }

    /// Set how often the local copy is refreshed from the store
    ///
    /// Must be called before the breaker is shared.
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.refresh_interval = interval;
        }
        self
    }

    /// Platform key
    pub fn platform(&self) -> &str {
        &self.shared.platform
    }

    /// Current configuration
    pub fn config(&self) -> CircuitBreakerConfig {
        self.shared.config.read().clone()
    }

    /// Current state
    pub fn state(&self) -> CircuitState {
        self.shared.local.lock().snapshot.state
    }

    /// Copy of the current snapshot
    pub fn snapshot(&self) -> CircuitSnapshot {
        self.shared.local.lock().snapshot.clone()
    }

    /// Run `operation` through the breaker
    ///
    /// Rejections return immediately without invoking the operation.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let config = self.config();
        if !config.enabled {
            return operation().await.map_err(CircuitBreakerError::Operation);
        }

        self.schedule_refresh();

        let (permit, persist) = self.admit(&config)?;
        self.persist(persist).await;

        let result = operation().await;

        let persist = self.record(permit, result.is_ok(), &config);
        self.persist(persist).await;

        result.map_err(CircuitBreakerError::Operation)
    }

    /// Status for admin tooling
    pub fn status(&self) -> CircuitStatus {
        let config = self.config();
        let now = self.shared.clock.now();
        let mut local = self.shared.local.lock();
        local.snapshot.prune_window(config.window_size, now);
        let snapshot = &local.snapshot;

        let retry_after_ms = (snapshot.state == CircuitState::Open).then(|| {
            let since = snapshot
                .last_failure_at
                .or(snapshot.last_state_change_at)
                .unwrap_or(now);
            config
                .timeout
                .saturating_sub(elapsed_between(since, now))
                .as_millis() as u64
        });

        CircuitStatus {
            platform: snapshot.platform.clone(),
            state: snapshot.state,
            failure_count: snapshot.failure_count,
            success_count: snapshot.success_count,
            window_failures: snapshot.failure_timestamps.len(),
            window_calls: snapshot.failure_timestamps.len() + snapshot.success_timestamps.len(),
            failure_rate: snapshot.failure_rate(config.failure_threshold),
            last_failure_at: snapshot.last_failure_at,
            last_state_change_at: snapshot.last_state_change_at,
            retry_after_ms,
            time_open_ms: snapshot.time_open(now).as_millis() as u64,
            success_rate: snapshot.metrics.success_rate(),
            config,
            metrics: snapshot.metrics.clone(),
        }
    }

    /// Force the breaker closed and clear its failure history
    pub async fn reset(&self) {
        let now = self.shared.clock.now();
        let persist = {
            let mut local = self.shared.local.lock();
            let snapshot = &mut local.snapshot;
            let change = if snapshot.state != CircuitState::Closed {
                Some(snapshot.transition(CircuitState::Closed, now))
            } else {
                snapshot.failure_count = 0;
                snapshot.success_count = 0;
                snapshot.failure_timestamps.clear();
                snapshot.success_timestamps.clear();
                None
            };
            snapshot.last_failure_at = None;
            snapshot.touch(now);
            local.half_open_in_flight = 0;

            let snapshot = local.snapshot.clone();
            match change {
                Some(change) => Persist::Transition(snapshot, change),
                None => Persist::Background(snapshot),
            }
        };

        info!(platform = %self.shared.platform, "circuit breaker reset");
        // Resets are operator actions; always write through
        match persist {
            Persist::Background(snapshot) => {
                write_snapshot(&self.shared, snapshot).await;
            }
            other => self.persist(other).await,
        }
    }

    /// Replace the configuration; state is kept
    pub async fn update_config(&self, config: CircuitBreakerConfig) {
        *self.shared.config.write() = config.clone();
        let snapshot = {
            let now = self.shared.clock.now();
            let mut local = self.shared.local.lock();
            local.snapshot.config = config;
            local.snapshot.touch(now);
            local.snapshot.clone()
        };
        info!(platform = %self.shared.platform, "circuit breaker config updated");
        write_snapshot(&self.shared, snapshot).await;
    }

    /// Re-read the store now, adopting newer state
    pub async fn refresh(&self) {
        refresh_from_store(&self.shared).await;
    }

    // =========================================================================
    // State machine
    // =========================================================================

    fn admit<E>(&self, config: &CircuitBreakerConfig) -> Result<(Permit, Persist), CircuitBreakerError<E>> {
        let now = self.shared.clock.now();
        let mut local = self.shared.local.lock();

        match local.snapshot.state {
            CircuitState::Closed => Ok((Permit::Normal, Persist::Skip)),
            CircuitState::Open => {
                let since = local
                    .snapshot
                    .last_failure_at
                    .or(local.snapshot.last_state_change_at)
                    .unwrap_or(now);
                let elapsed = elapsed_between(since, now);

                if elapsed < config.timeout {
                    return Err(CircuitBreakerError::Open {
                        retry_after: config.timeout - elapsed,
                    });
                }

                let change = local.snapshot.transition(CircuitState::HalfOpen, now);
                local.snapshot.touch(now);
                local.half_open_in_flight = 1;
                log_transition(&self.shared.platform, &change);
                Ok((
                    Permit::Probe,
                    Persist::Transition(local.snapshot.clone(), change),
                ))
            }
            CircuitState::HalfOpen => {
                let admitted = local.half_open_in_flight + local.snapshot.success_count;
                if admitted >= config.half_open_requests {
                    return Err(CircuitBreakerError::HalfOpenExhausted);
                }
                local.half_open_in_flight += 1;
                Ok((Permit::Probe, Persist::Skip))
            }
        }
    }

    fn record(&self, permit: Permit, success: bool, config: &CircuitBreakerConfig) -> Persist {
        let now = self.shared.clock.now();
        let mut local = self.shared.local.lock();

        if permit == Permit::Probe {
            local.half_open_in_flight = local.half_open_in_flight.saturating_sub(1);
        }

        let snapshot = &mut local.snapshot;
        snapshot.metrics.total_requests += 1;
        if success {
            snapshot.metrics.total_successes += 1;
        } else {
            snapshot.metrics.total_failures += 1;
        }

        let change = match (snapshot.state, permit) {
            (CircuitState::Closed, Permit::Normal) => {
                snapshot.prune_window(config.window_size, now);
                if success {
                    push_capped(&mut snapshot.success_timestamps, now);
                    snapshot.failure_count = snapshot.failure_count.saturating_sub(1);
                    None
                } else {
                    let quiet = snapshot
                        .last_failure_at
                        .is_some_and(|at| elapsed_between(at, now) >= config.reset_timeout);
                    if quiet {
                        snapshot.failure_count = 0;
                    }
                    snapshot.failure_count += 1;
                    snapshot.last_failure_at = Some(now);
                    push_capped(&mut snapshot.failure_timestamps, now);

                    let rate = snapshot.failure_rate(config.failure_threshold);
                    if snapshot.failure_count >= config.failure_threshold || rate > 0.5 {
                        debug!(
                            platform = %snapshot.platform,
                            failure_count = snapshot.failure_count,
                            failure_rate = rate,
                            "failure threshold reached"
                        );
                        Some(snapshot.transition(CircuitState::Open, now))
                    } else {
                        None
                    }
                }
            }
            (CircuitState::HalfOpen, Permit::Probe) => {
                if success {
                    snapshot.success_count += 1;
                    if snapshot.success_count >= config.half_open_requests {
                        Some(snapshot.transition(CircuitState::Closed, now))
                    } else {
                        None
                    }
                } else {
                    snapshot.last_failure_at = Some(now);
                    Some(snapshot.transition(CircuitState::Open, now))
                }
            }
            // State moved on while the call was in flight; only metrics count
            _ => None,
        };

        snapshot.touch(now);
        if change.is_some() {
            local.half_open_in_flight = 0;
        }

        let snapshot = local.snapshot.clone();
        match change {
            Some(change) => {
                log_transition(&self.shared.platform, &change);
                Persist::Transition(snapshot, change)
            }
            None => Persist::Background(snapshot),
        }
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    async fn persist(&self, persist: Persist) {
        match persist {
            Persist::Skip => {}
            Persist::Transition(snapshot, _) => {
                write_snapshot(&self.shared, snapshot).await;
            }
            Persist::Background(snapshot) => {
                let shared = Arc::clone(&self.shared);
                tokio::spawn(async move {
                    write_snapshot(&shared, snapshot).await;
                });
            }
        }
    }

    fn schedule_refresh(&self) {
        let now = self.shared.clock.now();
        {
            let local = self.shared.local.lock();
            let stale = local
                .last_refresh
                .map(|at| elapsed_between(at, now) >= self.shared.refresh_interval)
                .unwrap_or(true);
            if !stale {
                return;
            }
        }
        if self.shared.refreshing.swap(true, Ordering::SeqCst) {
            return;
        }

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            refresh_from_store(&shared).await;
            shared.refreshing.store(false, Ordering::SeqCst);
        });
    }
}

fn log_transition(platform: &str, change: &StateChange) {
    match change.to {
        CircuitState::Open => warn!(
            %platform,
            from = %change.from,
            to = %change.to,
            "circuit breaker opened"
        ),
        _ => info!(
            %platform,
            from = %change.from,
            to = %change.to,
            "circuit breaker state changed"
        ),
    }
}

async fn load_snapshot(store: &dyn StateStore, platform: &str) -> Option<CircuitSnapshot> {
    match store.get(CIRCUIT_NAMESPACE, &state_key(platform)).await {
        Ok(Some(json)) => match serde_json::from_str(&json) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(%platform, error = %e, "discarding unreadable circuit breaker state");
                None
            }
        },
        Ok(None) => None,
        Err(e) => {
            warn!(%platform, error = %e, "failed to load circuit breaker state");
            None
        }
    }
}

async fn write_snapshot(shared: &BreakerShared, snapshot: CircuitSnapshot) {
    let mut written = shared.written.lock().await;
    if snapshot.revision <= *written {
        return;
    }

    let json = match serde_json::to_string(&snapshot) {
        Ok(json) => json,
        Err(e) => {
            warn!(platform = %shared.platform, error = %e, "failed to encode circuit breaker state");
            return;
        }
    };

    match shared
        .store
        .set(
            CIRCUIT_NAMESPACE,
            &state_key(&shared.platform),
            &json,
            Some(CIRCUIT_STATE_TTL),
        )
        .await
    {
        Ok(()) => *written = snapshot.revision,
        Err(e) => warn!(platform = %shared.platform, error = %e, "failed to persist circuit breaker state"),
    }
}

async fn refresh_from_store(shared: &BreakerShared) {
    let stored = load_snapshot(shared.store.as_ref(), &shared.platform).await;
    let now = shared.clock.now();
    let mut local = shared.local.lock();
    local.last_refresh = Some(now);

    let Some(stored) = stored else {
        return;
    };

    let newer_transition = match (stored.last_state_change_at, local.snapshot.last_state_change_at) {
        (Some(remote), Some(mine)) => remote > mine,
        (Some(_), None) => true,
        _ => false,
    };
    if !newer_transition && stored.revision <= local.snapshot.revision {
        return;
    }

    let config = local.snapshot.config.clone();
    let local_revision = local.snapshot.revision;
    let previous = local.snapshot.state;

    local.snapshot = stored;
    local.snapshot.config = config;
    local.snapshot.revision = local.snapshot.revision.max(local_revision);
    if local.snapshot.state != previous {
        local.half_open_in_flight = 0;
        debug!(
            platform = %shared.platform,
            from = %previous,
            to = %local.snapshot.state,
            "adopted circuit breaker state from store"
        );
    }
}
