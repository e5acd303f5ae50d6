//! Degrading wrapper around a networked StateStore
//!
//! # Reconnect policy
//!
//! ```text
//!            primary unavailable                 probe ok + reconcile
//! ┌─────────┐ ─────────────────► ┌──────────┐ ─────────────────────► ┌─────────┐
//! │ Primary │                    │ Degraded │                        │ Primary │
//! └─────────┘ ◄───────────────── └──────────┘                        └─────────┘
//!                 (never)            │  ▲
//!                                    └──┘ probe every probe_interval
//! ```
//!
//! While degraded, every call is served by a process-local
//! [`InMemoryStateStore`]. Once a probe succeeds the in-memory contents are
//! drained and reconciled into the primary:
//!
//! - queued retries, their entries and DLQ abandon marks are replayed,
//!   values keeping their remaining TTL;
//! - active claims and their leases are replayed too, so a retry still
//!   executing from the outage stays claimed; a claim whose worker died is
//!   freed by the scheduler's stale-claim watchdog once its lease expires;
//! - circuit breaker state is discarded, since another process may hold a
//!   newer view of the platform.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::memory::{InMemoryStateStore, StoreSnapshot};
use super::store::{StateStore, StoreError};
use crate::clock::{elapsed_between, Clock, SystemClock};
use crate::config::duration_millis;

/// Fallback behavior configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Minimum time between reconnect probes while degraded
    #[serde(with = "duration_millis")]
    pub probe_interval: Duration,

    /// Namespaces whose in-memory contents are dropped on reconnect
    pub discard_namespaces: Vec<String>,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(5),
            discard_namespaces: vec!["circuitbreaker".to_string()],
        }
    }
}

impl FallbackConfig {
    /// Set the probe interval
    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }
}

/// StateStore that degrades to memory when its primary is unreachable
pub struct FallbackStateStore {
    primary: Arc<dyn StateStore>,
    memory: Arc<InMemoryStateStore>,
    config: FallbackConfig,
    clock: Arc<dyn Clock>,
    degraded: AtomicBool,
    last_probe: Mutex<Option<DateTime<Utc>>>,
    reconcile_lock: tokio::sync::Mutex<()>,
}

/// Route a call to the primary, degrading to memory when it is unavailable
macro_rules! route {
    ($self:ident, $op:literal, $store:ident => $call:expr) => {{
        if $self.use_primary().await {
            let $store = &$self.primary;
            match $call.await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_unavailable() => $self.degrade($op, &e),
                Err(e) => return Err(e),
            }
        }
        let $store = &$self.memory;
        $call.await
    }};
}

impl FallbackStateStore {
    /// Wrap `primary` with the default fallback configuration
    pub fn new(primary: Arc<dyn StateStore>) -> Self {
        Self::with_config(primary, FallbackConfig::default(), Arc::new(SystemClock))
    }

    /// Wrap `primary` with explicit configuration and clock
    pub fn with_config(
        primary: Arc<dyn StateStore>,
        config: FallbackConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let memory = Arc::new(InMemoryStateStore::with_clock(Arc::clone(&clock)));
        Self {
            primary,
            memory,
            config,
            clock,
            degraded: AtomicBool::new(false),
            last_probe: Mutex::new(None),
            reconcile_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Start degraded, e.g. when the primary failed its startup ping
    pub fn start_degraded(self) -> Self {
        self.degraded.store(true, Ordering::SeqCst);
        *self.last_probe.lock() = Some(self.clock.now());
        self
    }

    /// Whether calls are currently served from memory
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// The in-memory store used while degraded
    pub fn memory(&self) -> &Arc<InMemoryStateStore> {
        &self.memory
    }

    fn degrade(&self, op: &'static str, e: &StoreError) {
        if !self.degraded.swap(true, Ordering::SeqCst) {
            *self.last_probe.lock() = Some(self.clock.now());
            warn!(
                backend = self.primary.backend(),
                op,
                error = %e,
                "Shared store unavailable, degrading to in-memory store"
            );
        }
    }

    async fn use_primary(&self) -> bool {
        if !self.is_degraded() {
            return true;
        }
        if !self.probe_due() {
            return false;
        }
        self.try_recover().await
    }

    fn probe_due(&self) -> bool {
        let now = self.clock.now();
        let mut last_probe = self.last_probe.lock();
        let due = last_probe
            .map(|at| elapsed_between(at, now) >= self.config.probe_interval)
            .unwrap_or(true);
        if due {
            *last_probe = Some(now);
        }
        due
    }

    /// Probe the primary and reconcile if it answers
    ///
    /// Returns whether the primary is in use again.
    pub async fn try_recover(&self) -> bool {
        let _guard = self.reconcile_lock.lock().await;
        if !self.is_degraded() {
            return true;
        }

        if let Err(e) = self.primary.ping().await {
            warn!(backend = self.primary.backend(), error = %e, "Shared store still unavailable");
            return false;
        }

        // Route new calls to the primary before draining so later writes are not lost
        self.degraded.store(false, Ordering::SeqCst);
        let snapshot = self.memory.drain();

        match self.reconcile(snapshot).await {
            Ok(replayed) => {
                info!(
                    backend = self.primary.backend(),
                    replayed, "Shared store recovered, in-memory state reconciled"
                );
                true
            }
            Err((e, remaining)) => {
                error!(
                    backend = self.primary.backend(),
                    error = %e,
                    remaining = remaining.len(),
                    "Reconciliation failed, staying degraded"
                );
                self.memory.restore(remaining);
                self.degraded.store(true, Ordering::SeqCst);
                false
            }
        }
    }

    async fn reconcile(&self, snapshot: StoreSnapshot) -> Result<usize, (StoreError, StoreSnapshot)> {
        let discard = |ns: &str| self.config.discard_namespaces.iter().any(|d| d == ns);

        let StoreSnapshot {
            values,
            sorted,
            sets,
        } = snapshot;
        let mut replayed = 0;

        let mut values = values.into_iter();
        while let Some((ns, key, value, ttl)) = values.next() {
            if discard(&ns) {
                continue;
            }
            if let Err(e) = self.primary.set(&ns, &key, &value, ttl).await {
                let mut rest = StoreSnapshot {
                    values: vec![(ns, key, value, ttl)],
                    sorted,
                    sets,
                };
                rest.values.extend(values);
                return Err((e, rest));
            }
            replayed += 1;
        }

        let mut sorted = sorted.into_iter();
        while let Some((ns, set, member, score)) = sorted.next() {
            if discard(&ns) {
                continue;
            }
            if let Err(e) = self.primary.zadd(&ns, &set, score, &member).await {
                let mut rest = StoreSnapshot {
                    values: vec![],
                    sorted: vec![(ns, set, member, score)],
                    sets,
                };
                rest.sorted.extend(sorted);
                return Err((e, rest));
            }
            replayed += 1;
        }

        let mut sets = sets.into_iter();
        while let Some((ns, set, member)) = sets.next() {
            if discard(&ns) {
                continue;
            }
            if let Err(e) = self.primary.sadd(&ns, &set, &member).await {
                let mut rest = StoreSnapshot {
                    values: vec![],
                    sorted: vec![],
                    sets: vec![(ns, set, member)],
                };
                rest.sets.extend(sets);
                return Err((e, rest));
            }
            replayed += 1;
        }

        Ok(replayed)
    }
}

#[async_trait]
impl StateStore for FallbackStateStore {
    async fn get(&self, ns: &str, key: &str) -> Result<Option<String>, StoreError> {
        route!(self, "get", store => store.get(ns, key))
    }

    async fn set(
        &self,
        ns: &str,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        route!(self, "set", store => store.set(ns, key, value, ttl))
    }

    async fn delete(&self, ns: &str, key: &str) -> Result<bool, StoreError> {
        route!(self, "delete", store => store.delete(ns, key))
    }

    async fn zadd(&self, ns: &str, set: &str, score: f64, member: &str) -> Result<(), StoreError> {
        route!(self, "zadd", store => store.zadd(ns, set, score, member))
    }

    async fn zrange_by_score(
        &self,
        ns: &str,
        set: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> Result<Vec<String>, StoreError> {
        route!(self, "zrange_by_score", store => store.zrange_by_score(ns, set, min, max, limit))
    }

    async fn zrem(&self, ns: &str, set: &str, member: &str) -> Result<bool, StoreError> {
        route!(self, "zrem", store => store.zrem(ns, set, member))
    }

    async fn zcard(&self, ns: &str, set: &str) -> Result<u64, StoreError> {
        route!(self, "zcard", store => store.zcard(ns, set))
    }

    async fn sadd(&self, ns: &str, set: &str, member: &str) -> Result<bool, StoreError> {
        route!(self, "sadd", store => store.sadd(ns, set, member))
    }

    async fn sismember(&self, ns: &str, set: &str, member: &str) -> Result<bool, StoreError> {
        route!(self, "sismember", store => store.sismember(ns, set, member))
    }

    async fn srem(&self, ns: &str, set: &str, member: &str) -> Result<bool, StoreError> {
        route!(self, "srem", store => store.srem(ns, set, member))
    }

    async fn smembers(&self, ns: &str, set: &str) -> Result<Vec<String>, StoreError> {
        route!(self, "smembers", store => store.smembers(ns, set))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        if self.use_primary().await {
            if let Err(e) = self.primary.ping().await {
                self.degrade("ping", &e);
            }
        }
        Ok(())
    }

    fn backend(&self) -> &'static str {
        if self.is_degraded() {
            "memory-fallback"
        } else {
            self.primary.backend()
        }
    }
}
