//! In-memory implementation of StateStore

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::store::{StateStore, StoreError};
use crate::clock::{add_duration, elapsed_between, Clock, SystemClock};

type Slot = (String, String);

struct ValueEntry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct MemoryState {
    values: HashMap<Slot, ValueEntry>,
    sorted: HashMap<Slot, HashMap<String, f64>>,
    sets: HashMap<Slot, HashSet<String>>,
}

fn slot(ns: &str, key: &str) -> Slot {
    (ns.to_string(), key.to_string())
}

/// Point-in-time copy of an in-memory store, used to replay state into
/// another backend
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    /// `(ns, key, value, remaining ttl)`
    pub values: Vec<(String, String, String, Option<Duration>)>,
    /// `(ns, set, member, score)`
    pub sorted: Vec<(String, String, String, f64)>,
    /// `(ns, set, member)`
    pub sets: Vec<(String, String, String)>,
}

impl StoreSnapshot {
    /// Whether the snapshot holds nothing
    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.sorted.is_empty() && self.sets.is_empty()
    }

    /// Total number of items
    pub fn len(&self) -> usize {
        self.values.len() + self.sorted.len() + self.sets.len()
    }
}

/// In-memory implementation of StateStore
///
/// Process-local only. Used directly in tests and as the degraded-mode
/// backend behind [`FallbackStateStore`](super::FallbackStateStore).
/// Values expire lazily against the injected clock.
///
/// # Example
///
/// ```
/// use dispatch_resilience::persistence::InMemoryStateStore;
///
/// let store = InMemoryStateStore::new();
/// ```
pub struct InMemoryStateStore {
    state: RwLock<MemoryState>,
    clock: Arc<dyn Clock>,
}

impl InMemoryStateStore {
    /// Create a new in-memory store on the system clock
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a new in-memory store that expires keys against `clock`
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            clock,
        }
    }

    /// Number of live key/value entries
    pub fn value_count(&self) -> usize {
        let now = self.clock.now();
        self.state
            .read()
            .values
            .values()
            .filter(|entry| !is_expired(entry, now))
            .count()
    }

    /// Whether the store holds nothing
    pub fn is_empty(&self) -> bool {
        let state = self.state.read();
        state.values.is_empty()
            && state.sorted.values().all(HashMap::is_empty)
            && state.sets.values().all(HashSet::is_empty)
    }

    /// Copy all live entries
    pub fn snapshot(&self) -> StoreSnapshot {
        let now = self.clock.now();
        let state = self.state.read();
        Self::collect(&state, now)
    }

    /// Take all live entries, leaving the store empty
    pub fn drain(&self) -> StoreSnapshot {
        let now = self.clock.now();
        let mut state = self.state.write();
        let snapshot = Self::collect(&state, now);
        *state = MemoryState::default();
        snapshot
    }

    /// Load entries from a snapshot, overwriting existing keys
    pub fn restore(&self, snapshot: StoreSnapshot) {
        let now = self.clock.now();
        let mut state = self.state.write();
        for (ns, key, value, ttl) in snapshot.values {
            let expires_at = ttl.map(|ttl| add_duration(now, ttl));
            state
                .values
                .insert((ns, key), ValueEntry { value, expires_at });
        }
        for (ns, set, member, score) in snapshot.sorted {
            state.sorted.entry((ns, set)).or_default().insert(member, score);
        }
        for (ns, set, member) in snapshot.sets {
            state.sets.entry((ns, set)).or_default().insert(member);
        }
    }

    /// Remove everything
    pub fn clear(&self) {
        *self.state.write() = MemoryState::default();
    }

    fn collect(state: &MemoryState, now: DateTime<Utc>) -> StoreSnapshot {
        let values = state
            .values
            .iter()
            .filter(|(_, entry)| !is_expired(entry, now))
            .map(|((ns, key), entry)| {
                let ttl = entry.expires_at.map(|at| elapsed_between(now, at));
                (ns.clone(), key.clone(), entry.value.clone(), ttl)
            })
            .collect();

        let sorted = state
            .sorted
            .iter()
            .flat_map(|((ns, set), members)| {
                members
                    .iter()
                    .map(move |(member, score)| (ns.clone(), set.clone(), member.clone(), *score))
            })
            .collect();

        let sets = state
            .sets
            .iter()
            .flat_map(|((ns, set), members)| {
                members
                    .iter()
                    .map(move |member| (ns.clone(), set.clone(), member.clone()))
            })
            .collect();

        StoreSnapshot {
            values,
            sorted,
            sets,
        }
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

fn is_expired(entry: &ValueEntry, now: DateTime<Utc>) -> bool {
    entry.expires_at.is_some_and(|at| at <= now)
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn get(&self, ns: &str, key: &str) -> Result<Option<String>, StoreError> {
        let now = self.clock.now();
        let slot = slot(ns, key);
        {
            let state = self.state.read();
            match state.values.get(&slot) {
                None => return Ok(None),
                Some(entry) if !is_expired(entry, now) => return Ok(Some(entry.value.clone())),
                Some(_) => {}
            }
        }

        // Expired: drop it under the write lock, unless it was rewritten meanwhile
        let mut state = self.state.write();
        if state
            .values
            .get(&slot)
            .is_some_and(|entry| is_expired(entry, now))
        {
            state.values.remove(&slot);
        }
        Ok(None)
    }

    async fn set(
        &self,
        ns: &str,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let expires_at = ttl.map(|ttl| add_duration(self.clock.now(), ttl));
        self.state.write().values.insert(
            slot(ns, key),
            ValueEntry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, ns: &str, key: &str) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let removed = self.state.write().values.remove(&slot(ns, key));
        Ok(removed.is_some_and(|entry| !is_expired(&entry, now)))
    }

    async fn zadd(&self, ns: &str, set: &str, score: f64, member: &str) -> Result<(), StoreError> {
        self.state
            .write()
            .sorted
            .entry(slot(ns, set))
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zrange_by_score(
        &self,
        ns: &str,
        set: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> Result<Vec<String>, StoreError> {
        let state = self.state.read();
        let Some(members) = state.sorted.get(&slot(ns, set)) else {
            return Ok(vec![]);
        };

        let mut matching: Vec<(&String, f64)> = members
            .iter()
            .filter(|(_, score)| **score >= min && **score <= max)
            .map(|(member, score)| (member, *score))
            .collect();
        matching.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));

        Ok(matching
            .into_iter()
            .take(limit.unwrap_or(usize::MAX))
            .map(|(member, _)| member.clone())
            .collect())
    }

    async fn zrem(&self, ns: &str, set: &str, member: &str) -> Result<bool, StoreError> {
        let mut state = self.state.write();
        Ok(state
            .sorted
            .get_mut(&slot(ns, set))
            .is_some_and(|members| members.remove(member).is_some()))
    }

    async fn zcard(&self, ns: &str, set: &str) -> Result<u64, StoreError> {
        Ok(self
            .state
            .read()
            .sorted
            .get(&slot(ns, set))
            .map_or(0, |members| members.len() as u64))
    }

    async fn sadd(&self, ns: &str, set: &str, member: &str) -> Result<bool, StoreError> {
        Ok(self
            .state
            .write()
            .sets
            .entry(slot(ns, set))
            .or_default()
            .insert(member.to_string()))
    }

    async fn sismember(&self, ns: &str, set: &str, member: &str) -> Result<bool, StoreError> {
        Ok(self
            .state
            .read()
            .sets
            .get(&slot(ns, set))
            .is_some_and(|members| members.contains(member)))
    }

    async fn srem(&self, ns: &str, set: &str, member: &str) -> Result<bool, StoreError> {
        let mut state = self.state.write();
        Ok(state
            .sets
            .get_mut(&slot(ns, set))
            .is_some_and(|members| members.remove(member)))
    }

    async fn smembers(&self, ns: &str, set: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .state
            .read()
            .sets
            .get(&slot(ns, set))
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
