//! StateStore trait definition

use std::time::Duration;

use async_trait::async_trait;

/// Error type for store operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Backend is unreachable (connection refused, dropped, timed out)
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Backend rejected the command
    #[error("store command failed: {0}")]
    Command(String),

    /// Stored value could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether the error means the backend itself is unreachable
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Build the physical key for a namespaced entry
pub fn namespaced_key(ns: &str, key: &str) -> String {
    format!("{}:{}", ns, key)
}

/// Shared key/value, sorted-set and set store
///
/// All cross-process coordination state lives here: circuit breaker
/// snapshots, the retry queue and its active-claim set, and DLQ abandon
/// marks. Keys are addressed as `(namespace, key)` and stored as
/// `"{namespace}:{key}"`.
///
/// Implementations must give `sadd` set semantics: it returns `true` only
/// for the caller that inserted the member. The retry scheduler relies on
/// that to claim work exclusively.
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    // =========================================================================
    // Key/value
    // =========================================================================

    /// Read a value
    async fn get(&self, ns: &str, key: &str) -> Result<Option<String>, StoreError>;

    /// Write a value, replacing any existing one; `ttl=None` never expires
    async fn set(
        &self,
        ns: &str,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError>;

    /// Delete a value, returning whether it existed
    async fn delete(&self, ns: &str, key: &str) -> Result<bool, StoreError>;

    // =========================================================================
    // Sorted sets
    // =========================================================================

    /// Add or re-score a member
    async fn zadd(&self, ns: &str, set: &str, score: f64, member: &str) -> Result<(), StoreError>;

    /// Members with `min <= score <= max` in ascending score order
    async fn zrange_by_score(
        &self,
        ns: &str,
        set: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> Result<Vec<String>, StoreError>;

    /// Remove a member, returning whether it was present
    async fn zrem(&self, ns: &str, set: &str, member: &str) -> Result<bool, StoreError>;

    /// Number of members
    async fn zcard(&self, ns: &str, set: &str) -> Result<u64, StoreError>;

    // =========================================================================
    // Sets
    // =========================================================================

    /// Add a member, returning `true` only if it was not already present
    async fn sadd(&self, ns: &str, set: &str, member: &str) -> Result<bool, StoreError>;

    /// Whether a member is present
    async fn sismember(&self, ns: &str, set: &str, member: &str) -> Result<bool, StoreError>;

    /// Remove a member, returning whether it was present
    async fn srem(&self, ns: &str, set: &str, member: &str) -> Result<bool, StoreError>;

    /// All members, in no particular order
    async fn smembers(&self, ns: &str, set: &str) -> Result<Vec<String>, StoreError>;

    // =========================================================================
    // Health
    // =========================================================================

    /// Check that the backend is reachable
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    /// Short backend name for logs
    fn backend(&self) -> &'static str;
}
