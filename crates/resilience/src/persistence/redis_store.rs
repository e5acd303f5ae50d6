//! Redis implementation of StateStore
//!
//! Uses the async [`ConnectionManager`], which multiplexes commands over one
//! connection and reconnects on its own after drops. The manager is created
//! lazily so a worker can start while Redis is still down.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::RedisError;
use tokio::sync::RwLock;
use tracing::{debug, error, instrument};

use super::store::{namespaced_key, StateStore, StoreError};

/// Redis implementation of StateStore
///
/// # Example
///
/// ```ignore
/// use dispatch_resilience::persistence::RedisStateStore;
///
/// let store = RedisStateStore::new("redis://localhost:6379")?;
/// store.ping().await?;
/// ```
pub struct RedisStateStore {
    client: redis::Client,
    manager: RwLock<Option<ConnectionManager>>,
}

impl RedisStateStore {
    /// Create a store for the given URL without connecting yet
    pub fn new(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::Command(format!("invalid redis url: {}", e)))?;

        Ok(Self {
            client,
            manager: RwLock::new(None),
        })
    }

    /// Create a store and establish the connection immediately
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let store = Self::new(redis_url)?;
        store.connection().await?;
        Ok(store)
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        if let Some(manager) = self.manager.read().await.as_ref() {
            return Ok(manager.clone());
        }

        let mut slot = self.manager.write().await;
        if let Some(manager) = slot.as_ref() {
            return Ok(manager.clone());
        }

        let manager = ConnectionManager::new(self.client.clone())
            .await
            .map_err(map_redis_error)?;
        debug!("connected to redis");
        *slot = Some(manager.clone());
        Ok(manager)
    }
}

fn map_redis_error(e: RedisError) -> StoreError {
    if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout()
    {
        StoreError::Unavailable(e.to_string())
    } else {
        StoreError::Command(e.to_string())
    }
}

fn score_bound(score: f64) -> String {
    if score == f64::NEG_INFINITY {
        "-inf".to_string()
    } else if score == f64::INFINITY {
        "+inf".to_string()
    } else {
        score.to_string()
    }
}

#[async_trait]
impl StateStore for RedisStateStore {
    #[instrument(skip(self))]
    async fn get(&self, ns: &str, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection().await?;
        let value: Option<String> = redis::cmd("GET")
            .arg(namespaced_key(ns, key))
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                error!("Failed to get key: {}", e);
                map_redis_error(e)
            })?;
        Ok(value)
    }

    #[instrument(skip(self, value))]
    async fn set(
        &self,
        ns: &str,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(namespaced_key(ns, key)).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg((ttl.as_millis() as u64).max(1));
        }

        let _: () = cmd.query_async(&mut conn).await.map_err(|e| {
            error!("Failed to set key: {}", e);
            map_redis_error(e)
        })?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, ns: &str, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let removed: i64 = redis::cmd("DEL")
            .arg(namespaced_key(ns, key))
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                error!("Failed to delete key: {}", e);
                map_redis_error(e)
            })?;
        Ok(removed > 0)
    }

    #[instrument(skip(self))]
    async fn zadd(&self, ns: &str, set: &str, score: f64, member: &str) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: i64 = redis::cmd("ZADD")
            .arg(namespaced_key(ns, set))
            .arg(score)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                error!("Failed to add sorted set member: {}", e);
                map_redis_error(e)
            })?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn zrange_by_score(
        &self,
        ns: &str,
        set: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("ZRANGEBYSCORE");
        cmd.arg(namespaced_key(ns, set))
            .arg(score_bound(min))
            .arg(score_bound(max));
        if let Some(limit) = limit {
            cmd.arg("LIMIT").arg(0).arg(limit);
        }

        let members: Vec<String> = cmd.query_async(&mut conn).await.map_err(|e| {
            error!("Failed to range sorted set: {}", e);
            map_redis_error(e)
        })?;
        Ok(members)
    }

    #[instrument(skip(self))]
    async fn zrem(&self, ns: &str, set: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let removed: i64 = redis::cmd("ZREM")
            .arg(namespaced_key(ns, set))
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                error!("Failed to remove sorted set member: {}", e);
                map_redis_error(e)
            })?;
        Ok(removed > 0)
    }

    #[instrument(skip(self))]
    async fn zcard(&self, ns: &str, set: &str) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;
        let count: u64 = redis::cmd("ZCARD")
            .arg(namespaced_key(ns, set))
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(count)
    }

    #[instrument(skip(self))]
    async fn sadd(&self, ns: &str, set: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let added: i64 = redis::cmd("SADD")
            .arg(namespaced_key(ns, set))
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                error!("Failed to add set member: {}", e);
                map_redis_error(e)
            })?;
        Ok(added > 0)
    }

    #[instrument(skip(self))]
    async fn sismember(&self, ns: &str, set: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let present: bool = redis::cmd("SISMEMBER")
            .arg(namespaced_key(ns, set))
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(present)
    }

    #[instrument(skip(self))]
    async fn srem(&self, ns: &str, set: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let removed: i64 = redis::cmd("SREM")
            .arg(namespaced_key(ns, set))
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                error!("Failed to remove set member: {}", e);
                map_redis_error(e)
            })?;
        Ok(removed > 0)
    }

    #[instrument(skip(self))]
    async fn smembers(&self, ns: &str, set: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection().await?;
        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(namespaced_key(ns, set))
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(members)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_bounds() {
        assert_eq!(score_bound(f64::NEG_INFINITY), "-inf");
        assert_eq!(score_bound(f64::INFINITY), "+inf");
        assert_eq!(score_bound(1700000000000.0), "1700000000000");
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        assert!(RedisStateStore::new("not a url").is_err());
    }
}
