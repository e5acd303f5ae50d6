//! Persistence layer for shared coordination state
//!
//! This module provides:
//! - [`StateStore`] trait for key/value, sorted-set and set operations
//! - [`InMemoryStateStore`] for tests and degraded mode
//! - [`RedisStateStore`] for production
//! - [`FallbackStateStore`] which degrades to memory and reconciles on reconnect

mod fallback;
mod memory;
mod redis_store;
mod store;

pub use fallback::{FallbackConfig, FallbackStateStore};
pub use memory::{InMemoryStateStore, StoreSnapshot};
pub use redis_store::RedisStateStore;
pub use store::{namespaced_key, StateStore, StoreError};
