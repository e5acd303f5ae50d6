//! Reliability patterns for courier dispatch
//!
//! This module provides:
//! - [`CircuitBreaker`] - Per-platform breaker with shared state
//! - [`CircuitBreakerRegistry`] - One breaker per platform, injected by handle
//! - [`backoff_millis`] - Exponential backoff with jitter

mod circuit_breaker;
mod distributed_circuit_breaker;
mod registry;
mod retry;

pub use circuit_breaker::{
    CircuitBreakerConfig, CircuitMetrics, CircuitSnapshot, CircuitState, StateChange,
    MAX_STATE_CHANGES, MAX_WINDOW_EVENTS,
};
pub use distributed_circuit_breaker::{
    state_key, CircuitBreaker, CircuitBreakerError, CircuitStatus, CIRCUIT_NAMESPACE,
    CIRCUIT_STATE_TTL,
};
pub use registry::CircuitBreakerRegistry;
pub use retry::{backoff_millis, backoff_millis_with, BackoffPolicy};
