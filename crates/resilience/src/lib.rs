//! # Dispatch Resilience
//!
//! Keeps courier dispatch working when the courier platforms do not.
//!
//! ## Features
//!
//! - **Circuit breakers**: One breaker per platform, state shared across instances through the state store
//! - **Scheduled retries**: Exponential backoff with jitter, driven from a time-ordered queue
//! - **Dead letter queue**: PostgreSQL-backed triage of jobs that exhausted retries
//! - **Degraded mode**: Falls back to process memory when Redis is unreachable, reconciles on reconnect
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       RetryWorker                            │
//! │  (polls due retries, bounded concurrency, graceful drain)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      RetryScheduler                          │
//! │  (retry:queue sorted set, claims, backoff, DLQ hand-off)    │
//! └─────────────────────────────────────────────────────────────┘
//!               │                               │
//!               ▼                               ▼
//! ┌───────────────────────────┐   ┌─────────────────────────────┐
//! │    GuardedDispatcher      │   │      DeadLetterQueue        │
//! │ (CircuitBreakerRegistry + │   │ (PostgreSQL, manual retry,  │
//! │  OperationDispatcher)     │   │  resolve, abandon, cleanup) │
//! └───────────────────────────┘   └─────────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        StateStore                            │
//! │  (Redis, with in-memory fallback: FallbackStateStore)       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use dispatch_resilience::prelude::*;
//!
//! let clock: Arc<dyn Clock> = Arc::new(SystemClock);
//! let store: Arc<dyn StateStore> = Arc::new(FallbackStateStore::new(Arc::new(redis)));
//! let breakers = Arc::new(CircuitBreakerRegistry::new(config.clone(), store.clone(), clock.clone()));
//! let dispatcher = GuardedDispatcher::new(breakers, Arc::new(handlers));
//! let dlq = Arc::new(DeadLetterQueue::new(dlq_store, store.clone(), dispatcher.clone(), clock.clone()));
//! let scheduler = Arc::new(RetryScheduler::new(store, config, dispatcher, dlq, clock));
//!
//! let worker = RetryWorker::new(scheduler, WorkerConfig::default());
//! worker.start().await?;
//! ```

pub mod clock;
pub mod config;
pub mod dispatch;
pub mod dlq;
pub mod persistence;
pub mod reliability;
pub mod scheduler;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::config::{ConfigError, ConfigSource, PlatformConfig, StaticConfigSource};
    pub use crate::dispatch::{
        AdminNotifier, DispatchJob, DispatchOutcome, DispatchReceipt, GuardedDispatcher,
        HandlerRegistry, JobHints, JobStore, OperationDispatcher, OperationError, Payload,
    };
    pub use crate::dlq::{
        DeadLetterQueue, DlqConfig, DlqEntry, DlqError, DlqFilter, DlqPriority, DlqStatus, DlqStore,
        InMemoryDlqStore, Pagination, PostgresDlqStore,
    };
    pub use crate::persistence::{
        FallbackStateStore, InMemoryStateStore, RedisStateStore, StateStore, StoreError,
    };
    pub use crate::reliability::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};
    pub use crate::scheduler::{
        ExecutionOutcome, RetryScheduler, ScheduleOutcome, SchedulerConfig, SchedulerError,
    };
    pub use crate::worker::{RetryWorker, WorkerConfig, WorkerError};
}

// Re-export key types at crate root
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, ConfigSource, PlatformConfig, StaticConfigSource};
pub use dispatch::{DispatchJob, GuardedDispatcher, OperationDispatcher, OperationError};
pub use dlq::{DeadLetterQueue, DlqError, DlqStore};
pub use persistence::{FallbackStateStore, StateStore, StoreError};
pub use reliability::{CircuitBreakerConfig, CircuitBreakerRegistry};
pub use scheduler::{RetryScheduler, SchedulerError};
pub use worker::{RetryWorker, WorkerConfig, WorkerError};
