//! Retry worker
//!
//! This module provides:
//! - [`RetryWorker`] - Polls the retry queue and executes due retries with
//!   bounded concurrency and graceful shutdown

mod pool;

pub use pool::{BatchSummary, RetryWorker, WorkerConfig, WorkerError, WorkerStats, WorkerStatsSnapshot, WorkerStatus};
