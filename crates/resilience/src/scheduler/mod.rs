//! Scheduled retries with exponential backoff
//!
//! This module provides:
//! - [`RetryScheduler`] - Schedules, claims and executes retries
//! - [`RetryEntry`] - One queued retry, stored as JSON in the state store

mod entry;
mod retry_scheduler;

pub use entry::{generate_retry_id, RetryEntry, RetryStatus};
pub use retry_scheduler::{
    ExecutionOutcome, RetryScheduler, ScheduleOutcome, SchedulerConfig, SchedulerError,
    SchedulerStats, ACTIVE_SET, MAX_RETRIES_EXHAUSTED, QUEUE_SET, RETRY_NAMESPACE,
};
