//! Side-effect hooks called by the scheduler and the DLQ
//!
//! The core does not own job persistence or alert delivery. It reports
//! lifecycle changes through these traits; hook failures are logged by the
//! caller and never change the outcome of the retry or DLQ operation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use super::operation::{DispatchReceipt, OperationError};
use crate::dlq::DlqEntry;

/// Errors from the job store hook
#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(String),

    #[error("job store error: {0}")]
    Backend(String),
}

/// Narrow update hook into the order/job store
///
/// Every method defaults to a no-op so integrations implement only what
/// they track.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// A retry was queued for the job
    async fn mark_retry_scheduled(
        &self,
        _job_id: &str,
        _retry_at: DateTime<Utc>,
        _retry_count: u32,
    ) -> Result<(), JobStoreError> {
        Ok(())
    }

    /// The job reached the platform
    async fn mark_synced(&self, _job_id: &str, _receipt: &DispatchReceipt) -> Result<(), JobStoreError> {
        Ok(())
    }

    /// The job was parked in the dead letter queue
    async fn mark_failed(
        &self,
        _job_id: &str,
        _dlq_id: Uuid,
        _error: &OperationError,
    ) -> Result<(), JobStoreError> {
        Ok(())
    }
}

/// Job store that records nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopJobStore;

#[async_trait]
impl JobStore for NoopJobStore {}

/// Notification fired on every DLQ insert
///
/// Called from a spawned task; delivery is fire-and-forget.
#[async_trait]
pub trait AdminNotifier: Send + Sync + 'static {
    async fn notify(&self, entry: &DlqEntry);
}

/// Notifier that writes a warning to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl AdminNotifier for LogNotifier {
    async fn notify(&self, entry: &DlqEntry) {
        warn!(
            dlq_id = %entry.id,
            job_id = %entry.job_id,
            platform = %entry.platform,
            operation = %entry.operation,
            priority = %entry.priority,
            error_code = %entry.last_error.code,
            "job moved to dead letter queue"
        );
    }
}

/// Log a hook failure in the shape used throughout the crate
pub(crate) fn log_hook_error(hook: &'static str, job_id: &str, error: &JobStoreError) {
    warn!(hook, %job_id, error = %error, "job store hook failed");
}
