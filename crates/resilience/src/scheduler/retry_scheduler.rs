//! Retry scheduling over the shared state store
//!
//! # Store layout
//!
//! | Key                    | Kind       | Contents                          |
//! |------------------------|------------|-----------------------------------|
//! | `retry:{retry_id}`     | value      | [`RetryEntry`] JSON, TTL 7 days   |
//! | `retry:queue`          | sorted set | retry ids scored by `retry_at` ms |
//! | `retry:active`         | set        | ids currently claimed             |
//! | `retry:claim:{id}`     | value      | claim lease, TTL `claim_timeout`  |
//!
//! A worker owns a retry id from the moment its `sadd` into `retry:active`
//! succeeds until it removes the id again. Finished entries are removed in
//! the order queue, entry, active set, so a worker that claims an id after
//! another finished it finds the entry gone and skips it.
//!
//! An entry is removed only after its successor (the next retry or the DLQ
//! entry) is written. If that write fails the entry stays queued and becomes
//! claimable again once the claim is released.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::entry::{generate_retry_id, RetryEntry, RetryStatus};
use crate::clock::{add_duration, Clock};
use crate::config::{duration_millis, ConfigError, ConfigSource, PlatformConfig};
use crate::dispatch::{
    log_hook_error, DispatchJob, DispatchOutcome, GuardedDispatcher, JobStore, NoopJobStore,
    OperationError,
};
use crate::dlq::{is_abandoned, DeadLetterQueue, DlqError, NewDlqEntry};
use crate::persistence::{StateStore, StoreError};
use crate::reliability::backoff_millis;

/// Store namespace for the retry queue
pub const RETRY_NAMESPACE: &str = "retry";

/// Sorted set of pending retries
pub const QUEUE_SET: &str = "queue";

/// Set of claimed retry ids
pub const ACTIVE_SET: &str = "active";

/// Error code recorded when automatic retries run out
pub const MAX_RETRIES_EXHAUSTED: &str = "MAX_RETRIES_EXHAUSTED";

fn claim_key(retry_id: &str) -> String {
    format!("claim:{}", retry_id)
}

/// Errors from scheduler operations
///
/// Expected failure paths are reported through [`ScheduleOutcome`] and
/// [`ExecutionOutcome`]; these are contract violations or broken storage.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("dead letter queue error: {0}")]
    Dlq(#[from] DlqError),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for SchedulerError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How long a claim stays valid without being released
    ///
    /// Must exceed the longest expected dispatch; an expired lease lets the
    /// watchdog hand the id to another worker.
    #[serde(with = "duration_millis")]
    pub claim_timeout: Duration,

    /// TTL of stored retry entries
    #[serde(with = "duration_millis")]
    pub entry_ttl: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            claim_timeout: Duration::from_secs(5 * 60),
            entry_ttl: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_claim_timeout(mut self, timeout: Duration) -> Self {
        self.claim_timeout = timeout;
        self
    }

    pub fn with_entry_ttl(mut self, ttl: Duration) -> Self {
        self.entry_ttl = ttl;
        self
    }
}

/// Result of scheduling a retry
#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleOutcome {
    /// Queued for `retry_at`
    Scheduled {
        retry_id: String,
        retry_at: DateTime<Utc>,
        retry_count: u32,
    },
    /// Retries exhausted or error terminal; parked in the DLQ
    DeadLettered { dlq_id: Uuid },
    /// The job was abandoned by an operator; nothing was written
    Abandoned,
}

/// Result of executing one claimed retry
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// The platform accepted the job
    Succeeded,
    /// The attempt failed and the next retry is queued
    Rescheduled {
        retry_id: String,
        retry_at: DateTime<Utc>,
        retry_count: u32,
    },
    /// The breaker refused the call; the same entry runs again at `retry_at`
    Deferred { retry_at: DateTime<Utc> },
    /// The job was parked in the DLQ
    DeadLettered { dlq_id: Uuid },
    /// The job was abandoned; the entry was dropped
    Abandoned,
    /// The entry no longer exists
    Skipped,
}

/// Queue counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    /// Entries waiting in the queue, due or not
    pub queued: u64,
    /// Entries due now
    pub due: u64,
    /// Entries currently claimed
    pub active: u64,
}

/// Schedules, claims and executes retries
///
/// # Example
///
/// ```ignore
/// use dispatch_resilience::scheduler::{RetryScheduler, ScheduleOutcome};
///
/// let scheduler = RetryScheduler::new(store, config_source, dispatcher, dlq, clock);
///
/// // After the first dispatch attempt failed
/// match scheduler.schedule_failure(job, 0, error).await? {
///     ScheduleOutcome::Scheduled { retry_at, .. } => info!(%retry_at, "retry queued"),
///     ScheduleOutcome::DeadLettered { dlq_id } => warn!(%dlq_id, "job dead-lettered"),
///     ScheduleOutcome::Abandoned => {}
/// }
/// ```
pub struct RetryScheduler {
    store: Arc<dyn StateStore>,
    config_source: Arc<dyn ConfigSource>,
    dispatcher: GuardedDispatcher,
    dlq: Arc<DeadLetterQueue>,
    job_store: Arc<dyn JobStore>,
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    /// Active ids seen without a lease on the previous watchdog pass
    suspects: Mutex<HashSet<String>>,
}

impl std::fmt::Debug for RetryScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryScheduler")
            .field("config", &self.config)
            .field("store", &self.store.backend())
            .finish()
    }
}

impl RetryScheduler {
    pub fn new(
        store: Arc<dyn StateStore>,
        config_source: Arc<dyn ConfigSource>,
        dispatcher: GuardedDispatcher,
        dlq: Arc<DeadLetterQueue>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            config_source,
            dispatcher,
            dlq,
            job_store: Arc::new(NoopJobStore),
            config: SchedulerConfig::default(),
            clock,
            suspects: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_job_store(mut self, job_store: Arc<dyn JobStore>) -> Self {
        self.job_store = job_store;
        self
    }

    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// The DLQ shared with manual retries
    pub fn dlq(&self) -> &Arc<DeadLetterQueue> {
        &self.dlq
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    /// Queue the retry that follows `retry_count` attempts
    pub async fn schedule(
        &self,
        job: DispatchJob,
        retry_count: u32,
    ) -> Result<ScheduleOutcome, SchedulerError> {
        self.schedule_with_error(job, retry_count, None).await
    }

    /// Route a failed attempt: terminal errors to the DLQ, retryable ones to the queue
    pub async fn schedule_failure(
        &self,
        job: DispatchJob,
        retry_count: u32,
        error: OperationError,
    ) -> Result<ScheduleOutcome, SchedulerError> {
        if error.retryable {
            return self.schedule_with_error(job, retry_count, Some(error)).await;
        }

        if is_abandoned(self.store.as_ref(), &job.job_id).await? {
            info!(job_id = %job.job_id, "job abandoned, not dead-lettering");
            return Ok(ScheduleOutcome::Abandoned);
        }
        let platform = self.config_source.platform_config(&job.platform).await?;
        let dlq_id = self
            .dead_letter(job, retry_count, platform.max_retries, error)
            .await?;
        Ok(ScheduleOutcome::DeadLettered { dlq_id })
    }

    #[instrument(skip(self, job, last_error), fields(job_id = %job.job_id, platform = %job.platform, operation = %job.operation))]
    async fn schedule_with_error(
        &self,
        job: DispatchJob,
        retry_count: u32,
        last_error: Option<OperationError>,
    ) -> Result<ScheduleOutcome, SchedulerError> {
        if is_abandoned(self.store.as_ref(), &job.job_id).await? {
            info!("job abandoned, not scheduling retry");
            return Ok(ScheduleOutcome::Abandoned);
        }

        let platform = self.config_source.platform_config(&job.platform).await?;

        if retry_count >= platform.max_retries {
            let error = match last_error {
                Some(e) => e.with_code(MAX_RETRIES_EXHAUSTED),
                None => OperationError::terminal("maximum retries exhausted")
                    .with_code(MAX_RETRIES_EXHAUSTED),
            };
            let dlq_id = self
                .dead_letter(job, retry_count, platform.max_retries, error)
                .await?;
            return Ok(ScheduleOutcome::DeadLettered { dlq_id });
        }

        let entry = self.build_entry(job, retry_count, &platform, last_error);
        self.write_entry(&entry).await?;
        self.store
            .zadd(RETRY_NAMESPACE, QUEUE_SET, entry.score(), &entry.retry_id)
            .await?;

        info!(
            retry_id = %entry.retry_id,
            retry_count = entry.retry_count,
            retry_at = %entry.retry_at,
            "retry scheduled"
        );

        if let Err(e) = self
            .job_store
            .mark_retry_scheduled(&entry.job_id, entry.retry_at, entry.retry_count)
            .await
        {
            log_hook_error("mark_retry_scheduled", &entry.job_id, &e);
        }

        Ok(ScheduleOutcome::Scheduled {
            retry_id: entry.retry_id,
            retry_at: entry.retry_at,
            retry_count: entry.retry_count,
        })
    }

    fn build_entry(
        &self,
        job: DispatchJob,
        retry_count: u32,
        platform: &PlatformConfig,
        last_error: Option<OperationError>,
    ) -> RetryEntry {
        let now = self.clock.now();
        let delay_ms = backoff_millis(
            retry_count,
            platform.base_delay.as_millis() as u64,
            platform.max_delay.as_millis() as u64,
            platform.jitter_factor,
        );
        let retry_at = add_duration(now, Duration::from_millis(delay_ms));

        RetryEntry {
            retry_id: generate_retry_id(&job, now),
            job_id: job.job_id,
            platform: job.platform,
            operation: job.operation,
            payload: job.payload,
            hints: job.hints,
            retry_count: retry_count + 1,
            max_retries: platform.max_retries,
            scheduled_at: now,
            retry_at,
            status: RetryStatus::Scheduled,
            last_error,
        }
    }

    async fn dead_letter(
        &self,
        job: DispatchJob,
        retry_count: u32,
        max_retries: u32,
        error: OperationError,
    ) -> Result<Uuid, SchedulerError> {
        let entry = self
            .dlq
            .insert(NewDlqEntry {
                job_id: job.job_id,
                platform: job.platform,
                operation: job.operation,
                payload: job.payload,
                error,
                retry_count,
                max_retries,
                hints: job.hints,
            })
            .await?;
        Ok(entry.id)
    }

    // =========================================================================
    // Claiming
    // =========================================================================

    /// Claim up to `limit` due retries
    ///
    /// An id is returned only to the caller whose `sadd` into the active set
    /// succeeded, so concurrent callers never share an id.
    #[instrument(skip(self))]
    pub async fn claim_ready(&self, limit: usize) -> Result<Vec<String>, SchedulerError> {
        if limit == 0 {
            return Ok(vec![]);
        }

        let now = self.clock.now();
        // Claimed entries stay queued until they finish, so look past them
        let in_flight = self.store.smembers(RETRY_NAMESPACE, ACTIVE_SET).await?.len();
        let candidates = self
            .store
            .zrange_by_score(
                RETRY_NAMESPACE,
                QUEUE_SET,
                f64::NEG_INFINITY,
                now.timestamp_millis() as f64,
                Some(limit.saturating_add(in_flight)),
            )
            .await?;

        let mut claimed = Vec::with_capacity(limit);
        for retry_id in candidates {
            if claimed.len() == limit {
                break;
            }
            if !self.store.sadd(RETRY_NAMESPACE, ACTIVE_SET, &retry_id).await? {
                continue;
            }
            self.store
                .set(
                    RETRY_NAMESPACE,
                    &claim_key(&retry_id),
                    &now.to_rfc3339(),
                    Some(self.config.claim_timeout),
                )
                .await?;

            match self.load_entry(&retry_id).await? {
                Some(entry) if entry.is_due(now) => claimed.push(retry_id),
                Some(_) => {
                    // Re-queued for later between our read and our claim
                    self.release(&retry_id).await?;
                }
                None => {
                    debug!(%retry_id, "queued retry has no entry, dropping");
                    self.store.zrem(RETRY_NAMESPACE, QUEUE_SET, &retry_id).await?;
                    self.release(&retry_id).await?;
                }
            }
        }

        if !claimed.is_empty() {
            debug!(count = claimed.len(), "claimed retries");
        }
        Ok(claimed)
    }

    /// Give up a claim
    pub async fn release(&self, retry_id: &str) -> Result<(), SchedulerError> {
        self.store.srem(RETRY_NAMESPACE, ACTIVE_SET, retry_id).await?;
        self.store.delete(RETRY_NAMESPACE, &claim_key(retry_id)).await?;
        Ok(())
    }

    /// Release claims whose lease expired
    ///
    /// An id must be seen without a lease on two consecutive passes before
    /// it is released, which covers the gap between a claimer's `sadd` and
    /// its lease write.
    #[instrument(skip(self))]
    pub async fn reclaim_stale(&self) -> Result<Vec<String>, SchedulerError> {
        let active = self.store.smembers(RETRY_NAMESPACE, ACTIVE_SET).await?;

        let mut unleased = HashSet::new();
        for retry_id in active {
            if self
                .store
                .get(RETRY_NAMESPACE, &claim_key(&retry_id))
                .await?
                .is_none()
            {
                unleased.insert(retry_id);
            }
        }

        let mut stale: Vec<String> = {
            let mut suspects = self.suspects.lock();
            let stale: Vec<String> = unleased.intersection(&suspects).cloned().collect();
            for retry_id in &stale {
                unleased.remove(retry_id);
            }
            *suspects = unleased;
            stale
        };
        stale.sort();

        for retry_id in &stale {
            self.store.srem(RETRY_NAMESPACE, ACTIVE_SET, retry_id).await?;
            warn!(%retry_id, "released stale retry claim");
        }

        Ok(stale)
    }

    /// Queue counters
    pub async fn stats(&self) -> Result<SchedulerStats, SchedulerError> {
        let now = self.clock.now().timestamp_millis() as f64;
        let queued = self.store.zcard(RETRY_NAMESPACE, QUEUE_SET).await?;
        let due = self
            .store
            .zrange_by_score(RETRY_NAMESPACE, QUEUE_SET, f64::NEG_INFINITY, now, None)
            .await?
            .len() as u64;
        let active = self.store.smembers(RETRY_NAMESPACE, ACTIVE_SET).await?.len() as u64;
        Ok(SchedulerStats { queued, due, active })
    }

    /// Stored entry for `retry_id`
    pub async fn load_entry(&self, retry_id: &str) -> Result<Option<RetryEntry>, SchedulerError> {
        match self.store.get(RETRY_NAMESPACE, retry_id).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn write_entry(&self, entry: &RetryEntry) -> Result<(), SchedulerError> {
        let json = serde_json::to_string(entry)?;
        self.store
            .set(RETRY_NAMESPACE, &entry.retry_id, &json, Some(self.config.entry_ttl))
            .await?;
        Ok(())
    }

    /// Drop an entry from the queue and storage; the claim is released separately
    async fn remove_entry(&self, retry_id: &str) -> Result<(), SchedulerError> {
        self.store.zrem(RETRY_NAMESPACE, QUEUE_SET, retry_id).await?;
        self.store.delete(RETRY_NAMESPACE, retry_id).await?;
        Ok(())
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Execute a claimed retry and release the claim
    #[instrument(skip(self))]
    pub async fn execute(&self, retry_id: &str) -> Result<ExecutionOutcome, SchedulerError> {
        let result = self.execute_claimed(retry_id).await;

        if let Err(e) = self.release(retry_id).await {
            error!(%retry_id, error = %e, "failed to release retry claim");
        }

        match &result {
            Ok(outcome) => debug!(%retry_id, ?outcome, "retry executed"),
            Err(e) => error!(%retry_id, error = %e, "retry execution failed"),
        }
        result
    }

    async fn execute_claimed(&self, retry_id: &str) -> Result<ExecutionOutcome, SchedulerError> {
        let Some(mut entry) = self.load_entry(retry_id).await? else {
            return Ok(ExecutionOutcome::Skipped);
        };

        if is_abandoned(self.store.as_ref(), &entry.job_id).await? {
            self.remove_entry(retry_id).await?;
            info!(job_id = %entry.job_id, "job abandoned, dropping retry");
            return Ok(ExecutionOutcome::Abandoned);
        }

        entry.status = RetryStatus::Processing;
        self.write_entry(&entry).await?;

        let outcome = self
            .dispatcher
            .dispatch(&entry.platform, &entry.operation, &entry.payload)
            .await?;

        match outcome {
            DispatchOutcome::Succeeded(receipt) => {
                self.remove_entry(retry_id).await?;
                info!(
                    job_id = %entry.job_id,
                    retry_count = entry.retry_count,
                    "retry succeeded"
                );
                if let Err(e) = self.job_store.mark_synced(&entry.job_id, &receipt).await {
                    log_hook_error("mark_synced", &entry.job_id, &e);
                }
                Ok(ExecutionOutcome::Succeeded)
            }

            DispatchOutcome::Rejected { retry_after } => {
                // Breaker rejection does not consume a retry slot
                entry.status = RetryStatus::Scheduled;
                entry.retry_at = add_duration(self.clock.now(), retry_after);
                self.write_entry(&entry).await?;
                self.store
                    .zadd(RETRY_NAMESPACE, QUEUE_SET, entry.score(), retry_id)
                    .await?;
                debug!(
                    job_id = %entry.job_id,
                    retry_at = %entry.retry_at,
                    "circuit open, retry deferred"
                );
                Ok(ExecutionOutcome::Deferred {
                    retry_at: entry.retry_at,
                })
            }

            DispatchOutcome::Failed(error) if error.retryable => {
                warn!(
                    job_id = %entry.job_id,
                    retry_count = entry.retry_count,
                    error = %error,
                    "retry failed"
                );
                let retry_count = entry.retry_count;
                let next = self
                    .schedule_with_error(entry.job(), retry_count, Some(error))
                    .await?;
                self.remove_entry(retry_id).await?;
                match next {
                    ScheduleOutcome::Scheduled {
                        retry_id,
                        retry_at,
                        retry_count,
                    } => Ok(ExecutionOutcome::Rescheduled {
                        retry_id,
                        retry_at,
                        retry_count,
                    }),
                    ScheduleOutcome::DeadLettered { dlq_id } => {
                        Ok(ExecutionOutcome::DeadLettered { dlq_id })
                    }
                    ScheduleOutcome::Abandoned => Ok(ExecutionOutcome::Abandoned),
                }
            }

            DispatchOutcome::Failed(error) => {
                warn!(
                    job_id = %entry.job_id,
                    error = %error,
                    "retry failed with terminal error"
                );
                let dlq_id = self
                    .dead_letter(entry.job(), entry.retry_count, entry.max_retries, error)
                    .await?;
                self.remove_entry(retry_id).await?;
                Ok(ExecutionOutcome::DeadLettered { dlq_id })
            }
        }
    }
}
