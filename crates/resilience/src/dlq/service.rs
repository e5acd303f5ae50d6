//! Dead letter queue service
//!
//! Owns every DLQ entry. The retry scheduler only inserts; operators list,
//! retry, resolve and abandon through this service. Abandoning a job also
//! writes an abandon mark into the shared state store, which the scheduler
//! checks before every scheduling decision.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::priority::PriorityPolicy;
use super::store::{DlqError, DlqStore};
use super::types::{
    BulkRetryError, BulkRetryReport, BulkRetrySelector, DlqEntry, DlqFilter, DlqPage,
    DlqRetryOutcome, DlqStats, DlqStatus, LastError, NewDlqEntry, Pagination, TransitionOutcome,
};
use crate::clock::{sub_duration, Clock};
use crate::config::duration_millis;
use crate::dispatch::{
    log_hook_error, AdminNotifier, DispatchOutcome, GuardedDispatcher, JobStore, LogNotifier,
    NoopJobStore, OperationError,
};
use crate::persistence::{StateStore, StoreError};

/// Store namespace for DLQ marks
pub const DLQ_NAMESPACE: &str = "dlq";

/// Set of job ids that must never be retried again
pub const ABANDONED_SET: &str = "abandoned";

/// Statuses removed by cleanup when none are given
pub const DEFAULT_CLEANUP_STATUSES: [DlqStatus; 2] = [DlqStatus::Resolved, DlqStatus::Abandoned];

/// Whether `job_id` carries an abandon mark
pub async fn is_abandoned(store: &dyn StateStore, job_id: &str) -> Result<bool, StoreError> {
    store.sismember(DLQ_NAMESPACE, ABANDONED_SET, job_id).await
}

/// Dead letter queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DlqConfig {
    /// Operator retries allowed before an entry is abandoned
    pub max_manual_retries: u32,

    /// Maximum entries a filter-based bulk retry touches
    pub bulk_limit: usize,

    /// Entries retried concurrently within one bulk batch
    pub bulk_batch_size: usize,

    /// Default age after which terminal entries are cleaned up
    pub retention_days: u32,

    /// Age after which an entry still marked retrying is returned to pending
    #[serde(with = "duration_millis")]
    pub stale_retry_after: Duration,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            max_manual_retries: 5,
            bulk_limit: 100,
            bulk_batch_size: 10,
            retention_days: 30,
            stale_retry_after: Duration::from_secs(10 * 60),
        }
    }
}

impl DlqConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_manual_retries(mut self, max: u32) -> Self {
        self.max_manual_retries = max.max(1);
        self
    }

    pub fn with_bulk_limit(mut self, limit: usize) -> Self {
        self.bulk_limit = limit;
        self
    }

    pub fn with_bulk_batch_size(mut self, size: usize) -> Self {
        self.bulk_batch_size = size.max(1);
        self
    }

    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention_days = days;
        self
    }

    pub fn with_stale_retry_after(mut self, after: Duration) -> Self {
        self.stale_retry_after = after;
        self
    }
}

/// The dead letter queue
///
/// # Example
///
/// ```ignore
/// use dispatch_resilience::dlq::{DeadLetterQueue, DlqFilter, DlqStatus, Pagination};
///
/// let dlq = DeadLetterQueue::new(store, state, dispatcher, clock);
/// let page = dlq
///     .list(&DlqFilter::default().with_status(DlqStatus::Pending), Pagination::default())
///     .await?;
/// for entry in page.entries {
///     dlq.retry(entry.id).await?;
/// }
/// ```
pub struct DeadLetterQueue {
    store: Arc<dyn DlqStore>,
    state: Arc<dyn StateStore>,
    dispatcher: GuardedDispatcher,
    job_store: Arc<dyn JobStore>,
    notifier: Arc<dyn AdminNotifier>,
    policy: PriorityPolicy,
    config: DlqConfig,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for DeadLetterQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterQueue")
            .field("config", &self.config)
            .field("policy", &self.policy)
            .finish()
    }
}

impl DeadLetterQueue {
    pub fn new(
        store: Arc<dyn DlqStore>,
        state: Arc<dyn StateStore>,
        dispatcher: GuardedDispatcher,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            state,
            dispatcher,
            job_store: Arc::new(NoopJobStore),
            notifier: Arc::new(LogNotifier),
            policy: PriorityPolicy::default(),
            config: DlqConfig::default(),
            clock,
        }
    }

    pub fn with_job_store(mut self, job_store: Arc<dyn JobStore>) -> Self {
        self.job_store = job_store;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn AdminNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_policy(mut self, policy: PriorityPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_config(mut self, config: DlqConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &DlqConfig {
        &self.config
    }

    // =========================================================================
    // Insert and query
    // =========================================================================

    /// Park a failed job
    #[instrument(skip(self, new), fields(job_id = %new.job_id, platform = %new.platform, operation = %new.operation))]
    pub async fn insert(&self, new: NewDlqEntry) -> Result<DlqEntry, DlqError> {
        let now = self.clock.now();
        let priority = self.policy.priority(&new.operation, &new.hints);

        let mut metadata = new.hints.metadata.clone();
        if let Some(amount) = new.hints.amount {
            metadata.insert("amount".to_string(), amount.to_string());
        }
        if new.hints.prepaid {
            metadata.insert("prepaid".to_string(), "true".to_string());
        }

        let entry = DlqEntry {
            id: Uuid::now_v7(),
            job_id: new.job_id,
            platform: new.platform,
            operation: new.operation,
            payload: new.payload,
            last_error: LastError::from_operation(&new.error, now),
            retry_count: new.retry_count,
            max_retries: new.max_retries,
            manual_retry_count: 0,
            status: DlqStatus::Pending,
            priority,
            created_at: now,
            last_attempt_at: Some(now),
            resolved_at: None,
            abandoned_at: None,
            resolved_by: None,
            resolution_notes: None,
            metadata,
            tags: new.hints.tags,
        };

        self.store.insert(&entry).await?;
        info!(
            dlq_id = %entry.id,
            priority = %entry.priority,
            retry_count = entry.retry_count,
            error_code = %entry.last_error.code,
            "job added to dead letter queue"
        );

        if let Err(e) = self.job_store.mark_failed(&entry.job_id, entry.id, &new.error).await {
            log_hook_error("mark_failed", &entry.job_id, &e);
        }

        let notifier = Arc::clone(&self.notifier);
        let notified = entry.clone();
        tokio::spawn(async move {
            notifier.notify(&notified).await;
        });

        Ok(entry)
    }

    /// One page of entries, highest priority and oldest first
    pub async fn list(&self, filter: &DlqFilter, pagination: Pagination) -> Result<DlqPage, DlqError> {
        let (entries, total) = self.store.list(filter, pagination).await?;
        Ok(DlqPage {
            entries,
            total,
            offset: pagination.offset,
            limit: pagination.limit,
        })
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<DlqEntry>, DlqError> {
        self.store.get(id).await
    }

    /// Permanently remove an entry
    #[instrument(skip(self))]
    pub async fn delete(&self, id: Uuid) -> Result<bool, DlqError> {
        let deleted = self.store.delete(id).await?;
        if deleted {
            info!(dlq_id = %id, "DLQ entry deleted");
        }
        Ok(deleted)
    }

    async fn require(&self, id: Uuid) -> Result<DlqEntry, DlqError> {
        self.store.get(id).await?.ok_or(DlqError::NotFound(id))
    }

    // =========================================================================
    // Manual retry
    // =========================================================================

    /// Dispatch an entry's job again
    #[instrument(skip(self))]
    pub async fn retry(&self, id: Uuid) -> Result<DlqRetryOutcome, DlqError> {
        let entry = self.require(id).await?;
        if matches!(entry.status, DlqStatus::Retrying | DlqStatus::Resolved) {
            return Ok(DlqRetryOutcome::Conflict { status: entry.status });
        }

        let now = self.clock.now();
        let mut entry = entry;
        let previous = entry.status;
        entry.status = DlqStatus::Retrying;
        entry.manual_retry_count += 1;
        entry.last_attempt_at = Some(now);

        let retryable_from = [DlqStatus::Pending, DlqStatus::Abandoned, DlqStatus::ManualReview];
        if let Some(status) = self.store.update_if(&entry, &retryable_from).await? {
            return Ok(DlqRetryOutcome::Conflict { status });
        }

        self.clear_abandon_mark(&entry.job_id).await;

        let result = self.dispatch_retry(entry.clone()).await;
        if let Err(e) = &result {
            self.restore_interrupted(entry, previous, e).await;
        }
        result
    }

    async fn dispatch_retry(&self, mut entry: DlqEntry) -> Result<DlqRetryOutcome, DlqError> {
        let outcome = match self
            .dispatcher
            .dispatch(&entry.platform, &entry.operation, &entry.payload)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => DispatchOutcome::Failed(
                OperationError::terminal(e.to_string()).with_code("CONFIG_ERROR"),
            ),
        };

        let now = self.clock.now();
        match outcome {
            DispatchOutcome::Succeeded(receipt) => {
                entry.status = DlqStatus::Resolved;
                entry.resolved_at = Some(now);
                entry.resolved_by = Some("system".to_string());
                entry.resolution_notes = Some("Resolved by manual retry".to_string());
                self.store.update(&entry).await?;

                info!(job_id = %entry.job_id, manual_retry_count = entry.manual_retry_count, "DLQ retry succeeded");
                if let Err(e) = self.job_store.mark_synced(&entry.job_id, &receipt).await {
                    log_hook_error("mark_synced", &entry.job_id, &e);
                }
                Ok(DlqRetryOutcome::Resolved(entry))
            }
            DispatchOutcome::Failed(error) => self.record_failed_retry(entry, &error).await,
            DispatchOutcome::Rejected { retry_after } => {
                let error = OperationError::retryable(format!(
                    "circuit breaker open, retry after {}ms",
                    retry_after.as_millis()
                ))
                .with_code("CIRCUIT_OPEN");
                self.record_failed_retry(entry, &error).await
            }
        }
    }

    /// Put an entry whose retry errored back into its previous status
    async fn restore_interrupted(&self, mut entry: DlqEntry, previous: DlqStatus, cause: &DlqError) {
        entry.status = previous;
        match self.store.update_if(&entry, &[DlqStatus::Retrying]).await {
            Ok(None) => {
                if previous == DlqStatus::Abandoned {
                    self.set_abandon_mark(&entry.job_id).await;
                }
                warn!(dlq_id = %entry.id, job_id = %entry.job_id, status = %previous, error = %cause, "DLQ retry interrupted, entry restored");
            }
            Ok(Some(status)) => {
                debug!(dlq_id = %entry.id, %status, "DLQ entry moved on during interrupted retry");
            }
            Err(e) => {
                error!(dlq_id = %entry.id, error = %e, "failed to restore DLQ entry after interrupted retry");
            }
        }
    }

    async fn record_failed_retry(
        &self,
        mut entry: DlqEntry,
        error: &OperationError,
    ) -> Result<DlqRetryOutcome, DlqError> {
        let now = self.clock.now();
        entry.last_error = LastError::from_operation(error, now);

        if entry.manual_retry_count >= self.config.max_manual_retries {
            entry.status = DlqStatus::Abandoned;
            entry.abandoned_at = Some(now);
            entry.resolution_notes = Some(format!(
                "Abandoned after {} manual retries",
                entry.manual_retry_count
            ));
            self.store.update(&entry).await?;
            self.set_abandon_mark(&entry.job_id).await;

            warn!(
                job_id = %entry.job_id,
                manual_retry_count = entry.manual_retry_count,
                error = %error,
                "DLQ retry failed, manual retry cap reached"
            );
            return Ok(DlqRetryOutcome::Abandoned(entry));
        }

        entry.status = DlqStatus::Pending;
        self.store.update(&entry).await?;
        warn!(
            job_id = %entry.job_id,
            manual_retry_count = entry.manual_retry_count,
            error = %error,
            "DLQ retry failed"
        );
        Ok(DlqRetryOutcome::Failed(entry))
    }

    /// Retry many entries in bounded batches
    ///
    /// Batches run one after another with a yield in between, so a large
    /// bulk retry shares the runtime with the retry worker.
    #[instrument(skip(self, selector))]
    pub async fn bulk_retry(&self, selector: BulkRetrySelector) -> Result<BulkRetryReport, DlqError> {
        let ids: Vec<Uuid> = match selector {
            BulkRetrySelector::Ids(ids) => {
                let mut selected = Vec::with_capacity(ids.len());
                for id in ids {
                    if let Some(entry) = self.store.get(id).await? {
                        if matches!(entry.status, DlqStatus::Pending | DlqStatus::Abandoned) {
                            selected.push(entry.id);
                        }
                    }
                }
                selected
            }
            BulkRetrySelector::Filter(filter) => {
                let filter = filter.with_status(DlqStatus::Pending);
                self.store
                    .scan(&filter)
                    .await?
                    .into_iter()
                    .take(self.config.bulk_limit)
                    .map(|entry| entry.id)
                    .collect()
            }
        };

        let mut report = BulkRetryReport {
            total: ids.len(),
            ..Default::default()
        };

        for batch in ids.chunks(self.config.bulk_batch_size.max(1)) {
            let results = futures::future::join_all(batch.iter().map(|id| self.retry(*id))).await;

            for (id, result) in batch.iter().zip(results) {
                let failure = match result {
                    Ok(DlqRetryOutcome::Resolved(_)) => None,
                    Ok(DlqRetryOutcome::Failed(entry)) | Ok(DlqRetryOutcome::Abandoned(entry)) => {
                        Some(entry.last_error.message)
                    }
                    Ok(DlqRetryOutcome::Conflict { status }) => {
                        Some(format!("entry is {}", status))
                    }
                    Err(e) => Some(e.to_string()),
                };

                match failure {
                    None => report.successful += 1,
                    Some(error) => {
                        report.failed += 1;
                        report.errors.push(BulkRetryError { id: *id, error });
                    }
                }
            }

            tokio::task::yield_now().await;
        }

        info!(
            total = report.total,
            successful = report.successful,
            failed = report.failed,
            "bulk DLQ retry finished"
        );
        Ok(report)
    }

    // =========================================================================
    // Manual transitions
    // =========================================================================

    /// Mark an entry resolved by an operator
    #[instrument(skip(self, notes))]
    pub async fn resolve(
        &self,
        id: Uuid,
        resolved_by: &str,
        notes: Option<String>,
    ) -> Result<TransitionOutcome, DlqError> {
        let mut entry = self.require(id).await?;
        if entry.status == DlqStatus::Resolved {
            return Ok(TransitionOutcome::Conflict { status: entry.status });
        }
        let previous = entry.status;

        entry.status = DlqStatus::Resolved;
        entry.resolved_at = Some(self.clock.now());
        entry.resolved_by = Some(resolved_by.to_string());
        entry.resolution_notes = notes;

        if let Some(status) = self.store.update_if(&entry, &[previous]).await? {
            return Ok(TransitionOutcome::Conflict { status });
        }
        self.clear_abandon_mark(&entry.job_id).await;

        info!(job_id = %entry.job_id, %resolved_by, "DLQ entry resolved manually");
        Ok(TransitionOutcome::Applied(entry))
    }

    /// Stop all further retries of an entry's job
    #[instrument(skip(self, reason))]
    pub async fn abandon(&self, id: Uuid, reason: &str) -> Result<TransitionOutcome, DlqError> {
        let mut entry = self.require(id).await?;
        if entry.status == DlqStatus::Abandoned {
            return Ok(TransitionOutcome::Conflict { status: entry.status });
        }
        let previous = entry.status;

        entry.status = DlqStatus::Abandoned;
        entry.abandoned_at = Some(self.clock.now());
        entry.resolution_notes = Some(reason.to_string());

        if let Some(status) = self.store.update_if(&entry, &[previous]).await? {
            return Ok(TransitionOutcome::Conflict { status });
        }
        self.set_abandon_mark(&entry.job_id).await;

        info!(job_id = %entry.job_id, %reason, "DLQ entry abandoned");
        Ok(TransitionOutcome::Applied(entry))
    }

    async fn set_abandon_mark(&self, job_id: &str) {
        if let Err(e) = self.state.sadd(DLQ_NAMESPACE, ABANDONED_SET, job_id).await {
            error!(%job_id, error = %e, "failed to write abandon mark");
        }
    }

    async fn clear_abandon_mark(&self, job_id: &str) {
        if let Err(e) = self.state.srem(DLQ_NAMESPACE, ABANDONED_SET, job_id).await {
            error!(%job_id, error = %e, "failed to clear abandon mark");
        }
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Aggregate over every entry
    pub async fn stats(&self) -> Result<DlqStats, DlqError> {
        let entries = self.store.scan(&DlqFilter::default()).await?;
        Ok(DlqStats::from_entries(&entries, self.clock.now()))
    }

    /// Delete terminal entries older than `older_than_days`
    ///
    /// `statuses` defaults to resolved and abandoned.
    #[instrument(skip(self))]
    pub async fn cleanup(
        &self,
        older_than_days: u32,
        statuses: Option<&[DlqStatus]>,
    ) -> Result<u64, DlqError> {
        let statuses = statuses.unwrap_or(&DEFAULT_CLEANUP_STATUSES);
        let cutoff = sub_duration(
            self.clock.now(),
            Duration::from_secs(older_than_days as u64 * 24 * 60 * 60),
        );

        let deleted = self.store.delete_terminal_before(cutoff, statuses).await?;
        info!(deleted, older_than_days, "DLQ cleanup finished");
        Ok(deleted)
    }

    /// Return entries stuck in retrying for longer than `stale_retry_after` to pending
    ///
    /// Covers retries whose process died between claiming the entry and
    /// recording the result.
    #[instrument(skip(self))]
    pub async fn recover_stale_retries(&self) -> Result<u64, DlqError> {
        let cutoff = sub_duration(self.clock.now(), self.config.stale_retry_after);
        let stuck = self
            .store
            .scan(&DlqFilter::default().with_status(DlqStatus::Retrying))
            .await?;

        let mut recovered = 0;
        for mut entry in stuck {
            if entry.last_attempt_at.unwrap_or(entry.created_at) >= cutoff {
                continue;
            }
            entry.status = DlqStatus::Pending;
            if self.store.update_if(&entry, &[DlqStatus::Retrying]).await?.is_none() {
                warn!(dlq_id = %entry.id, job_id = %entry.job_id, "stale DLQ retry returned to pending");
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    /// Spawn the periodic cleanup loop
    pub fn spawn_cleanup(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let dlq = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let retention_days = dlq.config.retention_days;
            info!(interval_ms = interval.as_millis() as u64, retention_days, "DLQ cleanup loop started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = dlq.cleanup(retention_days, None).await {
                            error!(error = %e, "DLQ cleanup failed");
                        }
                        if let Err(e) = dlq.recover_stale_retries().await {
                            error!(error = %e, "DLQ stale retry recovery failed");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Cleanup loop: shutdown requested");
                        break;
                    }
                }
            }

            debug!("Cleanup loop exited");
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use parking_lot::Mutex;

    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{PlatformConfig, StaticConfigSource};
    use crate::dispatch::{DispatchReceipt, HandlerRegistry, JobHints, JobStoreError, Payload};
    use crate::dlq::{DlqPriority, InMemoryDlqStore};
    use crate::persistence::InMemoryStateStore;
    use crate::reliability::{CircuitBreakerConfig, CircuitBreakerRegistry};

    #[derive(Default)]
    struct RecordingJobStore {
        failed: Mutex<Vec<String>>,
        synced: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl JobStore for RecordingJobStore {
        async fn mark_synced(&self, job_id: &str, _receipt: &DispatchReceipt) -> Result<(), JobStoreError> {
            self.synced.lock().push(job_id.to_string());
            Ok(())
        }

        async fn mark_failed(
            &self,
            job_id: &str,
            _dlq_id: Uuid,
            _error: &OperationError,
        ) -> Result<(), JobStoreError> {
            self.failed.lock().push(job_id.to_string());
            Err(JobStoreError::Backend("hook failures are logged only".to_string()))
        }
    }

    /// In-memory store whose unconditional `update` fails while `failing` is set
    #[derive(Default)]
    struct FlakyUpdateStore {
        inner: InMemoryDlqStore,
        failing: AtomicBool,
    }

    impl FlakyUpdateStore {
        fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl DlqStore for FlakyUpdateStore {
        async fn insert(&self, entry: &DlqEntry) -> Result<(), DlqError> {
            self.inner.insert(entry).await
        }

        async fn get(&self, id: Uuid) -> Result<Option<DlqEntry>, DlqError> {
            self.inner.get(id).await
        }

        async fn update(&self, entry: &DlqEntry) -> Result<(), DlqError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(DlqError::Database("connection reset".to_string()));
            }
            self.inner.update(entry).await
        }

        async fn update_if(
            &self,
            entry: &DlqEntry,
            expected: &[DlqStatus],
        ) -> Result<Option<DlqStatus>, DlqError> {
            self.inner.update_if(entry, expected).await
        }

        async fn delete(&self, id: Uuid) -> Result<bool, DlqError> {
            self.inner.delete(id).await
        }

        async fn list(
            &self,
            filter: &DlqFilter,
            pagination: Pagination,
        ) -> Result<(Vec<DlqEntry>, u64), DlqError> {
            self.inner.list(filter, pagination).await
        }

        async fn scan(&self, filter: &DlqFilter) -> Result<Vec<DlqEntry>, DlqError> {
            self.inner.scan(filter).await
        }

        async fn delete_terminal_before(
            &self,
            cutoff: DateTime<Utc>,
            statuses: &[DlqStatus],
        ) -> Result<u64, DlqError> {
            self.inner.delete_terminal_before(cutoff, statuses).await
        }
    }

    struct Fixture {
        dlq: DeadLetterQueue,
        store: Arc<FlakyUpdateStore>,
        state: Arc<InMemoryStateStore>,
        clock: Arc<ManualClock>,
        jobs: Arc<RecordingJobStore>,
        attempts: Arc<AtomicU32>,
    }

    /// `submit_order` fails until `succeed_after` attempts have been made
    fn create_fixture(succeed_after: u32) -> Fixture {
        let clock = Arc::new(ManualClock::starting_now());
        let state = Arc::new(InMemoryStateStore::with_clock(clock.clone()));
        let attempts = Arc::new(AtomicU32::new(0));

        let mut handlers = HandlerRegistry::new();
        let counter = attempts.clone();
        handlers.register("swiftship", "submit_order", move |_| {
            let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if attempt > succeed_after {
                    Ok(DispatchReceipt::with_external_id("ss-1"))
                } else {
                    Err(OperationError::from_status(503, "maintenance window"))
                }
            }
        });

        let source = StaticConfigSource::uniform(
            PlatformConfig::default()
                .with_circuit_breaker(CircuitBreakerConfig::default().with_failure_threshold(100)),
        );
        let breakers = CircuitBreakerRegistry::new(Arc::new(source), state.clone(), clock.clone())
            .with_refresh_interval(Duration::from_secs(3600));
        let dispatcher = GuardedDispatcher::new(Arc::new(breakers), Arc::new(handlers));

        let jobs = Arc::new(RecordingJobStore::default());
        let store = Arc::new(FlakyUpdateStore::default());
        let dlq = DeadLetterQueue::new(
            store.clone(),
            state.clone(),
            dispatcher,
            clock.clone(),
        )
        .with_job_store(jobs.clone());

        Fixture {
            dlq,
            store,
            state,
            clock,
            jobs,
            attempts,
        }
    }

    fn new_entry(job_id: &str, operation: &str, hints: JobHints) -> NewDlqEntry {
        NewDlqEntry {
            job_id: job_id.to_string(),
            platform: "swiftship".to_string(),
            operation: operation.to_string(),
            payload: Payload::from("{\"order\":42}"),
            error: OperationError::from_status(503, "maintenance window"),
            retry_count: 5,
            max_retries: 5,
            hints,
        }
    }

    #[tokio::test]
    async fn test_insert_sets_priority_and_calls_hooks() {
        let f = create_fixture(0);
        let entry = f
            .dlq
            .insert(new_entry("job-1", "submit_order", JobHints::default().with_amount(900.0)))
            .await
            .unwrap();

        assert_eq!(entry.status, DlqStatus::Pending);
        assert_eq!(entry.priority, DlqPriority::High);
        assert_eq!(entry.last_error.message, "maintenance window");
        assert_eq!(entry.metadata.get("amount").map(String::as_str), Some("900"));
        assert_eq!(*f.jobs.failed.lock(), vec!["job-1"]);
    }

    #[tokio::test]
    async fn test_list_orders_by_priority_then_age() {
        let f = create_fixture(0);
        let low = f.dlq.insert(new_entry("a", "webhook_process", JobHints::default())).await.unwrap();
        f.clock.advance(Duration::from_secs(1));
        let high = f.dlq.insert(new_entry("b", "cancel_order", JobHints::default())).await.unwrap();
        f.clock.advance(Duration::from_secs(1));
        let medium = f.dlq.insert(new_entry("c", "submit_order", JobHints::default())).await.unwrap();

        let page = f.dlq.list(&DlqFilter::default(), Pagination::default()).await.unwrap();
        let ids: Vec<Uuid> = page.entries.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![high.id, medium.id, low.id]);
        assert_eq!(page.total, 3);
        assert!(!page.has_more());

        let page = f
            .dlq
            .list(&DlqFilter::default().with_priority(DlqPriority::High), Pagination::default())
            .await
            .unwrap();
        assert_eq!(page.total, 1);
    }

    #[tokio::test]
    async fn test_retry_success_resolves_entry() {
        let f = create_fixture(0);
        let entry = f.dlq.insert(new_entry("job-1", "submit_order", JobHints::default())).await.unwrap();

        let outcome = f.dlq.retry(entry.id).await.unwrap();
        let DlqRetryOutcome::Resolved(resolved) = outcome else {
            panic!("expected resolved, got {:?}", outcome);
        };
        assert_eq!(resolved.status, DlqStatus::Resolved);
        assert_eq!(resolved.resolved_by.as_deref(), Some("system"));
        assert_eq!(resolved.manual_retry_count, 1);
        assert_eq!(*f.jobs.synced.lock(), vec!["job-1"]);

        // A resolved entry cannot be retried again
        let outcome = f.dlq.retry(entry.id).await.unwrap();
        assert_eq!(outcome, DlqRetryOutcome::Conflict { status: DlqStatus::Resolved });
    }

    #[tokio::test]
    async fn test_retry_failure_returns_to_pending_then_abandons_at_cap() {
        let f = create_fixture(u32::MAX);
        let entry = f.dlq.insert(new_entry("job-1", "submit_order", JobHints::default())).await.unwrap();

        for attempt in 1..5 {
            let outcome = f.dlq.retry(entry.id).await.unwrap();
            let DlqRetryOutcome::Failed(failed) = outcome else {
                panic!("attempt {} expected failure, got {:?}", attempt, outcome);
            };
            assert_eq!(failed.status, DlqStatus::Pending);
            assert_eq!(failed.manual_retry_count, attempt);
        }

        let outcome = f.dlq.retry(entry.id).await.unwrap();
        let DlqRetryOutcome::Abandoned(abandoned) = outcome else {
            panic!("expected abandonment, got {:?}", outcome);
        };
        assert_eq!(abandoned.status, DlqStatus::Abandoned);
        assert!(abandoned.abandoned_at.is_some());
        assert!(is_abandoned(f.state.as_ref(), "job-1").await.unwrap());
        assert_eq!(f.attempts.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_retry_error_after_dispatch_restores_entry() {
        let f = create_fixture(0);
        let entry = f.dlq.insert(new_entry("job-1", "submit_order", JobHints::default())).await.unwrap();

        f.store.set_failing(true);
        let result = f.dlq.retry(entry.id).await;
        assert!(matches!(result, Err(DlqError::Database(_))));

        let stored = f.dlq.get(entry.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DlqStatus::Pending);
        assert_eq!(stored.manual_retry_count, 1);

        f.store.set_failing(false);
        let outcome = f.dlq.retry(entry.id).await.unwrap();
        assert!(matches!(outcome, DlqRetryOutcome::Resolved(_)));
    }

    #[tokio::test]
    async fn test_retry_error_restores_abandoned_entry_and_mark() {
        let f = create_fixture(0);
        let entry = f.dlq.insert(new_entry("job-1", "submit_order", JobHints::default())).await.unwrap();
        f.dlq.abandon(entry.id, "hold").await.unwrap();

        f.store.set_failing(true);
        assert!(f.dlq.retry(entry.id).await.is_err());

        let stored = f.dlq.get(entry.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DlqStatus::Abandoned);
        assert!(is_abandoned(f.state.as_ref(), "job-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_retrying_entry_is_recovered() {
        let f = create_fixture(0);
        let mut entry = f.dlq.insert(new_entry("job-1", "submit_order", JobHints::default())).await.unwrap();

        // A process died mid-retry
        entry.status = DlqStatus::Retrying;
        entry.last_attempt_at = Some(f.clock.now());
        f.store.inner.update(&entry).await.unwrap();

        assert_eq!(
            f.dlq.retry(entry.id).await.unwrap(),
            DlqRetryOutcome::Conflict { status: DlqStatus::Retrying }
        );
        assert_eq!(f.dlq.recover_stale_retries().await.unwrap(), 0);

        f.clock.advance(Duration::from_secs(11 * 60));
        assert_eq!(f.dlq.recover_stale_retries().await.unwrap(), 1);
        assert_eq!(
            f.dlq.get(entry.id).await.unwrap().unwrap().status,
            DlqStatus::Pending
        );

        let outcome = f.dlq.retry(entry.id).await.unwrap();
        assert!(matches!(outcome, DlqRetryOutcome::Resolved(_)));
    }

    #[tokio::test]
    async fn test_retry_missing_entry() {
        let f = create_fixture(0);
        let result = f.dlq.retry(Uuid::now_v7()).await;
        assert!(matches!(result, Err(DlqError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_resolve_and_abandon_conflicts() {
        let f = create_fixture(0);
        let a = f.dlq.insert(new_entry("job-a", "submit_order", JobHints::default())).await.unwrap();
        let b = f.dlq.insert(new_entry("job-b", "submit_order", JobHints::default())).await.unwrap();

        let outcome = f.dlq.abandon(a.id, "customer cancelled").await.unwrap();
        assert!(matches!(outcome, TransitionOutcome::Applied(ref e) if e.status == DlqStatus::Abandoned));
        assert!(is_abandoned(f.state.as_ref(), "job-a").await.unwrap());

        let outcome = f.dlq.abandon(a.id, "again").await.unwrap();
        assert_eq!(outcome, TransitionOutcome::Conflict { status: DlqStatus::Abandoned });

        let outcome = f.dlq.resolve(b.id, "ops@example.com", Some("fixed by hand".into())).await.unwrap();
        let TransitionOutcome::Applied(resolved) = outcome else {
            panic!("expected resolve to apply");
        };
        assert_eq!(resolved.resolved_by.as_deref(), Some("ops@example.com"));
        assert_eq!(
            f.dlq.resolve(b.id, "ops@example.com", None).await.unwrap(),
            TransitionOutcome::Conflict { status: DlqStatus::Resolved }
        );

        // Resolving an abandoned entry lifts the abandon mark
        f.dlq.resolve(a.id, "ops@example.com", None).await.unwrap();
        assert!(!is_abandoned(f.state.as_ref(), "job-a").await.unwrap());
    }

    #[tokio::test]
    async fn test_bulk_retry_by_ids_skips_ineligible_entries() {
        let f = create_fixture(0);
        let pending = f.dlq.insert(new_entry("a", "submit_order", JobHints::default())).await.unwrap();
        let abandoned = f.dlq.insert(new_entry("b", "submit_order", JobHints::default())).await.unwrap();
        let resolved = f.dlq.insert(new_entry("c", "submit_order", JobHints::default())).await.unwrap();
        f.dlq.abandon(abandoned.id, "hold").await.unwrap();
        f.dlq.resolve(resolved.id, "ops", None).await.unwrap();

        let report = f
            .dlq
            .bulk_retry(BulkRetrySelector::Ids(vec![
                pending.id,
                abandoned.id,
                resolved.id,
                Uuid::now_v7(),
            ]))
            .await
            .unwrap();

        assert_eq!(report.total, 2);
        assert_eq!(report.successful, 2);
        assert_eq!(report.failed, 0);
    }

    #[tokio::test]
    async fn test_bulk_retry_by_filter_respects_limit_and_batches() {
        let f = create_fixture(u32::MAX);
        let dlq = f.dlq.with_config(DlqConfig::default().with_bulk_limit(7).with_bulk_batch_size(3));
        for i in 0..10 {
            dlq.insert(new_entry(&format!("job-{}", i), "submit_order", JobHints::default()))
                .await
                .unwrap();
        }

        let report = dlq
            .bulk_retry(BulkRetrySelector::Filter(DlqFilter::default().with_platform("swiftship")))
            .await
            .unwrap();

        assert_eq!(report.total, 7);
        assert_eq!(report.successful, 0);
        assert_eq!(report.failed, 7);
        assert_eq!(report.errors.len(), 7);
        assert!(report.errors.iter().all(|e| e.error == "maintenance window"));
        assert_eq!(f.attempts.load(Ordering::SeqCst), 7);
    }

    #[tokio::test]
    async fn test_stats_and_cleanup() {
        let f = create_fixture(0);
        let mut ids = vec![];
        for i in 0..6 {
            let entry = f
                .dlq
                .insert(new_entry(&format!("job-{}", i), "submit_order", JobHints::default()))
                .await
                .unwrap();
            ids.push(entry.id);
        }
        f.dlq.resolve(ids[3], "ops", None).await.unwrap();
        f.dlq.resolve(ids[4], "ops", None).await.unwrap();
        f.dlq.abandon(ids[5], "duplicate").await.unwrap();

        let stats = f.dlq.stats().await.unwrap();
        assert_eq!(stats.count(DlqStatus::Pending), 3);
        assert_eq!(stats.count(DlqStatus::Resolved), 2);
        assert_eq!(stats.count(DlqStatus::Abandoned), 1);
        assert_eq!(stats.by_platform["swiftship"].count, 6);

        assert_eq!(f.dlq.cleanup(30, None).await.unwrap(), 0);
        f.clock.advance(Duration::from_secs(31 * 24 * 60 * 60));
        assert_eq!(f.dlq.cleanup(30, None).await.unwrap(), 3);
        assert_eq!(f.dlq.stats().await.unwrap().total, 3);
    }

    #[tokio::test]
    async fn test_cleanup_loop_stops_on_shutdown() {
        let f = create_fixture(0);
        let dlq = Arc::new(f.dlq);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = dlq.spawn_cleanup(Duration::from_millis(10), shutdown_rx);
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("cleanup loop exits")
            .unwrap();
    }
}
