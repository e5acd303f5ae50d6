//! Worker pool for retry execution
//!
//! Claims due retries from the scheduler, executes them with bounded
//! concurrency and drains in-flight work on shutdown.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::duration_millis;
use crate::scheduler::{ExecutionOutcome, RetryScheduler, SchedulerError};

/// Retry worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Unique worker ID (generated if not provided)
    pub worker_id: String,

    /// Time between queue polls
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// Maximum retries claimed per poll
    pub batch_size: usize,

    /// Maximum concurrent retry executions
    pub max_concurrency: usize,

    /// Stale claim reclamation interval
    #[serde(with = "duration_millis")]
    pub reclaim_interval: Duration,

    /// Graceful shutdown timeout
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("retry-worker-{}", Uuid::now_v7()),
            poll_interval: Duration::from_secs(5),
            batch_size: 10,
            max_concurrency: 10,
            reclaim_interval: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_reclaim_interval(mut self, interval: Duration) -> Self {
        self.reclaim_interval = interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Worker lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Worker is starting up
    Starting,
    /// Worker is polling and executing retries
    Running,
    /// Worker is finishing in-flight retries, not claiming new ones
    Draining,
    /// Worker has stopped
    Stopped,
}

/// Worker errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("retry worker is already running")]
    AlreadyRunning,

    #[error("graceful shutdown timed out")]
    ShutdownTimeout,
}

/// Execution counters, by outcome
#[derive(Debug, Default)]
pub struct WorkerStats {
    succeeded: AtomicU64,
    rescheduled: AtomicU64,
    deferred: AtomicU64,
    dead_lettered: AtomicU64,
    abandoned: AtomicU64,
    skipped: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time copy of [`WorkerStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatsSnapshot {
    pub succeeded: u64,
    pub rescheduled: u64,
    pub deferred: u64,
    pub dead_lettered: u64,
    pub abandoned: u64,
    pub skipped: u64,
    pub errors: u64,
}

impl WorkerStatsSnapshot {
    /// Executions that completed, whatever the outcome
    pub fn executed(&self) -> u64 {
        self.succeeded
            + self.rescheduled
            + self.deferred
            + self.dead_lettered
            + self.abandoned
            + self.skipped
    }
}

impl WorkerStats {
    fn record(&self, result: &Result<ExecutionOutcome, SchedulerError>) {
        let counter = match result {
            Ok(ExecutionOutcome::Succeeded) => &self.succeeded,
            Ok(ExecutionOutcome::Rescheduled { .. }) => &self.rescheduled,
            Ok(ExecutionOutcome::Deferred { .. }) => &self.deferred,
            Ok(ExecutionOutcome::DeadLettered { .. }) => &self.dead_lettered,
            Ok(ExecutionOutcome::Abandoned) => &self.abandoned,
            Ok(ExecutionOutcome::Skipped) => &self.skipped,
            Err(_) => &self.errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            succeeded: self.succeeded.load(Ordering::Relaxed),
            rescheduled: self.rescheduled.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Polls the retry queue and executes due retries
///
/// # Example
///
/// ```ignore
/// use dispatch_resilience::worker::{RetryWorker, WorkerConfig};
///
/// let config = WorkerConfig::new()
///     .with_poll_interval(Duration::from_secs(5))
///     .with_max_concurrency(10);
///
/// let worker = RetryWorker::new(scheduler, config);
/// worker.start().await?;
///
/// // ... later, graceful shutdown
/// worker.shutdown().await?;
/// ```
pub struct RetryWorker {
    scheduler: Arc<RetryScheduler>,
    config: WorkerConfig,
    stats: Arc<WorkerStats>,
    shutdown_tx: watch::Sender<bool>,
    status: RwLock<WorkerStatus>,
    active_tasks: Arc<Semaphore>,
    poll_handle: Mutex<Option<JoinHandle<()>>>,
    reclaim_handle: Mutex<Option<JoinHandle<()>>>,
}

impl RetryWorker {
    pub fn new(scheduler: Arc<RetryScheduler>, config: WorkerConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            scheduler,
            active_tasks: Arc::new(Semaphore::new(config.max_concurrency)),
            config,
            stats: Arc::new(WorkerStats::default()),
            shutdown_tx,
            status: RwLock::new(WorkerStatus::Stopped),
            poll_handle: Mutex::new(None),
            reclaim_handle: Mutex::new(None),
        }
    }

    /// Start the poll and reclaim loops
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn start(&self) -> Result<(), WorkerError> {
        {
            let mut status = self.status.write();
            if matches!(*status, WorkerStatus::Running | WorkerStatus::Starting) {
                return Err(WorkerError::AlreadyRunning);
            }
            *status = WorkerStatus::Starting;
        }

        info!(
            worker_id = %self.config.worker_id,
            batch_size = self.config.batch_size,
            max_concurrency = self.config.max_concurrency,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Starting retry worker"
        );

        self.shutdown_tx.send_replace(false);
        self.start_poll_loop();
        self.start_reclaim_loop();

        *self.status.write() = WorkerStatus::Running;
        Ok(())
    }

    /// Stop claiming, then wait for in-flight retries
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn shutdown(&self) -> Result<(), WorkerError> {
        if *self.status.read() == WorkerStatus::Stopped {
            return Ok(());
        }

        info!(worker_id = %self.config.worker_id, "Initiating graceful shutdown");

        *self.status.write() = WorkerStatus::Draining;
        self.shutdown_tx.send_replace(true);

        let poll_handle = self.poll_handle.lock().take();
        if let Some(handle) = poll_handle {
            let _ = handle.await;
        }
        let reclaim_handle = self.reclaim_handle.lock().take();
        if let Some(handle) = reclaim_handle {
            let _ = handle.await;
        }

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;

        loop {
            let available = self.active_tasks.available_permits();
            if available == self.config.max_concurrency {
                debug!("All retries completed");
                break;
            }

            if tokio::time::Instant::now() >= deadline {
                warn!(
                    remaining_tasks = self.config.max_concurrency - available,
                    "Shutdown timeout reached"
                );
                return Err(WorkerError::ShutdownTimeout);
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        *self.status.write() = WorkerStatus::Stopped;

        info!(worker_id = %self.config.worker_id, "Retry worker stopped");
        Ok(())
    }

    pub fn status(&self) -> WorkerStatus {
        *self.status.read()
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn stats(&self) -> WorkerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Retries currently executing
    pub fn in_flight(&self) -> usize {
        self.config.max_concurrency - self.active_tasks.available_permits()
    }

    /// Claim one batch and spawn its executions
    pub async fn poll_once(&self) -> Result<BatchSummary, WorkerError> {
        let summary = poll_batch(
            &self.scheduler,
            &self.active_tasks,
            &self.stats,
            self.config.batch_size,
        )
        .await?;
        Ok(summary)
    }

    fn start_poll_loop(&self) {
        let scheduler = Arc::clone(&self.scheduler);
        let active_tasks = Arc::clone(&self.active_tasks);
        let stats = Arc::clone(&self.stats);
        let batch_size = self.config.batch_size;
        let interval = self.config.poll_interval;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = poll_batch(&scheduler, &active_tasks, &stats, batch_size).await {
                            error!(error = %e, "Retry poll failed");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Poll loop: shutdown requested");
                        break;
                    }
                }
            }

            debug!("Poll loop exited");
        });

        *self.poll_handle.lock() = Some(handle);
    }

    fn start_reclaim_loop(&self) {
        let scheduler = Arc::clone(&self.scheduler);
        let interval = self.config.reclaim_interval;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match scheduler.reclaim_stale().await {
                            Ok(reclaimed) => {
                                if !reclaimed.is_empty() {
                                    info!(count = reclaimed.len(), "Reclaimed stale retry claims");
                                }
                            }
                            Err(e) => {
                                error!(error = %e, "Stale claim reclamation failed");
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Reclaim loop: shutdown requested");
                        break;
                    }
                }
            }

            debug!("Reclaim loop exited");
        });

        *self.reclaim_handle.lock() = Some(handle);
    }
}

/// Counts for one poll of the retry queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    /// Free execution slots when the poll started
    pub slots: usize,
    /// Retries claimed from the queue
    pub claimed: usize,
    /// Executions spawned
    pub spawned: usize,
    /// Claims handed back because no permit was free
    pub released: usize,
}

async fn poll_batch(
    scheduler: &Arc<RetryScheduler>,
    active_tasks: &Arc<Semaphore>,
    stats: &Arc<WorkerStats>,
    batch_size: usize,
) -> Result<BatchSummary, SchedulerError> {
    let mut summary = BatchSummary {
        slots: active_tasks.available_permits().min(batch_size),
        ..Default::default()
    };
    if summary.slots == 0 {
        debug!("Poll loop: no free slots, waiting");
        return Ok(summary);
    }

    let claimed = scheduler.claim_ready(summary.slots).await?;
    summary.claimed = claimed.len();

    for retry_id in claimed {
        let permit = match active_tasks.clone().try_acquire_owned() {
            Ok(p) => p,
            Err(_) => {
                debug!(%retry_id, "No permits available, releasing claim");
                scheduler.release(&retry_id).await?;
                summary.released += 1;
                continue;
            }
        };

        let scheduler = Arc::clone(scheduler);
        let stats = Arc::clone(stats);
        tokio::spawn(async move {
            let result = scheduler.execute(&retry_id).await;
            stats.record(&result);
            drop(permit);
        });
        summary.spawned += 1;
    }

    if summary.claimed > 0 {
        info!(
            slots = summary.slots,
            claimed = summary.claimed,
            spawned = summary.spawned,
            released = summary.released,
            "Retry batch dispatched"
        );
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{ConfigSource, PlatformConfig, StaticConfigSource};
    use crate::dispatch::{DispatchJob, DispatchReceipt, GuardedDispatcher, HandlerRegistry};
    use crate::dlq::{DeadLetterQueue, InMemoryDlqStore};
    use crate::persistence::InMemoryStateStore;
    use crate::reliability::CircuitBreakerRegistry;

    fn create_scheduler(clock: Arc<ManualClock>, handler_delay: Duration) -> Arc<RetryScheduler> {
        let store = Arc::new(InMemoryStateStore::with_clock(clock.clone()));
        let mut handlers = HandlerRegistry::new();
        handlers.register("swiftship", "submit_order", move |_| async move {
            tokio::time::sleep(handler_delay).await;
            Ok(DispatchReceipt::default())
        });

        let source: Arc<dyn ConfigSource> = Arc::new(StaticConfigSource::uniform(
            PlatformConfig::default().with_jitter_factor(0.0),
        ));
        let breakers = Arc::new(CircuitBreakerRegistry::new(source.clone(), store.clone(), clock.clone()));
        let dispatcher = GuardedDispatcher::new(breakers, Arc::new(handlers));
        let dlq = Arc::new(DeadLetterQueue::new(
            Arc::new(InMemoryDlqStore::new()),
            store.clone(),
            dispatcher.clone(),
            clock.clone(),
        ));
        Arc::new(RetryScheduler::new(store, source, dispatcher, dlq, clock))
    }

    async fn schedule_due(scheduler: &RetryScheduler, clock: &ManualClock, count: usize) {
        for i in 0..count {
            let job = DispatchJob::new(format!("order-{}", i), "swiftship", "submit_order", "{}");
            scheduler.schedule(job, 0).await.unwrap();
        }
        clock.advance(Duration::from_secs(2));
    }

    async fn wait_for_executions(worker: &RetryWorker, count: u64) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while worker.stats().executed() < count {
            assert!(tokio::time::Instant::now() < deadline, "retries did not finish");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn test_default_config() {
        let config = WorkerConfig::default();
        assert!(config.worker_id.starts_with("retry-worker-"));
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.max_concurrency, 10);
    }

    #[test]
    fn test_config_builder_clamps() {
        let config = WorkerConfig::new()
            .with_worker_id("w-1")
            .with_batch_size(0)
            .with_max_concurrency(0);

        assert_eq!(config.worker_id, "w-1");
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.max_concurrency, 1);
    }

    #[tokio::test]
    async fn test_poll_once_respects_batch_size() {
        let clock = Arc::new(ManualClock::starting_now());
        let scheduler = create_scheduler(clock.clone(), Duration::ZERO);
        schedule_due(&scheduler, &clock, 5).await;

        let worker = RetryWorker::new(scheduler.clone(), WorkerConfig::new().with_batch_size(3));
        let batch = worker.poll_once().await.unwrap();
        assert_eq!(
            batch,
            BatchSummary {
                slots: 3,
                claimed: 3,
                spawned: 3,
                released: 0
            }
        );
        wait_for_executions(&worker, 3).await;
        assert_eq!(worker.poll_once().await.unwrap().spawned, 2);
        wait_for_executions(&worker, 5).await;

        assert_eq!(worker.stats().succeeded, 5);
        assert_eq!(scheduler.stats().await.unwrap().queued, 0);
    }

    #[tokio::test]
    async fn test_poll_once_limited_by_concurrency() {
        let clock = Arc::new(ManualClock::starting_now());
        let scheduler = create_scheduler(clock.clone(), Duration::from_millis(200));
        schedule_due(&scheduler, &clock, 4).await;

        let worker = RetryWorker::new(
            scheduler.clone(),
            WorkerConfig::new().with_batch_size(10).with_max_concurrency(2),
        );
        let batch = worker.poll_once().await.unwrap();
        assert_eq!((batch.slots, batch.claimed, batch.spawned), (2, 2, 2));
        assert_eq!(worker.poll_once().await.unwrap(), BatchSummary::default());
        assert_eq!(worker.in_flight(), 2);

        // Unclaimed retries stay queued and unclaimed
        let stats = scheduler.stats().await.unwrap();
        assert_eq!(stats.queued, 4);
        assert_eq!(stats.active, 2);
        wait_for_executions(&worker, 2).await;
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let clock = Arc::new(ManualClock::starting_now());
        let scheduler = create_scheduler(clock.clone(), Duration::ZERO);
        schedule_due(&scheduler, &clock, 3).await;

        let worker = RetryWorker::new(
            scheduler.clone(),
            WorkerConfig::new().with_poll_interval(Duration::from_millis(10)),
        );
        worker.start().await.unwrap();
        assert_eq!(worker.status(), WorkerStatus::Running);
        assert!(matches!(worker.start().await, Err(WorkerError::AlreadyRunning)));

        wait_for_executions(&worker, 3).await;
        worker.shutdown().await.unwrap();
        assert_eq!(worker.status(), WorkerStatus::Stopped);
        assert_eq!(worker.stats().succeeded, 3);

        // Stopped workers claim nothing
        schedule_due(&scheduler, &clock, 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(scheduler.stats().await.unwrap().queued, 1);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight() {
        let clock = Arc::new(ManualClock::starting_now());
        let scheduler = create_scheduler(clock.clone(), Duration::from_millis(150));
        schedule_due(&scheduler, &clock, 1).await;

        let worker = RetryWorker::new(
            scheduler,
            WorkerConfig::new().with_poll_interval(Duration::from_millis(10)),
        );
        worker.start().await.unwrap();
        while worker.in_flight() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        worker.shutdown().await.unwrap();
        assert_eq!(worker.in_flight(), 0);
        assert_eq!(worker.stats().succeeded, 1);
    }

    #[tokio::test]
    async fn test_shutdown_timeout() {
        let clock = Arc::new(ManualClock::starting_now());
        let scheduler = create_scheduler(clock.clone(), Duration::from_secs(5));
        schedule_due(&scheduler, &clock, 1).await;

        let worker = RetryWorker::new(
            scheduler,
            WorkerConfig::new().with_shutdown_timeout(Duration::from_millis(100)),
        );
        worker.start().await.unwrap();
        while worker.in_flight() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(matches!(worker.shutdown().await, Err(WorkerError::ShutdownTimeout)));
        assert_eq!(worker.status(), WorkerStatus::Draining);
    }
}
