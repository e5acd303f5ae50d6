//! Retry worker process for courier dispatch
//!
//! Wires the resilience core to Redis and PostgreSQL and runs its background
//! loops: the retry worker, the circuit breaker monitor and DLQ cleanup.

pub mod settings;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use dispatch_resilience::clock::{Clock, SystemClock};
use dispatch_resilience::config::{ConfigSource, PlatformConfig, StaticConfigSource};
use dispatch_resilience::dispatch::{GuardedDispatcher, OperationDispatcher};
use dispatch_resilience::dlq::{DeadLetterQueue, PostgresDlqStore};
use dispatch_resilience::persistence::{FallbackStateStore, RedisStateStore, StateStore};
use dispatch_resilience::reliability::CircuitBreakerRegistry;
use dispatch_resilience::scheduler::RetryScheduler;
use dispatch_resilience::worker::RetryWorker;

pub use settings::{SettingsError, WorkerSettings};

/// Interval of the stuck-breaker monitor
const MONITOR_INTERVAL: Duration = Duration::from_secs(30);

/// The wired process
pub struct DispatchWorker {
    settings: WorkerSettings,
    state: Arc<FallbackStateStore>,
    breakers: Arc<CircuitBreakerRegistry>,
    dlq: Arc<DeadLetterQueue>,
    scheduler: Arc<RetryScheduler>,
    retry_worker: RetryWorker,
    shutdown_tx: watch::Sender<bool>,
    background: Vec<JoinHandle<()>>,
}

impl DispatchWorker {
    /// Connect backends and wire every component around `dispatcher`
    pub async fn build(
        settings: WorkerSettings,
        dispatcher: Arc<dyn OperationDispatcher>,
    ) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let redis = RedisStateStore::new(&settings.redis_url).context("Invalid REDIS_URL")?;
        let state = match redis.ping().await {
            Ok(()) => {
                info!("Connected to Redis");
                FallbackStateStore::new(Arc::new(redis))
            }
            Err(e) => {
                warn!(error = %e, "Redis unreachable at startup, starting in degraded mode");
                FallbackStateStore::new(Arc::new(redis)).start_degraded()
            }
        };
        let state = Arc::new(state);

        let pool = PgPool::connect(&settings.database_url)
            .await
            .context("Failed to connect to database")?;
        let dlq_store = PostgresDlqStore::new(pool);
        dlq_store
            .migrate()
            .await
            .context("Failed to run DLQ migrations")?;
        info!("Connected to database");

        let config_source: Arc<dyn ConfigSource> = match &settings.platform_config_path {
            Some(path) => Arc::new(
                StaticConfigSource::from_json_file(path)
                    .with_context(|| format!("Failed to load platform config from {}", path.display()))?,
            ),
            None => {
                info!("No PLATFORM_CONFIG_PATH set, using defaults for every platform");
                Arc::new(StaticConfigSource::uniform(PlatformConfig::default()))
            }
        };

        let store: Arc<dyn StateStore> = state.clone();
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            config_source.clone(),
            store.clone(),
            clock.clone(),
        ));
        let dispatcher = GuardedDispatcher::new(breakers.clone(), dispatcher);
        let dlq = Arc::new(
            DeadLetterQueue::new(
                Arc::new(dlq_store),
                store.clone(),
                dispatcher.clone(),
                clock.clone(),
            )
            .with_config(settings.dlq_config()),
        );
        let scheduler = Arc::new(RetryScheduler::new(
            store,
            config_source,
            dispatcher,
            dlq.clone(),
            clock,
        ));
        let retry_worker = RetryWorker::new(scheduler.clone(), settings.worker_config());
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            settings,
            state,
            breakers,
            dlq,
            scheduler,
            retry_worker,
            shutdown_tx,
            background: Vec::new(),
        })
    }

    pub fn scheduler(&self) -> &Arc<RetryScheduler> {
        &self.scheduler
    }

    pub fn dlq(&self) -> &Arc<DeadLetterQueue> {
        &self.dlq
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Start the retry worker and background loops
    pub async fn start(&mut self) -> Result<()> {
        self.retry_worker
            .start()
            .await
            .context("Failed to start retry worker")?;

        self.background.push(
            self.breakers
                .spawn_monitor(MONITOR_INTERVAL, self.shutdown_tx.subscribe()),
        );
        self.background.push(
            self.dlq
                .spawn_cleanup(self.settings.dlq_cleanup_interval, self.shutdown_tx.subscribe()),
        );

        info!(
            worker_id = %self.retry_worker.worker_id(),
            degraded = self.state.is_degraded(),
            "Dispatch worker started"
        );
        Ok(())
    }

    /// Drain in-flight retries and stop every loop
    pub async fn shutdown(self) -> Result<()> {
        let drained = self.retry_worker.shutdown().await;

        self.shutdown_tx.send_replace(true);
        for handle in self.background {
            if let Err(e) = handle.await {
                error!(error = %e, "Background loop panicked");
            }
        }

        let stats = self.retry_worker.stats();
        info!(
            succeeded = stats.succeeded,
            rescheduled = stats.rescheduled,
            dead_lettered = stats.dead_lettered,
            errors = stats.errors,
            "Dispatch worker stopped"
        );

        drained.context("Retry worker did not drain in time")
    }
}
