//! Registry of per-platform circuit breakers
//!
//! Constructed once at process start and shared by handle; breakers are
//! created on first use from the platform's configuration and restored from
//! the store when a snapshot exists.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::circuit_breaker::{CircuitBreakerConfig, CircuitState};
use super::distributed_circuit_breaker::{CircuitBreaker, CircuitBreakerError, CircuitStatus};
use crate::clock::{elapsed_between, Clock};
use crate::config::{ConfigError, ConfigSource};
use crate::persistence::StateStore;

/// Owner of one [`CircuitBreaker`] per platform key
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, CircuitBreaker>,
    config_source: Arc<dyn ConfigSource>,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    refresh_interval: Duration,
}

impl fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("platforms", &self.platforms())
            .finish()
    }
}

impl CircuitBreakerRegistry {
    /// Create an empty registry
    pub fn new(
        config_source: Arc<dyn ConfigSource>,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            breakers: DashMap::new(),
            config_source,
            store,
            clock,
            refresh_interval: Duration::from_secs(1),
        }
    }

    /// Set how often breakers re-read shared state
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Breaker for `platform`, created on first use
    pub async fn breaker(&self, platform: &str) -> Result<CircuitBreaker, ConfigError> {
        if let Some(breaker) = self.breakers.get(platform) {
            return Ok(breaker.clone());
        }

        let config = self.config_source.platform_config(platform).await?;
        let breaker = CircuitBreaker::restore(
            platform,
            config.circuit_breaker,
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
        )
        .await
        .with_refresh_interval(self.refresh_interval);

        // A concurrent caller may have won the race; keep the first
        let breaker = self
            .breakers
            .entry(platform.to_string())
            .or_insert(breaker)
            .clone();
        debug!(%platform, "circuit breaker registered");
        Ok(breaker)
    }

    /// Run `operation` through the platform's breaker
    ///
    /// The outer error is a configuration contract violation; the inner
    /// result is the breaker's verdict.
    pub async fn execute<F, Fut, T, E>(
        &self,
        platform: &str,
        operation: F,
    ) -> Result<Result<T, CircuitBreakerError<E>>, ConfigError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let breaker = self.breaker(platform).await?;
        Ok(breaker.execute(operation).await)
    }

    /// Status of one platform's breaker, if it exists
    pub fn status(&self, platform: &str) -> Option<CircuitStatus> {
        self.breakers.get(platform).map(|breaker| breaker.status())
    }

    /// Status of every breaker, sorted by platform
    pub fn all_status(&self) -> Vec<CircuitStatus> {
        let mut statuses: Vec<CircuitStatus> =
            self.breakers.iter().map(|entry| entry.value().status()).collect();
        statuses.sort_by(|a, b| a.platform.cmp(&b.platform));
        statuses
    }

    /// Registered platform keys, sorted
    pub fn platforms(&self) -> Vec<String> {
        let mut platforms: Vec<String> =
            self.breakers.iter().map(|entry| entry.key().clone()).collect();
        platforms.sort();
        platforms
    }

    /// Force one platform's breaker closed; returns false if it does not exist
    pub async fn reset(&self, platform: &str) -> bool {
        let Some(breaker) = self.breakers.get(platform).map(|b| b.clone()) else {
            return false;
        };
        breaker.reset().await;
        true
    }

    /// Force every breaker closed
    pub async fn reset_all(&self) {
        let breakers: Vec<CircuitBreaker> =
            self.breakers.iter().map(|entry| entry.value().clone()).collect();
        for breaker in breakers {
            breaker.reset().await;
        }
    }

    /// Replace one platform's breaker configuration
    pub async fn update_config(
        &self,
        platform: &str,
        config: CircuitBreakerConfig,
    ) -> Result<(), ConfigError> {
        let breaker = self.breaker(platform).await?;
        breaker.update_config(config).await;
        Ok(())
    }

    /// Log breakers that stay open past their timeout
    ///
    /// An open breaker only probes when traffic arrives; one that has sat
    /// open well past its timeout usually means the platform has no queued
    /// work or the operator should look at it.
    pub fn check_stuck(&self) -> Vec<String> {
        let now = self.clock.now();
        let mut stuck = vec![];

        for entry in self.breakers.iter() {
            let status = entry.value().status();
            debug!(
                platform = %status.platform,
                state = %status.state,
                total_requests = status.metrics.total_requests,
                total_failures = status.metrics.total_failures,
                success_rate = status.success_rate,
                "circuit breaker metrics"
            );

            if status.state != CircuitState::Open {
                continue;
            }
            let since = status.last_state_change_at.unwrap_or(now);
            let open_for = elapsed_between(since, now);
            if open_for > status.config.timeout {
                warn!(
                    platform = %status.platform,
                    open_for_ms = open_for.as_millis() as u64,
                    timeout_ms = status.config.timeout.as_millis() as u64,
                    "circuit breaker stuck open"
                );
                stuck.push(status.platform.clone());
            }
        }

        stuck.sort();
        stuck
    }

    /// Spawn the monitoring loop
    pub fn spawn_monitor(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            info!(interval_ms = interval.as_millis() as u64, "circuit breaker monitor started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        registry.check_stuck();
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Monitor loop: shutdown requested");
                        break;
                    }
                }
            }

            debug!("Monitor loop exited");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{PlatformConfig, StaticConfigSource};
    use crate::persistence::InMemoryStateStore;

    fn create_test_registry() -> (Arc<CircuitBreakerRegistry>, Arc<ManualClock>, Arc<InMemoryStateStore>) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(InMemoryStateStore::with_clock(clock.clone()));
        let source = StaticConfigSource::new()
            .with_platform("swiftship", PlatformConfig::default())
            .with_platform(
                "parcelpro",
                PlatformConfig::default()
                    .with_circuit_breaker(CircuitBreakerConfig::default().with_failure_threshold(2)),
            );
        let registry = CircuitBreakerRegistry::new(Arc::new(source), store.clone(), clock.clone())
            .with_refresh_interval(Duration::from_secs(3600));
        (Arc::new(registry), clock, store)
    }

    async fn fail(registry: &CircuitBreakerRegistry, platform: &str) {
        let result = registry
            .execute(platform, || async { Err::<(), _>("down") })
            .await
            .unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_breakers_are_isolated_per_platform() {
        let (registry, _, _) = create_test_registry();

        fail(&registry, "parcelpro").await;
        fail(&registry, "parcelpro").await;

        assert_eq!(registry.status("parcelpro").unwrap().state, CircuitState::Open);

        let ok = registry
            .execute("swiftship", || async { Ok::<_, &str>("delivered") })
            .await
            .unwrap();
        assert_eq!(ok.unwrap(), "delivered");
        assert_eq!(registry.platforms(), vec!["parcelpro", "swiftship"]);
    }

    #[tokio::test]
    async fn test_unknown_platform_is_a_config_error() {
        let (registry, _, _) = create_test_registry();
        let result = registry
            .execute("nowhere", || async { Ok::<_, &str>(()) })
            .await;
        assert!(matches!(result, Err(ConfigError::UnknownPlatform(_))));
    }

    #[tokio::test]
    async fn test_same_breaker_is_returned() {
        let (registry, _, _) = create_test_registry();
        fail(&registry, "parcelpro").await;

        let breaker = registry.breaker("parcelpro").await.unwrap();
        assert_eq!(breaker.snapshot().failure_count, 1);
    }

    #[tokio::test]
    async fn test_state_restored_by_new_registry() {
        let (registry, clock, store) = create_test_registry();
        fail(&registry, "parcelpro").await;
        fail(&registry, "parcelpro").await;

        let source = StaticConfigSource::uniform(PlatformConfig::default());
        let restarted = CircuitBreakerRegistry::new(Arc::new(source), store, clock);
        let breaker = restarted.breaker("parcelpro").await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Open);
        // Live configuration comes from the config source, not the snapshot
        assert_eq!(breaker.config().failure_threshold, 5);
    }

    #[tokio::test]
    async fn test_reset_and_all_status() {
        let (registry, _, _) = create_test_registry();
        fail(&registry, "parcelpro").await;
        fail(&registry, "parcelpro").await;
        registry.breaker("swiftship").await.unwrap();

        assert!(registry.reset("parcelpro").await);
        assert!(!registry.reset("unknown").await);

        let statuses = registry.all_status();
        assert_eq!(statuses.len(), 2);
        assert!(statuses.iter().all(|s| s.state == CircuitState::Closed));
    }

    #[tokio::test]
    async fn test_update_config() {
        let (registry, _, _) = create_test_registry();
        registry
            .update_config("swiftship", CircuitBreakerConfig::default().with_failure_threshold(1))
            .await
            .unwrap();

        fail(&registry, "swiftship").await;
        assert_eq!(registry.status("swiftship").unwrap().state, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_check_stuck_reports_long_open_breakers() {
        let (registry, clock, _) = create_test_registry();
        fail(&registry, "parcelpro").await;
        fail(&registry, "parcelpro").await;

        assert!(registry.check_stuck().is_empty());
        clock.advance(Duration::from_secs(61));
        assert_eq!(registry.check_stuck(), vec!["parcelpro"]);
    }

    #[tokio::test]
    async fn test_monitor_stops_on_shutdown() {
        let (registry, _, _) = create_test_registry();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = registry.spawn_monitor(Duration::from_millis(10), shutdown_rx);
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("monitor exits")
            .unwrap();
    }
}
