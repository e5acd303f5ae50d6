//! Dispatch through the platform's circuit breaker

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument};

use super::operation::{DispatchReceipt, OperationDispatcher, OperationError, Payload};
use crate::config::ConfigError;
use crate::reliability::{CircuitBreakerError, CircuitBreakerRegistry};

/// Wait suggested to callers turned away by a saturated half-open breaker
pub const HALF_OPEN_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Result of one guarded dispatch
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// The platform accepted the call
    Succeeded(DispatchReceipt),
    /// The platform call ran and failed
    Failed(OperationError),
    /// The breaker refused the call; the operation was not invoked
    Rejected { retry_after: Duration },
}

impl DispatchOutcome {
    /// Whether the call succeeded
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded(_))
    }
}

/// Circuit breaker registry in front of an [`OperationDispatcher`]
///
/// Used by both the retry scheduler and manual DLQ retries so the two paths
/// share breaker state.
#[derive(Clone)]
pub struct GuardedDispatcher {
    breakers: Arc<CircuitBreakerRegistry>,
    dispatcher: Arc<dyn OperationDispatcher>,
}

impl std::fmt::Debug for GuardedDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardedDispatcher")
            .field("breakers", &self.breakers)
            .finish()
    }
}

impl GuardedDispatcher {
    pub fn new(breakers: Arc<CircuitBreakerRegistry>, dispatcher: Arc<dyn OperationDispatcher>) -> Self {
        Self { breakers, dispatcher }
    }

    /// The breaker registry
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Dispatch one operation
    ///
    /// Only retryable errors count as breaker failures. A terminal error
    /// means the platform answered and rejected the request, which says
    /// nothing about its health.
    #[instrument(skip(self, payload), fields(payload_len = payload.len()))]
    pub async fn dispatch(
        &self,
        platform: &str,
        operation: &str,
        payload: &Payload,
    ) -> Result<DispatchOutcome, ConfigError> {
        let dispatcher = Arc::clone(&self.dispatcher);
        let verdict = self
            .breakers
            .execute(platform, || async move {
                match dispatcher.dispatch(platform, operation, payload).await {
                    Ok(receipt) => Ok(Ok(receipt)),
                    Err(error) if error.retryable => Err(error),
                    Err(error) => Ok(Err(error)),
                }
            })
            .await?;

        let outcome = match verdict {
            Ok(Ok(receipt)) => DispatchOutcome::Succeeded(receipt),
            Ok(Err(terminal)) => DispatchOutcome::Failed(terminal),
            Err(CircuitBreakerError::Operation(error)) => DispatchOutcome::Failed(error),
            Err(CircuitBreakerError::Open { retry_after }) => DispatchOutcome::Rejected { retry_after },
            Err(CircuitBreakerError::HalfOpenExhausted) => DispatchOutcome::Rejected {
                retry_after: HALF_OPEN_RETRY_AFTER,
            },
        };

        debug!(?outcome, "guarded dispatch finished");
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{PlatformConfig, StaticConfigSource};
    use crate::dispatch::HandlerRegistry;
    use crate::persistence::InMemoryStateStore;
    use crate::reliability::{CircuitBreakerConfig, CircuitState};

    fn create_dispatcher(handlers: HandlerRegistry) -> GuardedDispatcher {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(InMemoryStateStore::with_clock(clock.clone()));
        let source = StaticConfigSource::uniform(
            PlatformConfig::default()
                .with_circuit_breaker(CircuitBreakerConfig::default().with_failure_threshold(2)),
        );
        let breakers = CircuitBreakerRegistry::new(Arc::new(source), store, clock)
            .with_refresh_interval(Duration::from_secs(3600));
        GuardedDispatcher::new(Arc::new(breakers), Arc::new(handlers))
    }

    #[tokio::test]
    async fn test_success_and_retryable_failure() {
        let mut handlers = HandlerRegistry::new();
        handlers.register("swiftship", "submit_order", |_| async {
            Ok(DispatchReceipt::with_external_id("ss-1"))
        });
        handlers.register("swiftship", "update_status", |_| async {
            Err(OperationError::from_status(503, "unavailable"))
        });
        let guarded = create_dispatcher(handlers);

        let outcome = guarded
            .dispatch("swiftship", "submit_order", &Payload::default())
            .await
            .unwrap();
        assert!(outcome.is_success());

        let outcome = guarded
            .dispatch("swiftship", "update_status", &Payload::default())
            .await
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Failed(e) if e.retryable));
    }

    #[tokio::test]
    async fn test_open_breaker_rejects_without_dispatch() {
        let mut handlers = HandlerRegistry::new();
        handlers.register("swiftship", "submit_order", |_| async {
            Err(OperationError::retryable("connection reset"))
        });
        let guarded = create_dispatcher(handlers);

        for _ in 0..2 {
            guarded
                .dispatch("swiftship", "submit_order", &Payload::default())
                .await
                .unwrap();
        }
        assert_eq!(
            guarded.breakers().status("swiftship").unwrap().state,
            CircuitState::Open
        );

        let outcome = guarded
            .dispatch("swiftship", "submit_order", &Payload::default())
            .await
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Rejected { retry_after } if retry_after > Duration::ZERO));
    }

    #[tokio::test]
    async fn test_terminal_errors_do_not_trip_the_breaker() {
        let mut handlers = HandlerRegistry::new();
        handlers.register("swiftship", "submit_order", |_| async {
            Err(OperationError::from_status(422, "invalid address"))
        });
        let guarded = create_dispatcher(handlers);

        for _ in 0..5 {
            let outcome = guarded
                .dispatch("swiftship", "submit_order", &Payload::default())
                .await
                .unwrap();
            assert!(matches!(outcome, DispatchOutcome::Failed(e) if !e.retryable));
        }
        assert_eq!(
            guarded.breakers().status("swiftship").unwrap().state,
            CircuitState::Closed
        );
    }
}
