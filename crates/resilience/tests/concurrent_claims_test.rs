//! Concurrent claiming against one shared store
//!
//! Run with: cargo test -p dispatch-resilience --test concurrent_claims_test

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dispatch_resilience::clock::ManualClock;
use dispatch_resilience::config::{ConfigSource, PlatformConfig, StaticConfigSource};
use dispatch_resilience::dispatch::{DispatchJob, DispatchReceipt, GuardedDispatcher, HandlerRegistry};
use dispatch_resilience::dlq::{DeadLetterQueue, InMemoryDlqStore};
use dispatch_resilience::persistence::{InMemoryStateStore, StateStore};
use dispatch_resilience::reliability::CircuitBreakerRegistry;
use dispatch_resilience::scheduler::RetryScheduler;
use dispatch_resilience::worker::{RetryWorker, WorkerConfig};

const JOBS: usize = 60;

/// Several schedulers (one per simulated process) over one store
fn create_schedulers(
    count: usize,
    store: Arc<InMemoryStateStore>,
    clock: Arc<ManualClock>,
    executions: Arc<AtomicU32>,
) -> Vec<Arc<RetryScheduler>> {
    let config: Arc<dyn ConfigSource> = Arc::new(StaticConfigSource::uniform(
        PlatformConfig::default().with_jitter_factor(0.0),
    ));

    (0..count)
        .map(|_| {
            let mut handlers = HandlerRegistry::new();
            let executions = executions.clone();
            handlers.register("swiftship", "submit_order", move |_| {
                executions.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Ok(DispatchReceipt::default())
                }
            });

            let breakers = Arc::new(CircuitBreakerRegistry::new(
                config.clone(),
                store.clone(),
                clock.clone(),
            ));
            let dispatcher = GuardedDispatcher::new(breakers, Arc::new(handlers));
            let dlq = Arc::new(DeadLetterQueue::new(
                Arc::new(InMemoryDlqStore::new()),
                store.clone(),
                dispatcher.clone(),
                clock.clone(),
            ));
            Arc::new(RetryScheduler::new(
                store.clone(),
                config.clone(),
                dispatcher,
                dlq,
                clock.clone(),
            ))
        })
        .collect()
}

async fn schedule_due_jobs(scheduler: &RetryScheduler, clock: &ManualClock) {
    for i in 0..JOBS {
        let job = DispatchJob::new(format!("order-{}", i), "swiftship", "submit_order", "{}");
        scheduler.schedule(job, 0).await.unwrap();
    }
    clock.advance(Duration::from_secs(2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_never_overlap() {
    let clock = Arc::new(ManualClock::starting_now());
    let store = Arc::new(InMemoryStateStore::with_clock(clock.clone()));
    let schedulers = create_schedulers(8, store.clone(), clock.clone(), Arc::new(AtomicU32::new(0)));
    schedule_due_jobs(&schedulers[0], &clock).await;

    let handles: Vec<_> = schedulers
        .iter()
        .cloned()
        .map(|scheduler| {
            tokio::spawn(async move {
                let mut mine = Vec::new();
                loop {
                    let claimed = scheduler.claim_ready(4).await.unwrap();
                    if claimed.is_empty() {
                        break;
                    }
                    mine.extend(claimed);
                    tokio::task::yield_now().await;
                }
                mine
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for handle in handles {
        for retry_id in handle.await.unwrap() {
            assert!(seen.insert(retry_id.clone()), "{} claimed twice", retry_id);
        }
    }

    // Whatever a racing caller gave up on is still claimable
    loop {
        let claimed = schedulers[0].claim_ready(16).await.unwrap();
        if claimed.is_empty() {
            break;
        }
        for retry_id in claimed {
            assert!(seen.insert(retry_id.clone()), "{} claimed twice", retry_id);
        }
    }

    assert_eq!(seen.len(), JOBS);
    let active = store.smembers("retry", "active").await.unwrap();
    assert_eq!(active.len(), JOBS);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_competing_workers_execute_each_retry_once() {
    let clock = Arc::new(ManualClock::starting_now());
    let store = Arc::new(InMemoryStateStore::with_clock(clock.clone()));
    let executions = Arc::new(AtomicU32::new(0));
    let schedulers = create_schedulers(3, store.clone(), clock.clone(), executions.clone());
    schedule_due_jobs(&schedulers[0], &clock).await;

    let workers: Vec<RetryWorker> = schedulers
        .iter()
        .enumerate()
        .map(|(i, scheduler)| {
            RetryWorker::new(
                scheduler.clone(),
                WorkerConfig::new()
                    .with_worker_id(format!("worker-{}", i))
                    .with_poll_interval(Duration::from_millis(5))
                    .with_batch_size(5)
                    .with_max_concurrency(4),
            )
        })
        .collect();

    for worker in &workers {
        worker.start().await.unwrap();
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let stats = schedulers[0].stats().await.unwrap();
        if stats.queued == 0 && stats.active == 0 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "queue never drained: {:?}", stats);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    for worker in &workers {
        worker.shutdown().await.unwrap();
    }

    assert_eq!(executions.load(Ordering::SeqCst), JOBS as u32);
    let succeeded: u64 = workers.iter().map(|w| w.stats().succeeded).sum();
    assert_eq!(succeeded, JOBS as u64);
}
