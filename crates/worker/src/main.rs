use std::sync::Arc;

use anyhow::{Context, Result};
use dispatch_resilience::dispatch::HandlerRegistry;
use dispatch_worker::{DispatchWorker, WorkerSettings};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let dotenv = dotenvy::dotenv();
    let settings = WorkerSettings::from_env().context("Invalid worker settings")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| settings.log_filter().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Ok(path) = dotenv {
        tracing::info!("Loaded .env from {:?}", path);
    }
    tracing::info!(worker_id = %settings.worker_id, "dispatch-worker starting...");

    // Platform adapters register their operations here
    let handlers = HandlerRegistry::new();
    if handlers.is_empty() {
        tracing::warn!("No platform handlers registered; due retries will be dead-lettered");
    }

    let mut worker = DispatchWorker::build(settings, Arc::new(handlers))
        .await
        .context("Failed to build dispatch worker")?;
    worker.start().await?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Received shutdown signal");

    worker.shutdown().await?;
    tracing::info!("Worker shutdown complete");
    Ok(())
}
