//! Process settings read from the environment
//!
//! | Variable                    | Default                            |
//! |-----------------------------|------------------------------------|
//! | `REDIS_URL`                 | required                           |
//! | `DATABASE_URL`              | required                           |
//! | `PLATFORM_CONFIG_PATH`      | unset: defaults for every platform |
//! | `WORKER_ID`                 | `retry-worker-{uuid}`              |
//! | `POLL_INTERVAL_MS`          | `5000`                             |
//! | `MAX_CONCURRENT_RETRIES`    | `10`                               |
//! | `RETRY_BATCH_SIZE`          | `10`                               |
//! | `DLQ_RETENTION_DAYS`        | `30`                               |
//! | `DLQ_CLEANUP_INTERVAL_SECS` | `3600`                             |
//! | `LOG_LEVEL`                 | `info`                             |

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use dispatch_resilience::dlq::DlqConfig;
use dispatch_resilience::worker::WorkerConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("{0} environment variable required")]
    Missing(&'static str),

    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

/// Settings for one worker process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub redis_url: String,
    pub database_url: String,
    pub platform_config_path: Option<PathBuf>,
    pub worker_id: String,
    pub poll_interval: Duration,
    pub max_concurrent_retries: usize,
    pub retry_batch_size: usize,
    pub dlq_retention_days: u32,
    pub dlq_cleanup_interval: Duration,
    pub log_level: String,
}

impl WorkerSettings {
    /// Read settings from the process environment
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read settings through `lookup`
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &'static str| {
            lookup(name)
                .filter(|v| !v.is_empty())
                .ok_or(SettingsError::Missing(name))
        };

        Ok(Self {
            redis_url: required("REDIS_URL")?,
            database_url: required("DATABASE_URL")?,
            platform_config_path: lookup("PLATFORM_CONFIG_PATH")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            worker_id: lookup("WORKER_ID")
                .unwrap_or_else(|| format!("retry-worker-{}", Uuid::now_v7())),
            poll_interval: Duration::from_millis(parse(&lookup, "POLL_INTERVAL_MS", 5_000)?),
            max_concurrent_retries: parse(&lookup, "MAX_CONCURRENT_RETRIES", 10)?,
            retry_batch_size: parse(&lookup, "RETRY_BATCH_SIZE", 10)?,
            dlq_retention_days: parse(&lookup, "DLQ_RETENTION_DAYS", 30)?,
            dlq_cleanup_interval: Duration::from_secs(parse(
                &lookup,
                "DLQ_CLEANUP_INTERVAL_SECS",
                3_600,
            )?),
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig::new()
            .with_worker_id(self.worker_id.clone())
            .with_poll_interval(self.poll_interval)
            .with_max_concurrency(self.max_concurrent_retries)
            .with_batch_size(self.retry_batch_size)
    }

    pub fn dlq_config(&self) -> DlqConfig {
        DlqConfig::new().with_retention_days(self.dlq_retention_days)
    }

    /// Default tracing filter at the configured level
    pub fn log_filter(&self) -> String {
        format!(
            "dispatch_worker={level},dispatch_resilience={level}",
            level = self.log_level
        )
    }
}

fn parse<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, SettingsError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| SettingsError::Invalid { name, value }),
    }
}
