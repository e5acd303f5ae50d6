//! Retry queue entries

use std::fmt;

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::dispatch::{DispatchJob, JobHints, OperationError, Payload};

/// Where an entry is in its attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStatus {
    /// Waiting in the queue for `retry_at`
    Scheduled,
    /// Claimed and being dispatched
    Processing,
}

impl fmt::Display for RetryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scheduled => write!(f, "scheduled"),
            Self::Processing => write!(f, "processing"),
        }
    }
}

/// One queued retry of a job
///
/// `retry_count` is the number of this attempt: the first retry after a
/// failed initial dispatch carries `retry_count = 1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryEntry {
    pub retry_id: String,
    pub job_id: String,
    pub platform: String,
    pub operation: String,
    pub payload: Payload,
    #[serde(default)]
    pub hints: JobHints,
    pub retry_count: u32,
    pub max_retries: u32,
    pub scheduled_at: DateTime<Utc>,
    pub retry_at: DateTime<Utc>,
    pub status: RetryStatus,
    pub last_error: Option<OperationError>,
}

impl RetryEntry {
    /// The job this entry retries
    pub fn job(&self) -> DispatchJob {
        DispatchJob {
            job_id: self.job_id.clone(),
            platform: self.platform.clone(),
            operation: self.operation.clone(),
            payload: self.payload.clone(),
            hints: self.hints.clone(),
        }
    }

    /// Queue score: `retry_at` in epoch milliseconds
    pub fn score(&self) -> f64 {
        self.retry_at.timestamp_millis() as f64
    }

    /// Whether the entry is due at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.retry_at <= now
    }
}

/// New unique retry id: `{platform}_{job_id}_{operation}_{micros}_{suffix}`
pub fn generate_retry_id(job: &DispatchJob, scheduled_at: DateTime<Utc>) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!(
        "{}_{}_{}_{}_{}",
        job.platform,
        job.job_id,
        job.operation,
        scheduled_at.timestamp_micros(),
        suffix
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_id_format_and_uniqueness() {
        let job = DispatchJob::new("order-7", "swiftship", "submit_order", "{}");
        let at = Utc::now();

        let a = generate_retry_id(&job, at);
        let b = generate_retry_id(&job, at);
        assert_ne!(a, b);
        assert!(a.starts_with(&format!("swiftship_order-7_submit_order_{}_", at.timestamp_micros())));
        assert_eq!(a.rsplit('_').next().unwrap().len(), 8);
    }

    #[test]
    fn test_entry_serializes_payload_as_base64() {
        let now = Utc::now();
        let job = DispatchJob::new("order-7", "swiftship", "submit_order", "hi");
        let entry = RetryEntry {
            retry_id: generate_retry_id(&job, now),
            job_id: job.job_id.clone(),
            platform: job.platform.clone(),
            operation: job.operation.clone(),
            payload: job.payload.clone(),
            hints: JobHints::default(),
            retry_count: 1,
            max_retries: 5,
            scheduled_at: now,
            retry_at: now,
            status: RetryStatus::Scheduled,
            last_error: None,
        };

        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["payload"], "aGk=");
        assert_eq!(json["status"], "scheduled");
        assert_eq!(entry.job(), job);
        assert!(entry.is_due(now));
    }
}
