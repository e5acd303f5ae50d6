//! Dead letter queue data model

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::elapsed_between;
use crate::dispatch::{JobHints, OperationError, Payload};

// =============================================================================
// Status and priority
// =============================================================================

/// Lifecycle of a DLQ entry
///
/// ```text
///             retry()            success
///  Pending ───────────► Retrying ─────────► Resolved
///     ▲                    │
///     │      failure       │ failure, manual cap reached
///     └────────────────────┴──────────────► Abandoned
/// ```
///
/// `resolve()` and `abandon()` move any non-terminal entry directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqStatus {
    Pending,
    Retrying,
    Resolved,
    Abandoned,
    ManualReview,
}

impl DlqStatus {
    /// All statuses, in declaration order
    pub const ALL: [DlqStatus; 5] = [
        DlqStatus::Pending,
        DlqStatus::Retrying,
        DlqStatus::Resolved,
        DlqStatus::Abandoned,
        DlqStatus::ManualReview,
    ];

    /// Storage representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Retrying => "retrying",
            Self::Resolved => "resolved",
            Self::Abandoned => "abandoned",
            Self::ManualReview => "manual_review",
        }
    }

    /// Whether the entry needs no further work
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved | Self::Abandoned)
    }
}

impl fmt::Display for DlqStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DlqStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "retrying" => Ok(Self::Retrying),
            "resolved" => Ok(Self::Resolved),
            "abandoned" => Ok(Self::Abandoned),
            "manual_review" => Ok(Self::ManualReview),
            other => Err(format!("unknown DLQ status: {}", other)),
        }
    }
}

/// Triage priority, ordered `Low < Medium < High < Critical`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqPriority {
    Low,
    Medium,
    High,
    Critical,
}

impl DlqPriority {
    /// All priorities, lowest first
    pub const ALL: [DlqPriority; 4] = [
        DlqPriority::Low,
        DlqPriority::Medium,
        DlqPriority::High,
        DlqPriority::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Numeric rank used for storage ordering
    pub fn rank(&self) -> i16 {
        match self {
            Self::Low => 0,
            Self::Medium => 1,
            Self::High => 2,
            Self::Critical => 3,
        }
    }

    /// Inverse of [`DlqPriority::rank`]
    pub fn from_rank(rank: i16) -> Option<Self> {
        match rank {
            0 => Some(Self::Low),
            1 => Some(Self::Medium),
            2 => Some(Self::High),
            3 => Some(Self::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for DlqPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Entries
// =============================================================================

/// Last error recorded against an entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastError {
    pub message: String,
    pub code: String,
    pub status_code: Option<u16>,
    pub stack: Option<String>,
    pub at: DateTime<Utc>,
}

impl LastError {
    /// Capture an operation error at `at`
    pub fn from_operation(error: &OperationError, at: DateTime<Utc>) -> Self {
        Self {
            message: error.message.clone(),
            code: error.code.clone(),
            status_code: error.status_code,
            stack: error.stack.clone(),
            at,
        }
    }
}

/// A job parked for manual attention
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqEntry {
    pub id: Uuid,
    pub job_id: String,
    pub platform: String,
    pub operation: String,
    pub payload: Payload,
    pub last_error: LastError,

    /// Automatic retries consumed before the entry was parked
    pub retry_count: u32,
    /// Automatic retries the platform allows
    pub max_retries: u32,
    /// Operator-triggered retries, capped separately
    pub manual_retry_count: u32,

    pub status: DlqStatus,
    pub priority: DlqPriority,

    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub abandoned_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub resolution_notes: Option<String>,

    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl DlqEntry {
    /// Time since the entry was created
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        elapsed_between(self.created_at, now)
    }

    /// When the entry reached its terminal state, if it has
    pub fn terminal_at(&self) -> Option<DateTime<Utc>> {
        match self.status {
            DlqStatus::Resolved => self.resolved_at,
            DlqStatus::Abandoned => self.abandoned_at,
            _ => None,
        }
    }

    /// Whether the entry matches every set field of `filter`
    pub fn matches(&self, filter: &DlqFilter) -> bool {
        filter.status.map_or(true, |s| self.status == s)
            && filter.priority.map_or(true, |p| self.priority == p)
            && filter.platform.as_ref().map_or(true, |p| &self.platform == p)
            && filter.operation.as_ref().map_or(true, |o| &self.operation == o)
            && filter.job_id.as_ref().map_or(true, |j| &self.job_id == j)
    }
}

/// Input to [`crate::dlq::DeadLetterQueue::insert`]
#[derive(Debug, Clone)]
pub struct NewDlqEntry {
    pub job_id: String,
    pub platform: String,
    pub operation: String,
    pub payload: Payload,
    pub error: OperationError,
    pub retry_count: u32,
    pub max_retries: u32,
    pub hints: JobHints,
}

// =============================================================================
// Queries
// =============================================================================

/// Filter for listing DLQ entries
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DlqFilter {
    pub status: Option<DlqStatus>,
    pub platform: Option<String>,
    pub priority: Option<DlqPriority>,
    pub operation: Option<String>,
    pub job_id: Option<String>,
}

impl DlqFilter {
    pub fn with_status(mut self, status: DlqStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }

    pub fn with_priority(mut self, priority: DlqPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }
}

/// Pagination parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub offset: u32,
    pub limit: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 50,
        }
    }
}

impl Pagination {
    pub fn new(offset: u32, limit: u32) -> Self {
        Self { offset, limit }
    }
}

/// One page of entries plus the unpaginated total
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqPage {
    pub entries: Vec<DlqEntry>,
    pub total: u64,
    pub offset: u32,
    pub limit: u32,
}

impl DlqPage {
    /// Whether more entries follow this page
    pub fn has_more(&self) -> bool {
        (self.offset as u64).saturating_add(self.limit as u64) < self.total
    }
}

/// Canonical listing order: priority descending, then oldest first
pub(crate) fn sort_for_listing(entries: &mut [DlqEntry]) {
    entries.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    });
}

// =============================================================================
// Operation results
// =============================================================================

/// Result of a manual transition
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    /// The transition happened
    Applied(DlqEntry),
    /// The entry was already in a state that forbids the transition
    Conflict { status: DlqStatus },
}

/// Result of a manual retry
#[derive(Debug, Clone, PartialEq)]
pub enum DlqRetryOutcome {
    /// The platform accepted the job
    Resolved(DlqEntry),
    /// The retry failed; the entry is pending again
    Failed(DlqEntry),
    /// The retry failed and the manual retry cap was reached
    Abandoned(DlqEntry),
    /// The entry is already retrying or resolved
    Conflict { status: DlqStatus },
}

impl DlqRetryOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Resolved(_))
    }
}

/// Which entries a bulk retry targets
#[derive(Debug, Clone)]
pub enum BulkRetrySelector {
    /// Explicit ids; only pending or abandoned entries are retried
    Ids(Vec<Uuid>),
    /// Pending entries matching the filter; the status field is forced to pending
    Filter(DlqFilter),
}

/// Per-entry failure in a bulk retry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkRetryError {
    pub id: Uuid,
    pub error: String,
}

/// Totals from a bulk retry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkRetryReport {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub errors: Vec<BulkRetryError>,
}

// =============================================================================
// Stats
// =============================================================================

/// Aggregate over one group of entries
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupStats {
    pub count: u64,
    pub pending: u64,
    pub avg_retries: f64,
    pub max_retries: u32,
}

/// Aggregated view of the queue
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DlqStats {
    pub total: u64,
    pub by_status: BTreeMap<DlqStatus, u64>,
    pub by_platform: BTreeMap<String, GroupStats>,
    pub by_operation: BTreeMap<String, GroupStats>,
    pub by_priority: BTreeMap<DlqPriority, GroupStats>,
    /// Age of the oldest pending entry, if any
    pub oldest_pending_age: Option<Duration>,
}

impl DlqStats {
    /// Aggregate `entries` as of `now`
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a DlqEntry>, now: DateTime<Utc>) -> Self {
        #[derive(Default)]
        struct Acc {
            count: u64,
            pending: u64,
            retries_sum: u64,
            retries_max: u32,
        }

        impl Acc {
            fn add(&mut self, entry: &DlqEntry) {
                self.count += 1;
                if entry.status == DlqStatus::Pending {
                    self.pending += 1;
                }
                self.retries_sum += entry.retry_count as u64;
                self.retries_max = self.retries_max.max(entry.retry_count);
            }

            fn finish(self) -> GroupStats {
                GroupStats {
                    count: self.count,
                    pending: self.pending,
                    avg_retries: if self.count == 0 {
                        0.0
                    } else {
                        self.retries_sum as f64 / self.count as f64
                    },
                    max_retries: self.retries_max,
                }
            }
        }

        let mut total = 0u64;
        let mut by_status: BTreeMap<DlqStatus, u64> = BTreeMap::new();
        let mut by_platform: BTreeMap<String, Acc> = BTreeMap::new();
        let mut by_operation: BTreeMap<String, Acc> = BTreeMap::new();
        let mut by_priority: BTreeMap<DlqPriority, Acc> = BTreeMap::new();
        let mut oldest_pending: Option<DateTime<Utc>> = None;

        for entry in entries {
            total += 1;
            *by_status.entry(entry.status).or_default() += 1;
            by_platform.entry(entry.platform.clone()).or_default().add(entry);
            by_operation.entry(entry.operation.clone()).or_default().add(entry);
            by_priority.entry(entry.priority).or_default().add(entry);

            if entry.status == DlqStatus::Pending
                && oldest_pending.map_or(true, |t| entry.created_at < t)
            {
                oldest_pending = Some(entry.created_at);
            }
        }

        Self {
            total,
            by_status,
            by_platform: by_platform.into_iter().map(|(k, v)| (k, v.finish())).collect(),
            by_operation: by_operation.into_iter().map(|(k, v)| (k, v.finish())).collect(),
            by_priority: by_priority.into_iter().map(|(k, v)| (k, v.finish())).collect(),
            oldest_pending_age: oldest_pending.map(|t| elapsed_between(t, now)),
        }
    }

    /// Count of entries in `status`
    pub fn count(&self, status: DlqStatus) -> u64 {
        self.by_status.get(&status).copied().unwrap_or(0)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::create_entry;
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(DlqPriority::Low < DlqPriority::Medium);
        assert!(DlqPriority::High < DlqPriority::Critical);
        for priority in DlqPriority::ALL {
            assert_eq!(DlqPriority::from_rank(priority.rank()), Some(priority));
        }
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in DlqStatus::ALL {
            assert_eq!(status.as_str().parse::<DlqStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<DlqStatus>().is_err());
        assert_eq!(
            serde_json::to_string(&DlqStatus::ManualReview).unwrap(),
            "\"manual_review\""
        );
    }

    #[test]
    fn test_listing_order() {
        let now = Utc::now();
        let mut old_low = create_entry("swiftship", DlqStatus::Pending, now - chrono::Duration::hours(2));
        old_low.priority = DlqPriority::Low;
        let mut new_high = create_entry("swiftship", DlqStatus::Pending, now);
        new_high.priority = DlqPriority::High;
        let mut old_high = create_entry("swiftship", DlqStatus::Pending, now - chrono::Duration::hours(1));
        old_high.priority = DlqPriority::High;

        let mut entries = vec![old_low.clone(), new_high.clone(), old_high.clone()];
        sort_for_listing(&mut entries);
        let ids: Vec<_> = entries.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![old_high.id, new_high.id, old_low.id]);
    }

    #[test]
    fn test_stats_counts_by_status() {
        let now = Utc::now();
        let mut entries = vec![];
        for _ in 0..3 {
            entries.push(create_entry("swiftship", DlqStatus::Pending, now));
        }
        for _ in 0..2 {
            entries.push(create_entry("parcelpro", DlqStatus::Resolved, now));
        }
        entries.push(create_entry("parcelpro", DlqStatus::Abandoned, now));

        let stats = DlqStats::from_entries(&entries, now);
        assert_eq!(stats.total, 6);
        assert_eq!(stats.count(DlqStatus::Pending), 3);
        assert_eq!(stats.count(DlqStatus::Resolved), 2);
        assert_eq!(stats.count(DlqStatus::Abandoned), 1);
        assert_eq!(stats.count(DlqStatus::Retrying), 0);
        assert_eq!(stats.by_status.len(), 3);

        let swiftship = &stats.by_platform["swiftship"];
        assert_eq!(swiftship.count, 3);
        assert_eq!(swiftship.pending, 3);
        assert_eq!(stats.by_platform["parcelpro"].pending, 0);
        assert_eq!(stats.by_operation["submit_order"].avg_retries, 5.0);
    }

    #[test]
    fn test_oldest_pending_age() {
        let now = Utc::now();
        let entries = vec![
            create_entry("swiftship", DlqStatus::Pending, now - chrono::Duration::minutes(5)),
            create_entry("swiftship", DlqStatus::Pending, now - chrono::Duration::minutes(30)),
            create_entry("swiftship", DlqStatus::Resolved, now - chrono::Duration::hours(3)),
        ];

        let stats = DlqStats::from_entries(&entries, now);
        assert_eq!(stats.oldest_pending_age, Some(Duration::from_secs(30 * 60)));

        let empty = DlqStats::from_entries(&Vec::<DlqEntry>::new(), now);
        assert_eq!(empty.total, 0);
        assert_eq!(empty.oldest_pending_age, None);
    }

    #[test]
    fn test_filter_matching() {
        let entry = create_entry("swiftship", DlqStatus::Pending, Utc::now());
        assert!(entry.matches(&DlqFilter::default()));
        assert!(entry.matches(&DlqFilter::default().with_platform("swiftship")));
        assert!(!entry.matches(&DlqFilter::default().with_status(DlqStatus::Resolved)));
        assert!(!entry.matches(&DlqFilter::default().with_operation("cancel_order")));
    }
}
