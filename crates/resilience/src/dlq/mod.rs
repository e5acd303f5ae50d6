//! Dead letter queue for jobs that exhausted automatic retries
//!
//! This module provides:
//! - [`DeadLetterQueue`] - Triage, manual retry and cleanup of parked jobs
//! - [`DlqStore`] - Storage contract, with [`InMemoryDlqStore`] and [`PostgresDlqStore`]
//! - [`PriorityPolicy`] - Priority assigned to new entries

mod memory;
mod postgres;
mod priority;
mod service;
mod store;
mod types;

pub use memory::InMemoryDlqStore;
pub use postgres::PostgresDlqStore;
pub use priority::PriorityPolicy;
pub use service::{
    is_abandoned, DeadLetterQueue, DlqConfig, ABANDONED_SET, DEFAULT_CLEANUP_STATUSES,
    DLQ_NAMESPACE,
};
pub use store::{DlqError, DlqStore};
pub use types::{
    BulkRetryError, BulkRetryReport, BulkRetrySelector, DlqEntry, DlqFilter, DlqPage, DlqPriority,
    DlqRetryOutcome, DlqStats, DlqStatus, GroupStats, LastError, NewDlqEntry, Pagination,
    TransitionOutcome,
};
