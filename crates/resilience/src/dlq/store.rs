//! Persistence contract for the dead letter queue

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use super::types::{DlqEntry, DlqFilter, DlqStatus, Pagination};
use crate::persistence::StoreError;

/// Errors from DLQ operations
#[derive(Debug, Error)]
pub enum DlqError {
    #[error("DLQ entry not found: {0}")]
    NotFound(Uuid),

    #[error("state store error: {0}")]
    Store(#[from] StoreError),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for DlqError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Storage for DLQ entries
///
/// `list` and `scan` return entries in listing order: priority descending,
/// then oldest first.
#[async_trait]
pub trait DlqStore: Send + Sync + 'static {
    /// Insert a new entry
    async fn insert(&self, entry: &DlqEntry) -> Result<(), DlqError>;

    /// Fetch one entry
    async fn get(&self, id: Uuid) -> Result<Option<DlqEntry>, DlqError>;

    /// Overwrite an existing entry
    ///
    /// Returns [`DlqError::NotFound`] if the entry does not exist.
    async fn update(&self, entry: &DlqEntry) -> Result<(), DlqError>;

    /// Overwrite an entry only while its stored status is one of `expected`
    ///
    /// Returns `Ok(None)` when the write happened, or the current status when
    /// it did not. This is the compare-and-set that keeps two operators from
    /// retrying the same entry at once.
    async fn update_if(
        &self,
        entry: &DlqEntry,
        expected: &[DlqStatus],
    ) -> Result<Option<DlqStatus>, DlqError>;

    /// Remove an entry; returns false if it did not exist
    async fn delete(&self, id: Uuid) -> Result<bool, DlqError>;

    /// One page of matching entries plus the total match count
    async fn list(
        &self,
        filter: &DlqFilter,
        pagination: Pagination,
    ) -> Result<(Vec<DlqEntry>, u64), DlqError>;

    /// Every matching entry
    async fn scan(&self, filter: &DlqFilter) -> Result<Vec<DlqEntry>, DlqError>;

    /// Delete entries in `statuses` whose terminal timestamp is before `cutoff`
    async fn delete_terminal_before(
        &self,
        cutoff: DateTime<Utc>,
        statuses: &[DlqStatus],
    ) -> Result<u64, DlqError>;
}
