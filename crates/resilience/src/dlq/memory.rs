//! In-memory implementation of DlqStore for testing

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::{DlqError, DlqStore};
use super::types::{sort_for_listing, DlqEntry, DlqFilter, DlqStatus, Pagination};

/// In-memory implementation of DlqStore
///
/// Same semantics as the PostgreSQL implementation, process-local.
///
/// # Example
///
/// ```
/// use dispatch_resilience::dlq::InMemoryDlqStore;
///
/// let store = InMemoryDlqStore::new();
/// assert!(store.is_empty());
/// ```
#[derive(Debug, Default)]
pub struct InMemoryDlqStore {
    entries: RwLock<HashMap<Uuid, DlqEntry>>,
}

impl InMemoryDlqStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn matching(&self, filter: &DlqFilter) -> Vec<DlqEntry> {
        let mut entries: Vec<DlqEntry> = self
            .entries
            .read()
            .values()
            .filter(|e| e.matches(filter))
            .cloned()
            .collect();
        sort_for_listing(&mut entries);
        entries
    }
}

#[async_trait]
impl DlqStore for InMemoryDlqStore {
    async fn insert(&self, entry: &DlqEntry) -> Result<(), DlqError> {
        self.entries.write().insert(entry.id, entry.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<DlqEntry>, DlqError> {
        Ok(self.entries.read().get(&id).cloned())
    }

    async fn update(&self, entry: &DlqEntry) -> Result<(), DlqError> {
        let mut entries = self.entries.write();
        match entries.get_mut(&entry.id) {
            Some(existing) => {
                *existing = entry.clone();
                Ok(())
            }
            None => Err(DlqError::NotFound(entry.id)),
        }
    }

    async fn update_if(
        &self,
        entry: &DlqEntry,
        expected: &[DlqStatus],
    ) -> Result<Option<DlqStatus>, DlqError> {
        let mut entries = self.entries.write();
        let existing = entries
            .get_mut(&entry.id)
            .ok_or(DlqError::NotFound(entry.id))?;

        if !expected.contains(&existing.status) {
            return Ok(Some(existing.status));
        }
        *existing = entry.clone();
        Ok(None)
    }

    async fn delete(&self, id: Uuid) -> Result<bool, DlqError> {
        Ok(self.entries.write().remove(&id).is_some())
    }

    async fn list(
        &self,
        filter: &DlqFilter,
        pagination: Pagination,
    ) -> Result<(Vec<DlqEntry>, u64), DlqError> {
        let entries = self.matching(filter);
        let total = entries.len() as u64;
        let page = entries
            .into_iter()
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .collect();
        Ok((page, total))
    }

    async fn scan(&self, filter: &DlqFilter) -> Result<Vec<DlqEntry>, DlqError> {
        Ok(self.matching(filter))
    }

    async fn delete_terminal_before(
        &self,
        cutoff: DateTime<Utc>,
        statuses: &[DlqStatus],
    ) -> Result<u64, DlqError> {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| {
            let expired = statuses.contains(&e.status)
                && e.terminal_at().or(e.last_attempt_at).unwrap_or(e.created_at) < cutoff;
            !expired
        });
        Ok((before - entries.len()) as u64)
    }
}
