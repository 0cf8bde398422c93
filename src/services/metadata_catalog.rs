use dashmap::{mapref::entry::Entry, DashMap};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::debug;

use crate::models::{FileRecord, Page, PageRequest, StorageKey, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    #[error("Unknown owner: {0}")]
    UnknownOwner(UserId),

    #[error("Catalog already exists for owner: {0}")]
    OwnerExists(UserId),

    #[error("Catalog unavailable: {0}")]
    Unavailable(String),
}

/// Outcome of an append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed {
    /// The record as stored, which is what readers will see.
    pub record: FileRecord,
    /// The record that previously lived under the same storage key.
    pub replaced: Option<FileRecord>,
}

/// Ordered per-user file records.
///
/// Records are kept in `sequence` order. An append is visible to every
/// `list` that starts after it returns, and each `list` reads one
/// consistent snapshot.
#[cfg_attr(test, mockall::automock)]
pub trait MetadataCatalog: Send + Sync {
    fn open_owner(&self, owner: UserId) -> Result<(), CatalogError>;

    /// Inserts `record`, replacing any record with the same storage key.
    fn append(&self, record: FileRecord) -> Result<Committed, CatalogError>;

    fn get(&self, owner: UserId, key: &StorageKey) -> Result<Option<FileRecord>, CatalogError>;

    fn list(&self, owner: UserId, request: PageRequest) -> Result<Page<FileRecord>, CatalogError>;

    /// Sum of `size_bytes` over the owner's records.
    fn total_bytes(&self, owner: UserId) -> Result<u64, CatalogError>;
}

#[derive(Debug, Default)]
struct OwnerFiles {
    records: Vec<FileRecord>,
    sequences: HashMap<StorageKey, u64>,
}

impl OwnerFiles {
    fn position_of(&self, sequence: u64) -> Result<usize, usize> {
        self.records
            .binary_search_by_key(&sequence, |record| record.sequence)
    }

    fn insert(&mut self, mut record: FileRecord) -> Committed {
        let replaced = self
            .sequences
            .remove(&record.storage_key)
            .and_then(|sequence| self.position_of(sequence).ok())
            .map(|index| self.records.remove(index));

        let index = self
            .records
            .partition_point(|existing| existing.sequence < record.sequence);

        // Uploads can finish out of admission order; pin the timestamp
        // between its neighbours so it never decreases along the list.
        if let Some(previous) = index.checked_sub(1).map(|i| &self.records[i]) {
            record.uploaded_at = record.uploaded_at.max(previous.uploaded_at);
        }
        if let Some(next) = self.records.get(index) {
            record.uploaded_at = record.uploaded_at.min(next.uploaded_at);
        }

        self.sequences
            .insert(record.storage_key.clone(), record.sequence);
        self.records.insert(index, record.clone());

        Committed { record, replaced }
    }

    fn get(&self, key: &StorageKey) -> Option<&FileRecord> {
        let sequence = self.sequences.get(key)?;
        self.position_of(*sequence)
            .ok()
            .map(|index| &self.records[index])
    }
}

#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    owners: DashMap<UserId, Arc<Mutex<OwnerFiles>>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn owner(&self, owner: UserId) -> Result<Arc<Mutex<OwnerFiles>>, CatalogError> {
        self.owners
            .get(&owner)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(CatalogError::UnknownOwner(owner))
    }
}

fn lock(files: &Mutex<OwnerFiles>) -> MutexGuard<'_, OwnerFiles> {
    files.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MetadataCatalog for InMemoryCatalog {
    fn open_owner(&self, owner: UserId) -> Result<(), CatalogError> {
        match self.owners.entry(owner) {
            Entry::Occupied(_) => Err(CatalogError::OwnerExists(owner)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::default());
                Ok(())
            }
        }
    }

    fn append(&self, record: FileRecord) -> Result<Committed, CatalogError> {
        let owner = record.owner_id;
        let files = self.owner(owner)?;
        let committed = lock(&files).insert(record);

        debug!(
            user_id = %owner,
            storage_key = %committed.record.storage_key,
            sequence = committed.record.sequence,
            replaced = committed.replaced.is_some(),
            "Catalog record committed"
        );

        Ok(committed)
    }

    fn get(&self, owner: UserId, key: &StorageKey) -> Result<Option<FileRecord>, CatalogError> {
        let files = self.owner(owner)?;
        let files = lock(&files);
        Ok(files.get(key).cloned())
    }

    fn list(&self, owner: UserId, request: PageRequest) -> Result<Page<FileRecord>, CatalogError> {
        let files = self.owner(owner)?;
        let files = lock(&files);
        Ok(Page::from_slice(&files.records, request))
    }

    fn total_bytes(&self, owner: UserId) -> Result<u64, CatalogError> {
        let files = self.owner(owner)?;
        let files = lock(&files);
        Ok(files.records.iter().map(|record| record.size_bytes).sum())
    }
}
