use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::{
    io::AsyncRead,
    sync::{Mutex as AsyncMutex, OwnedMutexGuard},
};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    models::{FileRecord, Page, PageRequest, Principal, QuotaUsage, StorageKey, UserId},
    services::{
        metadata_catalog::{CatalogError, MetadataCatalog},
        quota_ledger::{QuotaError, QuotaLedger},
    },
    storage::{BlobStore, ExactLength},
};

pub const MAX_FILENAME_LENGTH: usize = 255;

/// Oldest reconciliation entries are dropped past this many.
pub const MAX_RECONCILIATION_ENTRIES: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("Storage quota exceeded: requested {requested} bytes, {available} bytes available")]
    QuotaExceeded { requested: u64, available: u64 },

    #[error("Failed to persist file: {0}")]
    PersistenceFailed(String),

    #[error("Unknown user: {0}")]
    UnknownUser(UserId),

    #[error("Invalid upload: {0}")]
    InvalidUpload(String),

    #[error("Catalog error: {0}")]
    Catalog(String),
}

impl From<QuotaError> for StorageError {
    fn from(err: QuotaError) -> Self {
        match err {
            QuotaError::Exceeded {
                requested,
                available,
            } => StorageError::QuotaExceeded {
                requested,
                available,
            },
            QuotaError::UnknownUser(user_id) => StorageError::UnknownUser(user_id),
            QuotaError::AccountExists(user_id) => {
                StorageError::InvalidUpload(format!("account {} already provisioned", user_id))
            }
        }
    }
}

impl From<CatalogError> for StorageError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::UnknownOwner(user_id) => StorageError::UnknownUser(user_id),
            other => StorageError::Catalog(other.to_string()),
        }
    }
}

/// Bytes that reached the blob store without a matching catalog record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationEntry {
    pub user_id: UserId,
    pub storage_key: StorageKey,
    pub original_name: String,
    pub size_bytes: u64,
    pub reason: String,
    pub detected_at: DateTime<Utc>,
}

/// A granted quota charge that has not been confirmed yet.
///
/// Dropping it unconfirmed gives the bytes back, which covers both failed
/// writes and callers that abandon the upload future mid-flight.
struct Reservation {
    ledger: Arc<dyn QuotaLedger>,
    user_id: UserId,
    bytes: u64,
    settled: bool,
}

impl Reservation {
    fn new(ledger: Arc<dyn QuotaLedger>, user_id: UserId, bytes: u64) -> Self {
        Self {
            ledger,
            user_id,
            bytes,
            settled: false,
        }
    }

    fn confirm(mut self) {
        self.settled = true;
    }

    fn roll_back(mut self) {
        self.settled = true;
        self.give_back();
    }

    fn give_back(&self) {
        if self.bytes == 0 {
            return;
        }
        if let Err(e) = self.ledger.release(self.user_id, self.bytes) {
            error!(user_id = %self.user_id, bytes = self.bytes, error = %e, "Failed to release reservation");
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.settled {
            warn!(user_id = %self.user_id, bytes = self.bytes, "Upload abandoned; releasing reservation");
            self.give_back();
        }
    }
}

type KeyLocks = DashMap<StorageKey, Arc<AsyncMutex<()>>>;

/// Serializes uploads that target the same storage key.
struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    key: StorageKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Coordinates quota admission, blob persistence and catalog records.
pub struct StorageService {
    ledger: Arc<dyn QuotaLedger>,
    catalog: Arc<dyn MetadataCatalog>,
    blobs: Arc<dyn BlobStore>,
    key_locks: KeyLocks,
    reconciliation: Mutex<VecDeque<ReconciliationEntry>>,
}

impl StorageService {
    pub fn new(
        ledger: Arc<dyn QuotaLedger>,
        catalog: Arc<dyn MetadataCatalog>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            ledger,
            catalog,
            blobs,
            key_locks: DashMap::new(),
            reconciliation: Mutex::new(VecDeque::new()),
        }
    }

    /// Opens the quota account and the file catalog of a new user.
    pub fn provision(&self, user_id: UserId, quota_bytes: u64) -> Result<(), StorageError> {
        self.ledger.open_account(user_id, quota_bytes)?;
        self.catalog.open_owner(user_id)?;
        info!(%user_id, quota_bytes, "Provisioned storage");
        Ok(())
    }

    /// Stores `source` as `filename` for the principal.
    ///
    /// Re-uploading an existing filename overwrites it and only charges the
    /// growth in size. A rejected or failed upload leaves quota and catalog
    /// exactly as they were; `source` is not touched unless quota is granted.
    #[instrument(
        skip_all,
        fields(user_id = %principal.user_id, filename = %filename, size = size_bytes)
    )]
    pub async fn upload<R>(
        &self,
        principal: &Principal,
        filename: &str,
        size_bytes: u64,
        source: R,
    ) -> Result<FileRecord, StorageError>
    where
        R: AsyncRead + Send + Unpin,
    {
        let user_id = principal.user_id;
        validate_filename(filename)?;
        if size_bytes == 0 {
            return Err(StorageError::InvalidUpload("File is empty".to_string()));
        }

        let key = StorageKey::derive(user_id, filename);
        let _key_guard = self.lock_key(&key).await;

        let previous_size = self
            .catalog
            .get(user_id, &key)?
            .map_or(0, |record| record.size_bytes);
        let charge = size_bytes.saturating_sub(previous_size);

        let grant = self.ledger.try_reserve(user_id, charge).map_err(|e| {
            if let QuotaError::Exceeded { available, .. } = e {
                warn!(charge, available, "Upload rejected: storage quota exceeded");
            }
            StorageError::from(e)
        })?;
        let reservation = Reservation::new(Arc::clone(&self.ledger), user_id, charge);
        debug!(charge, sequence = grant.sequence, used = grant.new_used, "Quota reserved");

        let mut reader = ExactLength::new(source, size_bytes);
        let written = match self.blobs.write(&key, &mut reader).await {
            Ok(written) => written,
            Err(e) => {
                error!(storage_key = %key, error = %e, "Failed to persist file; releasing reservation");
                reservation.roll_back();
                return Err(StorageError::PersistenceFailed(e.to_string()));
            }
        };
        if written != size_bytes {
            error!(storage_key = %key, written, "Blob store wrote an unexpected byte count");
            reservation.roll_back();
            return Err(StorageError::PersistenceFailed(format!(
                "wrote {} bytes, expected {}",
                written, size_bytes
            )));
        }
        reservation.confirm();

        let record = FileRecord {
            storage_key: key.clone(),
            original_name: filename.to_string(),
            size_bytes,
            content_type: mime_guess::from_path(filename)
                .first_or_octet_stream()
                .essence_str()
                .to_string(),
            uploaded_at: Utc::now(),
            owner_id: user_id,
            sequence: grant.sequence,
        };

        match self.catalog.append(record.clone()) {
            Ok(committed) => {
                if previous_size > size_bytes {
                    let refund = previous_size - size_bytes;
                    if let Err(e) = self.ledger.release(user_id, refund) {
                        error!(refund, error = %e, "Failed to refund shrunk overwrite");
                    }
                }
                info!(
                    storage_key = %key,
                    overwrite = committed.replaced.is_some(),
                    "File uploaded"
                );
                Ok(committed.record)
            }
            Err(e) => {
                self.flag_reconciliation(&record, e.to_string());
                Ok(record)
            }
        }
    }

    pub fn remaining_quota(&self, principal: &Principal) -> Result<QuotaUsage, StorageError> {
        Ok(self.ledger.usage(principal.user_id)?)
    }

    pub fn list_files(
        &self,
        principal: &Principal,
        request: PageRequest,
    ) -> Result<Page<FileRecord>, StorageError> {
        Ok(self.catalog.list(principal.user_id, request)?)
    }

    /// Ledger charge minus catalogued bytes for the principal.
    ///
    /// Zero once uploads settle, unless a catalog append was flagged for
    /// reconciliation.
    pub fn usage_drift(&self, principal: &Principal) -> Result<i128, StorageError> {
        let used = self.ledger.usage(principal.user_id)?.used_bytes;
        let catalogued = self.catalog.total_bytes(principal.user_id)?;
        Ok(i128::from(used) - i128::from(catalogued))
    }

    /// Uploads whose bytes are stored but whose catalog append failed.
    pub fn pending_reconciliation(&self) -> Vec<ReconciliationEntry> {
        self.reconciliation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Drains the reconciliation list, handing the entries to the caller.
    pub fn take_reconciliation(&self) -> Vec<ReconciliationEntry> {
        self.reconciliation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }

    async fn lock_key(&self, key: &StorageKey) -> KeyGuard<'_> {
        let lock = Arc::clone(self.key_locks.entry(key.clone()).or_default().value());
        let guard = lock.lock_owned().await;

        KeyGuard {
            locks: &self.key_locks,
            key: key.clone(),
            guard: Some(guard),
        }
    }

    fn flag_reconciliation(&self, record: &FileRecord, reason: String) {
        error!(
            user_id = %record.owner_id,
            storage_key = %record.storage_key,
            size = record.size_bytes,
            reason = %reason,
            "Reconciliation required: file stored without catalog record"
        );

        let mut pending = self
            .reconciliation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if pending.len() >= MAX_RECONCILIATION_ENTRIES {
            if let Some(dropped) = pending.pop_front() {
                error!(
                    storage_key = %dropped.storage_key,
                    "Reconciliation list full; dropping oldest entry"
                );
            }
        }
        pending.push_back(ReconciliationEntry {
            user_id: record.owner_id,
            storage_key: record.storage_key.clone(),
            original_name: record.original_name.clone(),
            size_bytes: record.size_bytes,
            reason,
            detected_at: Utc::now(),
        });
    }
}

fn validate_filename(filename: &str) -> Result<(), StorageError> {
    if filename.trim().is_empty() {
        return Err(StorageError::InvalidUpload(
            "Filename must not be empty".to_string(),
        ));
    }
    if filename.chars().count() > MAX_FILENAME_LENGTH {
        return Err(StorageError::InvalidUpload(format!(
            "Filename must be at most {} characters",
            MAX_FILENAME_LENGTH
        )));
    }
    if filename.chars().any(char::is_control) {
        return Err(StorageError::InvalidUpload(
            "Filename contains control characters".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        services::{
            metadata_catalog::{InMemoryCatalog, MockMetadataCatalog},
            quota_ledger::{InMemoryQuotaLedger, MockQuotaLedger},
        },
        storage::MemoryBlobStore,
    };

    fn principal() -> Principal {
        Principal {
            user_id: UserId::new(),
            username: "alice".to_string(),
        }
    }

    fn service_for(principal: &Principal, quota: u64) -> (StorageService, Arc<MemoryBlobStore>) {
        let blobs = Arc::new(MemoryBlobStore::new());
        let service = StorageService::new(
            Arc::new(InMemoryQuotaLedger::new()),
            Arc::new(InMemoryCatalog::new()),
            blobs.clone(),
        );
        service.provision(principal.user_id, quota).unwrap();
        (service, blobs)
    }

    #[tokio::test]
    async fn test_upload_records_file_and_charges_quota() {
        let alice = principal();
        let (service, blobs) = service_for(&alice, 100);

        let record = service
            .upload(&alice, "notes.txt", 11, &b"hello world"[..])
            .await
            .unwrap();

        assert_eq!(record.size_bytes, 11);
        assert_eq!(record.content_type, "text/plain");
        assert_eq!(blobs.read(&record.storage_key).await.unwrap(), b"hello world");
        assert_eq!(service.remaining_quota(&alice).unwrap().used_bytes, 11);

        let page = service.list_files(&alice, PageRequest::default()).unwrap();
        assert_eq!(page.items, vec![record]);
    }

    #[tokio::test]
    async fn test_rejects_invalid_uploads_without_side_effects() {
        let alice = principal();
        let (service, blobs) = service_for(&alice, 100);

        assert!(matches!(
            service.upload(&alice, "empty.txt", 0, &b""[..]).await,
            Err(StorageError::InvalidUpload(_))
        ));
        assert!(matches!(
            service.upload(&alice, "  ", 3, &b"abc"[..]).await,
            Err(StorageError::InvalidUpload(_))
        ));
        assert!(blobs.is_empty());
        assert_eq!(service.remaining_quota(&alice).unwrap().used_bytes, 0);
    }

    #[tokio::test]
    async fn test_declared_size_mismatch_rolls_back() {
        let alice = principal();
        let (service, _) = service_for(&alice, 100);

        let result = service.upload(&alice, "a.bin", 10, &b"short"[..]).await;

        assert!(matches!(result, Err(StorageError::PersistenceFailed(_))));
        assert_eq!(service.remaining_quota(&alice).unwrap().used_bytes, 0);
        assert_eq!(
            service.list_files(&alice, PageRequest::default()).unwrap().total_items,
            0
        );
    }

    #[tokio::test]
    async fn test_unknown_user_is_surfaced() {
        let alice = principal();
        let (service, _) = service_for(&alice, 100);
        let stranger = principal();

        assert_eq!(
            service.upload(&stranger, "a.txt", 1, &b"a"[..]).await.unwrap_err(),
            StorageError::UnknownUser(stranger.user_id)
        );
        assert_eq!(
            service.remaining_quota(&stranger).unwrap_err(),
            StorageError::UnknownUser(stranger.user_id)
        );
    }

    #[tokio::test]
    async fn test_catalog_failure_is_flagged_for_reconciliation() {
        let alice = principal();

        let mut catalog = MockMetadataCatalog::new();
        catalog.expect_get().returning(|_, _| Ok(None));
        catalog
            .expect_append()
            .returning(|_| Err(CatalogError::Unavailable("disk full".to_string())));
        catalog.expect_total_bytes().returning(|_| Ok(0));

        let ledger = Arc::new(InMemoryQuotaLedger::new());
        ledger.open_account(alice.user_id, 100).unwrap();

        let service = StorageService::new(
            ledger.clone(),
            Arc::new(catalog),
            Arc::new(MemoryBlobStore::new()),
        );

        let record = service
            .upload(&alice, "a.txt", 3, &b"abc"[..])
            .await
            .unwrap();

        let pending = service.pending_reconciliation();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].storage_key, record.storage_key);
        assert_eq!(pending[0].size_bytes, 3);
        // The bytes are on disk, so they stay charged.
        assert_eq!(ledger.usage(alice.user_id).unwrap().used_bytes, 3);
        assert_eq!(service.usage_drift(&alice).unwrap(), 3);

        let taken = service.take_reconciliation();
        assert_eq!(taken, pending);
        assert!(service.pending_reconciliation().is_empty());
    }

    #[tokio::test]
    async fn test_reconciliation_list_is_bounded() {
        let alice = principal();

        let mut catalog = MockMetadataCatalog::new();
        catalog.expect_get().returning(|_, _| Ok(None));
        catalog
            .expect_append()
            .returning(|_| Err(CatalogError::Unavailable("offline".to_string())));

        let ledger = Arc::new(InMemoryQuotaLedger::new());
        ledger.open_account(alice.user_id, u64::MAX).unwrap();
        let service = StorageService::new(
            ledger,
            Arc::new(catalog),
            Arc::new(MemoryBlobStore::new()),
        );

        let total = MAX_RECONCILIATION_ENTRIES + 3;
        for i in 0..total {
            service
                .upload(&alice, &format!("f{}.bin", i), 1, &b"x"[..])
                .await
                .unwrap();
        }

        let pending = service.take_reconciliation();
        assert_eq!(pending.len(), MAX_RECONCILIATION_ENTRIES);
        assert_eq!(pending[0].original_name, "f3.bin");
        assert_eq!(
            pending.last().unwrap().original_name,
            format!("f{}.bin", total - 1)
        );
    }

    #[tokio::test]
    async fn test_rejected_reservation_never_reads_source() {
        let alice = principal();

        let mut ledger = MockQuotaLedger::new();
        ledger.expect_try_reserve().returning(|_, delta| {
            Err(QuotaError::Exceeded {
                requested: delta,
                available: 0,
            })
        });
        ledger.expect_release().never();

        let mut catalog = MockMetadataCatalog::new();
        catalog.expect_get().returning(|_, _| Ok(None));
        catalog.expect_append().never();

        let blobs = Arc::new(MemoryBlobStore::new());
        let service = StorageService::new(Arc::new(ledger), Arc::new(catalog), blobs.clone());

        let mut source = &b"payload"[..];
        let err = service
            .upload(&alice, "a.txt", 7, &mut source)
            .await
            .unwrap_err();

        assert_eq!(
            err,
            StorageError::QuotaExceeded {
                requested: 7,
                available: 0
            }
        );
        assert_eq!(source.len(), 7);
        assert!(blobs.is_empty());
    }

    #[tokio::test]
    async fn test_key_locks_are_cleaned_up() {
        let alice = principal();
        let (service, _) = service_for(&alice, 100);

        service.upload(&alice, "a.txt", 1, &b"a"[..]).await.unwrap();
        service.upload(&alice, "b.txt", 1, &b"b"[..]).await.unwrap();

        assert!(service.key_locks.is_empty());
    }
}
