use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{
    models::StorageKey,
    storage::{BlobError, BlobStore},
};

/// Blob store that keeps everything in process memory.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: DashMap<StorageKey, Vec<u8>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn write(
        &self,
        key: &StorageKey,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64, BlobError> {
        let mut buffer = Vec::new();
        source.read_to_end(&mut buffer).await?;

        let written = buffer.len() as u64;
        self.blobs.insert(key.clone(), buffer);
        Ok(written)
    }

    async fn read(&self, key: &StorageKey) -> Result<Vec<u8>, BlobError> {
        self.blobs
            .get(key)
            .map(|blob| blob.value().clone())
            .ok_or_else(|| BlobError::NotFound(key.clone()))
    }

    async fn exists(&self, key: &StorageKey) -> Result<bool, BlobError> {
        Ok(self.blobs.contains_key(key))
    }

    async fn size(&self, key: &StorageKey) -> Result<u64, BlobError> {
        self.blobs
            .get(key)
            .map(|blob| blob.value().len() as u64)
            .ok_or_else(|| BlobError::NotFound(key.clone()))
    }
}
