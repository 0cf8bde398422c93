use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use tokio::{
    fs,
    io::{AsyncRead, AsyncWriteExt},
};
use tracing::{debug, warn};

use crate::{
    models::StorageKey,
    storage::{BlobError, BlobStore},
};

/// Blob store on the local filesystem, one directory per user.
///
/// Writes go to a `.part` sibling first and are renamed into place once
/// synced, so a crash, failed copy or abandoned write never leaves a
/// truncated blob behind.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    base_path: PathBuf,
}

impl LocalBlobStore {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Result<Self, BlobError> {
        let base_path = base_path.as_ref().to_path_buf();

        std::fs::create_dir_all(&base_path)?;

        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn get_full_path(&self, key: &StorageKey) -> PathBuf {
        self.base_path.join(key.as_str())
    }

    async fn write_part(
        part_path: &Path,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> io::Result<u64> {
        let mut file = fs::File::create(part_path).await?;
        let written = tokio::io::copy(source, &mut file).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(written)
    }
}

/// Temporary file of an in-progress write. Removed on drop unless the write
/// was committed by renaming it into place.
struct PartFile {
    path: PathBuf,
    committed: bool,
}

impl PartFile {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            committed: false,
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for PartFile {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        // Drop cannot await.
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed partial blob"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to remove partial blob")
            }
        }
    }
}

fn not_found(err: io::Error, key: &StorageKey) -> BlobError {
    if err.kind() == io::ErrorKind::NotFound {
        BlobError::NotFound(key.clone())
    } else {
        BlobError::Io(err)
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn write(
        &self,
        key: &StorageKey,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64, BlobError> {
        let full_path = self.get_full_path(key);

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let part = PartFile::new(full_path.with_extension("part"));
        let written = Self::write_part(part.path(), source).await?;

        fs::rename(part.path(), &full_path).await?;
        part.commit();

        Ok(written)
    }

    async fn read(&self, key: &StorageKey) -> Result<Vec<u8>, BlobError> {
        fs::read(self.get_full_path(key))
            .await
            .map_err(|e| not_found(e, key))
    }

    async fn exists(&self, key: &StorageKey) -> Result<bool, BlobError> {
        Ok(fs::try_exists(self.get_full_path(key)).await?)
    }

    async fn size(&self, key: &StorageKey) -> Result<u64, BlobError> {
        let metadata = fs::metadata(self.get_full_path(key))
            .await
            .map_err(|e| not_found(e, key))?;

        Ok(metadata.len())
    }
}
