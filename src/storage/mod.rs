use async_trait::async_trait;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use thiserror::Error;
use tokio::io::{AsyncRead, ReadBuf};

use crate::models::StorageKey;

pub mod local;
pub mod memory;

pub use local::LocalBlobStore;
pub use memory::MemoryBlobStore;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Blob not found: {0}")]
    NotFound(StorageKey),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Raw byte persistence, keyed by [`StorageKey`].
///
/// `write` replaces whatever is stored under the key and returns the number
/// of bytes persisted. A failed write leaves the previous bytes in place.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn write(
        &self,
        key: &StorageKey,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64, BlobError>;

    async fn read(&self, key: &StorageKey) -> Result<Vec<u8>, BlobError>;

    async fn exists(&self, key: &StorageKey) -> Result<bool, BlobError>;

    async fn size(&self, key: &StorageKey) -> Result<u64, BlobError>;
}

/// Reader that fails unless its inner stream yields exactly `expected` bytes.
///
/// A short stream ends in `UnexpectedEof` and a long one in `InvalidData`, so
/// a blob store copying from it aborts before committing anything.
pub struct ExactLength<R> {
    inner: R,
    remaining: u64,
}

impl<R> ExactLength<R> {
    pub fn new(inner: R, expected: u64) -> Self {
        Self {
            inner,
            remaining: expected,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ExactLength<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        let read = (buf.filled().len() - before) as u64;

        if read == 0 && this.remaining > 0 {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("stream ended {} bytes short of the declared size", this.remaining),
            )));
        }
        if read > this.remaining {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "stream is longer than the declared size",
            )));
        }

        this.remaining -= read;
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn drain(data: &[u8], expected: u64) -> io::Result<Vec<u8>> {
        let mut reader = ExactLength::new(data, expected);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await?;
        Ok(out)
    }

    #[tokio::test]
    async fn test_exact_length_accepts_matching_stream() {
        assert_eq!(drain(b"hello", 5).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_exact_length_rejects_short_stream() {
        let err = drain(b"hell", 5).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_exact_length_rejects_long_stream() {
        let err = drain(b"hello!", 5).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
