use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use utoipa::ToSchema;

use super::UserId;

pub const DEFAULT_PAGE: u64 = 1;
pub const DEFAULT_PAGE_SIZE: u64 = 10;

/// Blob location of a user's file.
///
/// Derived from the owner and the filename only, so re-uploading the same
/// name lands on the same key. The filename is hashed, which keeps arbitrary
/// user input out of storage paths.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorageKey(String);

impl StorageKey {
    pub fn derive(owner: UserId, filename: &str) -> Self {
        let digest = Sha256::digest(filename.as_bytes());
        Self(format!("{}/{:x}", owner, digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    #[schema(value_type = String)]
    pub storage_key: StorageKey,
    pub original_name: String,
    pub size_bytes: u64,
    pub content_type: String,
    pub uploaded_at: DateTime<Utc>,
    #[schema(value_type = String, format = Uuid)]
    pub owner_id: UserId,
    /// Admission order within the owner's files.
    pub sequence: u64,
}

/// Normalized pagination input. Out-of-range values fall back to defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u64,
    pub page_size: u64,
}

impl PageRequest {
    pub fn new(page: i64, page_size: i64) -> Self {
        Self::with_default_size(page, page_size, DEFAULT_PAGE_SIZE)
    }

    pub fn with_default_size(page: i64, page_size: i64, default_size: u64) -> Self {
        let default_size = default_size.max(1);
        Self {
            page: if page < 1 { DEFAULT_PAGE } else { page as u64 },
            page_size: if page_size < 1 {
                default_size
            } else {
                page_size as u64
            },
        }
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: DEFAULT_PAGE,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    #[serde(rename = "data")]
    pub items: Vec<T>,
    pub page: u64,
    pub page_size: u64,
    pub total_items: u64,
    pub total_pages: u64,
}

impl<T: Clone> Page<T> {
    /// Cuts one page out of an ordered snapshot.
    ///
    /// Running off the end yields an empty page that still carries the
    /// requested `page`/`page_size` and the real totals.
    pub fn from_slice(all: &[T], request: PageRequest) -> Self {
        let page_size = request.page_size.max(1);
        let total_items = all.len() as u64;
        let total_pages = total_items.div_ceil(page_size);
        let start = request.page.saturating_sub(1).saturating_mul(page_size);

        let items = if start >= total_items {
            Vec::new()
        } else {
            let end = start.saturating_add(page_size).min(total_items);
            all[start as usize..end as usize].to_vec()
        };

        Self {
            items,
            page: request.page,
            page_size,
            total_items,
            total_pages,
        }
    }
}
