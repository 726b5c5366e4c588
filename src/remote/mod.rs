//! External-capability seams the sync engine depends on.
//!
//! The engine only needs "upload bytes to key K", "upsert record R",
//! "look up sidecar fields for a key", and "is the network reachable".
//! Real transports live behind these traits; the `cloud` feature ships an
//! S3-compatible [`BlobStore`] adapter.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::Result;
use crate::types::{SidecarRecord, StructuredRecord};

#[cfg(feature = "cloud")]
mod s3;
#[cfg(feature = "cloud")]
pub use s3::S3BlobStore;

/// Unstructured binary destination. `put` to an existing key must
/// overwrite; retried bundles re-upload every attachment.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<()>;
}

/// Structured destination, keyed by `(owner_id, record_id)`. Upsert
/// semantics are required for retry-safety.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn upsert(&self, record: &StructuredRecord) -> Result<()>;
}

/// Out-of-band metadata lookup, populated by the capture flow before the
/// bundle is enqueued.
#[async_trait]
pub trait SidecarSource: Send + Sync {
    async fn get(&self, owner_id: &str, record_id: i64) -> Result<Option<SidecarRecord>>;
}

/// Single boolean query consulted before each drain attempt. No side
/// effects.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn is_reachable(&self) -> bool;
}

/// In-process sidecar source backed by a concurrent map.
#[derive(Debug, Default)]
pub struct InMemorySidecar {
    entries: DashMap<(String, i64), SidecarRecord>,
}

impl InMemorySidecar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, owner_id: impl Into<String>, record_id: i64, record: SidecarRecord) {
        self.entries.insert((owner_id.into(), record_id), record);
    }

    pub fn remove(&self, owner_id: &str, record_id: i64) -> Option<SidecarRecord> {
        self.entries
            .remove(&(owner_id.to_string(), record_id))
            .map(|(_, v)| v)
    }
}

#[async_trait]
impl SidecarSource for InMemorySidecar {
    async fn get(&self, owner_id: &str, record_id: i64) -> Result<Option<SidecarRecord>> {
        Ok(self
            .entries
            .get(&(owner_id.to_string(), record_id))
            .map(|r| r.value().clone()))
    }
}

/// Constant-true probe for environments without a real reachability check.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysReachable;

#[async_trait]
impl ConnectivityProbe for AlwaysReachable {
    async fn is_reachable(&self) -> bool {
        true
    }
}

/// Detect content type from an attachment filename's extension.
pub fn content_type_for(filename: &str) -> &'static str {
    let ext = filename.rsplit_once('.').map(|(_, e)| e).unwrap_or("");
    match ext.to_lowercase().as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        "csv" => "text/csv",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "json" => "application/json",
        _ => "application/octet-stream",
    }
}
