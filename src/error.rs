//! Error types for the upload outbox

use thiserror::Error;

/// Result type alias for outbox operations
pub type Result<T> = std::result::Result<T, OutboxError>;

/// Main error type for the outbox
#[derive(Error, Debug)]
pub enum OutboxError {
    #[error("Blob store error: {0}")]
    BlobStore(String),

    #[error("Record store error: {0}")]
    RecordStore(String),

    #[error("Invalid bundle: {0}")]
    InvalidBundle(String),

    #[error("Sidecar metadata missing for {owner_id}_{record_id}")]
    MissingSidecar { owner_id: String, record_id: i64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Descriptor error: {0}")]
    Descriptor(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Sync error: {0}")]
    Sync(String),
}

impl OutboxError {
    /// Check if error is retryable on a later drain cycle.
    ///
    /// Remote failures are. A malformed bundle fails identically every
    /// cycle until the bundle is externally corrected, and a missing
    /// sidecar stays missing until the capture layer restores it.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OutboxError::BlobStore(_) | OutboxError::RecordStore(_) | OutboxError::Sync(_)
        )
    }
}
