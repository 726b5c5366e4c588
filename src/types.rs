//! Core types for the upload outbox

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{OutboxError, Result};

/// Pattern a bundle directory name must match: `{owner_id}_{record_id}`
/// where the owner part is word/hyphen characters and the record part is
/// all digits. Anything else in the queue root is ignored as a stray.
pub static KEY_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+_[0-9]+$").expect("valid key pattern"));

/// Composite identity of a bundle: `(owner_id, record_id)`.
///
/// Serialized as `"{owner_id}_{record_id}"`, which is also the name of
/// the bundle's directory in the queue root. `owner_id` is an arbitrary
/// string (it may contain underscores), so parsing splits at the *last*
/// underscore.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BundleKey {
    pub owner_id: String,
    pub record_id: i64,
}

impl BundleKey {
    pub fn new(owner_id: impl Into<String>, record_id: i64) -> Self {
        Self {
            owner_id: owner_id.into(),
            record_id,
        }
    }
}

impl fmt::Display for BundleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.owner_id, self.record_id)
    }
}

impl FromStr for BundleKey {
    type Err = OutboxError;

    fn from_str(s: &str) -> Result<Self> {
        if !KEY_PATTERN.is_match(s) {
            return Err(OutboxError::InvalidBundle(format!(
                "name '{}' does not match owner_record pattern",
                s
            )));
        }
        // The pattern guarantees at least one underscore and a digit tail.
        let (owner, record) = s
            .rsplit_once('_')
            .ok_or_else(|| OutboxError::InvalidBundle(format!("name '{}' has no separator", s)))?;
        if owner.is_empty() {
            return Err(OutboxError::InvalidBundle(format!(
                "name '{}' has an empty owner id",
                s
            )));
        }
        let record_id = record.parse::<i64>().map_err(|_| {
            OutboxError::InvalidBundle(format!("record id '{}' is not an integer", record))
        })?;
        Ok(Self {
            owner_id: owner.to_string(),
            record_id,
        })
    }
}

/// On-disk bundle descriptor, the only persisted format the outbox owns.
///
/// Written as `manifest.json` inside each bundle directory. The reader is
/// strict: missing fields, unknown fields, or a non-integer `record_id`
/// make the bundle invalid rather than silently defaulting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BundleDescriptor {
    pub owner_id: String,
    pub record_id: i64,
    pub metadata_blob_base64: String,
}

/// A fully loaded unit of pending work: attachments plus the metadata
/// blob, keyed by owner/record identity.
#[derive(Debug, Clone)]
pub struct Bundle {
    pub key: BundleKey,
    /// Attachment payloads ordered by filename.
    pub attachments: BTreeMap<String, Vec<u8>>,
    /// Auxiliary record-sheet payload, uploaded to its own destination key.
    pub metadata_blob: Vec<u8>,
}

/// Structured fields looked up out-of-band at upload time, needed to
/// construct the remote record. Populated by the capture flow before the
/// bundle is enqueued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidecarRecord {
    pub name: String,
    pub age: String,
    pub gender: String,
    pub phone: String,
    pub timestamp: DateTime<Utc>,
}

/// The record written to the remote record store, keyed by
/// `(owner_id, record_id)`. `record_id` is serialized as a string and the
/// timestamp as epoch milliseconds, matching the remote table schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StructuredRecord {
    pub owner_id: String,
    pub record_id: String,
    pub name: String,
    pub age: String,
    pub gender: String,
    pub phone: String,
    /// Attachment filename -> blob store key.
    pub attachment_paths: HashMap<String, String>,
    pub timestamp: i64,
}

/// Outcome of one full drain pass over the queue.
#[derive(Debug, Clone)]
pub struct DrainSummary {
    /// Bundles this cycle attempted (in-flight skips excluded).
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Terminal human-readable message, also emitted on the progress sink.
    pub message: String,
}

impl DrainSummary {
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }
}
