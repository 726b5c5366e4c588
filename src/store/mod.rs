//! Durable on-disk bundle queue.
//!
//! Each pending bundle is a self-describing directory under the queue
//! root, named `{owner_id}_{record_id}`, holding one file per attachment
//! plus a `manifest.json` descriptor. Enqueue writes into a hidden
//! staging directory, fsyncs every file, and renames it into place with
//! directory syncs on either side, so a bundle the sync engine can
//! discover always has complete contents, even across a power loss.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use crate::error::{OutboxError, Result};
use crate::types::{Bundle, BundleDescriptor, BundleKey, KEY_PATTERN};

/// Descriptor filename inside each bundle directory.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Sidecar-failure attempt counter, excluded from attachment listing.
const ATTEMPTS_FILE: &str = "attempts";

/// Dead-letter area under the queue root. The leading dot keeps it out of
/// the key-pattern filter.
const DEAD_LETTER_DIR: &str = ".dead_letter";

/// Write a file and flush its data to disk before returning.
fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

/// Flush a directory's entry list to disk. Without this a power loss
/// shortly after a rename can roll the rename back even though the file
/// contents survived.
#[cfg(unix)]
fn sync_dir(path: &Path) -> Result<()> {
    fs::File::open(path)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_path: &Path) -> Result<()> {
    // Directories cannot be opened as files here; the rename itself is
    // still atomic, only its durability is weaker.
    Ok(())
}

/// Crash-safe persistence of pending bundles under a fixed queue root.
#[derive(Debug, Clone)]
pub struct BundleStore {
    root: PathBuf,
}

impl BundleStore {
    /// Open (creating if needed) a bundle store at the given root.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bundle_dir(&self, key: &BundleKey) -> PathBuf {
        self.root.join(key.to_string())
    }

    /// Persist a bundle atomically.
    ///
    /// All files land in `.staging-{key}` first; the final rename is what
    /// makes the bundle visible to `list_pending`. Safe to call
    /// concurrently for distinct keys. Re-enqueueing an existing key
    /// replaces the previous bundle.
    pub fn enqueue(
        &self,
        key: &BundleKey,
        attachments: &BTreeMap<String, Vec<u8>>,
        metadata_blob: &[u8],
    ) -> Result<()> {
        if !KEY_PATTERN.is_match(&key.to_string()) {
            return Err(OutboxError::InvalidBundle(format!(
                "key '{}' contains characters outside the bundle-name pattern",
                key
            )));
        }

        let staging = self.root.join(format!(".staging-{}", key));
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)?;

        let write_all = || -> Result<()> {
            for (filename, bytes) in attachments {
                if filename == MANIFEST_FILE || filename == ATTEMPTS_FILE {
                    return Err(OutboxError::InvalidBundle(format!(
                        "attachment name '{}' is reserved",
                        filename
                    )));
                }
                // Attachment names must be plain filenames; a separator or
                // dot-dot component would land the file outside the bundle.
                if filename.is_empty()
                    || filename == "."
                    || filename == ".."
                    || filename.contains(['/', '\\'])
                {
                    return Err(OutboxError::InvalidBundle(format!(
                        "attachment name '{}' is not a plain filename",
                        filename
                    )));
                }
                write_file(&staging.join(filename), bytes)?;
            }
            let descriptor = BundleDescriptor {
                owner_id: key.owner_id.clone(),
                record_id: key.record_id,
                metadata_blob_base64: BASE64.encode(metadata_blob),
            };
            let json = serde_json::to_vec_pretty(&descriptor)?;
            write_file(&staging.join(MANIFEST_FILE), &json)?;
            Ok(())
        };

        if let Err(e) = write_all() {
            // A failed enqueue must not leave anything dispatchable behind.
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }

        sync_dir(&staging)?;
        let target = self.bundle_dir(key);
        if target.exists() {
            fs::remove_dir_all(&target)?;
        }
        fs::rename(&staging, &target)?;
        sync_dir(&self.root)?;

        tracing::debug!(
            "Enqueued bundle {} with {} attachments",
            key,
            attachments.len()
        );
        Ok(())
    }

    /// List every dispatchable bundle key, sorted by name.
    ///
    /// Only directories whose names match the key pattern *and* that
    /// contain a manifest are returned; stray files, staging directories,
    /// and the dead-letter area are ignored. Tolerates entries deleted
    /// concurrently by an upload task.
    pub fn list_pending(&self) -> Result<Vec<BundleKey>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            let name = match entry.file_name().into_string() {
                Ok(n) => n,
                Err(_) => continue,
            };
            if !KEY_PATTERN.is_match(&name) {
                continue;
            }
            if !entry.path().is_dir() {
                continue;
            }
            if !entry.path().join(MANIFEST_FILE).is_file() {
                tracing::warn!("Skipping bundle '{}' with no manifest", name);
                continue;
            }
            match name.parse::<BundleKey>() {
                Ok(key) => keys.push(key),
                Err(e) => tracing::warn!("Skipping unparseable bundle name '{}': {}", name, e),
            }
        }
        keys.sort_by_key(|k| k.to_string());
        Ok(keys)
    }

    /// Load a bundle back into memory.
    ///
    /// The manifest is parsed strictly; a malformed or mismatched
    /// descriptor fails with `InvalidBundle` so the engine can report a
    /// standing problem instead of uploading under a wrong identity.
    pub fn load(&self, key: &BundleKey) -> Result<Bundle> {
        let dir = self.bundle_dir(key);
        let manifest_path = dir.join(MANIFEST_FILE);
        let manifest = fs::read(&manifest_path)?;

        let descriptor: BundleDescriptor = serde_json::from_slice(&manifest)
            .map_err(|e| OutboxError::InvalidBundle(format!("manifest for {}: {}", key, e)))?;
        if descriptor.owner_id != key.owner_id || descriptor.record_id != key.record_id {
            return Err(OutboxError::InvalidBundle(format!(
                "manifest identity {}_{} does not match directory {}",
                descriptor.owner_id, descriptor.record_id, key
            )));
        }

        let metadata_blob = BASE64
            .decode(descriptor.metadata_blob_base64.as_bytes())
            .map_err(|e| {
                OutboxError::InvalidBundle(format!("metadata blob for {} is not base64: {}", key, e))
            })?;

        let mut attachments = BTreeMap::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = match entry.file_name().into_string() {
                Ok(n) => n,
                Err(_) => continue,
            };
            if name == MANIFEST_FILE || name == ATTEMPTS_FILE {
                continue;
            }
            if !entry.path().is_file() {
                continue;
            }
            attachments.insert(name, fs::read(entry.path())?);
        }

        Ok(Bundle {
            key: key.clone(),
            attachments,
            metadata_blob,
        })
    }

    /// Count a bundle's attachments without reading their payloads.
    pub fn count_attachments(&self, key: &BundleKey) -> Result<usize> {
        let dir = self.bundle_dir(key);
        let mut count = 0;
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = match entry.file_name().into_string() {
                Ok(n) => n,
                Err(_) => continue,
            };
            if name == MANIFEST_FILE || name == ATTEMPTS_FILE {
                continue;
            }
            if entry.path().is_file() {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Remove a bundle after its uploads fully succeeded.
    pub fn delete(&self, key: &BundleKey) -> Result<()> {
        fs::remove_dir_all(self.bundle_dir(key))?;
        tracing::debug!("Deleted bundle {}", key);
        Ok(())
    }

    /// Record one sidecar-lookup failure for a bundle; returns the new
    /// attempt count. The counter lives in a small file inside the bundle
    /// directory so it survives restarts.
    pub fn record_sidecar_failure(&self, key: &BundleKey) -> Result<u32> {
        let path = self.bundle_dir(key).join(ATTEMPTS_FILE);
        let prior: u32 = match fs::read_to_string(&path) {
            Ok(s) => s.trim().parse().unwrap_or(0),
            Err(_) => 0,
        };
        let attempts = prior + 1;
        fs::write(&path, attempts.to_string())?;
        Ok(attempts)
    }

    /// Move a bundle into the dead-letter area, where `list_pending`
    /// never finds it. Data is preserved for operator recovery.
    pub fn quarantine(&self, key: &BundleKey) -> Result<()> {
        let dead_dir = self.root.join(DEAD_LETTER_DIR);
        fs::create_dir_all(&dead_dir)?;
        let target = dead_dir.join(key.to_string());
        if target.exists() {
            fs::remove_dir_all(&target)?;
        }
        fs::rename(self.bundle_dir(key), &target)?;
        tracing::warn!("Quarantined bundle {} to dead-letter area", key);
        Ok(())
    }

    /// Keys currently parked in the dead-letter area.
    pub fn list_dead_letter(&self) -> Result<Vec<BundleKey>> {
        let dead_dir = self.root.join(DEAD_LETTER_DIR);
        if !dead_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        for entry in fs::read_dir(&dead_dir)? {
            let entry = entry?;
            if let Ok(name) = entry.file_name().into_string() {
                if let Ok(key) = name.parse::<BundleKey>() {
                    keys.push(key);
                }
            }
        }
        keys.sort_by_key(|k| k.to_string());
        Ok(keys)
    }
}
