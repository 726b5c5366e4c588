//! Background sync engine.
//!
//! Drains the bundle store: one upload task per pending bundle, bounded
//! concurrency, at-most-one concurrent task per key within the process.
//! A bundle is deleted from disk only after all its attachments, its
//! metadata blob, and the structured record have been delivered; any
//! failure leaves the bundle intact for the next drain cycle.

pub mod progress;
pub mod scheduler;

pub use progress::{NullSink, ProgressSink, ProgressTracker};
pub use scheduler::{RetryScheduler, SchedulerCommand};

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::error::{OutboxError, Result};
use crate::remote::{content_type_for, BlobStore, ConnectivityProbe, RecordStore, SidecarSource};
use crate::store::BundleStore;
use crate::types::{BundleKey, DrainSummary, StructuredRecord};

/// Tunables for the sync engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Blob-key prefix for attachments: `{prefix}/{owner}_{record}/{file}`.
    pub attachment_prefix: String,
    /// Blob-key prefix for the metadata blob (its own destination key).
    pub sheet_prefix: String,
    /// Filename the metadata blob is stored under remotely.
    pub sheet_filename: String,
    /// Upper bound on concurrently uploading bundles.
    pub max_concurrent_uploads: usize,
    /// Sidecar-lookup failures tolerated before a bundle is dead-lettered.
    pub max_sidecar_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            attachment_prefix: "public".to_string(),
            sheet_prefix: "records".to_string(),
            sheet_filename: "record_sheet.xlsx".to_string(),
            max_concurrent_uploads: 4,
            max_sidecar_attempts: 12,
        }
    }
}

/// Everything one upload task needs, cloned per bundle.
#[derive(Clone)]
struct TaskContext {
    store: BundleStore,
    blobs: Arc<dyn BlobStore>,
    records: Arc<dyn RecordStore>,
    sidecars: Arc<dyn SidecarSource>,
    config: Arc<EngineConfig>,
    in_flight: Arc<DashMap<String, ()>>,
    tracker: Arc<ProgressTracker>,
    semaphore: Arc<Semaphore>,
}

/// Removes the bundle key from the in-flight set when the task ends,
/// whatever the outcome.
struct InFlightGuard {
    map: Arc<DashMap<String, ()>>,
    key: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.map.remove(&self.key);
    }
}

/// Drains the durable queue to the remote blob and record stores.
pub struct SyncEngine {
    store: BundleStore,
    blobs: Arc<dyn BlobStore>,
    records: Arc<dyn RecordStore>,
    sidecars: Arc<dyn SidecarSource>,
    probe: Arc<dyn ConnectivityProbe>,
    config: Arc<EngineConfig>,
    in_flight: Arc<DashMap<String, ()>>,
}

impl SyncEngine {
    pub fn new(
        store: BundleStore,
        blobs: Arc<dyn BlobStore>,
        records: Arc<dyn RecordStore>,
        sidecars: Arc<dyn SidecarSource>,
        probe: Arc<dyn ConnectivityProbe>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            blobs,
            records,
            sidecars,
            probe,
            config: Arc::new(config),
            in_flight: Arc::new(DashMap::new()),
        }
    }

    /// The durable queue this engine drains. Producers enqueue through it.
    pub fn store(&self) -> &BundleStore {
        &self.store
    }

    /// Whether a validated network path is currently available.
    pub async fn is_reachable(&self) -> bool {
        self.probe.is_reachable().await
    }

    /// One full pass over the pending queue.
    ///
    /// Launches one upload task per pending bundle not already in flight,
    /// bounded by `max_concurrent_uploads`, joins them all, and returns a
    /// summary. Per-bundle failures never abort the cycle; an unreachable
    /// network is a benign deferral, not an error.
    pub async fn drain(&self, sink: Arc<dyn ProgressSink>) -> Result<DrainSummary> {
        if !self.probe.is_reachable().await {
            tracing::info!("Network unreachable, deferring drain");
            return Ok(DrainSummary {
                total: 0,
                succeeded: 0,
                failed: 0,
                message: "No items processed".to_string(),
            });
        }

        let pending = self.store.list_pending()?;
        if pending.is_empty() {
            return Ok(DrainSummary {
                total: 0,
                succeeded: 0,
                failed: 0,
                message: "No items in queue".to_string(),
            });
        }
        tracing::debug!("Found {} pending bundles", pending.len());

        // Claim keys not already owned by another drain's task. Insert
        // returning a previous marker means someone else holds the key.
        let mut claimed = Vec::new();
        for key in pending {
            if self.in_flight.insert(key.to_string(), ()).is_none() {
                claimed.push(key);
            } else {
                tracing::debug!("Bundle {} already in flight, skipping", key);
            }
        }

        // Global progress denominator across everything this cycle will
        // attempt. A bundle whose directory cannot be read is released and
        // left for the next cycle.
        let mut total_attachments = 0;
        let mut work = Vec::new();
        for key in claimed {
            match self.store.count_attachments(&key) {
                Ok(n) => {
                    total_attachments += n;
                    work.push(key);
                }
                Err(e) => {
                    tracing::warn!("Skipping bundle {} this cycle: {}", key, e);
                    self.in_flight.remove(&key.to_string());
                }
            }
        }
        if work.is_empty() {
            return Ok(DrainSummary {
                total: 0,
                succeeded: 0,
                failed: 0,
                message: "No items processed".to_string(),
            });
        }

        let total = work.len();
        let tracker = Arc::new(ProgressTracker::new(total, total_attachments, sink.clone()));
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_uploads));

        let mut tasks = JoinSet::new();
        for key in work {
            let ctx = TaskContext {
                store: self.store.clone(),
                blobs: self.blobs.clone(),
                records: self.records.clone(),
                sidecars: self.sidecars.clone(),
                config: self.config.clone(),
                in_flight: self.in_flight.clone(),
                tracker: tracker.clone(),
                semaphore: semaphore.clone(),
            };
            tasks.spawn(run_upload_task(ctx, key));
        }

        let mut succeeded = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(true) => succeeded += 1,
                Ok(false) => {}
                Err(e) => {
                    // A panicked task is a failed bundle, not a failed drain.
                    tracing::error!("Upload task panicked: {}", e);
                    tracker.bundle_done(false);
                }
            }
        }

        let failed = total - succeeded;
        let message = if failed == 0 {
            "All uploads completed".to_string()
        } else {
            format!("Completed {}/{} bundles", succeeded, total)
        };
        sink.on_progress(100, &message);
        tracing::info!(
            "Drain finished: {} succeeded, {} failed of {}",
            succeeded,
            failed,
            total
        );

        Ok(DrainSummary {
            total,
            succeeded,
            failed,
            message,
        })
    }
}

/// Runs one bundle to completion and reports it to the tracker. Returns
/// whether the bundle was fully delivered.
async fn run_upload_task(ctx: TaskContext, key: BundleKey) -> bool {
    let _guard = InFlightGuard {
        map: ctx.in_flight.clone(),
        key: key.to_string(),
    };
    let _permit = match ctx.semaphore.clone().acquire_owned().await {
        Ok(p) => p,
        Err(_) => return false,
    };

    let success = match upload_bundle(&ctx, &key).await {
        Ok(()) => {
            tracing::info!("Bundle {} delivered", key);
            true
        }
        Err(OutboxError::MissingSidecar {
            owner_id,
            record_id,
        }) => {
            handle_missing_sidecar(&ctx, &key, &owner_id, record_id);
            false
        }
        Err(e @ OutboxError::InvalidBundle(_)) => {
            // Will fail identically every cycle until externally corrected.
            tracing::error!("Bundle {} is malformed and will not make progress: {}", key, e);
            false
        }
        Err(e) if e.is_retryable() => {
            tracing::warn!("Bundle {} failed, will retry next drain: {}", key, e);
            false
        }
        Err(e) => {
            tracing::error!("Bundle {} failed: {}", key, e);
            false
        }
    };

    ctx.tracker.bundle_done(success);
    success
}

/// The per-bundle upload protocol: attachments, then the metadata blob,
/// then the structured record, then local deletion. Attachments go up
/// sequentially within the bundle; concurrency comes from running
/// bundles in parallel.
async fn upload_bundle(ctx: &TaskContext, key: &BundleKey) -> Result<()> {
    let bundle = ctx.store.load(key)?;
    let dir_name = key.to_string();

    let mut attachment_paths = HashMap::new();
    for (filename, bytes) in &bundle.attachments {
        let blob_key = format!("{}/{}/{}", ctx.config.attachment_prefix, dir_name, filename);
        ctx.blobs
            .put(&blob_key, bytes, content_type_for(filename))
            .await?;
        attachment_paths.insert(filename.clone(), blob_key);
        ctx.tracker.attachment_done(filename);
    }

    let sheet_key = format!(
        "{}/{}/{}",
        ctx.config.sheet_prefix, dir_name, ctx.config.sheet_filename
    );
    ctx.blobs
        .put(
            &sheet_key,
            &bundle.metadata_blob,
            content_type_for(&ctx.config.sheet_filename),
        )
        .await?;

    let sidecar = ctx
        .sidecars
        .get(&key.owner_id, key.record_id)
        .await?
        .ok_or_else(|| OutboxError::MissingSidecar {
            owner_id: key.owner_id.clone(),
            record_id: key.record_id,
        })?;

    let record = StructuredRecord {
        owner_id: key.owner_id.clone(),
        record_id: key.record_id.to_string(),
        name: sidecar.name,
        age: sidecar.age,
        gender: sidecar.gender,
        phone: sidecar.phone,
        attachment_paths,
        timestamp: sidecar.timestamp.timestamp_millis(),
    };
    ctx.records.upsert(&record).await?;

    ctx.store.delete(key)?;
    Ok(())
}

/// A missing sidecar cannot resolve itself; after the attempt budget is
/// spent the bundle moves to the dead-letter area instead of burning a
/// retry slot forever.
fn handle_missing_sidecar(ctx: &TaskContext, key: &BundleKey, owner_id: &str, record_id: i64) {
    tracing::error!(
        "Sidecar metadata missing for {}_{}; bundle retained",
        owner_id,
        record_id
    );
    match ctx.store.record_sidecar_failure(key) {
        Ok(attempts) if attempts > ctx.config.max_sidecar_attempts => {
            if let Err(e) = ctx.store.quarantine(key) {
                tracing::error!("Failed to quarantine bundle {}: {}", key, e);
            }
        }
        Ok(attempts) => {
            tracing::debug!(
                "Bundle {} sidecar attempt {}/{}",
                key,
                attempts,
                ctx.config.max_sidecar_attempts
            );
        }
        Err(e) => tracing::error!("Failed to record sidecar attempt for {}: {}", key, e),
    }
}
