//! Outbox - offline-first upload queue and synchronization engine.
//!
//! Captured bundles (binary attachments plus a metadata record) are
//! persisted to a durable on-disk queue, then drained in the background
//! to a remote blob store and a remote record store with at-least-once
//! delivery, aggregate progress reporting, and periodic retry.

pub mod error;
pub mod remote;
pub mod store;
pub mod sync;
pub mod types;

pub use error::{OutboxError, Result};
pub use store::BundleStore;
pub use sync::{EngineConfig, NullSink, ProgressSink, RetryScheduler, SyncEngine};
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
