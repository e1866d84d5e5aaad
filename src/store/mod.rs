//! Durable append-only update stores.
//!
//! A store appends `(update, metadata, timestamp)` records keyed by a
//! document path and replays them in insertion order. Two variants exist:
//! one file per document ([`FileStore`]) and one shared SQLite database
//! for all documents ([`SqliteStore`]). Both carry a format version; on
//! open, data written by a different version is renamed aside and a fresh
//! store is initialized, never silently upgraded.

pub mod file;
pub mod sqlite;

pub use file::FileStore;
pub use sqlite::SqliteStore;

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use yrs::{Doc, ReadTxn, StateVector, Transact};

use crate::callback::MetadataCallback;
use crate::error::Result;
use crate::protocol;

/// Current on-disk format version, shared by both variants.
pub const STORE_VERSION: u32 = 2;

/// One stored record.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredUpdate {
    pub update: Vec<u8>,
    pub metadata: Vec<u8>,
    /// Seconds since the Unix epoch at write time.
    pub timestamp: f64,
}

pub type UpdateStream = BoxStream<'static, Result<StoredUpdate>>;

/// The common store contract.
#[async_trait]
pub trait UpdateStore: Send + Sync {
    /// The on-disk format version this store reads and writes.
    fn version(&self) -> u32 {
        STORE_VERSION
    }

    /// Initialize the store. Idempotent: starting a started store is a
    /// no-op, so several rooms can share one instance.
    async fn start(&self) -> Result<()>;

    /// Drain in-flight writes and release file handles or connections.
    async fn stop(&self) -> Result<()>;

    fn is_started(&self) -> bool;

    /// Resolve once the store has started.
    async fn wait_started(&self);

    /// Durably append one update.
    async fn write(&self, update: &[u8]) -> Result<()>;

    /// All records for this store's document path, in append order.
    /// Fails with [`crate::Error::DocumentNotFound`] when none exist.
    async fn read(&self) -> Result<UpdateStream>;

    /// Append the document's full state as a single update.
    async fn encode_state_as_update(&self, doc: &Doc) -> Result<()> {
        let update = {
            let txn = doc.transact();
            txn.encode_state_as_update_v1(&StateVector::default())
        };
        self.write(&update).await
    }

    /// Replay every stored update into the document.
    async fn apply_updates(&self, doc: &Doc) -> Result<()> {
        let mut records = self.read().await?;
        while let Some(record) = records.next().await {
            protocol::apply_update(doc, &record?.update)?;
        }
        Ok(())
    }
}

/// Current wall-clock time as fractional seconds since the epoch.
pub(crate) fn unix_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Resolve the metadata for a record being written.
pub(crate) async fn resolve_metadata(callback: &Option<MetadataCallback>) -> Vec<u8> {
    match callback {
        Some(cb) => cb.call(()).await,
        None => Vec::new(),
    }
}

/// The lowest-numbered non-colliding `name(N).ext` sibling of `path`,
/// used to move aside data written by another format version.
pub(crate) fn rotated_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let parent = path.parent().unwrap_or_else(|| Path::new(""));
    let mut i = 1;
    loop {
        let candidate = parent.join(format!("{stem}({i}){ext}"));
        if !candidate.exists() {
            return candidate;
        }
        i += 1;
    }
}
