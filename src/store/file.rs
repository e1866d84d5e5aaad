//! File-per-document update store.
//!
//! Layout: an ASCII `VERSION:<n>\n` header followed by records, each a
//! length-prefixed update, length-prefixed metadata, and a length-prefixed
//! little-endian f64 timestamp (always 8 bytes). Appends are atomic enough
//! that a torn final record from a crash is tolerated on read.

use std::path::{Path, PathBuf};

use futures::stream;
use futures::StreamExt;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{watch, Mutex};
use tracing::warn;

use super::{resolve_metadata, rotated_path, unix_timestamp, StoredUpdate, UpdateStore};
use crate::callback::MetadataCallback;
use crate::error::{Error, Result};
use crate::protocol::{read_var_bytes, write_var_bytes};

/// Longest header line we accept before declaring a version mismatch.
const MAX_HEADER_BYTES: u64 = 64;

/// A store writing one append-only file per document path.
pub struct FileStore {
    path: PathBuf,
    metadata_callback: Option<MetadataCallback>,
    lock: Mutex<()>,
    started: watch::Sender<bool>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let (started, _) = watch::channel(false);
        Self {
            path: path.into(),
            metadata_callback: None,
            lock: Mutex::new(()),
            started,
        }
    }

    /// Attach a callback producing the metadata stored with each update.
    pub fn with_metadata(mut self, callback: MetadataCallback) -> Self {
        self.metadata_callback = Some(callback);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn header(&self) -> String {
        format!("VERSION:{}\n", self.version())
    }

    /// Verify the file header, moving mismatched data aside and starting
    /// a fresh file. Returns the offset where records begin. The caller
    /// holds the store lock.
    async fn check_version(&self) -> Result<u64> {
        let expected = self.header();
        match fs::File::open(&self.path).await {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => self.init_file().await,
            Err(e) => Err(e.into()),
            Ok(file) => {
                let mut reader = BufReader::new(file).take(MAX_HEADER_BYTES);
                let mut header = String::new();
                // non-UTF-8 garbage reads as an error, which is a mismatch too
                let matches = reader.read_line(&mut header).await.is_ok() && header == expected;
                if matches {
                    return Ok(expected.len() as u64);
                }
                let new_path = rotated_path(&self.path);
                warn!(
                    path = %self.path.display(),
                    new_path = %new_path.display(),
                    "store version mismatch, moving file aside"
                );
                fs::rename(&self.path, &new_path).await?;
                self.init_file().await
            }
        }
    }

    async fn init_file(&self) -> Result<u64> {
        let header = self.header();
        fs::write(&self.path, header.as_bytes()).await?;
        Ok(header.len() as u64)
    }

    fn parse_records(data: &[u8]) -> Vec<StoredUpdate> {
        let mut records = Vec::new();
        let mut cursor = data;
        while !cursor.is_empty() {
            let parsed = (|| -> Result<StoredUpdate> {
                let update = read_var_bytes(&mut cursor)?.to_vec();
                let metadata = read_var_bytes(&mut cursor)?.to_vec();
                let ts_bytes = read_var_bytes(&mut cursor)?;
                let ts_bytes: [u8; 8] = ts_bytes
                    .try_into()
                    .map_err(|_| Error::Store("timestamp is not 8 bytes".into()))?;
                Ok(StoredUpdate {
                    update,
                    metadata,
                    timestamp: f64::from_le_bytes(ts_bytes),
                })
            })();
            match parsed {
                Ok(record) => records.push(record),
                Err(e) => {
                    // a torn tail record from a crash loses only itself
                    warn!(error = %e, "ignoring truncated store tail");
                    break;
                }
            }
        }
        records
    }
}

#[async_trait::async_trait]
impl UpdateStore for FileStore {
    async fn start(&self) -> Result<()> {
        self.started.send_replace(true);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        // taking the lock waits out any in-flight write
        let _guard = self.lock.lock().await;
        self.started.send_replace(false);
        Ok(())
    }

    fn is_started(&self) -> bool {
        *self.started.borrow()
    }

    async fn wait_started(&self) {
        let mut rx = self.started.subscribe();
        let _ = rx.wait_for(|started| *started).await;
    }

    async fn write(&self, update: &[u8]) -> Result<()> {
        let metadata = resolve_metadata(&self.metadata_callback).await;
        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        self.check_version().await?;

        let mut buf = Vec::with_capacity(update.len() + metadata.len() + 32);
        write_var_bytes(update, &mut buf);
        write_var_bytes(&metadata, &mut buf);
        write_var_bytes(&unix_timestamp().to_le_bytes(), &mut buf);

        let mut file = OpenOptions::new().append(true).open(&self.path).await?;
        file.write_all(&buf).await?;
        file.flush().await?;
        Ok(())
    }

    async fn read(&self) -> Result<super::UpdateStream> {
        let data = {
            let _guard = self.lock.lock().await;
            if fs::metadata(&self.path).await.is_err() {
                return Err(Error::DocumentNotFound);
            }
            let offset = self.check_version().await? as usize;
            let mut file = fs::File::open(&self.path).await?;
            let mut data = Vec::new();
            file.read_to_end(&mut data).await?;
            data.split_off(offset.min(data.len()))
        };

        let records = Self::parse_records(&data);
        if records.is_empty() {
            return Err(Error::DocumentNotFound);
        }
        Ok(stream::iter(records.into_iter().map(Ok)).boxed())
    }
}
