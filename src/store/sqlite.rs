//! Shared-database update store.
//!
//! All documents' updates live in one SQLite file:
//!
//! ```sql
//! yupdates(path TEXT NOT NULL, yupdate BLOB, metadata BLOB, timestamp REAL NOT NULL)
//! ```
//!
//! with an index on `(path, timestamp)` and the format version recorded in
//! `PRAGMA user_version`. Each store instance serves one document path.
//! When `document_ttl` is set and the newest record for the path is older
//! than the TTL, a write first squashes the path's history into a single
//! snapshot record.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::stream;
use futures::StreamExt;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::{watch, Mutex};
use tracing::warn;
use yrs::{Doc, ReadTxn, StateVector, Transact};

use super::{resolve_metadata, rotated_path, unix_timestamp, StoredUpdate, UpdateStore};
use crate::callback::MetadataCallback;
use crate::error::{Error, Result};
use crate::protocol;

/// Injectable time source, overridden in tests to exercise compaction.
pub(crate) type Clock = Arc<dyn Fn() -> f64 + Send + Sync>;

/// A store keeping every document's updates in one SQLite database.
pub struct SqliteStore {
    db_path: PathBuf,
    doc_path: String,
    document_ttl: Option<f64>,
    metadata_callback: Option<MetadataCallback>,
    clock: Clock,
    conn: StdMutex<Option<Connection>>,
    lock: Mutex<()>,
    started: watch::Sender<bool>,
}

impl SqliteStore {
    /// A store for `doc_path` backed by the database at `db_path`.
    pub fn new(db_path: impl Into<PathBuf>, doc_path: impl Into<String>) -> Self {
        let (started, _) = watch::channel(false);
        Self {
            db_path: db_path.into(),
            doc_path: doc_path.into(),
            document_ttl: None,
            metadata_callback: None,
            clock: Arc::new(unix_timestamp),
            conn: StdMutex::new(None),
            lock: Mutex::new(()),
            started,
        }
    }

    /// Attach a callback producing the metadata stored with each update.
    pub fn with_metadata(mut self, callback: MetadataCallback) -> Self {
        self.metadata_callback = Some(callback);
        self
    }

    /// Squash a document's history once its newest record is older than
    /// `ttl` seconds. Unset means history is kept forever.
    pub fn with_document_ttl(mut self, ttl: f64) -> Self {
        self.document_ttl = Some(ttl);
        self
    }

    #[cfg(test)]
    pub(crate) fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Open the database, moving a version-mismatched file aside first.
    fn init_db(&self) -> Result<()> {
        if self.db_path.exists() {
            let conn = Connection::open(&self.db_path)?;
            let table_exists: i64 = conn.query_row(
                "SELECT count(name) FROM sqlite_master WHERE type = 'table' AND name = 'yupdates'",
                [],
                |row| row.get(0),
            )?;
            if table_exists > 0 {
                let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
                if version == self.version() as i64 {
                    conn.busy_timeout(Duration::from_secs(5))?;
                    *self.conn.lock().unwrap() = Some(conn);
                    return Ok(());
                }
                drop(conn);
                let new_path = rotated_path(&self.db_path);
                warn!(
                    path = %self.db_path.display(),
                    new_path = %new_path.display(),
                    "store version mismatch, moving database aside"
                );
                std::fs::rename(&self.db_path, &new_path)?;
            }
        } else if let Some(parent) = self.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&self.db_path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS yupdates (
                 path TEXT NOT NULL,
                 yupdate BLOB,
                 metadata BLOB,
                 timestamp REAL NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_yupdates_path_timestamp
                 ON yupdates (path, timestamp);",
        )?;
        conn.pragma_update(None, "user_version", self.version() as i64)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        *self.conn.lock().unwrap() = Some(conn);
        Ok(())
    }

    /// Replay the path's rows into a fresh document, delete them, and
    /// insert one squashed record. The caller holds the connection guard.
    fn squash_history(&self, conn: &Connection, metadata: &[u8], now: f64) -> Result<()> {
        let doc = Doc::new();
        {
            let mut stmt =
                conn.prepare("SELECT yupdate FROM yupdates WHERE path = ?1 ORDER BY rowid")?;
            let rows = stmt.query_map(params![self.doc_path], |row| row.get::<_, Vec<u8>>(0))?;
            for row in rows {
                protocol::apply_update(&doc, &row?)?;
            }
        }
        conn.execute(
            "DELETE FROM yupdates WHERE path = ?1",
            params![self.doc_path],
        )?;
        let squashed = {
            let txn = doc.transact();
            txn.encode_state_as_update_v1(&StateVector::default())
        };
        conn.execute(
            "INSERT INTO yupdates VALUES (?1, ?2, ?3, ?4)",
            params![self.doc_path, squashed, metadata, now],
        )?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl UpdateStore for SqliteStore {
    async fn start(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        if self.is_started() {
            return Ok(());
        }
        self.init_db()?;
        self.started.send_replace(true);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        // taking the lock waits out any in-flight write
        let _guard = self.lock.lock().await;
        self.started.send_replace(false);
        // dropping the connection closes it
        *self.conn.lock().unwrap() = None;
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
        let conn_guard = self.conn.lock().unwrap();
        let conn = conn_guard
            .as_ref()
            .ok_or(Error::NotRunning("SqliteStore"))?;
        let now = (self.clock)();

        if let Some(ttl) = self.document_ttl {
            let newest: Option<f64> = conn
                .query_row(
                    "SELECT timestamp FROM yupdates WHERE path = ?1
                     ORDER BY timestamp DESC LIMIT 1",
                    params![self.doc_path],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(ts) = newest {
                if now - ts > ttl {
                    self.squash_history(conn, &metadata, now)?;
                }
            }
        }

        conn.execute(
            "INSERT INTO yupdates VALUES (?1, ?2, ?3, ?4)",
            params![self.doc_path, update, metadata, now],
        )?;
        Ok(())
    }

    async fn read(&self) -> Result<super::UpdateStream> {
        let _guard = self.lock.lock().await;
        let conn_guard = self.conn.lock().unwrap();
        let conn = conn_guard
            .as_ref()
            .ok_or(Error::NotRunning("SqliteStore"))?;

        let mut stmt = conn.prepare(
            "SELECT yupdate, metadata, timestamp FROM yupdates
             WHERE path = ?1 ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![self.doc_path], |row| {
            Ok(StoredUpdate {
                update: row.get(0)?,
                metadata: row.get(1)?,
                timestamp: row.get(2)?,
            })
        })?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        if records.is_empty() {
            return Err(Error::DocumentNotFound);
        }
        Ok(stream::iter(records.into_iter().map(Ok)).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::MetadataCallback;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn counting_metadata() -> MetadataCallback {
        let counter = Arc::new(AtomicU64::new(0));
        MetadataCallback::sync(move |()| {
            let i = counter.fetch_add(1, Ordering::SeqCst);
            i.to_string().into_bytes()
        })
    }

    fn text_update(content: &str) -> Vec<u8> {
        use yrs::Text;
        let doc = Doc::new();
        let text = doc.get_or_insert_text("content");
        {
            let mut txn = doc.transact_mut();
            text.push(&mut txn, content);
        }
        let txn = doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    fn row_count(db_path: &Path) -> i64 {
        let conn = Connection::open(db_path).unwrap();
        conn.query_row("SELECT count(*) FROM yupdates", [], |row| row.get(0))
            .unwrap()
    }

    #[tokio::test]
    async fn writes_read_back_in_order_with_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("ystore.db"), "/doc")
            .with_metadata(counting_metadata());
        store.start().await.unwrap();

        for data in [b"foo".as_slice(), b"bar", b"baz"] {
            store.write(data).await.unwrap();
        }

        let mut records = store.read().await.unwrap();
        let mut seen = Vec::new();
        while let Some(record) = records.next().await {
            seen.push(record.unwrap());
        }
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].update, b"foo");
        assert_eq!(seen[1].update, b"bar");
        assert_eq!(seen[2].update, b"baz");
        assert_eq!(seen[0].metadata, b"0");
        assert_eq!(seen[1].metadata, b"1");
        assert_eq!(seen[2].metadata, b"2");
        assert!(seen[0].timestamp <= seen[1].timestamp);
        assert!(seen[1].timestamp <= seen[2].timestamp);
    }

    #[tokio::test]
    async fn ttl_compaction_squashes_old_history() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("ystore.db");
        let now = Arc::new(StdMutex::new(1_000_000.0f64));
        let clock_now = now.clone();
        let store = SqliteStore::new(&db_path, "/doc")
            .with_document_ttl(1000.0)
            .with_clock(Arc::new(move || *clock_now.lock().unwrap()));
        store.start().await.unwrap();

        for i in 0..3 {
            store.write(&text_update(&format!("edit {i}\n"))).await.unwrap();
            assert_eq!(row_count(&db_path), i + 1);
        }

        *now.lock().unwrap() += 1001.0;
        store.write(&text_update("late edit\n")).await.unwrap();
        // one squashed snapshot plus the new record
        assert_eq!(row_count(&db_path), 2);
    }

    #[tokio::test]
    async fn no_compaction_without_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("ystore.db");
        let now = Arc::new(StdMutex::new(1_000_000.0f64));
        let clock_now = now.clone();
        let store = SqliteStore::new(&db_path, "/doc")
            .with_clock(Arc::new(move || *clock_now.lock().unwrap()));
        store.start().await.unwrap();

        store.write(b"one").await.unwrap();
        *now.lock().unwrap() += 1_000_000.0;
        store.write(b"two").await.unwrap();
        assert_eq!(row_count(&db_path), 2);
    }

    #[tokio::test]
    async fn version_mismatch_moves_database_aside() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("ystore.db");

        {
            let store = SqliteStore::new(&db_path, "/doc");
            store.start().await.unwrap();
            store.write(b"old data").await.unwrap();
            store.stop().await.unwrap();
        }
        {
            // stamp the file as written by some other version
            let conn = Connection::open(&db_path).unwrap();
            conn.pragma_update(None, "user_version", 999i64).unwrap();
        }

        let store = SqliteStore::new(&db_path, "/doc");
        store.start().await.unwrap();
        assert!(dir.path().join("ystore(1).db").exists());
        assert!(matches!(
            store.read().await,
            Err(Error::DocumentNotFound)
        ));
    }

    #[tokio::test]
    async fn read_before_start_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("ystore.db"), "/doc");
        assert!(matches!(
            store.read().await,
            Err(Error::NotRunning("SqliteStore"))
        ));
    }
}
