//! Storage backends for the chunk store.
//!
//! Backends are synchronous; the store runs them on blocking worker threads.
//! A batch write must be atomic: either every chunk of the batch is stored or
//! none is.

use crate::error::{StoreError, StoreResult};
use crate::id::FileId;
use crate::store::ChunkWrite;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rusqlite::Connection;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Durable `(file_id, index) -> bytes` storage.
pub trait ChunkBackend: Send + Sync + 'static {
    /// Atomically store a batch, overwriting existing keys
    fn put_batch(&self, chunks: &[ChunkWrite]) -> StoreResult<()>;

    /// All stored chunks of a file, sorted by index
    fn chunks_for_file(&self, file_id: &FileId) -> StoreResult<Vec<(u64, Bytes)>>;

    /// Remove every chunk of a file, returning how many were removed
    fn delete_file(&self, file_id: &FileId) -> StoreResult<usize>;
}

/// In-memory backend with fault injection.
#[derive(Default)]
pub struct MemoryBackend {
    files: RwLock<HashMap<FileId, BTreeMap<u64, Bytes>>>,
    fail_next: AtomicUsize,
    batches_written: AtomicU64,
}

impl MemoryBackend {
    /// Create an empty backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` batch writes fail without storing anything
    pub fn fail_next_batches(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Number of batches committed successfully
    pub fn batches_written(&self) -> u64 {
        self.batches_written.load(Ordering::SeqCst)
    }

    /// Number of chunks stored for a file
    pub fn chunk_count(&self, file_id: &FileId) -> usize {
        self.files.read().get(file_id).map_or(0, BTreeMap::len)
    }
}

impl ChunkBackend for MemoryBackend {
    fn put_batch(&self, chunks: &[ChunkWrite]) -> StoreResult<()> {
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Backend("injected batch failure".into()));
        }

        let mut files = self.files.write();
        for chunk in chunks {
            files
                .entry(chunk.file_id.clone())
                .or_default()
                .insert(chunk.index, chunk.data.clone());
        }
        self.batches_written.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn chunks_for_file(&self, file_id: &FileId) -> StoreResult<Vec<(u64, Bytes)>> {
        Ok(self
            .files
            .read()
            .get(file_id)
            .map(|chunks| chunks.iter().map(|(i, d)| (*i, d.clone())).collect())
            .unwrap_or_default())
    }

    fn delete_file(&self, file_id: &FileId) -> StoreResult<usize> {
        Ok(self.files.write().remove(file_id).map_or(0, |c| c.len()))
    }
}

/// SQLite-backed chunk storage.
///
/// One table keyed by `(file_id, idx)`; each batch is a single transaction.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    /// Open or create a database file
    ///
    /// # Errors
    /// Returns `StoreError::Sqlite` if the database cannot be opened or the
    /// schema cannot be created.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        tracing::info!(path = %path.as_ref().display(), "chunk database opened");
        Self::with_connection(conn)
    }

    /// Open a private in-memory database
    ///
    /// # Errors
    /// Returns `StoreError::Sqlite` if the schema cannot be created.
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS chunks (
                file_id TEXT NOT NULL,
                idx INTEGER NOT NULL,
                data BLOB NOT NULL,
                PRIMARY KEY (file_id, idx)
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl ChunkBackend for SqliteBackend {
    fn put_batch(&self, chunks: &[ChunkWrite]) -> StoreResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO chunks (file_id, idx, data) VALUES (?1, ?2, ?3)",
            )?;
            for chunk in chunks {
                stmt.execute(rusqlite::params![
                    chunk.file_id.as_str(),
                    chunk.index as i64,
                    chunk.data.as_ref(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn chunks_for_file(&self, file_id: &FileId) -> StoreResult<Vec<(u64, Bytes)>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare_cached("SELECT idx, data FROM chunks WHERE file_id = ?1 ORDER BY idx")?;
        let rows = stmt.query_map(rusqlite::params![file_id.as_str()], |row| {
            let idx: i64 = row.get(0)?;
            let data: Vec<u8> = row.get(1)?;
            Ok((idx as u64, Bytes::from(data)))
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn delete_file(&self, file_id: &FileId) -> StoreResult<usize> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM chunks WHERE file_id = ?1",
            rusqlite::params![file_id.as_str()],
        )?;
        Ok(removed)
    }
}
