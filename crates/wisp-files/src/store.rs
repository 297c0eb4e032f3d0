//! Durable chunk store.
//!
//! Producers only enqueue. A single drain loop owns the pending-write guard,
//! groups queued writes into batches and hands them to a fixed pool of
//! storage workers sharing one batch queue. Each committed batch raises one
//! [`StoreEvent::Stored`] per chunk; a failed batch clears its guards and
//! raises [`StoreEvent::BatchFailed`] carrying the chunks so they can be
//! enqueued again.
//!
//! ```text
//! enqueue ─▶ queue ─▶ drain loop ─▶ batches ─▶ worker 0..N ─▶ backend
//!                        ▲  (guard set)                  │
//!                        └────────── outcomes ◀──────────┘
//!                        │
//!                        └─▶ StoreEvent stream
//! ```

use crate::backend::ChunkBackend;
use crate::error::{StoreError, StoreResult};
use crate::id::FileId;
use crate::SIZE_TOLERANCE;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// One chunk write request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkWrite {
    /// Owning file
    pub file_id: FileId,
    /// Chunk index
    pub index: u64,
    /// Chunk bytes
    pub data: Bytes,
}

/// Storage confirmations
#[derive(Debug, Clone)]
pub enum StoreEvent {
    /// A chunk is durably stored
    Stored {
        /// Owning file
        file_id: FileId,
        /// Chunk index
        index: u64,
    },
    /// A batch failed to commit; none of its chunks were stored
    BatchFailed {
        /// Chunks of the failed batch, free to be enqueued again
        chunks: Vec<ChunkWrite>,
        /// Backend error message
        error: String,
    },
}

/// Chunk store tuning
#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    /// Maximum chunks per atomic batch
    pub batch_size: usize,
    /// Number of storage workers
    pub workers: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            batch_size: 10,
            workers: num_cpus::get(),
        }
    }
}

/// Result of comparing an assembled file to its declared size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Integrity {
    /// Within tolerance of the declared size
    Verified,
    /// Assembled length differs from the declared size by more than the
    /// tolerance; the data is still returned
    SizeMismatch {
        /// Declared size
        expected: u64,
        /// Assembled length
        actual: u64,
    },
}

/// A file reassembled from the store
#[derive(Debug, Clone)]
pub struct AssembledFile {
    /// File identifier
    pub file_id: FileId,
    /// Concatenated chunk data in index order
    pub data: Bytes,
    /// Number of chunks used
    pub chunk_count: u64,
    /// Indices absent from the store (only non-empty for lossy reads)
    pub missing: Vec<u64>,
    /// Size check result
    pub integrity: Integrity,
}

struct BatchOutcome {
    batch: Vec<ChunkWrite>,
    result: Result<(), String>,
}

/// Queued, batched, confirmed chunk storage.
pub struct ChunkStore {
    queue_tx: mpsc::UnboundedSender<ChunkWrite>,
    backend: Arc<dyn ChunkBackend>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ChunkStore {
    /// Start the drain loop and worker pool.
    ///
    /// Must be called inside a Tokio runtime. Returns the store and its
    /// confirmation stream.
    pub fn spawn(
        backend: Arc<dyn ChunkBackend>,
        options: StoreOptions,
    ) -> (Self, mpsc::UnboundedReceiver<StoreEvent>) {
        let batch_size = options.batch_size.max(1);
        let workers = options.workers.max(1);

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (batch_tx, batch_rx) = mpsc::channel(workers * 2);
        let (done_tx, done_rx) = mpsc::unbounded_channel();

        let batch_rx = Arc::new(tokio::sync::Mutex::new(batch_rx));
        let mut tasks = Vec::with_capacity(workers + 1);

        for worker_id in 0..workers {
            tasks.push(tokio::spawn(storage_worker(
                worker_id,
                Arc::clone(&batch_rx),
                Arc::clone(&backend),
                done_tx.clone(),
            )));
        }
        tasks.push(tokio::spawn(drain_loop(
            queue_rx, batch_tx, done_rx, events_tx, batch_size,
        )));

        tracing::debug!(workers, batch_size, "chunk store started");

        let store = Self {
            queue_tx,
            backend,
            tasks: Mutex::new(tasks),
        };
        (store, events_rx)
    }

    /// Queue a chunk for durable storage
    ///
    /// # Errors
    /// Returns `StoreError::Closed` after shutdown.
    pub fn enqueue(&self, file_id: FileId, index: u64, data: Bytes) -> StoreResult<()> {
        self.queue_tx
            .send(ChunkWrite {
                file_id,
                index,
                data,
            })
            .map_err(|_| StoreError::Closed)
    }

    /// Re-queue chunks returned by a failed batch
    ///
    /// # Errors
    /// Returns `StoreError::Closed` after shutdown.
    pub fn requeue(&self, chunks: Vec<ChunkWrite>) -> StoreResult<()> {
        for chunk in chunks {
            self.queue_tx.send(chunk).map_err(|_| StoreError::Closed)?;
        }
        Ok(())
    }

    /// Read every stored chunk of a file in index order and concatenate.
    ///
    /// # Errors
    /// Returns `StoreError::MissingChunks` if any index below
    /// `expected_chunks` is absent.
    pub async fn read_file(
        &self,
        file_id: &FileId,
        declared_size: u64,
        expected_chunks: u64,
    ) -> StoreResult<AssembledFile> {
        let chunks = self.fetch(file_id).await?;
        assemble(file_id, chunks, declared_size, expected_chunks, false)
    }

    /// Like [`read_file`](Self::read_file), but concatenates whatever is
    /// present and lists the gaps in [`AssembledFile::missing`].
    ///
    /// # Errors
    /// Propagates backend errors.
    pub async fn read_file_lossy(
        &self,
        file_id: &FileId,
        declared_size: u64,
        expected_chunks: u64,
    ) -> StoreResult<AssembledFile> {
        let chunks = self.fetch(file_id).await?;
        assemble(file_id, chunks, declared_size, expected_chunks, true)
    }

    async fn fetch(&self, file_id: &FileId) -> StoreResult<Vec<(u64, Bytes)>> {
        let backend = Arc::clone(&self.backend);
        let id = file_id.clone();
        tokio::task::spawn_blocking(move || backend.chunks_for_file(&id))
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?
    }

    /// Remove a file's chunks from the backend
    ///
    /// # Errors
    /// Propagates backend errors.
    pub async fn delete_file(&self, file_id: &FileId) -> StoreResult<usize> {
        let backend = Arc::clone(&self.backend);
        let id = file_id.clone();
        tokio::task::spawn_blocking(move || backend.delete_file(&id))
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?
    }

    /// Stop the drain loop and workers. Queued writes are discarded.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for ChunkStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Join sorted chunks into one buffer, checking for gaps and size drift.
fn assemble(
    file_id: &FileId,
    chunks: Vec<(u64, Bytes)>,
    declared_size: u64,
    expected_chunks: u64,
    allow_gaps: bool,
) -> StoreResult<AssembledFile> {
    let present: HashSet<u64> = chunks.iter().map(|(i, _)| *i).collect();
    let missing: Vec<u64> = (0..expected_chunks)
        .filter(|i| !present.contains(i))
        .collect();
    if !missing.is_empty() {
        tracing::warn!(%file_id, missing = missing.len(), "assembly found gaps");
    }
    if !missing.is_empty() && !allow_gaps {
        return Err(StoreError::MissingChunks {
            file_id: file_id.clone(),
            missing,
        });
    }

    let mut buf = BytesMut::with_capacity(declared_size as usize);
    let mut used = 0u64;
    for (index, data) in &chunks {
        if *index >= expected_chunks {
            tracing::warn!(%file_id, index, "ignoring chunk past the declared end");
            continue;
        }
        buf.extend_from_slice(data);
        used += 1;
    }

    let actual = buf.len() as u64;
    let integrity = if actual.abs_diff(declared_size) > SIZE_TOLERANCE {
        tracing::warn!(
            %file_id,
            expected = declared_size,
            actual,
            "assembled size differs from declared size"
        );
        Integrity::SizeMismatch {
            expected: declared_size,
            actual,
        }
    } else {
        Integrity::Verified
    };

    Ok(AssembledFile {
        file_id: file_id.clone(),
        data: buf.freeze(),
        chunk_count: used,
        missing,
        integrity,
    })
}

/// Owns the pending-write guard; forms batches and publishes outcomes.
async fn drain_loop(
    mut queue_rx: mpsc::UnboundedReceiver<ChunkWrite>,
    batch_tx: mpsc::Sender<Vec<ChunkWrite>>,
    mut done_rx: mpsc::UnboundedReceiver<BatchOutcome>,
    events_tx: mpsc::UnboundedSender<StoreEvent>,
    batch_size: usize,
) {
    let mut pending: HashSet<(FileId, u64)> = HashSet::new();

    loop {
        tokio::select! {
            Some(outcome) = done_rx.recv() => {
                for chunk in &outcome.batch {
                    pending.remove(&(chunk.file_id.clone(), chunk.index));
                }
                match outcome.result {
                    Ok(()) => {
                        tracing::trace!(chunks = outcome.batch.len(), "batch committed");
                        for chunk in outcome.batch {
                            let _ = events_tx.send(StoreEvent::Stored {
                                file_id: chunk.file_id,
                                index: chunk.index,
                            });
                        }
                    }
                    Err(error) => {
                        tracing::warn!(chunks = outcome.batch.len(), %error, "batch failed");
                        let _ = events_tx.send(StoreEvent::BatchFailed {
                            chunks: outcome.batch,
                            error,
                        });
                    }
                }
            }
            next = queue_rx.recv() => {
                let Some(first) = next else { break };
                let mut batch = Vec::with_capacity(batch_size);
                admit(&mut pending, &mut batch, first);
                while batch.len() < batch_size {
                    match queue_rx.try_recv() {
                        Ok(write) => admit(&mut pending, &mut batch, write),
                        Err(_) => break,
                    }
                }
                if batch.is_empty() {
                    continue;
                }
                if batch_tx.send(batch).await.is_err() {
                    tracing::error!("storage workers stopped");
                    break;
                }
            }
        }
    }

    tracing::debug!("chunk store drain loop exiting");
}

/// Add a write to the batch unless the same key is already in flight.
fn admit(pending: &mut HashSet<(FileId, u64)>, batch: &mut Vec<ChunkWrite>, write: ChunkWrite) {
    if pending.insert((write.file_id.clone(), write.index)) {
        batch.push(write);
    } else {
        tracing::trace!(file_id = %write.file_id, index = write.index, "write already pending");
    }
}

async fn storage_worker(
    worker_id: usize,
    batches: Arc<tokio::sync::Mutex<mpsc::Receiver<Vec<ChunkWrite>>>>,
    backend: Arc<dyn ChunkBackend>,
    done_tx: mpsc::UnboundedSender<BatchOutcome>,
) {
    loop {
        let next = {
            let mut rx = batches.lock().await;
            rx.recv().await
        };
        let Some(batch) = next else { break };

        let to_write = batch.clone();
        let backend = Arc::clone(&backend);
        let result = match tokio::task::spawn_blocking(move || backend.put_batch(&to_write)).await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(e) => Err(format!("storage worker {worker_id} panicked: {e}")),
        };

        if done_tx.send(BatchOutcome { batch, result }).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, SqliteBackend};
    use std::time::Duration;

    fn options(workers: usize) -> StoreOptions {
        StoreOptions {
            batch_size: 10,
            workers,
        }
    }

    async fn collect_stored(
        events: &mut mpsc::UnboundedReceiver<StoreEvent>,
        count: usize,
    ) -> Vec<(FileId, u64)> {
        let mut stored = Vec::new();
        while stored.len() < count {
            match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
                Ok(Some(StoreEvent::Stored { file_id, index })) => stored.push((file_id, index)),
                Ok(Some(StoreEvent::BatchFailed { error, .. })) => panic!("batch failed: {error}"),
                _ => panic!("store stopped early"),
            }
        }
        stored
    }

    #[tokio::test]
    async fn test_store_round_trip() {
        let backend = Arc::new(MemoryBackend::new());
        let (store, mut events) = ChunkStore::spawn(backend, options(2));
        let file = FileId::new("file_rt");

        // Enqueue out of order
        for index in [2u64, 0, 1] {
            let data = Bytes::from(vec![index as u8; 100]);
            store.enqueue(file.clone(), index, data).unwrap();
        }
        collect_stored(&mut events, 3).await;

        let assembled = store.read_file(&file, 300, 3).await.unwrap();
        assert_eq!(assembled.chunk_count, 3);
        assert_eq!(assembled.integrity, Integrity::Verified);
        let expected: Vec<u8> = [0u8, 1, 2].iter().flat_map(|b| vec![*b; 100]).collect();
        assert_eq!(assembled.data.as_ref(), expected.as_slice());
    }

    #[tokio::test]
    async fn test_store_batches_up_to_limit() {
        let backend = Arc::new(MemoryBackend::new());
        let (store, mut events) = ChunkStore::spawn(backend.clone(), options(1));
        let file = FileId::new("file_batch");

        for index in 0..25u64 {
            store
                .enqueue(file.clone(), index, Bytes::from_static(b"x"))
                .unwrap();
        }
        let stored = collect_stored(&mut events, 25).await;
        assert_eq!(stored.len(), 25);
        assert!(backend.batches_written() >= 3);
        assert_eq!(backend.chunk_count(&file), 25);
    }

    #[tokio::test]
    async fn test_failed_batch_is_retryable() {
        let backend = Arc::new(MemoryBackend::new());
        backend.fail_next_batches(1);
        let (store, mut events) = ChunkStore::spawn(backend.clone(), options(1));
        let file = FileId::new("file_fail");

        for index in 0..10u64 {
            store
                .enqueue(file.clone(), index, Bytes::from_static(b"y"))
                .unwrap();
        }

        let failed = loop {
            match events.recv().await {
                Some(StoreEvent::BatchFailed { chunks, .. }) => break chunks,
                Some(StoreEvent::Stored { .. }) => {}
                None => panic!("store stopped"),
            }
        };
        let mut indices: Vec<u64> = failed.iter().map(|c| c.index).collect();
        indices.sort_unstable();
        assert_eq!(indices, (0..10).collect::<Vec<_>>());
        assert_eq!(backend.chunk_count(&file), 0);

        // Guards were cleared, so the same keys are accepted again
        store.requeue(failed).unwrap();
        let mut stored = 0;
        while stored < 10 {
            match events.recv().await {
                Some(StoreEvent::Stored { .. }) => stored += 1,
                Some(StoreEvent::BatchFailed { chunks, .. }) => store.requeue(chunks).unwrap(),
                None => panic!("store stopped"),
            }
        }
        assert_eq!(backend.chunk_count(&file), 10);
    }

    #[tokio::test]
    async fn test_read_file_reports_gaps() {
        let backend = Arc::new(MemoryBackend::new());
        let (store, mut events) = ChunkStore::spawn(backend, options(1));
        let file = FileId::new("file_gap");

        store.enqueue(file.clone(), 0, Bytes::from_static(b"a")).unwrap();
        store.enqueue(file.clone(), 2, Bytes::from_static(b"c")).unwrap();
        collect_stored(&mut events, 2).await;

        match store.read_file(&file, 3, 3).await {
            Err(StoreError::MissingChunks { missing, .. }) => assert_eq!(missing, vec![1]),
            other => panic!("expected missing chunks, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_lossy_read_concatenates_present_chunks() {
        let backend = Arc::new(MemoryBackend::new());
        let (store, mut events) = ChunkStore::spawn(backend, options(1));
        let file = FileId::new("file_lossy");

        store.enqueue(file.clone(), 0, Bytes::from_static(b"a")).unwrap();
        store.enqueue(file.clone(), 2, Bytes::from_static(b"c")).unwrap();
        collect_stored(&mut events, 2).await;

        let assembled = store.read_file_lossy(&file, 3, 3).await.unwrap();
        assert_eq!(assembled.data, Bytes::from_static(b"ac"));
        assert_eq!(assembled.missing, vec![1]);
        assert_eq!(assembled.chunk_count, 2);
    }

    #[tokio::test]
    async fn test_read_file_flags_size_mismatch() {
        let backend = Arc::new(MemoryBackend::new());
        let (store, mut events) = ChunkStore::spawn(backend, options(1));
        let file = FileId::new("file_size");

        store
            .enqueue(file.clone(), 0, Bytes::from(vec![7u8; 4096]))
            .unwrap();
        collect_stored(&mut events, 1).await;

        let assembled = store.read_file(&file, 1000, 1).await.unwrap();
        assert_eq!(
            assembled.integrity,
            Integrity::SizeMismatch {
                expected: 1000,
                actual: 4096
            }
        );
        assert_eq!(assembled.data.len(), 4096);

        let within = store.read_file(&file, 4096 + 512, 1).await.unwrap();
        assert_eq!(within.integrity, Integrity::Verified);
    }

    #[tokio::test]
    async fn test_sqlite_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(SqliteBackend::open(dir.path().join("store.db")).unwrap());
        let (store, mut events) = ChunkStore::spawn(backend, options(2));
        let file = FileId::new("file_sql");

        for index in 0..12u64 {
            store
                .enqueue(file.clone(), index, Bytes::from(vec![index as u8; 10]))
                .unwrap();
        }
        collect_stored(&mut events, 12).await;

        let assembled = store.read_file(&file, 120, 12).await.unwrap();
        assert_eq!(assembled.data.len(), 120);
        assert_eq!(assembled.data[115], 11);

        assert_eq!(store.delete_file(&file).await.unwrap(), 12);
    }

    #[tokio::test]
    async fn test_enqueue_after_shutdown() {
        let backend = Arc::new(MemoryBackend::new());
        let (store, _events) = ChunkStore::spawn(backend, options(1));
        store.shutdown();

        for _ in 0..100 {
            if let Err(e) = store.enqueue(FileId::new("f"), 0, Bytes::new()) {
                assert!(matches!(e, StoreError::Closed));
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("enqueue kept succeeding after shutdown");
    }

    #[test]
    fn test_assemble_ignores_extra_chunks() {
        let file = FileId::new("file_extra");
        let chunks = vec![
            (0, Bytes::from_static(b"ab")),
            (1, Bytes::from_static(b"cd")),
            (2, Bytes::from_static(b"zz")),
        ];
        let assembled = assemble(&file, chunks, 4, 2, false).unwrap();
        assert_eq!(assembled.data, Bytes::from_static(b"abcd"));
        assert_eq!(assembled.chunk_count, 2);
    }
}
