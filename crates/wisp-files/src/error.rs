//! Storage errors.

use crate::id::FileId;

/// Chunk store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// SQLite failure
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// I/O failure reading a byte source
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The store's background tasks have stopped
    #[error("Chunk store is closed")]
    Closed,

    /// Assembly found gaps
    #[error("File {file_id} is missing {} chunk(s)", missing.len())]
    MissingChunks {
        /// File being assembled
        file_id: FileId,
        /// Indices with no stored chunk
        missing: Vec<u64>,
    },

    /// Read past the end of a byte source
    #[error("Range {offset}+{len} out of bounds for source of {size} bytes")]
    OutOfBounds {
        /// Requested offset
        offset: u64,
        /// Requested length
        len: usize,
        /// Source length
        size: u64,
    },

    /// Backend-specific failure
    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;
