//! # WISP Files
//!
//! File layer for the WISP protocol.
//!
//! This crate provides:
//! - File identifiers ([`FileId`])
//! - Fixed-size chunking ([`FileChunker`])
//! - Byte sources that chunks are read from ([`ByteSource`])
//! - The durable [`ChunkStore`]: a queued, batched write path with a
//!   pending-write guard, per-chunk confirmations and ordered assembly
//! - Storage backends ([`MemoryBackend`], [`SqliteBackend`])

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod chunker;
pub mod error;
pub mod id;
pub mod source;
pub mod store;

pub use backend::{ChunkBackend, MemoryBackend, SqliteBackend};
pub use chunker::FileChunker;
pub use error::{StoreError, StoreResult};
pub use id::FileId;
pub use source::ByteSource;
pub use store::{AssembledFile, ChunkStore, ChunkWrite, Integrity, StoreEvent, StoreOptions};

/// Protocol chunk size (256 KiB).
///
/// Sender and receiver both derive `total_chunks` from it, so it is not
/// configurable.
pub const CHUNK_SIZE: usize = 256 * 1024;

/// Largest difference between declared and assembled size that is not
/// reported as an integrity problem.
pub const SIZE_TOLERANCE: u64 = 1024;
