//! File chunking.

use crate::CHUNK_SIZE;
use std::ops::Range;

/// Splits a byte length into fixed-size chunks.
///
/// Every chunk is `chunk_size` bytes except the last, which holds the
/// remainder. An empty file has zero chunks.
#[derive(Debug, Clone, Copy)]
pub struct FileChunker {
    chunk_size: usize,
}

impl FileChunker {
    /// Create a new chunker with the protocol chunk size
    pub fn new() -> Self {
        Self::with_chunk_size(CHUNK_SIZE)
    }

    /// Create a new chunker with custom chunk size
    ///
    /// A size of zero is raised to one byte.
    pub fn with_chunk_size(size: usize) -> Self {
        Self {
            chunk_size: size.max(1),
        }
    }

    /// Get chunk size
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Calculate number of chunks for a file
    pub fn chunk_count(&self, file_size: u64) -> u64 {
        file_size.div_ceil(self.chunk_size as u64)
    }

    /// Byte range of chunk `index`, or `None` past the end of the file
    pub fn chunk_range(&self, index: u64, file_size: u64) -> Option<Range<u64>> {
        if index >= self.chunk_count(file_size) {
            return None;
        }
        let start = index * self.chunk_size as u64;
        let end = (start + self.chunk_size as u64).min(file_size);
        Some(start..end)
    }

    /// Whether `index` is the final chunk of a file
    pub fn is_last_chunk(&self, index: u64, file_size: u64) -> bool {
        let count = self.chunk_count(file_size);
        count > 0 && index == count - 1
    }
}

impl Default for FileChunker {
    fn default() -> Self {
        Self::new()
    }
}
