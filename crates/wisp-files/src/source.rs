//! Byte sources that outgoing chunks are read from.
//!
//! A source stays readable for as long as the sender retains the file, so a
//! post-completion acceptor can be served by re-reading it from chunk 0.

use crate::error::{StoreError, StoreResult};
use bytes::Bytes;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Content of a file being offered.
#[derive(Debug, Clone)]
pub enum ByteSource {
    /// Content held in memory
    Memory(Bytes),
    /// Content read on demand from disk
    Disk {
        /// File path
        path: PathBuf,
        /// Length captured when the source was opened
        len: u64,
    },
}

impl ByteSource {
    /// In-memory source
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        Self::Memory(data.into())
    }

    /// Open an on-disk source, capturing its current length
    ///
    /// # Errors
    /// Returns `StoreError::Io` if the file metadata cannot be read.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let len = tokio::fs::metadata(&path).await?.len();
        Ok(Self::Disk { path, len })
    }

    /// Total length in bytes
    pub fn len(&self) -> u64 {
        match self {
            Self::Memory(data) => data.len() as u64,
            Self::Disk { len, .. } => *len,
        }
    }

    /// Whether the source holds no bytes
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read `len` bytes starting at `offset`.
    ///
    /// # Errors
    /// Returns `StoreError::OutOfBounds` when the range exceeds the source and
    /// `StoreError::Io` when the disk read fails.
    pub async fn read_range(&self, offset: u64, len: usize) -> StoreResult<Bytes> {
        let size = self.len();
        if offset.saturating_add(len as u64) > size {
            return Err(StoreError::OutOfBounds { offset, len, size });
        }

        match self {
            Self::Memory(data) => {
                let start = offset as usize;
                Ok(data.slice(start..start + len))
            }
            Self::Disk { path, .. } => {
                let mut file = tokio::fs::File::open(path).await?;
                file.seek(SeekFrom::Start(offset)).await?;
                let mut buf = vec![0u8; len];
                file.read_exact(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
        }
    }
}
