//! Wire messages exchanged between sender and receivers.
//!
//! Every datagram carries exactly one [`Message`], encoded with bincode.
//! Messages name their file explicitly, so datagrams of different files can
//! interleave freely on one channel.

use crate::error::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use wisp_files::{CHUNK_SIZE, FileChunker, FileId};

/// Protocol message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Message {
    /// Sender announces a file to every peer
    FileOffer {
        /// File identifier
        file_id: FileId,
        /// Display name
        name: String,
        /// Size in bytes
        size: u64,
        /// MIME type
        file_type: String,
    },
    /// Receiver wants the file
    FileAccepted {
        /// File identifier
        file_id: FileId,
    },
    /// Receiver declines the file, or sender refuses a late acceptance
    FileRejected {
        /// File identifier
        file_id: FileId,
        /// Human-readable reason
        reason: Option<String>,
    },
    /// Sender tells a mid-transfer acceptor how many chunks are being replayed
    FileCatchup {
        /// File identifier
        file_id: FileId,
        /// Chunks already sent before this peer joined
        chunks_to_expect: u64,
    },
    /// One chunk of file data
    FileChunk {
        /// File identifier
        file_id: FileId,
        /// Chunk index
        index: u64,
        /// Chunk bytes
        data: Bytes,
        /// Whether this is the final index
        is_last_chunk: bool,
    },
    /// Receiver acknowledges a chunk
    FileAck {
        /// File identifier
        file_id: FileId,
        /// Chunk index
        index: u64,
    },
    /// Sender has sent every chunk
    FileComplete {
        /// File identifier
        file_id: FileId,
    },
}

impl Message {
    /// Encode for the datagram transport
    ///
    /// # Errors
    /// Returns `TransferError::Serialization` if encoding fails.
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    /// Decode a datagram
    ///
    /// # Errors
    /// Returns `TransferError::Serialization` for malformed input.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// File this message refers to
    pub fn file_id(&self) -> &FileId {
        match self {
            Message::FileOffer { file_id, .. }
            | Message::FileAccepted { file_id }
            | Message::FileRejected { file_id, .. }
            | Message::FileCatchup { file_id, .. }
            | Message::FileChunk { file_id, .. }
            | Message::FileAck { file_id, .. }
            | Message::FileComplete { file_id } => file_id,
        }
    }

    /// Wire name of the message kind
    pub fn kind(&self) -> &'static str {
        match self {
            Message::FileOffer { .. } => "file-offer",
            Message::FileAccepted { .. } => "file-accepted",
            Message::FileRejected { .. } => "file-rejected",
            Message::FileCatchup { .. } => "file-catchup",
            Message::FileChunk { .. } => "file-chunk",
            Message::FileAck { .. } => "file-ack",
            Message::FileComplete { .. } => "file-complete",
        }
    }
}

/// Immutable description of an offered file.
///
/// Sender and receiver derive `total_chunks` identically from the size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOffer {
    /// File identifier
    pub file_id: FileId,
    /// Display name
    pub name: String,
    /// Size in bytes
    pub byte_size: u64,
    /// MIME type
    pub mime_type: String,
    /// Chunk size
    pub chunk_size: usize,
    /// `ceil(byte_size / chunk_size)`
    pub total_chunks: u64,
}

impl FileOffer {
    /// Describe a file using the protocol chunk size
    pub fn new(
        file_id: FileId,
        name: impl Into<String>,
        byte_size: u64,
        mime_type: impl Into<String>,
    ) -> Self {
        Self {
            file_id,
            name: name.into(),
            byte_size,
            mime_type: mime_type.into(),
            chunk_size: CHUNK_SIZE,
            total_chunks: FileChunker::new().chunk_count(byte_size),
        }
    }

    /// The `file-offer` message announcing this file
    pub fn to_message(&self) -> Message {
        Message::FileOffer {
            file_id: self.file_id.clone(),
            name: self.name.clone(),
            size: self.byte_size,
            file_type: self.mime_type.clone(),
        }
    }
}
