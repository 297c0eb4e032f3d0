//! Events surfaced to the application.

use crate::error::TransferError;
use crate::protocol::FileOffer;
use bytes::Bytes;
use tokio::sync::mpsc;
use wisp_files::{FileId, Integrity};
use wisp_transport::PeerId;

/// Which side of a transfer an event concerns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// This node is sending
    Outgoing,
    /// This node is receiving
    Incoming,
}

/// A received file, durably stored and reassembled
#[derive(Debug, Clone)]
pub struct CompletedFile {
    /// File identifier
    pub file_id: FileId,
    /// Display name from the offer
    pub name: String,
    /// MIME type from the offer
    pub mime_type: String,
    /// Declared size
    pub byte_size: u64,
    /// Sending peer
    pub from: PeerId,
    /// Reassembled content
    pub data: Bytes,
    /// Chunks absent after a best-effort completion
    pub missing_chunks: Vec<u64>,
    /// Size check result
    pub integrity: Integrity,
}

impl CompletedFile {
    /// True when every chunk arrived and the size matches
    pub fn is_intact(&self) -> bool {
        self.missing_chunks.is_empty() && self.integrity == Integrity::Verified
    }
}

/// How a transfer completed
#[derive(Debug, Clone)]
pub enum Completion {
    /// Every chunk was acknowledged and completion was sent
    Sent,
    /// The completion barrier resolved
    Received(Box<CompletedFile>),
}

/// Transfer lifecycle event
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// A file was offered, by this node or to it
    Offered {
        /// Side
        direction: Direction,
        /// The offer
        offer: FileOffer,
        /// Offering peer for incoming offers
        from: Option<PeerId>,
    },
    /// A peer accepted one of our files
    Accepted {
        /// File identifier
        file_id: FileId,
        /// Accepting peer
        peer: PeerId,
    },
    /// A file was declined
    Rejected {
        /// Side
        direction: Direction,
        /// File identifier
        file_id: FileId,
        /// Declining peer
        peer: PeerId,
        /// Reason, if given
        reason: Option<String>,
    },
    /// Periodic progress sample
    Progress {
        /// Side
        direction: Direction,
        /// File identifier
        file_id: FileId,
        /// Completion in percent
        percent: f64,
        /// Bytes per second since the previous sample
        throughput: f64,
    },
    /// A transfer finished
    Completed {
        /// File identifier
        file_id: FileId,
        /// Outcome
        completion: Completion,
    },
    /// A transfer ended in error
    Failed {
        /// Side
        direction: Direction,
        /// File identifier
        file_id: FileId,
        /// Cause
        error: TransferError,
    },
    /// A received file is available but flagged
    IntegrityWarning {
        /// File identifier
        file_id: FileId,
        /// What is wrong
        error: TransferError,
    },
}

impl TransferEvent {
    /// File this event concerns
    pub fn file_id(&self) -> &FileId {
        match self {
            TransferEvent::Offered { offer, .. } => &offer.file_id,
            TransferEvent::Accepted { file_id, .. }
            | TransferEvent::Rejected { file_id, .. }
            | TransferEvent::Progress { file_id, .. }
            | TransferEvent::Completed { file_id, .. }
            | TransferEvent::Failed { file_id, .. }
            | TransferEvent::IntegrityWarning { file_id, .. } => file_id,
        }
    }
}

/// Cloneable event publisher; events to a closed stream are discarded
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<TransferEvent>,
}

impl EventSink {
    /// Create a sink and its receiving stream
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TransferEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Publish an event
    pub fn emit(&self, event: TransferEvent) {
        let _ = self.tx.send(event);
    }
}
