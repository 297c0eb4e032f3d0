//! Transfer registry
//!
//! Maps each file identifier to the record that owns its state: an
//! [`OutgoingTransfer`] when this node offered the file, an [`IncomingFile`]
//! when a peer offered it to us. Records are handed out as `Arc` handles.
//!
//! # Lifecycle
//!
//! ```text
//! outgoing: offer ──▶ offered ──▶ transferring ──▶ completed ──(retention)──▶ evicted
//!                                      └──▶ failed/cancelled ──▶ evicted
//! incoming: offer ──▶ offered ──▶ receiving ──▶ completing ──▶ handed out ──▶ removed
//!                        └──▶ rejected ──▶ removed
//! ```
//!
//! Identifiers are never reused: once a file ID has been registered in either
//! role, registering it again is refused even after the record is gone.

use crate::receiver::IncomingFile;
use crate::sender::OutgoingTransfer;
use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use wisp_files::FileId;
use wisp_transport::PeerId;

/// Role this node plays for a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// We offered the file
    Sender,
    /// A peer offered the file to us
    Receiver,
}

/// Process-wide file record map
#[derive(Default)]
pub struct TransferRegistry {
    outgoing: DashMap<FileId, Arc<OutgoingTransfer>>,
    incoming: DashMap<FileId, Arc<IncomingFile>>,
    seen: DashSet<FileId>,
}

impl TransferRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an outgoing transfer; false if the ID was used before
    pub fn register_outgoing(&self, transfer: Arc<OutgoingTransfer>) -> bool {
        let file_id = transfer.file_id().clone();
        if !self.seen.insert(file_id.clone()) {
            tracing::warn!(%file_id, "refusing to reuse file id");
            return false;
        }
        self.outgoing.insert(file_id, transfer);
        true
    }

    /// Register an incoming file; false if the ID was used before
    pub fn register_incoming(&self, file: Arc<IncomingFile>) -> bool {
        let file_id = file.file_id().clone();
        if !self.seen.insert(file_id.clone()) {
            tracing::warn!(%file_id, "ignoring offer for a known file id");
            return false;
        }
        self.incoming.insert(file_id, file);
        true
    }

    /// Look up an outgoing transfer
    pub fn outgoing(&self, file_id: &FileId) -> Option<Arc<OutgoingTransfer>> {
        self.outgoing.get(file_id).map(|e| Arc::clone(e.value()))
    }

    /// Look up an incoming file
    pub fn incoming(&self, file_id: &FileId) -> Option<Arc<IncomingFile>> {
        self.incoming.get(file_id).map(|e| Arc::clone(e.value()))
    }

    /// Evict an outgoing transfer
    pub fn remove_outgoing(&self, file_id: &FileId) -> Option<Arc<OutgoingTransfer>> {
        let removed = self.outgoing.remove(file_id).map(|(_, t)| t);
        if removed.is_some() {
            tracing::debug!(%file_id, "outgoing transfer evicted");
        }
        removed
    }

    /// Drop an incoming file's record
    pub fn remove_incoming(&self, file_id: &FileId) -> Option<Arc<IncomingFile>> {
        let removed = self.incoming.remove(file_id).map(|(_, f)| f);
        if removed.is_some() {
            tracing::debug!(%file_id, "incoming file removed");
        }
        removed
    }

    /// Role of a registered file
    pub fn role(&self, file_id: &FileId) -> Option<Role> {
        if self.outgoing.contains_key(file_id) {
            Some(Role::Sender)
        } else if self.incoming.contains_key(file_id) {
            Some(Role::Receiver)
        } else {
            None
        }
    }

    /// Snapshot of every outgoing transfer
    pub fn outgoing_transfers(&self) -> Vec<Arc<OutgoingTransfer>> {
        self.outgoing.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Snapshot of every incoming file
    pub fn incoming_files(&self) -> Vec<Arc<IncomingFile>> {
        self.incoming.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Incoming files offered by `peer`
    pub fn incoming_from(&self, peer: &PeerId) -> Vec<Arc<IncomingFile>> {
        self.incoming
            .iter()
            .filter(|e| e.value().sender() == peer)
            .map(|e| Arc::clone(e.value()))
            .collect()
    }

    /// Number of outgoing transfers
    pub fn outgoing_count(&self) -> usize {
        self.outgoing.len()
    }

    /// Number of incoming files
    pub fn incoming_count(&self) -> usize {
        self.incoming.len()
    }
}
