//! Receiver assembly manager
//!
//! Tracks every file offered to this node. Chunks of accepted (or catching
//! up) files are acknowledged the moment they arrive, deduplicated by index
//! and handed to the [`ChunkStore`]. A `file-complete` from the sender starts
//! the completion barrier, which waits for storage to confirm every chunk
//! rather than trusting network receipt.
//!
//! # Barrier outcomes
//!
//! - every chunk confirmed: the file is assembled and handed out
//! - timeout with at most `missing_tolerance` unconfirmed chunks: the file is
//!   handed out anyway, flagged with its gaps
//! - timeout with more missing: the file fails as incomplete

use crate::config::ReceiverConfig;
use crate::error::{Result, TransferError};
use crate::events::{CompletedFile, Completion, Direction, EventSink, TransferEvent};
use crate::link::Link;
use crate::progress::{RateSampler, percent};
use crate::protocol::{FileOffer, Message};
use crate::registry::TransferRegistry;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use wisp_files::{ChunkStore, ChunkWrite, FileId, Integrity, StoreEvent};
use wisp_transport::PeerId;

/// Receiver-side phase of a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceivePhase {
    /// Offered, awaiting the user's decision
    Offered,
    /// Accepted or catching up; chunks flowing
    Receiving,
    /// Sender finished; waiting on storage confirmation
    Completing,
    /// Handed out
    Completed,
    /// Declined
    Rejected,
    /// Ended in error
    Failed,
}

impl ReceivePhase {
    fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Rejected | Self::Failed)
    }
}

impl fmt::Display for ReceivePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offered => write!(f, "Offered"),
            Self::Receiving => write!(f, "Receiving"),
            Self::Completing => write!(f, "Completing"),
            Self::Completed => write!(f, "Completed"),
            Self::Rejected => write!(f, "Rejected"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Point-in-time view of an incoming file
#[derive(Debug, Clone)]
pub struct IncomingStatus {
    /// Current phase
    pub phase: ReceivePhase,
    /// Explicitly accepted
    pub accepted: bool,
    /// Sender announced a catch-up replay
    pub catching_up: bool,
    /// Chunks the catch-up replay covers
    pub expected_resends: u64,
    /// Distinct chunks received
    pub received_chunks: u64,
    /// Distinct chunks confirmed by storage
    pub confirmed_chunks: u64,
    /// Bytes received, capped at the declared size
    pub received_size: u64,
    /// Chunks in the file
    pub total_chunks: u64,
}

struct ReceiveState {
    phase: ReceivePhase,
    accepted: bool,
    catching_up: bool,
    expected_resends: u64,
    received: HashSet<u64>,
    confirmed: HashSet<u64>,
    received_size: u64,
    /// Storage re-enqueues per chunk
    requeues: HashMap<u64, u32>,
    barrier: Option<AbortHandle>,
    rate: RateSampler,
}

/// Per-file receiver state
pub struct IncomingFile {
    offer: FileOffer,
    sender: PeerId,
    max_requeues: u32,
    state: Mutex<ReceiveState>,
    confirmed_tx: watch::Sender<u64>,
}

impl IncomingFile {
    /// Create the record for a file offered by `sender`
    pub fn new(offer: FileOffer, sender: PeerId, config: &ReceiverConfig) -> Self {
        let (confirmed_tx, _) = watch::channel(0);
        Self {
            offer,
            sender,
            max_requeues: config.max_store_requeues,
            state: Mutex::new(ReceiveState {
                phase: ReceivePhase::Offered,
                accepted: false,
                catching_up: false,
                expected_resends: 0,
                received: HashSet::new(),
                confirmed: HashSet::new(),
                received_size: 0,
                requeues: HashMap::new(),
                barrier: None,
                rate: RateSampler::new(Instant::now()),
            }),
            confirmed_tx,
        }
    }

    /// File identifier
    pub fn file_id(&self) -> &FileId {
        &self.offer.file_id
    }

    /// The offer
    pub fn offer(&self) -> &FileOffer {
        &self.offer
    }

    /// Offering peer
    pub fn sender(&self) -> &PeerId {
        &self.sender
    }

    /// Current phase
    pub fn phase(&self) -> ReceivePhase {
        self.state.lock().phase
    }

    /// Status snapshot
    pub fn status(&self) -> IncomingStatus {
        let state = self.state.lock();
        IncomingStatus {
            phase: state.phase,
            accepted: state.accepted,
            catching_up: state.catching_up,
            expected_resends: state.expected_resends,
            received_chunks: state.received.len() as u64,
            confirmed_chunks: state.confirmed.len() as u64,
            received_size: state.received_size,
            total_chunks: self.offer.total_chunks,
        }
    }

    fn admits_chunks(&self) -> bool {
        let state = self.state.lock();
        !state.phase.is_terminal() && (state.accepted || state.catching_up)
    }

    /// Record a first-seen chunk; false for duplicates
    fn record_chunk(&self, index: u64, len: usize) -> bool {
        let mut state = self.state.lock();
        if !state.received.insert(index) {
            return false;
        }
        state.received_size = state
            .received_size
            .saturating_add(len as u64)
            .min(self.offer.byte_size);
        true
    }

    fn confirm(&self, index: u64) {
        let mut state = self.state.lock();
        if state.received.contains(&index) && state.confirmed.insert(index) {
            self.confirmed_tx.send_replace(state.confirmed.len() as u64);
        }
    }

    fn confirmed_count(&self) -> u64 {
        self.state.lock().confirmed.len() as u64
    }

    /// Count a storage retry; false once the chunk is out of retries
    fn note_requeue(&self, index: u64) -> bool {
        let mut state = self.state.lock();
        if state.phase.is_terminal() {
            return false;
        }
        let count = state.requeues.entry(index).or_insert(0);
        *count += 1;
        *count <= self.max_requeues
    }

    /// Move to a terminal phase; false if already terminal
    fn terminate(&self, phase: ReceivePhase) -> bool {
        let mut state = self.state.lock();
        if state.phase.is_terminal() {
            return false;
        }
        state.phase = phase;
        if let Some(barrier) = state.barrier.take() {
            barrier.abort();
        }
        true
    }

    fn sample_progress(&self, now: Instant) -> Option<(f64, f64)> {
        let mut state = self.state.lock();
        if state.phase != ReceivePhase::Receiving || !(state.accepted || state.catching_up) {
            return None;
        }
        let received = state.received_size;
        let throughput = state.rate.sample(received, now);
        Some((percent(received, self.offer.byte_size), throughput))
    }
}

/// Drives incoming files
#[derive(Clone)]
pub struct ReceiverManager {
    link: Link,
    registry: Arc<TransferRegistry>,
    store: Arc<ChunkStore>,
    events: EventSink,
    config: ReceiverConfig,
}

impl ReceiverManager {
    /// Create a manager storing chunks in `store`
    pub fn new(
        link: Link,
        registry: Arc<TransferRegistry>,
        store: Arc<ChunkStore>,
        events: EventSink,
        config: ReceiverConfig,
    ) -> Self {
        Self {
            link,
            registry,
            store,
            events,
            config,
        }
    }

    /// A peer offered us a file
    pub fn handle_offer(&self, from: PeerId, offer: FileOffer) {
        let file = Arc::new(IncomingFile::new(offer.clone(), from.clone(), &self.config));
        if !self.registry.register_incoming(file) {
            return;
        }
        tracing::info!(
            file_id = %offer.file_id,
            %from,
            name = %offer.name,
            size = offer.byte_size,
            "file offered to us"
        );
        self.events.emit(TransferEvent::Offered {
            direction: Direction::Incoming,
            offer,
            from: Some(from),
        });
    }

    /// Accept an offered file and tell its sender
    ///
    /// Accepting twice is harmless.
    ///
    /// # Errors
    /// Returns `TransferError::FileNotFound` for unknown files and
    /// `TransferError::InvalidState` for files that already ended.
    pub async fn accept(&self, file_id: &FileId) -> Result<()> {
        let file = self
            .registry
            .incoming(file_id)
            .ok_or_else(|| TransferError::FileNotFound(file_id.clone()))?;

        let first = {
            let mut state = file.state.lock();
            match state.phase {
                ReceivePhase::Offered | ReceivePhase::Receiving => {
                    let first = !state.accepted;
                    state.accepted = true;
                    state.phase = ReceivePhase::Receiving;
                    state.rate = RateSampler::new(Instant::now());
                    first
                }
                ReceivePhase::Completing => false,
                _ => return Err(TransferError::invalid_state("file is no longer pending")),
            }
        };
        if !first {
            return Ok(());
        }

        tracing::info!(%file_id, sender = %file.sender, "file accepted");
        let accepted = Message::FileAccepted {
            file_id: file_id.clone(),
        };
        self.link.send(&file.sender, &accepted).await
    }

    /// Decline an offered file and discard its state
    ///
    /// # Errors
    /// Returns `TransferError::FileNotFound` for unknown files and
    /// `TransferError::InvalidState` once completion has begun.
    pub async fn reject(&self, file_id: &FileId, reason: Option<String>) -> Result<()> {
        let file = self
            .registry
            .incoming(file_id)
            .ok_or_else(|| TransferError::FileNotFound(file_id.clone()))?;

        if file.phase() == ReceivePhase::Completing {
            return Err(TransferError::invalid_state("file is already completing"));
        }
        if !file.terminate(ReceivePhase::Rejected) {
            return Err(TransferError::invalid_state("file is no longer pending"));
        }
        self.registry.remove_incoming(file_id);

        tracing::info!(%file_id, sender = %file.sender, "file rejected");
        let rejected = Message::FileRejected {
            file_id: file_id.clone(),
            reason: reason.clone(),
        };
        let sent = self.link.send(&file.sender, &rejected).await;
        self.events.emit(TransferEvent::Rejected {
            direction: Direction::Incoming,
            file_id: file_id.clone(),
            peer: file.sender.clone(),
            reason,
        });
        sent
    }

    /// The sender refused our acceptance
    pub fn handle_sender_reject(&self, from: &PeerId, file_id: &FileId, reason: Option<String>) {
        let Some(file) = self.registry.incoming(file_id) else {
            return;
        };
        if file.sender() != from {
            tracing::warn!(%file_id, %from, "rejection from a peer that did not offer the file");
            return;
        }
        if !file.terminate(ReceivePhase::Rejected) {
            return;
        }
        self.registry.remove_incoming(file_id);
        tracing::info!(%file_id, %from, reason = reason.as_deref().unwrap_or(""), "sender refused the file");
        self.events.emit(TransferEvent::Rejected {
            direction: Direction::Incoming,
            file_id: file_id.clone(),
            peer: from.clone(),
            reason,
        });
    }

    /// The sender is replaying chunks we missed
    pub fn handle_catchup(&self, from: &PeerId, file_id: &FileId, chunks_to_expect: u64) {
        let Some(file) = self.offered_by(from, file_id, "catch-up") else {
            return;
        };
        let mut state = file.state.lock();
        if state.phase.is_terminal() {
            return;
        }
        state.catching_up = true;
        state.expected_resends = chunks_to_expect;
        if state.phase == ReceivePhase::Offered {
            state.phase = ReceivePhase::Receiving;
        }
        tracing::debug!(%file_id, chunks_to_expect, "catching up");
    }

    /// A chunk arrived
    pub async fn handle_chunk(&self, from: &PeerId, file_id: FileId, index: u64, data: Bytes) {
        let Some(file) = self.offered_by(from, &file_id, "chunk") else {
            return;
        };
        if index >= file.offer.total_chunks {
            tracing::warn!(%file_id, index, total = file.offer.total_chunks, "chunk index out of range");
            return;
        }
        if !file.admits_chunks() {
            tracing::trace!(%file_id, index, "chunk for unaccepted file dropped");
            return;
        }

        let ack = Message::FileAck {
            file_id: file_id.clone(),
            index,
        };
        if let Err(e) = self.link.send(from, &ack).await {
            tracing::debug!(%file_id, index, error = %e, "ack send failed");
        }

        if data.is_empty() {
            tracing::warn!(%file_id, index, "empty chunk dropped");
            return;
        }
        if !file.record_chunk(index, data.len()) {
            tracing::trace!(%file_id, index, "duplicate chunk");
            return;
        }
        tracing::trace!(%file_id, index, len = data.len(), "chunk received");
        if let Err(e) = self.store.enqueue(file_id.clone(), index, data) {
            tracing::error!(%file_id, index, error = %e, "could not queue chunk for storage");
        }
    }

    /// The sender has sent everything; start the completion barrier
    pub fn handle_complete(&self, from: &PeerId, file_id: &FileId) {
        let Some(file) = self.offered_by(from, file_id, "completion") else {
            return;
        };

        let mut state = file.state.lock();
        match state.phase {
            ReceivePhase::Receiving if state.accepted || state.catching_up => {}
            ReceivePhase::Completing => {
                tracing::debug!(%file_id, "completion already in progress");
                return;
            }
            phase => {
                tracing::debug!(%file_id, %phase, "completion ignored");
                return;
            }
        }
        state.phase = ReceivePhase::Completing;
        let barrier = tokio::spawn(self.clone().await_barrier(Arc::clone(&file)));
        state.barrier = Some(barrier.abort_handle());
        tracing::debug!(%file_id, "completion barrier started");
    }

    /// Storage confirmation or failure
    pub fn handle_store_event(&self, event: StoreEvent) {
        match event {
            StoreEvent::Stored { file_id, index } => {
                if let Some(file) = self.registry.incoming(&file_id) {
                    file.confirm(index);
                }
            }
            StoreEvent::BatchFailed { chunks, error } => {
                tracing::warn!(chunks = chunks.len(), %error, "storage batch failed");
                let retry: Vec<ChunkWrite> = chunks
                    .into_iter()
                    .filter(|chunk| match self.registry.incoming(&chunk.file_id) {
                        Some(file) => {
                            let again = file.note_requeue(chunk.index);
                            if !again {
                                tracing::warn!(file_id = %chunk.file_id, index = chunk.index, "chunk out of storage retries");
                            }
                            again
                        }
                        None => false,
                    })
                    .collect();
                if retry.is_empty() {
                    return;
                }
                let store = Arc::clone(&self.store);
                let backoff = self.config.requeue_backoff;
                tokio::spawn(async move {
                    tokio::time::sleep(backoff).await;
                    if let Err(e) = store.requeue(retry) {
                        tracing::error!(error = %e, "could not re-queue chunks");
                    }
                });
            }
        }
    }

    /// A peer went away; its unfinished offers fail
    pub fn peer_disconnected(&self, peer: &PeerId) {
        for file in self.registry.incoming_from(peer) {
            if matches!(file.phase(), ReceivePhase::Offered | ReceivePhase::Receiving) {
                self.fail(&file, TransferError::transport("sender disconnected"));
            }
        }
    }

    /// Emit a progress sample for every receiving file
    pub fn sample_progress(&self, now: Instant) {
        for file in self.registry.incoming_files() {
            if let Some((percent, throughput)) = file.sample_progress(now) {
                self.events.emit(TransferEvent::Progress {
                    direction: Direction::Incoming,
                    file_id: file.file_id().clone(),
                    percent,
                    throughput,
                });
            }
        }
    }

    /// Abandon every incoming file
    pub fn shutdown(&self) {
        for file in self.registry.incoming_files() {
            self.fail(&file, TransferError::Cancelled);
        }
    }

    /// The file `from` offered us under `file_id`; anything else is dropped
    fn offered_by(&self, from: &PeerId, file_id: &FileId, kind: &str) -> Option<Arc<IncomingFile>> {
        let error = match self.registry.incoming(file_id) {
            Some(file) if file.sender() == from => return Some(file),
            Some(_) => TransferError::protocol("peer did not offer this file"),
            None => TransferError::protocol("file is unknown"),
        };
        tracing::warn!(%file_id, %from, kind, %error, "message dropped");
        None
    }

    async fn await_barrier(self, file: Arc<IncomingFile>) {
        let total = file.offer.total_chunks;
        let mut confirmed = file.confirmed_tx.subscribe();
        let reached = matches!(
            tokio::time::timeout(
                self.config.barrier_timeout,
                confirmed.wait_for(|count| *count >= total),
            )
            .await,
            Ok(Ok(_))
        );

        let missing = if reached {
            0
        } else {
            total.saturating_sub(file.confirmed_count())
        };

        if missing == 0 {
            self.deliver(&file, false).await;
        } else if missing <= self.config.missing_tolerance {
            tracing::warn!(file_id = %file.file_id(), missing, "barrier timed out, completing best-effort");
            self.deliver(&file, true).await;
        } else {
            self.fail(&file, TransferError::IncompleteFile { missing });
        }
    }

    /// Assemble from storage and hand the file out
    async fn deliver(&self, file: &IncomingFile, best_effort: bool) {
        let offer = &file.offer;
        let read = if best_effort {
            self.store
                .read_file_lossy(&offer.file_id, offer.byte_size, offer.total_chunks)
                .await
        } else {
            self.store
                .read_file(&offer.file_id, offer.byte_size, offer.total_chunks)
                .await
        };
        let assembled = match read {
            Ok(assembled) => assembled,
            Err(e) => {
                self.fail(file, e.into());
                return;
            }
        };

        if !file.terminate(ReceivePhase::Completed) {
            return;
        }
        self.registry.remove_incoming(&offer.file_id);

        if let Integrity::SizeMismatch { expected, actual } = assembled.integrity {
            self.events.emit(TransferEvent::IntegrityWarning {
                file_id: offer.file_id.clone(),
                error: TransferError::IntegrityMismatch { expected, actual },
            });
        }
        if !assembled.missing.is_empty() {
            self.events.emit(TransferEvent::IntegrityWarning {
                file_id: offer.file_id.clone(),
                error: TransferError::IncompleteFile {
                    missing: assembled.missing.len() as u64,
                },
            });
        }

        tracing::info!(
            file_id = %offer.file_id,
            from = %file.sender,
            size = assembled.data.len(),
            "file received"
        );
        let completed = CompletedFile {
            file_id: offer.file_id.clone(),
            name: offer.name.clone(),
            mime_type: offer.mime_type.clone(),
            byte_size: offer.byte_size,
            from: file.sender.clone(),
            data: assembled.data,
            missing_chunks: assembled.missing,
            integrity: assembled.integrity,
        };
        self.events.emit(TransferEvent::Completed {
            file_id: offer.file_id.clone(),
            completion: Completion::Received(Box::new(completed)),
        });
    }

    fn fail(&self, file: &IncomingFile, error: TransferError) {
        if !file.terminate(ReceivePhase::Failed) {
            return;
        }
        self.registry.remove_incoming(file.file_id());
        if error == TransferError::Cancelled {
            tracing::info!(file_id = %file.file_id(), "incoming file abandoned");
        } else if error.is_permanent() {
            tracing::error!(file_id = %file.file_id(), %error, "incoming file failed");
        } else {
            tracing::warn!(file_id = %file.file_id(), %error, "incoming file failed");
        }
        self.events.emit(TransferEvent::Failed {
            direction: Direction::Incoming,
            file_id: file.file_id().clone(),
            error,
        });
    }
}
