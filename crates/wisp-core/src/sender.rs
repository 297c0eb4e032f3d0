//! Sender transfer engine
//!
//! Streams an offered file to every peer that accepts it. Chunks are
//! dispatched in index order, each once the adaptive window has a free slot,
//! and each holds that slot until the first acknowledgment from any
//! acceptor. A timed-out attempt gives its slot back and waits for a new one
//! before retrying; once the attempt budget runs out the whole transfer
//! fails.
//!
//! # Phases
//!
//! ```text
//! offered ──first accept──▶ transferring ──all chunks acked──▶ completed
//!                               │                                 │
//!                               └──retries exhausted/cancel──▶ failed
//! ```
//!
//! A peer accepting while the file is `transferring` is sent a
//! `file-catchup` and a paced replay of every chunk sent so far; the normal
//! stream covers the rest. A peer accepting after `completed` gets a paced
//! resend of the whole file followed by its own `file-complete`.

use crate::config::TransferConfig;
use crate::error::{Result, TransferError};
use crate::events::{Completion, Direction, EventSink, TransferEvent};
use crate::link::Link;
use crate::progress::{RateSampler, percent};
use crate::protocol::{FileOffer, Message};
use crate::registry::TransferRegistry;
use crate::window::{SendWindow, WindowPermit, WindowSnapshot};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;
use tokio::task::{AbortHandle, JoinHandle, JoinSet};
use tokio::time::Instant;
use wisp_files::{ByteSource, FileChunker, FileId};
use wisp_transport::PeerId;

/// Reason sent to a peer that accepts a file this node no longer holds
pub const LATE_ACCEPT_REASON: &str =
    "File transfer already completed. Please ask sender to resend.";

/// A file the application wants to send
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    /// Display name
    pub name: String,
    /// MIME type
    pub mime_type: String,
    /// Content
    pub source: ByteSource,
}

impl OutgoingFile {
    /// File backed by memory
    pub fn from_bytes(
        name: impl Into<String>,
        mime_type: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            source: ByteSource::from_bytes(data),
        }
    }

    /// File read from disk on demand, named after its final path component
    ///
    /// # Errors
    /// Returns `TransferError::Storage` if the file cannot be opened.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        Ok(Self {
            name,
            mime_type: "application/octet-stream".to_string(),
            source: ByteSource::open(path).await?,
        })
    }

    /// Size in bytes
    pub fn size(&self) -> u64 {
        self.source.len()
    }
}

/// Sender-side phase of a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPhase {
    /// Offered, nobody accepted yet
    Offered,
    /// Windowed send loop running
    Transferring,
    /// Every chunk acknowledged; retained for late acceptors
    Completed,
    /// Aborted
    Failed,
}

impl fmt::Display for SendPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offered => write!(f, "Offered"),
            Self::Transferring => write!(f, "Transferring"),
            Self::Completed => write!(f, "Completed"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Point-in-time view of an outgoing transfer
#[derive(Debug, Clone)]
pub struct OutgoingStatus {
    /// Current phase
    pub phase: SendPhase,
    /// Chunks in the file
    pub total_chunks: u64,
    /// High-water mark of chunks transmitted at least once
    pub sent_chunks: u64,
    /// Chunks acknowledged by at least one acceptor
    pub ack_count: u64,
    /// Accepting peers in acceptance order
    pub acceptors: Vec<PeerId>,
    /// Window state
    pub window: WindowSnapshot,
}

struct PendingAck {
    tx: oneshot::Sender<()>,
    sent_at: Instant,
}

struct SendState {
    phase: SendPhase,
    acceptors: Vec<PeerId>,
    /// Catch-up replays, by acceptor
    replays: HashMap<PeerId, JoinHandle<()>>,
    /// Everything to abort on cancel
    tasks: Vec<AbortHandle>,
    rate: RateSampler,
}

enum Admission {
    Started,
    CatchingUp(u64),
    Resending,
    AlreadyAccepted,
    Closed,
}

/// Per-file sender state
pub struct OutgoingTransfer {
    offer: FileOffer,
    source: ByteSource,
    chunker: FileChunker,
    window: Arc<SendWindow>,
    config: TransferConfig,
    state: Mutex<SendState>,
    /// First-ack waiters, by chunk index
    pending: DashMap<u64, PendingAck>,
    sent_chunks: AtomicU64,
    ack_count: AtomicU64,
    acked_bytes: AtomicU64,
}

impl OutgoingTransfer {
    /// Create the record for a freshly offered file
    pub fn new(offer: FileOffer, source: ByteSource, config: &TransferConfig) -> Self {
        Self {
            chunker: FileChunker::with_chunk_size(offer.chunk_size),
            offer,
            source,
            window: Arc::new(SendWindow::new(config)),
            config: config.clone(),
            state: Mutex::new(SendState {
                phase: SendPhase::Offered,
                acceptors: Vec::new(),
                replays: HashMap::new(),
                tasks: Vec::new(),
                rate: RateSampler::new(Instant::now()),
            }),
            pending: DashMap::new(),
            sent_chunks: AtomicU64::new(0),
            ack_count: AtomicU64::new(0),
            acked_bytes: AtomicU64::new(0),
        }
    }

    /// File identifier
    pub fn file_id(&self) -> &FileId {
        &self.offer.file_id
    }

    /// The offer this transfer serves
    pub fn offer(&self) -> &FileOffer {
        &self.offer
    }

    /// Current phase
    pub fn phase(&self) -> SendPhase {
        self.state.lock().phase
    }

    /// Status snapshot
    pub fn status(&self) -> OutgoingStatus {
        let state = self.state.lock();
        OutgoingStatus {
            phase: state.phase,
            total_chunks: self.offer.total_chunks,
            sent_chunks: self.sent_chunks.load(Ordering::SeqCst),
            ack_count: self.ack_count.load(Ordering::SeqCst),
            acceptors: state.acceptors.clone(),
            window: self.window.snapshot(),
        }
    }

    async fn read_chunk(&self, index: u64) -> Result<(Bytes, bool)> {
        let size = self.offer.byte_size;
        let range = self
            .chunker
            .chunk_range(index, size)
            .ok_or(TransferError::invalid_state("chunk index past end of file"))?;
        let data = self
            .source
            .read_range(range.start, (range.end - range.start) as usize)
            .await?;
        Ok((data, self.chunker.is_last_chunk(index, size)))
    }

    async fn chunk_message(&self, index: u64) -> Result<Message> {
        let (data, is_last_chunk) = self.read_chunk(index).await?;
        Ok(Message::FileChunk {
            file_id: self.offer.file_id.clone(),
            index,
            data,
            is_last_chunk,
        })
    }

    /// Recipients for a transmission of `index`, recorded as sent.
    ///
    /// Acceptance appends under the same lock and reads `sent_chunks` there,
    /// so a chunk is either replayed to a new acceptor or addressed to it.
    fn begin_transmit(&self, index: u64) -> Vec<PeerId> {
        let state = self.state.lock();
        self.sent_chunks.fetch_max(index + 1, Ordering::SeqCst);
        state.acceptors.clone()
    }

    fn is_acceptor(&self, peer: &PeerId) -> bool {
        self.state.lock().acceptors.contains(peer)
    }

    /// Resolve the first-ack waiter of `index`, if still pending
    fn record_ack(&self, index: u64) -> Option<WindowSnapshot> {
        let (_, pending) = self.pending.remove(&index)?;
        let snapshot = self.window.on_ack(pending.sent_at.elapsed());
        self.ack_count.fetch_add(1, Ordering::SeqCst);
        let len = self
            .chunker
            .chunk_range(index, self.offer.byte_size)
            .map_or(0, |r| r.end - r.start);
        self.acked_bytes.fetch_add(len, Ordering::SeqCst);
        let _ = pending.tx.send(());
        Some(snapshot)
    }

    fn sample_progress(&self, now: Instant) -> Option<(f64, f64)> {
        let mut state = self.state.lock();
        if state.phase != SendPhase::Transferring {
            return None;
        }
        let throughput = state
            .rate
            .sample(self.acked_bytes.load(Ordering::SeqCst), now);
        let done = percent(
            self.ack_count.load(Ordering::SeqCst),
            self.offer.total_chunks,
        );
        Some((done, throughput))
    }
}

/// Drives outgoing transfers
#[derive(Clone)]
pub struct SenderEngine {
    link: Link,
    registry: Arc<TransferRegistry>,
    events: EventSink,
    config: TransferConfig,
}

impl SenderEngine {
    /// Create an engine
    pub fn new(
        link: Link,
        registry: Arc<TransferRegistry>,
        events: EventSink,
        config: TransferConfig,
    ) -> Self {
        Self {
            link,
            registry,
            events,
            config,
        }
    }

    /// Offer files to every connected peer, smallest first.
    ///
    /// # Errors
    /// Returns `TransferError::Serialization` or `TransferError::Transport`
    /// if an offer cannot be broadcast; files offered before the failure stay
    /// registered.
    pub async fn offer_files(&self, mut files: Vec<OutgoingFile>) -> Result<Vec<FileOffer>> {
        files.sort_by_key(OutgoingFile::size);

        let mut offers = Vec::with_capacity(files.len());
        for file in files {
            let offer = FileOffer::new(
                FileId::generate(),
                file.name,
                file.source.len(),
                file.mime_type,
            );
            let transfer = Arc::new(OutgoingTransfer::new(
                offer.clone(),
                file.source,
                &self.config,
            ));
            if !self.registry.register_outgoing(transfer) {
                return Err(TransferError::invalid_state("file id already in use"));
            }

            let peers = self.link.broadcast(&offer.to_message()).await?;
            tracing::info!(
                file_id = %offer.file_id,
                name = %offer.name,
                size = offer.byte_size,
                total_chunks = offer.total_chunks,
                peers,
                "file offered"
            );
            self.events.emit(TransferEvent::Offered {
                direction: Direction::Outgoing,
                offer: offer.clone(),
                from: None,
            });
            offers.push(offer);
        }
        Ok(offers)
    }

    /// A peer accepted one of our files
    pub async fn handle_accept(&self, peer: PeerId, file_id: FileId) {
        let Some(transfer) = self.registry.outgoing(&file_id) else {
            tracing::info!(%file_id, %peer, "acceptance for a file no longer held");
            self.refuse(&peer, file_id).await;
            return;
        };

        match self.admit(&transfer, &peer) {
            Admission::Started => {
                tracing::info!(%file_id, %peer, "first acceptor, transfer started");
            }
            Admission::CatchingUp(chunks) => {
                tracing::info!(%file_id, %peer, chunks, "late acceptor catching up");
            }
            Admission::Resending => {
                tracing::info!(%file_id, %peer, "acceptor after completion, resending file");
            }
            Admission::AlreadyAccepted => {
                tracing::debug!(%file_id, %peer, "duplicate acceptance ignored");
                return;
            }
            Admission::Closed => {
                self.refuse(&peer, file_id).await;
                return;
            }
        }
        self.events.emit(TransferEvent::Accepted { file_id, peer });
    }

    /// A peer declined one of our files; the transfer carries on
    pub fn handle_reject(&self, peer: PeerId, file_id: FileId, reason: Option<String>) {
        tracing::info!(%file_id, %peer, reason = reason.as_deref().unwrap_or(""), "file rejected by peer");
        self.events.emit(TransferEvent::Rejected {
            direction: Direction::Outgoing,
            file_id,
            peer,
            reason,
        });
    }

    /// A peer acknowledged a chunk
    pub fn handle_ack(&self, peer: &PeerId, file_id: &FileId, index: u64) {
        let Some(transfer) = self.registry.outgoing(file_id) else {
            tracing::trace!(%file_id, %peer, index, "ack for unknown transfer");
            return;
        };
        if !transfer.is_acceptor(peer) {
            let error = TransferError::protocol("ack from a peer that never accepted");
            tracing::warn!(%file_id, %peer, index, %error, "ack dropped");
            return;
        }
        match transfer.record_ack(index) {
            Some(window) => tracing::trace!(
                %file_id,
                %peer,
                index,
                pipeline_size = window.pipeline_size,
                avg_rtt_ms = window.avg_rtt.as_millis() as u64,
                "chunk acknowledged"
            ),
            None => tracing::trace!(%file_id, %peer, index, "redundant ack"),
        }
    }

    /// Abort an outgoing transfer at the user's request
    ///
    /// # Errors
    /// Returns `TransferError::FileNotFound` if no such transfer is held.
    pub fn cancel(&self, file_id: &FileId) -> Result<()> {
        let transfer = self
            .registry
            .outgoing(file_id)
            .ok_or_else(|| TransferError::FileNotFound(file_id.clone()))?;
        self.fail(&transfer, TransferError::Cancelled);
        Ok(())
    }

    /// Abort every outgoing transfer
    pub fn shutdown(&self) {
        for transfer in self.registry.outgoing_transfers() {
            self.fail(&transfer, TransferError::Cancelled);
        }
    }

    /// Emit a progress sample for every transferring file
    pub fn sample_progress(&self, now: Instant) {
        for transfer in self.registry.outgoing_transfers() {
            if let Some((percent, throughput)) = transfer.sample_progress(now) {
                self.events.emit(TransferEvent::Progress {
                    direction: Direction::Outgoing,
                    file_id: transfer.file_id().clone(),
                    percent,
                    throughput,
                });
            }
        }
    }

    async fn refuse(&self, peer: &PeerId, file_id: FileId) {
        let reply = Message::FileRejected {
            file_id,
            reason: Some(LATE_ACCEPT_REASON.to_string()),
        };
        if let Err(e) = self.link.send(peer, &reply).await {
            tracing::debug!(%peer, error = %e, "could not refuse late acceptance");
        }
    }

    /// Record an acceptance and start whatever it requires
    fn admit(&self, transfer: &Arc<OutgoingTransfer>, peer: &PeerId) -> Admission {
        let mut state = transfer.state.lock();
        match state.phase {
            SendPhase::Offered => {
                state.phase = SendPhase::Transferring;
                state.acceptors.push(peer.clone());
                let run = tokio::spawn(self.clone().run(Arc::clone(transfer)));
                state.tasks.push(run.abort_handle());
                Admission::Started
            }
            SendPhase::Transferring => {
                if state.acceptors.contains(peer) {
                    return Admission::AlreadyAccepted;
                }
                state.acceptors.push(peer.clone());
                let sent = transfer.sent_chunks.load(Ordering::SeqCst);
                let replay = tokio::spawn(self.clone().catch_up(
                    Arc::clone(transfer),
                    peer.clone(),
                    sent,
                ));
                state.tasks.push(replay.abort_handle());
                state.replays.insert(peer.clone(), replay);
                Admission::CatchingUp(sent)
            }
            SendPhase::Completed => {
                if !state.acceptors.contains(peer) {
                    state.acceptors.push(peer.clone());
                }
                let resend = tokio::spawn(self.clone().full_resend(Arc::clone(transfer), peer.clone()));
                state.tasks.push(resend.abort_handle());
                Admission::Resending
            }
            SendPhase::Failed => Admission::Closed,
        }
    }

    /// Windowed send loop
    async fn run(self, transfer: Arc<OutgoingTransfer>) {
        let total = transfer.offer.total_chunks;
        tracing::debug!(file_id = %transfer.file_id(), total_chunks = total, "send loop started");

        let mut chunks = JoinSet::new();
        let mut next = 0;
        loop {
            tokio::select! {
                permit = transfer.window.acquire(), if next < total => {
                    chunks.spawn(send_chunk(self.link.clone(), Arc::clone(&transfer), next, permit));
                    next += 1;
                }
                Some(joined) = chunks.join_next() => {
                    let error = match joined {
                        Ok(Ok(())) => continue,
                        Err(e) if e.is_cancelled() => continue,
                        Ok(Err(e)) => e,
                        Err(e) => TransferError::InvalidState(Cow::Owned(format!(
                            "chunk task panicked: {e}"
                        ))),
                    };
                    chunks.abort_all();
                    self.fail(&transfer, error);
                    return;
                }
                else => break,
            }
        }

        self.finish(&transfer).await;
    }

    /// Mark completed and send `file-complete` to every acceptor
    async fn finish(&self, transfer: &Arc<OutgoingTransfer>) {
        let (acceptors, mut replays) = {
            let mut state = transfer.state.lock();
            if state.phase != SendPhase::Transferring {
                return;
            }
            state.phase = SendPhase::Completed;
            (state.acceptors.clone(), std::mem::take(&mut state.replays))
        };

        let file_id = transfer.file_id().clone();
        let complete = Message::FileComplete {
            file_id: file_id.clone(),
        };
        for peer in acceptors {
            match replays.remove(&peer) {
                Some(replay) if !replay.is_finished() => {
                    // Completion must not overtake the replay
                    let link = self.link.clone();
                    let complete = complete.clone();
                    let deferred = tokio::spawn(async move {
                        let _ = replay.await;
                        if let Err(e) = link.send(&peer, &complete).await {
                            tracing::warn!(%peer, error = %e, "could not send completion");
                        }
                    });
                    transfer.state.lock().tasks.push(deferred.abort_handle());
                }
                _ => {
                    if let Err(e) = self.link.send(&peer, &complete).await {
                        tracing::warn!(%file_id, %peer, error = %e, "could not send completion");
                    }
                }
            }
        }

        tracing::info!(
            %file_id,
            acked = transfer.ack_count.load(Ordering::SeqCst),
            "transfer completed"
        );
        self.events.emit(TransferEvent::Completed {
            file_id,
            completion: Completion::Sent,
        });
        self.schedule_eviction(transfer);
    }

    fn schedule_eviction(&self, transfer: &Arc<OutgoingTransfer>) {
        let registry = Arc::clone(&self.registry);
        let file_id = transfer.file_id().clone();
        let retention = self.config.retention;
        let eviction = tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            if registry.remove_outgoing(&file_id).is_some() {
                tracing::info!(%file_id, "retention expired, source released");
            }
        });
        transfer.state.lock().tasks.push(eviction.abort_handle());
    }

    /// Tell a mid-transfer acceptor what it missed and replay it
    async fn catch_up(self, transfer: Arc<OutgoingTransfer>, peer: PeerId, sent: u64) {
        let notice = Message::FileCatchup {
            file_id: transfer.file_id().clone(),
            chunks_to_expect: sent,
        };
        if let Err(e) = self.link.send(&peer, &notice).await {
            tracing::warn!(file_id = %transfer.file_id(), %peer, error = %e, "catch-up notice failed");
            return;
        }
        self.replay(&transfer, &peer, sent).await;
        tracing::debug!(file_id = %transfer.file_id(), %peer, chunks = sent, "catch-up replay finished");
    }

    /// Resend the whole file to one peer after completion
    async fn full_resend(self, transfer: Arc<OutgoingTransfer>, peer: PeerId) {
        if !self
            .replay(&transfer, &peer, transfer.offer.total_chunks)
            .await
        {
            return;
        }
        let complete = Message::FileComplete {
            file_id: transfer.file_id().clone(),
        };
        if let Err(e) = self.link.send(&peer, &complete).await {
            tracing::warn!(file_id = %transfer.file_id(), %peer, error = %e, "could not send completion");
            return;
        }
        tracing::info!(file_id = %transfer.file_id(), %peer, "full resend finished");
    }

    /// Paced, unwindowed send of chunks `0..count` to one peer. Returns
    /// false if the peer became unreachable.
    async fn replay(&self, transfer: &OutgoingTransfer, peer: &PeerId, count: u64) -> bool {
        let batch = self.config.replay_batch_size.max(1) as u64;
        for index in 0..count {
            match transfer.chunk_message(index).await {
                Ok(message) => {
                    if let Err(e) = self.link.send(peer, &message).await {
                        tracing::warn!(file_id = %transfer.file_id(), %peer, index, error = %e, "replay aborted");
                        return false;
                    }
                }
                Err(e) => {
                    tracing::warn!(file_id = %transfer.file_id(), index, error = %e, "could not read chunk for replay");
                }
            }
            if (index + 1) % batch == 0 && index + 1 < count {
                tokio::time::sleep(self.config.replay_pause).await;
            }
        }
        true
    }

    /// Terminate a transfer: abort its tasks, release its waiters, evict it
    /// and report the failure once.
    fn fail(&self, transfer: &OutgoingTransfer, error: TransferError) {
        let (was_active, tasks) = {
            let mut state = transfer.state.lock();
            let was_active = matches!(state.phase, SendPhase::Offered | SendPhase::Transferring);
            if was_active {
                state.phase = SendPhase::Failed;
            }
            state.replays.clear();
            (was_active, std::mem::take(&mut state.tasks))
        };

        for task in tasks {
            task.abort();
        }
        transfer.pending.clear();
        self.registry.remove_outgoing(transfer.file_id());

        if was_active {
            if error == TransferError::Cancelled {
                tracing::info!(file_id = %transfer.file_id(), "transfer cancelled");
            } else if error.is_transient() {
                tracing::warn!(file_id = %transfer.file_id(), %error, "transfer failed");
            } else {
                tracing::error!(file_id = %transfer.file_id(), %error, "transfer failed");
            }
            self.events.emit(TransferEvent::Failed {
                direction: Direction::Outgoing,
                file_id: transfer.file_id().clone(),
                error,
            });
        }
    }
}

/// Send one chunk until some acceptor acknowledges it.
///
/// The first attempt runs under the slot taken by the dispatcher; every
/// retry waits for a fresh one.
async fn send_chunk(
    link: Link,
    transfer: Arc<OutgoingTransfer>,
    index: u64,
    first_slot: WindowPermit,
) -> Result<()> {
    let payload = transfer.chunk_message(index).await?.encode()?;
    let attempts = transfer.config.max_attempts;
    let mut first_slot = Some(first_slot);

    for attempt in 1..=attempts {
        let _slot = match first_slot.take() {
            Some(slot) => slot,
            None => transfer.window.acquire().await,
        };

        let (tx, rx) = oneshot::channel();
        transfer.pending.insert(
            index,
            PendingAck {
                tx,
                sent_at: Instant::now(),
            },
        );

        let recipients = transfer.begin_transmit(index);
        for peer in &recipients {
            if let Err(e) = link.send_encoded(peer, payload.clone()).await {
                tracing::debug!(file_id = %transfer.file_id(), %peer, index, error = %e, "chunk send failed");
            }
        }
        tracing::trace!(
            file_id = %transfer.file_id(),
            index,
            attempt,
            recipients = recipients.len(),
            "chunk sent"
        );

        match tokio::time::timeout(transfer.config.ack_timeout, rx).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(_)) => return Err(TransferError::Cancelled),
            Err(_) => {
                if transfer.pending.remove(&index).is_none() {
                    // Ack landed as the timer fired
                    return Ok(());
                }
                let window = transfer.window.on_timeout();
                let error = TransferError::timeout("chunk acknowledgment");
                tracing::warn!(
                    file_id = %transfer.file_id(),
                    index,
                    attempt,
                    pipeline_size = window.pipeline_size,
                    %error,
                    "chunk ack timed out"
                );
            }
        }
    }

    Err(TransferError::RetriesExhausted { index, attempts })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use wisp_transport::{InboundEvent, PeerEvent, SimEndpoint, SimNetwork};

    struct Harness {
        engine: SenderEngine,
        registry: Arc<TransferRegistry>,
        events: mpsc::UnboundedReceiver<TransferEvent>,
        peer: SimEndpoint,
        peer_rx: mpsc::UnboundedReceiver<InboundEvent>,
        sim: SimNetwork,
    }

    fn harness(config: TransferConfig) -> Harness {
        let sim = SimNetwork::new();
        let (sender, sender_rx) = sim.join("sender");
        let (peer, peer_rx) = sim.join("peer");
        let registry = Arc::new(TransferRegistry::new());
        let (sink, events) = EventSink::channel();
        let engine = SenderEngine::new(
            Link::new(Arc::new(sender)),
            Arc::clone(&registry),
            sink,
            config,
        );
        tokio::spawn(drive(engine.clone(), sender_rx));
        Harness {
            engine,
            registry,
            events,
            peer,
            peer_rx,
            sim,
        }
    }

    /// Route the sender's inbound messages to the engine
    async fn drive(engine: SenderEngine, mut inbox: mpsc::UnboundedReceiver<InboundEvent>) {
        while let Some(event) = inbox.recv().await {
            let PeerEvent::Datagram(bytes) = event.event else {
                continue;
            };
            match Message::decode(&bytes) {
                Ok(Message::FileAccepted { file_id }) => engine.handle_accept(event.from, file_id).await,
                Ok(Message::FileAck { file_id, index }) => engine.handle_ack(&event.from, &file_id, index),
                Ok(Message::FileRejected { file_id, reason }) => {
                    engine.handle_reject(event.from, file_id, reason)
                }
                _ => {}
            }
        }
    }

    async fn next_message(rx: &mut mpsc::UnboundedReceiver<InboundEvent>) -> Message {
        loop {
            let event = rx.recv().await.expect("inbox open");
            if let PeerEvent::Datagram(bytes) = event.event {
                return Message::decode(&bytes).unwrap();
            }
        }
    }

    async fn send(peer: &SimEndpoint, message: Message) {
        use wisp_transport::MessageTransport;
        peer.send_to_peer(&PeerId::new("sender"), message.encode().unwrap())
            .await
            .unwrap();
    }

    fn file(name: &str, size: usize) -> OutgoingFile {
        let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        OutgoingFile::from_bytes(name, "application/octet-stream", data)
    }

    #[tokio::test]
    async fn test_offers_smallest_first() {
        let mut h = harness(TransferConfig::default());
        let offers = h
            .engine
            .offer_files(vec![file("big", 3000), file("small", 10), file("mid", 500)])
            .await
            .unwrap();

        let names: Vec<&str> = offers.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["small", "mid", "big"]);

        for expected in ["small", "mid", "big"] {
            match next_message(&mut h.peer_rx).await {
                Message::FileOffer { name, .. } => assert_eq!(name, expected),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(h.registry.outgoing_count(), 3);
        for offer in &offers {
            assert_eq!(
                h.registry.outgoing(&offer.file_id).unwrap().phase(),
                SendPhase::Offered
            );
        }
    }

    #[tokio::test]
    async fn test_single_acceptor_completes() {
        let mut h = harness(TransferConfig::default());
        let offers = h
            .engine
            .offer_files(vec![file("a.bin", 700_000)])
            .await
            .unwrap();
        let file_id = offers[0].file_id.clone();
        let _ = next_message(&mut h.peer_rx).await;

        send(&h.peer, Message::FileAccepted { file_id: file_id.clone() }).await;

        let mut seen = std::collections::BTreeSet::new();
        loop {
            match next_message(&mut h.peer_rx).await {
                Message::FileChunk { index, .. } => {
                    seen.insert(index);
                    send(&h.peer, Message::FileAck { file_id: file_id.clone(), index }).await;
                }
                Message::FileComplete { .. } => break,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(seen.into_iter().collect::<Vec<_>>(), vec![0, 1, 2]);

        let status = h.registry.outgoing(&file_id).unwrap().status();
        assert_eq!(status.phase, SendPhase::Completed);
        assert_eq!(status.ack_count, 3);
        assert_eq!(status.sent_chunks, 3);

        let mut completed = false;
        while let Ok(event) = h.events.try_recv() {
            if matches!(event, TransferEvent::Completed { completion: Completion::Sent, .. }) {
                completed = true;
            }
        }
        assert!(completed);
    }

    #[tokio::test]
    async fn test_unknown_file_acceptance_refused() {
        let mut h = harness(TransferConfig::default());
        send(&h.peer, Message::FileAccepted { file_id: FileId::new("file_gone") }).await;

        match next_message(&mut h.peer_rx).await {
            Message::FileRejected { file_id, reason } => {
                assert_eq!(file_id.as_str(), "file_gone");
                assert_eq!(reason.as_deref(), Some(LATE_ACCEPT_REASON));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_fails_once() {
        let mut h = harness(TransferConfig::default());
        let offers = h.engine.offer_files(vec![file("one", 100)]).await.unwrap();
        let file_id = offers[0].file_id.clone();
        let _ = next_message(&mut h.peer_rx).await;

        send(&h.peer, Message::FileAccepted { file_id: file_id.clone() }).await;

        let failure = loop {
            match h.events.recv().await.unwrap() {
                TransferEvent::Failed { error, .. } => break error,
                _ => continue,
            }
        };
        assert_eq!(
            failure,
            TransferError::RetriesExhausted {
                index: 0,
                attempts: 10
            }
        );
        assert!(h.registry.outgoing(&file_id).is_none());

        let mut transmissions = 0;
        while let Ok(event) = h.peer_rx.try_recv() {
            if let PeerEvent::Datagram(bytes) = event.event {
                if matches!(Message::decode(&bytes), Ok(Message::FileChunk { .. })) {
                    transmissions += 1;
                }
            }
        }
        assert_eq!(transmissions, 10);

        tokio::time::sleep(Duration::from_secs(60)).await;
        while let Ok(event) = h.events.try_recv() {
            assert!(!matches!(event, TransferEvent::Failed { .. }));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_wait_for_shrunken_window() {
        let mut h = harness(TransferConfig::default());
        let offers = h
            .engine
            .offer_files(vec![file("wide", 40 * wisp_files::CHUNK_SIZE)])
            .await
            .unwrap();
        let file_id = offers[0].file_id.clone();

        // Nothing is ever acknowledged: all 32 first attempts time out at 5s
        send(&h.peer, Message::FileAccepted { file_id: file_id.clone() }).await;
        tokio::time::sleep(Duration::from_millis(5500)).await;

        let window = h.registry.outgoing(&file_id).unwrap().status().window;
        assert_eq!(window.pipeline_size, 4);
        assert!(
            window.in_flight <= window.pipeline_size,
            "in flight {} exceeds window {}",
            window.in_flight,
            window.pipeline_size
        );

        let mut transmissions = 0;
        while let Ok(event) = h.peer_rx.try_recv() {
            if let PeerEvent::Datagram(bytes) = event.event {
                if matches!(Message::decode(&bytes), Ok(Message::FileChunk { .. })) {
                    transmissions += 1;
                }
            }
        }
        assert_eq!(transmissions, 32 + 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_from_non_acceptor_ignored() {
        let mut h = harness(TransferConfig::default());
        let (stranger, _stranger_rx) = h.sim.join("stranger");
        let offers = h.engine.offer_files(vec![file("one", 100)]).await.unwrap();
        let file_id = offers[0].file_id.clone();

        send(&h.peer, Message::FileAccepted { file_id: file_id.clone() }).await;
        loop {
            if let Message::FileChunk { .. } = next_message(&mut h.peer_rx).await {
                break;
            }
        }

        send(&stranger, Message::FileAck { file_id: file_id.clone(), index: 0 }).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let status = h.registry.outgoing(&file_id).unwrap().status();
        assert_eq!(status.ack_count, 0);
        assert_eq!(status.phase, SendPhase::Transferring);

        send(&h.peer, Message::FileAck { file_id: file_id.clone(), index: 0 }).await;
        loop {
            if let Message::FileComplete { .. } = next_message(&mut h.peer_rx).await {
                break;
            }
        }
        assert_eq!(h.registry.outgoing(&file_id).unwrap().status().ack_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_shrinks_window() {
        let h = harness(TransferConfig::default());
        let offers = h.engine.offer_files(vec![file("one", 100)]).await.unwrap();
        let file_id = offers[0].file_id.clone();

        send(&h.peer, Message::FileAccepted { file_id: file_id.clone() }).await;
        tokio::time::sleep(Duration::from_millis(5500)).await;

        let status = h.registry.outgoing(&file_id).unwrap().status();
        assert_eq!(status.phase, SendPhase::Transferring);
        assert_eq!(status.window.pipeline_size, 16);
        assert_eq!(status.window.avg_rtt, Duration::from_millis(9999));
    }

    #[tokio::test]
    async fn test_cancel_reports_once() {
        let mut h = harness(TransferConfig::default());
        let offers = h.engine.offer_files(vec![file("c", 1000)]).await.unwrap();
        let file_id = offers[0].file_id.clone();

        h.engine.cancel(&file_id).unwrap();
        assert!(h.registry.outgoing(&file_id).is_none());
        assert!(matches!(
            h.engine.cancel(&file_id),
            Err(TransferError::FileNotFound(_))
        ));

        let mut failures = 0;
        while let Ok(event) = h.events.try_recv() {
            if let TransferEvent::Failed { error, .. } = event {
                assert_eq!(error, TransferError::Cancelled);
                failures += 1;
            }
        }
        assert_eq!(failures, 1);
    }

    #[tokio::test]
    async fn test_rejection_keeps_offer() {
        let mut h = harness(TransferConfig::default());
        let offers = h.engine.offer_files(vec![file("r", 10)]).await.unwrap();
        let file_id = offers[0].file_id.clone();

        send(
            &h.peer,
            Message::FileRejected {
                file_id: file_id.clone(),
                reason: Some("no thanks".into()),
            },
        )
        .await;

        loop {
            if let TransferEvent::Rejected { peer, reason, .. } = h.events.recv().await.unwrap() {
                assert_eq!(peer, PeerId::new("peer"));
                assert_eq!(reason.as_deref(), Some("no thanks"));
                break;
            }
        }
        assert_eq!(
            h.registry.outgoing(&file_id).unwrap().phase(),
            SendPhase::Offered
        );
    }

    #[tokio::test]
    async fn test_acceptor_after_completion_gets_full_resend() {
        let mut h = harness(TransferConfig::default());
        let (late, mut late_rx) = h.sim.join("late");
        let offers = h.engine.offer_files(vec![file("x", 600_000)]).await.unwrap();
        let file_id = offers[0].file_id.clone();

        send(&h.peer, Message::FileAccepted { file_id: file_id.clone() }).await;
        loop {
            match next_message(&mut h.peer_rx).await {
                Message::FileChunk { index, .. } => {
                    send(&h.peer, Message::FileAck { file_id: file_id.clone(), index }).await
                }
                Message::FileComplete { .. } => break,
                _ => {}
            }
        }

        send(&late, Message::FileAccepted { file_id: file_id.clone() }).await;
        let mut indices = Vec::new();
        loop {
            match next_message(&mut late_rx).await {
                Message::FileChunk { index, .. } => indices.push(index),
                Message::FileComplete { .. } => break,
                Message::FileOffer { .. } => {}
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(
            h.registry.outgoing(&file_id).unwrap().status().acceptors,
            vec![PeerId::new("peer"), PeerId::new("late")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_after_retention() {
        let mut h = harness(TransferConfig::default());
        let offers = h.engine.offer_files(vec![file("e", 10)]).await.unwrap();
        let file_id = offers[0].file_id.clone();

        send(&h.peer, Message::FileAccepted { file_id: file_id.clone() }).await;
        loop {
            match next_message(&mut h.peer_rx).await {
                Message::FileChunk { index, .. } => {
                    send(&h.peer, Message::FileAck { file_id: file_id.clone(), index }).await
                }
                Message::FileComplete { .. } => break,
                _ => {}
            }
        }

        tokio::time::sleep(Duration::from_secs(119)).await;
        assert!(h.registry.outgoing(&file_id).is_some());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(h.registry.outgoing(&file_id).is_none());
    }
}
