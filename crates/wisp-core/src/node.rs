//! Node implementation - transfer orchestrator
//!
//! A [`Node`] owns one transport endpoint, the chunk store, the sender engine
//! and the receiver manager. Once started it runs three loops: the inbound
//! dispatcher, the storage event pump and the progress sampler.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use wisp_core::{Node, NodeConfig, OutgoingFile};
//! use wisp_files::MemoryBackend;
//! use wisp_transport::SimNetwork;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let net = SimNetwork::new();
//!     let (endpoint, inbox) = net.join("alice");
//!     let (node, mut events) = Node::new(
//!         NodeConfig::default(),
//!         Arc::new(endpoint),
//!         inbox,
//!         Arc::new(MemoryBackend::new()),
//!     )?;
//!     node.start()?;
//!
//!     node.offer_files(vec![OutgoingFile::from_bytes("a.txt", "text/plain", "hi")])
//!         .await?;
//!     while let Some(event) = events.recv().await {
//!         println!("{event:?}");
//!     }
//!     Ok(())
//! }
//! ```

use crate::config::NodeConfig;
use crate::error::{Result, TransferError};
use crate::events::{EventSink, TransferEvent};
use crate::link::Link;
use crate::protocol::{FileOffer, Message};
use crate::receiver::{IncomingStatus, ReceiverManager};
use crate::registry::{Role, TransferRegistry};
use crate::sender::{OutgoingFile, OutgoingStatus, SenderEngine};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use wisp_files::{ChunkBackend, ChunkStore, FileId, StoreEvent, StoreOptions};
use wisp_transport::{InboundEvent, MessageTransport, PeerEvent, PeerId};

/// Node inner state
struct NodeInner {
    /// Node configuration
    config: NodeConfig,
    /// Message view of the transport
    link: Link,
    /// File records
    registry: Arc<TransferRegistry>,
    /// Outgoing side
    sender: SenderEngine,
    /// Incoming side
    receiver: ReceiverManager,
    /// Durable chunk storage
    store: Arc<ChunkStore>,
    /// Node running state
    running: AtomicBool,
    /// Transport inbox, taken on start
    inbox: Mutex<Option<mpsc::UnboundedReceiver<InboundEvent>>>,
    /// Storage events, taken on start
    store_events: Mutex<Option<mpsc::UnboundedReceiver<StoreEvent>>>,
    /// Background loops
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Transfer node
///
/// Cloning yields another handle to the same node.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Constructors
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    /// Build a node on `transport`, reading inbound traffic from `inbox` and
    /// persisting received chunks to `backend`.
    ///
    /// Returns the node and its event stream.
    ///
    /// # Errors
    /// Returns `TransferError::InvalidConfig` if `config` does not validate.
    pub fn new(
        config: NodeConfig,
        transport: Arc<dyn MessageTransport>,
        inbox: mpsc::UnboundedReceiver<InboundEvent>,
        backend: Arc<dyn ChunkBackend>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransferEvent>)> {
        config.validate()?;

        let link = Link::new(transport);
        let registry = Arc::new(TransferRegistry::new());
        let (events, event_rx) = EventSink::channel();
        let (store, store_events) = ChunkStore::spawn(backend, StoreOptions::from(&config.store));
        let store = Arc::new(store);

        let sender = SenderEngine::new(
            link.clone(),
            Arc::clone(&registry),
            events.clone(),
            config.transfer.clone(),
        );
        let receiver = ReceiverManager::new(
            link.clone(),
            Arc::clone(&registry),
            Arc::clone(&store),
            events,
            config.receiver.clone(),
        );

        tracing::debug!(peer = %link.local_peer(), "node created");

        let node = Self {
            inner: Arc::new(NodeInner {
                config,
                link,
                registry,
                sender,
                receiver,
                store,
                running: AtomicBool::new(false),
                inbox: Mutex::new(Some(inbox)),
                store_events: Mutex::new(Some(store_events)),
                tasks: Mutex::new(Vec::new()),
            }),
        };
        Ok((node, event_rx))
    }

    /// This node's identity
    pub fn local_peer(&self) -> &PeerId {
        self.inner.link.local_peer()
    }

    /// Node configuration
    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    /// File records
    pub fn registry(&self) -> &Arc<TransferRegistry> {
        &self.inner.registry
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Lifecycle Methods
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    /// Start the background loops
    ///
    /// # Errors
    /// Returns `TransferError::InvalidState` if the node was started before.
    pub fn start(&self) -> Result<()> {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(TransferError::invalid_state("node already running"));
        }

        let (Some(inbox), Some(store_events)) = (
            self.inner.inbox.lock().take(),
            self.inner.store_events.lock().take(),
        ) else {
            self.inner.running.store(false, Ordering::SeqCst);
            return Err(TransferError::invalid_state("node cannot be restarted"));
        };

        let mut tasks = self.inner.tasks.lock();
        tasks.push(tokio::spawn(self.clone().inbound_loop(inbox)));
        tasks.push(tokio::spawn(self.clone().store_event_loop(store_events)));
        tasks.push(tokio::spawn(self.clone().progress_loop()));

        tracing::info!(peer = %self.local_peer(), "node started");
        Ok(())
    }

    /// Cancel every transfer and stop the background loops
    ///
    /// # Errors
    /// Returns `TransferError::InvalidState` if the node is not running.
    pub fn shutdown(&self) -> Result<()> {
        if self
            .inner
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(TransferError::invalid_state("node not running"));
        }

        self.inner.sender.shutdown();
        self.inner.receiver.shutdown();
        self.inner.store.shutdown();
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }

        tracing::info!(peer = %self.local_peer(), "node stopped");
        Ok(())
    }

    /// Check if node is running
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Transfer Operations
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    /// Offer files to every connected peer, smallest first
    ///
    /// # Errors
    /// Returns `TransferError::Transport` if an offer cannot be broadcast.
    pub async fn offer_files(&self, files: Vec<OutgoingFile>) -> Result<Vec<FileOffer>> {
        self.inner.sender.offer_files(files).await
    }

    /// Accept a file offered to us
    ///
    /// # Errors
    /// Returns `TransferError::FileNotFound` for unknown files.
    pub async fn accept(&self, file_id: &FileId) -> Result<()> {
        self.inner.receiver.accept(file_id).await
    }

    /// Decline a file offered to us
    ///
    /// # Errors
    /// Returns `TransferError::FileNotFound` for unknown files.
    pub async fn reject(&self, file_id: &FileId, reason: Option<String>) -> Result<()> {
        self.inner.receiver.reject(file_id, reason).await
    }

    /// Abort one of our outgoing transfers
    ///
    /// # Errors
    /// Returns `TransferError::FileNotFound` if no such transfer is held.
    pub fn cancel(&self, file_id: &FileId) -> Result<()> {
        self.inner.sender.cancel(file_id)
    }

    /// Status of an outgoing transfer
    pub fn outgoing_status(&self, file_id: &FileId) -> Option<OutgoingStatus> {
        self.inner.registry.outgoing(file_id).map(|t| t.status())
    }

    /// Status of an incoming file
    pub fn incoming_status(&self, file_id: &FileId) -> Option<IncomingStatus> {
        self.inner.registry.incoming(file_id).map(|f| f.status())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Dispatch
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    async fn inbound_loop(self, mut inbox: mpsc::UnboundedReceiver<InboundEvent>) {
        while let Some(InboundEvent { from, event }) = inbox.recv().await {
            match event {
                PeerEvent::Datagram(payload) => self.handle_datagram(from, payload).await,
                PeerEvent::Connected => tracing::debug!(%from, "peer connected"),
                PeerEvent::Disconnected => {
                    tracing::info!(%from, "peer disconnected");
                    self.inner.receiver.peer_disconnected(&from);
                }
            }
        }
        tracing::debug!("transport inbox closed");
    }

    /// Decode and route one datagram
    pub(crate) async fn handle_datagram(&self, from: PeerId, payload: Bytes) {
        let message = match Message::decode(&payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(%from, len = payload.len(), error = %e, "undecodable message dropped");
                return;
            }
        };
        tracing::trace!(%from, kind = message.kind(), file_id = %message.file_id(), "message received");

        let inner = &self.inner;
        match message {
            Message::FileOffer {
                file_id,
                name,
                size,
                file_type,
            } => inner
                .receiver
                .handle_offer(from, FileOffer::new(file_id, name, size, file_type)),
            Message::FileAccepted { file_id } => inner.sender.handle_accept(from, file_id).await,
            Message::FileRejected { file_id, reason } => match inner.registry.role(&file_id) {
                Some(Role::Sender) => inner.sender.handle_reject(from, file_id, reason),
                _ => inner.receiver.handle_sender_reject(&from, &file_id, reason),
            },
            Message::FileCatchup {
                file_id,
                chunks_to_expect,
            } => inner
                .receiver
                .handle_catchup(&from, &file_id, chunks_to_expect),
            Message::FileChunk {
                file_id,
                index,
                data,
                ..
            } => inner.receiver.handle_chunk(&from, file_id, index, data).await,
            Message::FileAck { file_id, index } => inner.sender.handle_ack(&from, &file_id, index),
            Message::FileComplete { file_id } => inner.receiver.handle_complete(&from, &file_id),
        }
    }

    async fn store_event_loop(self, mut store_events: mpsc::UnboundedReceiver<StoreEvent>) {
        while let Some(event) = store_events.recv().await {
            self.inner.receiver.handle_store_event(event);
        }
    }

    async fn progress_loop(self) {
        let mut ticker = tokio::time::interval(self.inner.config.transfer.progress_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let now = Instant::now();
            self.inner.sender.sample_progress(now);
            self.inner.receiver.sample_progress(now);
        }
    }
}
