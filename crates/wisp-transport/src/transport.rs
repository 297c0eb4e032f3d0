//! Transport trait abstraction for peer message delivery.
//!
//! This module defines the `MessageTransport` trait that abstracts over the
//! datagram channel connecting peers (a WebRTC data channel in production, the
//! [`SimNetwork`](crate::sim::SimNetwork) in tests). The transfer engine only
//! ever sends opaque encoded messages through it; delivery is unreliable and
//! unordered.

use crate::peer::PeerId;
use async_trait::async_trait;
use bytes::Bytes;

/// Transport layer errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Destination peer has no open channel
    #[error("Peer {0} is not connected")]
    PeerNotConnected(PeerId),

    /// Transport is closed
    #[error("Transport is closed")]
    Closed,

    /// Payload exceeds what the channel can carry
    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge {
        /// Payload size
        size: usize,
        /// Channel limit
        max: usize,
    },

    /// Transport-specific error
    #[error("Transport error: {0}")]
    Other(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Something that happened on a peer channel.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A datagram arrived
    Datagram(Bytes),
    /// The peer's channel opened
    Connected,
    /// The peer's channel closed
    Disconnected,
}

/// An event attributed to the remote peer it came from.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    /// Remote peer
    pub from: PeerId,
    /// What happened
    pub event: PeerEvent,
}

/// Async transport trait for peer-to-peer message delivery.
///
/// Implementations provide per-peer sends and a broadcast to every connected
/// peer. Inbound traffic is surfaced separately as a stream of
/// [`InboundEvent`]s owned by whoever created the endpoint.
///
/// A successful send only means the datagram was handed to the channel; it
/// may still be dropped, delayed or reordered.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Identity of the local endpoint
    fn local_peer(&self) -> &PeerId;

    /// Send a datagram to one peer.
    ///
    /// # Errors
    /// Returns `TransportError::PeerNotConnected` when no channel to `peer`
    /// is open.
    async fn send_to_peer(&self, peer: &PeerId, payload: Bytes) -> TransportResult<()>;

    /// Send a datagram to every connected peer.
    ///
    /// Returns the number of peers the datagram was handed to. Individual
    /// per-peer failures are not reported.
    async fn broadcast(&self, payload: Bytes) -> TransportResult<usize>;

    /// Peers with an open channel
    fn connected_peers(&self) -> Vec<PeerId>;

    /// Get transport statistics (optional).
    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

/// Transport statistics
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total datagrams sent
    pub datagrams_sent: u64,
    /// Datagrams lost on the way (simulated networks only)
    pub datagrams_dropped: u64,
    /// Send errors
    pub send_errors: u64,
}

impl TransportStats {
    /// Create new empty statistics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful send
    pub fn record_send(&mut self, bytes: usize) {
        self.bytes_sent += bytes as u64;
        self.datagrams_sent += 1;
    }

    /// Record a datagram that was accepted but never delivered
    pub fn record_drop(&mut self) {
        self.datagrams_dropped += 1;
    }

    /// Record a send error
    pub fn record_send_error(&mut self) {
        self.send_errors += 1;
    }
}
