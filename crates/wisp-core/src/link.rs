//! Message-level view of the transport.

use crate::error::Result;
use crate::protocol::Message;
use bytes::Bytes;
use std::sync::Arc;
use wisp_transport::{MessageTransport, PeerId};

/// Encodes [`Message`]s onto a [`MessageTransport`].
#[derive(Clone)]
pub struct Link {
    transport: Arc<dyn MessageTransport>,
}

impl Link {
    /// Wrap a transport
    pub fn new(transport: Arc<dyn MessageTransport>) -> Self {
        Self { transport }
    }

    /// This node's identity
    pub fn local_peer(&self) -> &PeerId {
        self.transport.local_peer()
    }

    /// Encode and send one message
    ///
    /// # Errors
    /// Returns `TransferError::Transport` if the peer is unreachable.
    pub async fn send(&self, peer: &PeerId, message: &Message) -> Result<()> {
        self.send_encoded(peer, message.encode()?).await
    }

    /// Send a pre-encoded message
    ///
    /// # Errors
    /// Returns `TransferError::Transport` if the peer is unreachable.
    pub async fn send_encoded(&self, peer: &PeerId, payload: Bytes) -> Result<()> {
        self.transport.send_to_peer(peer, payload).await?;
        Ok(())
    }

    /// Encode and send one message to every connected peer
    ///
    /// # Errors
    /// Returns `TransferError::Serialization` or `TransferError::Transport`.
    pub async fn broadcast(&self, message: &Message) -> Result<usize> {
        Ok(self.transport.broadcast(message.encode()?).await?)
    }
}
