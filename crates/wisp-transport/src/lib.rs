//! # WISP Transport
//!
//! Message transport layer for the WISP protocol.
//!
//! This crate provides:
//! - Peer identities ([`PeerId`])
//! - The [`MessageTransport`] trait consumed by the transfer engine
//! - Inbound peer events (datagrams, connect, disconnect)
//! - A deterministic in-process [`SimNetwork`] with latency, jitter, loss and
//!   disconnection, used by tests and the CLI simulator
//!
//! The transport moves opaque datagrams. It gives no ordering guarantee, so
//! everything above it is index-addressed.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod peer;
pub mod sim;
pub mod transport;

pub use peer::PeerId;
pub use sim::{DropFilter, SimEndpoint, SimNetwork};
pub use transport::{
    InboundEvent, MessageTransport, PeerEvent, TransportError, TransportResult, TransportStats,
};
