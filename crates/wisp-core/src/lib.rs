//! # WISP Core
//!
//! Transfer engine for WISP, a windowed reliable-multicast file transfer
//! protocol.
//!
//! This crate provides:
//! - The wire protocol ([`Message`], [`FileOffer`])
//! - The adaptive send window ([`SendWindow`])
//! - The sender engine: offers, per-chunk acknowledgment with retries,
//!   catch-up replay for late acceptors, full resend after completion
//! - The receiver manager: acknowledgment at receipt, deduplication and a
//!   storage-confirmed completion barrier
//! - The [`TransferRegistry`] and the [`Node`] that ties them to a transport
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                            Node                               │
//! │   (inbound dispatch, storage event pump, progress sampling)  │
//! ├──────────────────────────────┬───────────────────────────────┤
//! │        SenderEngine          │        ReceiverManager        │
//! │  (window, acks, catch-up)    │  (dedup, completion barrier)  │
//! ├──────────────────────────────┴───────────────────────────────┤
//! │          TransferRegistry        │         ChunkStore         │
//! ├──────────────────────────────────┴───────────────────────────┤
//! │                    MessageTransport                           │
//! └──────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod events;
pub mod link;
pub mod node;
pub mod progress;
pub mod protocol;
pub mod receiver;
pub mod registry;
pub mod sender;
pub mod window;

pub use config::{NodeConfig, ReceiverConfig, StoreConfig, TransferConfig};
pub use error::{Result, TransferError};
pub use events::{CompletedFile, Completion, Direction, EventSink, TransferEvent};
pub use link::Link;
pub use node::Node;
pub use protocol::{FileOffer, Message};
pub use receiver::{IncomingFile, IncomingStatus, ReceivePhase, ReceiverManager};
pub use registry::{Role, TransferRegistry};
pub use sender::{
    LATE_ACCEPT_REASON, OutgoingFile, OutgoingStatus, OutgoingTransfer, SendPhase, SenderEngine,
};
pub use window::{SendWindow, WindowPermit, WindowSnapshot, next_pipeline_size};
