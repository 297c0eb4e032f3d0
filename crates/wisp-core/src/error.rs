//! Error types for the transfer engine
//!
//! Errors are scoped to one file. Only retry exhaustion, cancellation, a lost
//! sender, or a completion barrier that times out with too many chunks
//! missing end a transfer; everything else is retried or dropped.
//!
//! # Error Categories
//!
//! - **Transient**: may succeed on retry (transport hiccups, storage batch
//!   failures, per-chunk timeouts)
//! - **Permanent**: will not succeed without intervention (invalid config,
//!   unknown file, exhausted retries)

use std::borrow::Cow;
use thiserror::Error;
use wisp_files::{FileId, StoreError};
use wisp_transport::TransportError;

/// Errors that can occur while transferring a file
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransferError {
    // ============ Channel Errors ============
    /// Datagram could not be handed to the transport
    #[error("Transport error: {0}")]
    Transport(Cow<'static, str>),

    /// Peer sent something that makes no sense in the current state
    #[error("Protocol violation: {0}")]
    ProtocolViolation(Cow<'static, str>),

    /// Datagram could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(Cow<'static, str>),

    // ============ Storage Errors ============
    /// Chunk store failure
    #[error("Storage error: {0}")]
    Storage(Cow<'static, str>),

    /// Assembled size disagrees with the declared size
    #[error("Integrity mismatch: expected {expected} bytes, assembled {actual}")]
    IntegrityMismatch {
        /// Declared size
        expected: u64,
        /// Assembled size
        actual: u64,
    },

    /// Chunks never reached durable storage
    #[error("Incomplete file: {missing} chunk(s) missing")]
    IncompleteFile {
        /// Number of missing chunks
        missing: u64,
    },

    // ============ Transfer Errors ============
    /// A chunk went unacknowledged for every attempt
    #[error("Chunk {index} unacknowledged after {attempts} attempts")]
    RetriesExhausted {
        /// Chunk index
        index: u64,
        /// Attempts made
        attempts: u32,
    },

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(Cow<'static, str>),

    /// No transfer registered under this identifier
    #[error("File not found: {0}")]
    FileNotFound(FileId),

    /// Transfer aborted by the user or by shutdown
    #[error("Transfer cancelled")]
    Cancelled,

    // ============ Configuration & State Errors ============
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// Invalid state transition
    #[error("Invalid state: {0}")]
    InvalidState(Cow<'static, str>),
}

impl TransferError {
    /// Returns true if this error is transient and may succeed on retry
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransferError::Transport(_) | TransferError::Storage(_) | TransferError::Timeout(_)
        )
    }

    /// Returns true if this error is permanent and will not succeed on retry
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            TransferError::InvalidConfig(_)
                | TransferError::FileNotFound(_)
                | TransferError::RetriesExhausted { .. }
                | TransferError::IncompleteFile { .. }
                | TransferError::InvalidState(_)
                | TransferError::Cancelled
        )
    }

    /// Create a transport error with static context (zero allocation)
    #[must_use]
    pub const fn transport(context: &'static str) -> Self {
        TransferError::Transport(Cow::Borrowed(context))
    }

    /// Create a protocol violation with static context (zero allocation)
    #[must_use]
    pub const fn protocol(context: &'static str) -> Self {
        TransferError::ProtocolViolation(Cow::Borrowed(context))
    }

    /// Create a timeout error with static context (zero allocation)
    #[must_use]
    pub const fn timeout(context: &'static str) -> Self {
        TransferError::Timeout(Cow::Borrowed(context))
    }

    /// Create an invalid state error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_state(context: &'static str) -> Self {
        TransferError::InvalidState(Cow::Borrowed(context))
    }

    /// Create an invalid configuration error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_config(context: &'static str) -> Self {
        TransferError::InvalidConfig(Cow::Borrowed(context))
    }
}

impl From<TransportError> for TransferError {
    fn from(err: TransportError) -> Self {
        TransferError::Transport(Cow::Owned(err.to_string()))
    }
}

impl From<StoreError> for TransferError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::MissingChunks { missing, .. } => TransferError::IncompleteFile {
                missing: missing.len() as u64,
            },
            other => TransferError::Storage(Cow::Owned(other.to_string())),
        }
    }
}

impl From<bincode::Error> for TransferError {
    fn from(err: bincode::Error) -> Self {
        TransferError::Serialization(Cow::Owned(err.to_string()))
    }
}

/// Result type for transfer operations
pub type Result<T> = std::result::Result<T, TransferError>;

#[cfg(test)]
mod tests {
    use super::*;
    use wisp_transport::PeerId;

    #[test]
    fn test_transient_errors() {
        assert!(TransferError::transport("send failed").is_transient());
        assert!(TransferError::Storage(Cow::Borrowed("batch")).is_transient());
        assert!(TransferError::timeout("ack").is_transient());
    }

    #[test]
    fn test_permanent_errors() {
        assert!(TransferError::invalid_config("bad").is_permanent());
        assert!(TransferError::FileNotFound(FileId::new("f")).is_permanent());
        assert!(
            TransferError::RetriesExhausted {
                index: 2,
                attempts: 10
            }
            .is_permanent()
        );
        assert!(TransferError::IncompleteFile { missing: 6 }.is_permanent());
        assert!(TransferError::Cancelled.is_permanent());
    }

    #[test]
    fn test_mutual_exclusivity() {
        let errors = [
            TransferError::transport("x"),
            TransferError::timeout("x"),
            TransferError::invalid_state("x"),
            TransferError::Cancelled,
            TransferError::RetriesExhausted {
                index: 0,
                attempts: 1,
            },
        ];
        for err in &errors {
            assert!(!(err.is_transient() && err.is_permanent()));
        }
    }

    #[test]
    fn test_error_display() {
        let err = TransferError::RetriesExhausted {
            index: 2,
            attempts: 10,
        };
        assert_eq!(err.to_string(), "Chunk 2 unacknowledged after 10 attempts");

        let err = TransferError::IntegrityMismatch {
            expected: 100,
            actual: 5000,
        };
        assert!(err.to_string().contains("5000"));
    }

    #[test]
    fn test_conversions() {
        let err: TransferError = TransportError::PeerNotConnected(PeerId::new("bob")).into();
        assert!(matches!(err, TransferError::Transport(_)));

        let err: TransferError = StoreError::MissingChunks {
            file_id: FileId::new("f"),
            missing: vec![1, 2, 3],
        }
        .into();
        assert_eq!(err, TransferError::IncompleteFile { missing: 3 });

        let err: TransferError = StoreError::Closed.into();
        assert!(matches!(err, TransferError::Storage(_)));
    }
}
