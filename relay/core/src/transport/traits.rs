//! Transport Traits
//!
//! The server-side view of one client connection.

use async_trait::async_trait;
use thiserror::Error;

use crate::messages::TunnelResponse;

/// Errors that can occur during transport operations
#[derive(Debug, Error)]
pub enum TransportError {
    /// Peer closed the connection
    #[error("Connection closed")]
    ConnectionClosed,

    /// Failed to push a message to the peer
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// The opening handshake was missing or malformed
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Message serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Frame checksum mismatch - data corruption detected
    #[error("Checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Checksum carried in the frame header
        expected: u32,
        /// Checksum computed over the received payload
        actual: u32,
    },

    /// IO error from the underlying socket
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a tunnel stream ended
#[derive(Debug)]
pub enum CloseReason {
    /// The client went away cleanly
    Disconnected,
    /// The server is shutting down
    Cancelled,
    /// The connection failed underneath us
    Failed(TransportError),
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "client disconnected"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Failed(e) => write!(f, "transport failure: {e}"),
        }
    }
}

/// Outbound stream to one connected client
///
/// `send` is called by the dispatch task, one message at a time per stream.
/// `closed` is awaited by the connection task and resolves once the client
/// can no longer be reached.
#[async_trait]
pub trait TunnelStream: Send + Sync {
    /// Push one response to the client
    async fn send(&self, response: &TunnelResponse) -> Result<(), TransportError>;

    /// Wait until the stream is done
    async fn closed(&self) -> CloseReason;
}
