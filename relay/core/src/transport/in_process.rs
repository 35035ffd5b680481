//! In-Process Transport
//!
//! Channel-backed tunnel streams for embedding the relay directly in another
//! process (no sockets). The client end is a plain `mpsc::Receiver`; dropping
//! it closes the stream.
//!
//! # Usage
//!
//! ```ignore
//! let (stream, mut client) = InProcessStream::new_pair(32);
//!
//! let relay = relay.clone();
//! tokio::spawn(async move { relay.tunnel(TunnelRequest::default(), Arc::new(stream)).await });
//!
//! while let Some(response) = client.recv().await {
//!     // Render response
//! }
//! ```

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::messages::TunnelResponse;

use super::traits::{CloseReason, TransportError, TunnelStream};

/// Tunnel stream backed by a tokio channel
#[derive(Debug, Clone)]
pub struct InProcessStream {
    tx: mpsc::Sender<TunnelResponse>,
}

impl InProcessStream {
    /// Create a stream and the receiver its client reads from
    #[must_use]
    pub fn new_pair(capacity: usize) -> (Self, mpsc::Receiver<TunnelResponse>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Check if the client end is still alive
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

#[async_trait]
impl TunnelStream for InProcessStream {
    async fn send(&self, response: &TunnelResponse) -> Result<(), TransportError> {
        self.tx
            .send(response.clone())
            .await
            .map_err(|_| TransportError::SendFailed("Client receiver dropped".to_string()))
    }

    async fn closed(&self) -> CloseReason {
        self.tx.closed().await;
        CloseReason::Disconnected
    }
}
