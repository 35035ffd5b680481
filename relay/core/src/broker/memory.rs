//! In-Memory Broker
//!
//! Direct channel-based broker for single-process deployments and tests.
//! Producers and the relay share one tokio channel; there is no cross-process
//! delivery at all.
//!
//! # Blocking Semantics
//!
//! tokio channels cannot be unbuffered, so the channel holds
//! [`DEFAULT_CAPACITY`] message(s). A broadcast made before anyone listens is
//! parked in that slot and handed to the listener once it starts; further
//! broadcasts wait until the slot drains. Nothing is ever dropped silently, but
//! a producer with no listener will wait indefinitely. This is not a
//! guaranteed-delivery mechanism.

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{Broker, BrokerError, Subscription};
use crate::messages::QueueMessage;

/// Buffered slots in the shared channel
pub const DEFAULT_CAPACITY: usize = 1;

/// Broker backed by a single in-process channel
///
/// Only one listener can take the receiving end.
pub struct InMemoryBroker {
    /// Sending end shared by all producers
    tx: mpsc::Sender<QueueMessage>,
    /// Receiving end, handed out to the first listener
    rx: Mutex<Option<Subscription>>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// Create a broker with the default single slot
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a broker with a custom number of buffered slots
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn broadcast(&self, message: QueueMessage) -> Result<(), BrokerError> {
        self.tx
            .send(message)
            .await
            .map_err(|_| BrokerError::Transport("In-memory listener dropped".to_string()))
    }

    async fn listen(&self) -> Result<Subscription, BrokerError> {
        self.rx.lock().take().ok_or_else(|| {
            BrokerError::Connect("In-memory broker already has a listener".to_string())
        })
    }
}
