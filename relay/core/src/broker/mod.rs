//! Broker Layer
//!
//! The broker decouples message producers from every relay process:
//!
//! - [`InMemoryBroker`]: one shared channel inside a single process
//! - [`RedisBroker`]: Redis pub/sub, for deployments where a load balancer
//!   may route a client to any process
//!
//! # Delivery Model
//!
//! A broadcast is visible to every process that is currently listening. There
//! is no persistence and no ordering guarantee across publishers. A
//! subscription is established once and never re-established: when the
//! channel returned by [`Broker::listen`] closes, the subscription is over.

pub mod backoff;
pub mod memory;
pub mod redis;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::messages::QueueMessage;

pub use self::backoff::{retry, RetryPolicy};
pub use self::memory::InMemoryBroker;
pub use self::redis::RedisBroker;

/// Receiving end of a broker subscription
pub type Subscription = mpsc::Receiver<QueueMessage>;

/// Errors raised by broker implementations
#[derive(Clone, Debug, Error)]
pub enum BrokerError {
    /// The subscription could not be established
    #[error("Broker connect failed: {0}")]
    Connect(String),

    /// A publish could not be handed to the transport
    #[error("Broker transport error: {0}")]
    Transport(String),

    /// A received payload could not be decoded
    #[error("Failed to decode broker message: {0}")]
    Decode(String),
}

/// Publish/subscribe channel shared by all relay processes
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish a message to every listening process
    ///
    /// May wait on transport back-pressure.
    async fn broadcast(&self, message: QueueMessage) -> Result<(), BrokerError>;

    /// Subscribe to the shared channel
    ///
    /// The returned receiver yields messages for the life of the subscription
    /// and closes when the subscription terminates.
    async fn listen(&self) -> Result<Subscription, BrokerError>;
}

/// Spawn the task that turns raw transport events into a [`Subscription`]
///
/// Each `Ok` payload is decoded and forwarded. Undecodable payloads are
/// logged and skipped. An `Err` event, or the end of `events`, closes the
/// subscription. The task also stops once the receiver is dropped.
pub fn spawn_subscription<S>(events: S, capacity: usize) -> (Subscription, JoinHandle<()>)
where
    S: Stream<Item = Result<Vec<u8>, BrokerError>> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let handle = tokio::spawn(pump(events, tx));
    (rx, handle)
}

async fn pump<S>(events: S, tx: mpsc::Sender<QueueMessage>)
where
    S: Stream<Item = Result<Vec<u8>, BrokerError>>,
{
    futures::pin_mut!(events);

    while let Some(event) = events.next().await {
        match event {
            Ok(payload) => match QueueMessage::decode(&payload) {
                Ok(message) => {
                    if tx.send(message).await.is_err() {
                        info!("Subscription receiver dropped, stopping pump");
                        return;
                    }
                }
                Err(e) => {
                    warn!(error = %e, bytes = payload.len(), "Skipping undecodable message");
                }
            },
            Err(e) => {
                error!(error = %e, "Transport error, closing subscription");
                return;
            }
        }
    }

    debug!("Transport stream ended");
    warn!("Broker subscription closed");
}
