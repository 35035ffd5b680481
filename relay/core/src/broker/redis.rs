//! Redis Pub/Sub Broker
//!
//! Distributed broker for multi-process deployments. Every relay process
//! subscribes to one well-known channel; a publish from any process reaches
//! all of them.
//!
//! # Lifecycle
//!
//! ```text
//! connect()  ── PING with backoff ──► ready (or BrokerError::Connect)
//! listen()   ── SUBSCRIBE ──► pump task ──► Subscription
//!                                │
//!                    connection lost: stream ends,
//!                    Subscription closes, pump exits
//! ```
//!
//! Publishing uses a multiplexed connection; the subscription gets its own
//! dedicated pub/sub connection. A publish that finds its connection dropped
//! opens a fresh one and tries once more. The subscription is never reopened.

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, RedisError};
use tracing::{debug, info, warn};

use super::backoff::{retry, RetryPolicy};
use super::{spawn_subscription, Broker, BrokerError, Subscription};
use crate::messages::QueueMessage;

/// Channel shared by every relay process in a deployment
pub const DEFAULT_CHANNEL: &str = "VOICE";

/// Default capacity of the channel between the pump task and the relay
pub const DEFAULT_SUBSCRIPTION_CAPACITY: usize = 64;

/// Broker backed by Redis pub/sub
pub struct RedisBroker {
    client: redis::Client,
    publisher: Mutex<MultiplexedConnection>,
    channel: String,
    subscription_capacity: usize,
}

impl RedisBroker {
    /// Connect to Redis at `addr` (`host:port`, or `:port` for localhost)
    ///
    /// Probes the server with `PING`, retrying with `retry_policy`, before
    /// returning.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::Connect` if the address is invalid or every probe
    /// fails.
    pub async fn connect(addr: &str, retry_policy: &RetryPolicy) -> Result<Self, BrokerError> {
        let url = redis_url(addr);
        let client =
            redis::Client::open(url.as_str()).map_err(|e| BrokerError::Connect(e.to_string()))?;

        let publisher = retry(retry_policy, |attempt| {
            let client = client.clone();
            async move {
                debug!(attempt = attempt + 1, "Probing Redis");
                let mut conn = client.get_multiplexed_async_connection().await?;
                let _: String = redis::cmd("PING").query_async(&mut conn).await?;
                Ok::<_, redis::RedisError>(conn)
            }
        })
        .await
        .map_err(|e| BrokerError::Connect(format!("{url}: {e}")))?;

        info!(url = %url, "Connected to Redis");

        Ok(Self {
            client,
            publisher: Mutex::new(publisher),
            channel: DEFAULT_CHANNEL.to_string(),
            subscription_capacity: DEFAULT_SUBSCRIPTION_CAPACITY,
        })
    }

    /// Use a different pub/sub channel name
    #[must_use]
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    /// Set the buffer between the pump task and the subscriber
    #[must_use]
    pub fn with_subscription_capacity(mut self, capacity: usize) -> Self {
        self.subscription_capacity = capacity;
        self
    }

    /// The pub/sub channel this broker publishes and listens on
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    async fn publish_on(
        &self,
        mut conn: MultiplexedConnection,
        payload: &[u8],
    ) -> Result<i64, RedisError> {
        conn.publish(&self.channel, payload).await
    }
}

/// Whether a command failed because the connection itself is gone
fn needs_reconnect(err: &RedisError) -> bool {
    err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal()
}

#[async_trait]
impl Broker for RedisBroker {
    async fn broadcast(&self, message: QueueMessage) -> Result<(), BrokerError> {
        let payload = message.encode()?;
        let conn = self.publisher.lock().clone();

        let receivers = match self.publish_on(conn, &payload).await {
            Ok(receivers) => receivers,
            Err(e) if needs_reconnect(&e) => {
                warn!(error = %e, "Publish connection lost, reconnecting");
                let fresh = self
                    .client
                    .get_multiplexed_async_connection()
                    .await
                    .map_err(|e| BrokerError::Transport(e.to_string()))?;
                *self.publisher.lock() = fresh.clone();
                self.publish_on(fresh, &payload)
                    .await
                    .map_err(|e| BrokerError::Transport(e.to_string()))?
            }
            Err(e) => return Err(BrokerError::Transport(e.to_string())),
        };

        debug!(channel = %self.channel, receivers, "Published message");
        Ok(())
    }

    async fn listen(&self) -> Result<Subscription, BrokerError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))?;

        pubsub
            .subscribe(&self.channel)
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))?;

        info!(channel = %self.channel, "Subscribed to channel");

        // The message stream ends when the pub/sub connection drops
        let events = pubsub
            .into_on_message()
            .map(|msg| Ok::<_, BrokerError>(msg.get_payload_bytes().to_vec()));

        let (subscription, _pump) = spawn_subscription(events, self.subscription_capacity);
        Ok(subscription)
    }
}

/// Build a Redis URL from a `host:port` address
///
/// Accepts full `redis://` URLs unchanged. A bare `:port` means localhost.
#[must_use]
pub fn redis_url(addr: &str) -> String {
    if addr.starts_with("redis://") || addr.starts_with("rediss://") {
        return addr.to_string();
    }

    if let Some(port) = addr.strip_prefix(':') {
        format!("redis://127.0.0.1:{port}/")
    } else {
        format!("redis://{addr}/")
    }
}
