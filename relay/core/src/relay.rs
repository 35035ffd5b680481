//! Relay - Broker Fanout to Live Tunnels
//!
//! The relay owns one broker subscription and one dispatch task per process.
//! Every message that arrives on the subscription is offered to every session
//! registered at that moment.
//!
//! # Architecture
//!
//! ```text
//!   Broker::listen() ──► Subscription ──► dispatch task
//!                                            │ list() snapshot
//!                         ┌──────────────────┼──────────────────┐
//!                         ▼                  ▼                  ▼
//!                     session A          session B          session C
//!                  (TunnelStream)     (TunnelStream)     (TunnelStream)
//!
//!   transport accept ──► Relay::tunnel() ── add ── closed() ── remove
//! ```
//!
//! # Session Lifecycle
//!
//! Open (stream accepted) → Streaming (registered, receives fanout) → Closed
//! (stream ended, removed). The relay never tears a connection down itself;
//! [`TunnelStream::closed`] decides when a session ends.
//!
//! # Delivery
//!
//! - Only sessions registered when a message is dispatched receive it
//! - Messages reach each session in dispatch order
//! - At most once per session per message: no retries, no acknowledgement
//! - A failed send is logged and counted; the session stays registered until
//!   its own stream reports closure
//! - Each send has a deadline, so a client that stops reading cannot hold up
//!   the next message for everyone else

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use crate::broker::{Broker, BrokerError, Subscription};
use crate::config::DEFAULT_SEND_TIMEOUT_MS;
use crate::messages::{QueueMessage, TunnelRequest, TunnelResponse};
use crate::session::{Session, SessionId, SessionRegistry};
use crate::transport::{CloseReason, TransportError, TunnelStream};

/// Default deadline for one send to one session
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_millis(DEFAULT_SEND_TIMEOUT_MS);

/// Relay startup and supervision errors
#[derive(Debug, Error)]
pub enum RelayError {
    /// The broker subscription could not be established
    #[error("Failed to subscribe to broker: {0}")]
    Subscribe(#[from] BrokerError),

    /// The dispatch task panicked or was aborted
    #[error("Dispatch task failed: {0}")]
    Dispatch(#[from] tokio::task::JoinError),
}

/// Outcome of offering one message to every session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanoutReport {
    /// Sessions that accepted the message
    pub delivered: usize,
    /// Sessions whose send failed
    pub failed: usize,
    /// Ids of the sessions whose send failed
    pub failed_ids: Vec<SessionId>,
}

impl FanoutReport {
    /// Check if every session accepted the message
    #[must_use]
    pub fn all_delivered(&self) -> bool {
        self.failed == 0
    }

    /// Number of sessions the message was offered to
    #[must_use]
    pub fn attempted(&self) -> usize {
        self.delivered + self.failed
    }
}

/// Final statistics from a dispatch task that ran to completion
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Messages received from the subscription and fanned out
    pub messages_dispatched: u64,
    /// Individual session sends that failed
    pub failed_deliveries: u64,
}

/// Handle on the relay's dispatch task
///
/// The task ends only when the broker subscription closes. Owners should
/// treat that as fatal: no messages will be relayed afterwards.
#[derive(Debug)]
pub struct Dispatcher {
    handle: JoinHandle<DispatchSummary>,
}

impl Dispatcher {
    /// Wait for the dispatch task to end
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Dispatch` if the task panicked or was aborted.
    pub async fn wait(self) -> Result<DispatchSummary, RelayError> {
        Ok(self.handle.await?)
    }

    /// Check whether the dispatch task has ended
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop the dispatch task
    pub fn abort(&self) {
        self.handle.abort();
    }
}

/// Fans broker messages out to registered sessions
#[derive(Clone, Debug)]
pub struct Relay {
    sessions: SessionRegistry,
    send_timeout: Duration,
}

impl Default for Relay {
    fn default() -> Self {
        Self {
            sessions: SessionRegistry::default(),
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }
}

impl Relay {
    /// Subscribe to `broker` and start the dispatch task
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Subscribe` if the broker refuses the subscription.
    pub async fn start(broker: &dyn Broker) -> Result<(Self, Dispatcher), RelayError> {
        Self::new().attach(broker).await
    }

    /// Subscribe this relay to `broker` and start its dispatch task
    ///
    /// Like [`Relay::start`], for a relay built with non-default settings.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Subscribe` if the broker refuses the subscription.
    pub async fn attach(self, broker: &dyn Broker) -> Result<(Self, Dispatcher), RelayError> {
        let subscription = broker.listen().await?;

        let handle = tokio::spawn(self.clone().dispatch(subscription));
        info!(send_timeout = ?self.send_timeout, "Relay dispatch task started");

        Ok((self, Dispatcher { handle }))
    }

    /// Create a relay with an empty registry and no subscription
    ///
    /// Useful when messages are fed to [`Relay::fanout`] directly.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the deadline for a single send to a single session
    #[must_use]
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Deadline for a single send to a single session
    #[must_use]
    pub fn send_timeout(&self) -> Duration {
        self.send_timeout
    }

    /// The registry of live sessions
    #[must_use]
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Offer one message to every currently registered session
    ///
    /// Sends run concurrently; one slow or failed session does not hold up or
    /// cancel the others. A send that misses the deadline counts as failed.
    pub async fn fanout(&self, message: &QueueMessage) -> FanoutReport {
        let sessions = self.sessions.list();
        if sessions.is_empty() {
            debug!("No sessions registered, message not delivered");
            return FanoutReport::default();
        }

        let response = TunnelResponse::from(message);
        let deadline = self.send_timeout;
        let sends = sessions.iter().map(|session| {
            let response = &response;
            async move {
                let result = tokio::time::timeout(deadline, session.stream.send(response))
                    .await
                    .unwrap_or_else(|_| {
                        Err(TransportError::SendFailed(format!(
                            "Timed out after {}ms",
                            deadline.as_millis()
                        )))
                    });
                (session.id, result)
            }
        });

        let mut report = FanoutReport::default();
        for (id, result) in join_all(sends).await {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(session_id = %id, error = %e, "Delivery to session failed");
                    report.failed += 1;
                    report.failed_ids.push(id);
                }
            }
        }

        debug!(
            delivered = report.delivered,
            failed = report.failed,
            "Message fanned out"
        );
        report
    }

    /// Serve one tunnel for its whole lifetime
    ///
    /// Registers a fresh session, waits for the stream to close, then removes
    /// the session and returns why the stream ended.
    pub async fn tunnel(
        &self,
        request: TunnelRequest,
        stream: Arc<dyn TunnelStream>,
    ) -> CloseReason {
        let session = Session::new(Arc::clone(&stream));
        let id = session.id;
        let span = tracing::info_span!("session", session_id = %id, client = ?request.client);

        async move {
            self.sessions.add(session);
            info!(active = self.sessions.count(), "Tunnel streaming");

            let reason = stream.closed().await;

            if let Err(e) = self.sessions.remove(&id) {
                warn!(error = %e, "Session already gone at close");
            }
            info!(reason = %reason, "Tunnel closed");
            reason
        }
        .instrument(span)
        .await
    }

    async fn dispatch(self, mut subscription: Subscription) -> DispatchSummary {
        let mut summary = DispatchSummary::default();

        while let Some(message) = subscription.recv().await {
            let report = self.fanout(&message).await;
            summary.messages_dispatched += 1;
            summary.failed_deliveries += report.failed as u64;
        }

        error!(
            messages = summary.messages_dispatched,
            "Broker subscription closed, relay stopped dispatching"
        );
        summary
    }
}
