//! Daemon Server Implementation
//!
//! This module provides the tunnel server loop for the relay daemon:
//! - Accepts TCP connections and performs the tunnel handshake
//! - Hands each tunnel to [`Relay::tunnel`] for its lifetime
//! - Tracks active connections and enforces a connection cap
//! - Exits when asked to shut down, or when the broker subscription dies
//!
//! ```text
//!                     DaemonServer
//!                          │
//!          ┌───────────────┼───────────────┐
//!          │               │               │
//!       kiosk           phone          browser
//!      (conn-1)        (conn-2)        (conn-3)
//!          │               │               │
//!          └───────────────┴───────────────┘
//!                          │
//!                        Relay
//!              (SessionRegistry + dispatch)
//! ```

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn, Instrument};

use relay_core::{Dispatcher, Relay, TcpTunnelStream};

/// How long open tunnels get to wind down before being aborted
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Identifier for an accepted TCP connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Connection state tracking
struct ConnectionState {
    /// When the connection was accepted
    connected_at: Instant,
    /// Remote address
    peer: SocketAddr,
    /// Handle to abort the connection task
    abort_handle: tokio::task::AbortHandle,
}

/// Configuration for the tunnel server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on
    pub listen_addr: String,
    /// Maximum number of concurrent connections
    pub max_connections: usize,
    /// How long an accepted connection may take to send its handshake
    pub handshake_timeout: Duration,
}

/// The tunnel server
pub struct DaemonServer {
    config: ServerConfig,
    relay: Relay,
    /// Active connection state (task handles, peer info)
    connection_states: Arc<DashMap<ConnectionId, ConnectionState>>,
    /// Flipped to `true` to cancel every open tunnel
    tunnels_shutdown: watch::Sender<bool>,
}

impl DaemonServer {
    /// Create a server that serves tunnels for `relay`
    pub fn new(config: ServerConfig, relay: Relay) -> Self {
        let (tunnels_shutdown, _) = watch::channel(false);
        Self {
            config,
            relay,
            connection_states: Arc::new(DashMap::new()),
            tunnels_shutdown,
        }
    }

    /// Bind the listen address and serve until shutdown
    ///
    /// Returns an error if the address cannot be bound or the broker
    /// subscription ends while serving.
    pub async fn run(&self, dispatcher: Dispatcher, shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", self.config.listen_addr))?;

        self.serve(listener, dispatcher, shutdown).await
    }

    /// Serve tunnels on an already-bound listener
    pub async fn serve(
        &self,
        listener: TcpListener,
        dispatcher: Dispatcher,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        info!(addr = ?listener.local_addr().ok(), "Listening for tunnels");

        let dispatch = dispatcher.wait();
        tokio::pin!(dispatch);

        let outcome = loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown requested, stopping accept loop");
                        break Ok(());
                    }
                }

                finished = &mut dispatch => {
                    break Err(match finished {
                        Ok(summary) => anyhow!(
                            "Broker subscription closed after {} messages",
                            summary.messages_dispatched
                        ),
                        Err(e) => anyhow!(e).context("Relay dispatch task failed"),
                    });
                }

                accepted = listener.accept() => match accepted {
                    Ok((tcp, peer)) => self.admit(tcp, peer),
                    Err(e) => error!(error = %e, "Accept failed"),
                }
            }
        };

        if let Err(ref e) = outcome {
            error!(error = %e, "Relay can no longer deliver messages");
        }

        self.shutdown().await;
        outcome
    }

    fn admit(&self, tcp: TcpStream, peer: SocketAddr) {
        if self.connection_states.len() >= self.config.max_connections {
            warn!(
                peer = %peer,
                max_connections = self.config.max_connections,
                "Connection limit reached, rejecting new connection"
            );
            drop(tcp);
            return;
        }

        let conn_id = ConnectionId::next();
        let relay = self.relay.clone();
        let states = Arc::clone(&self.connection_states);
        let shutdown = self.tunnels_shutdown.subscribe();
        let handshake_timeout = self.config.handshake_timeout;

        // The handler waits until its state entry exists so it can remove it
        let (ready_tx, ready_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(
            async move {
                if ready_rx.await.is_err() {
                    return;
                }
                Self::handle_connection(conn_id, tcp, relay, shutdown, handshake_timeout, states)
                    .await;
            }
            .instrument(tracing::info_span!("connection", %conn_id, %peer)),
        );

        self.connection_states.insert(
            conn_id,
            ConnectionState {
                connected_at: Instant::now(),
                peer,
                abort_handle: task.abort_handle(),
            },
        );
        let _ = ready_tx.send(());

        info!(
            conn_id = %conn_id,
            peer = %peer,
            active_connections = self.connection_states.len(),
            "New connection accepted"
        );
    }

    /// Handle a single tunnel connection
    async fn handle_connection(
        conn_id: ConnectionId,
        tcp: TcpStream,
        relay: Relay,
        shutdown: watch::Receiver<bool>,
        handshake_timeout: Duration,
        connection_states: Arc<DashMap<ConnectionId, ConnectionState>>,
    ) {
        // A silent peer gives its slot back once the handshake deadline passes
        match TcpTunnelStream::accept_within(tcp, shutdown, handshake_timeout).await {
            Ok((request, stream)) => {
                debug!(client = ?request.client, "Tunnel opened");
                let reason = relay.tunnel(request, Arc::new(stream)).await;
                info!(reason = %reason, "Tunnel ended");
            }
            Err(e) => {
                warn!(error = %e, "Tunnel handshake failed");
            }
        }

        connection_states.remove(&conn_id);
        info!(
            active_connections = connection_states.len(),
            "Connection handler finished"
        );
    }

    /// Cancel open tunnels, then abort whatever is left after the grace period
    async fn shutdown(&self) {
        info!(
            active_connections = self.connection_count(),
            "Initiating graceful shutdown"
        );
        for (conn_id, stats) in self.connection_stats() {
            debug!(
                conn_id = %conn_id,
                peer = %stats.peer,
                uptime_secs = stats.uptime_secs,
                "Closing connection"
            );
        }

        self.tunnels_shutdown.send_replace(true);

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while !self.connection_states.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let conn_ids: Vec<ConnectionId> = self.connection_states.iter().map(|r| *r.key()).collect();
        for conn_id in conn_ids {
            if let Some((_, state)) = self.connection_states.remove(&conn_id) {
                warn!(conn_id = %conn_id, "Aborting connection");
                state.abort_handle.abort();
            }
        }

        info!("Shutdown complete");
    }

    /// Get number of active connections
    pub fn connection_count(&self) -> usize {
        self.connection_states.len()
    }

    /// Get connection statistics
    pub fn connection_stats(&self) -> HashMap<ConnectionId, ConnectionStats> {
        self.connection_states
            .iter()
            .map(|r| {
                let state = r.value();
                (
                    *r.key(),
                    ConnectionStats {
                        peer: state.peer,
                        uptime_secs: state.connected_at.elapsed().as_secs(),
                    },
                )
            })
            .collect()
    }
}

/// Statistics for a single connection
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    /// Remote address
    pub peer: SocketAddr,
    /// Connection uptime in seconds
    pub uptime_secs: u64,
}
