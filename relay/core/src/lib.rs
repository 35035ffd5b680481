//! Relay Core - Cross-Process Broadcast Relay for Voice/NLP Notifications
//!
//! Any process in a deployment may produce an NLP result for a client that is
//! connected to a *different* process. This crate moves every such result from
//! a shared broker to every tunnel connected to every relay process.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────────┐   broadcast()   ┌──────────────────────────────────────┐
//!  │  Producer    │ ──────────────► │   Broker (InMemory | Redis pub/sub)  │
//!  │ (NLP / STT)  │                 └───────────────┬──────────────────────┘
//!  └──────────────┘                                 │ listen()
//!                          ┌────────────────────────┼───────────────────────┐
//!                          │ relay process          ▼                       │
//!                          │              ┌───────────────────┐             │
//!                          │              │  dispatch task    │             │
//!                          │              └─────────┬─────────┘             │
//!                          │                        │ list() snapshot       │
//!                          │              ┌─────────▼─────────┐             │
//!                          │              │  SessionRegistry  │             │
//!                          │              └──┬──────┬──────┬──┘             │
//!                          │                 ▼      ▼      ▼                │
//!                          │             tunnel  tunnel  tunnel             │
//!                          └────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`Broker`]: publish/subscribe abstraction ([`InMemoryBroker`], [`RedisBroker`])
//! - [`Relay`]: owns the dispatch task and serves tunnels
//! - [`Dispatcher`]: handle for observing the dispatch task's end
//! - [`SessionRegistry`]: live sessions, safe for concurrent use
//! - [`TunnelStream`]: one client's outbound stream ([`TcpTunnelStream`], [`InProcessStream`])
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use relay_core::{Broker, InMemoryBroker, InProcessStream, QueueMessage, Relay, TunnelRequest};
//!
//! #[tokio::main]
//! async fn main() {
//!     let broker = Arc::new(InMemoryBroker::new());
//!     let (relay, _dispatcher) = Relay::start(broker.as_ref()).await.unwrap();
//!
//!     let (stream, mut client) = InProcessStream::new_pair(16);
//!     tokio::spawn({
//!         let relay = relay.clone();
//!         async move { relay.tunnel(TunnelRequest::default(), Arc::new(stream)).await }
//!     });
//!
//!     broker.broadcast(QueueMessage::new(br#"{"intent":"x"}"#.to_vec())).await.unwrap();
//!     let response = client.recv().await.unwrap();
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`broker`]: broker trait, implementations, subscription pump, backoff
//! - [`config`]: TOML + environment configuration
//! - [`messages`]: broker envelope and tunnel frames
//! - [`relay`]: dispatch loop and tunnel lifecycle
//! - [`session`]: session registry
//! - [`transport`]: tunnel streams and the frame codec

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod broker;
pub mod config;
pub mod messages;
pub mod relay;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use broker::{
    retry, spawn_subscription, Broker, BrokerError, InMemoryBroker, RedisBroker, RetryPolicy,
    Subscription,
};
pub use config::{
    default_config_path, load_config, load_config_from_path, BrokerKind, ConfigError,
    ConfigOverrides, ConfigSource, RelayConfig,
};
pub use messages::{NlpResponse, QueueMessage, TunnelRequest, TunnelResponse};
pub use relay::{
    DispatchSummary, Dispatcher, FanoutReport, Relay, RelayError, DEFAULT_SEND_TIMEOUT,
};
pub use session::{RegistryError, Session, SessionId, SessionRegistry};
pub use transport::{
    CloseReason, InProcessStream, TcpTunnelStream, TransportError, TunnelClient, TunnelStream,
    DEFAULT_HANDSHAKE_TIMEOUT,
};
