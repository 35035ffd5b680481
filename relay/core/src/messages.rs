//! Relay Messages
//!
//! Types that cross the two boundaries of the relay:
//!
//! - [`QueueMessage`]: what producers publish on the broker and what every
//!   relay process receives back from its subscription
//! - [`TunnelRequest`] / [`TunnelResponse`]: what a streaming client sends when
//!   it opens a tunnel, and what the relay pushes down to it
//!
//! Payloads are opaque. The relay never inspects an NLP body; it only moves
//! the bytes from the broker to every connected tunnel.

use serde::{Deserialize, Serialize};

use crate::broker::BrokerError;

/// A serialized NLP result produced by the intent pipeline
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NlpResponse {
    /// Opaque body, delivered to clients byte-for-byte
    pub body: Vec<u8>,
}

/// Envelope published on the broker
///
/// Carries no identity or ordering key: messages are delivered, never
/// deduplicated.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    /// The NLP result being relayed
    pub nlp_response: NlpResponse,
}

impl QueueMessage {
    /// Wrap an opaque NLP body
    #[must_use]
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            nlp_response: NlpResponse { body: body.into() },
        }
    }

    /// The opaque NLP body
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.nlp_response.body
    }

    /// Encode for the broker wire
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::Transport` if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, BrokerError> {
        serde_json::to_vec(self).map_err(|e| BrokerError::Transport(e.to_string()))
    }

    /// Decode a payload received from the broker
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::Decode` if the payload is not a valid envelope.
    pub fn decode(payload: &[u8]) -> Result<Self, BrokerError> {
        serde_json::from_slice(payload).map_err(|e| BrokerError::Decode(e.to_string()))
    }
}

/// First frame a client sends when opening a tunnel
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelRequest {
    /// Free-form client label, used only for logging
    #[serde(default)]
    pub client: Option<String>,
}

/// Frames pushed from the relay to a connected client
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TunnelResponse {
    /// An NLP result relayed from the broker
    NlpResponse {
        /// Opaque body, identical to the published payload
        body: Vec<u8>,
    },
}

impl TunnelResponse {
    /// The opaque body carried by this response
    #[must_use]
    pub fn body(&self) -> &[u8] {
        match self {
            Self::NlpResponse { body } => body,
        }
    }
}

impl From<&QueueMessage> for TunnelResponse {
    fn from(message: &QueueMessage) -> Self {
        Self::NlpResponse {
            body: message.nlp_response.body.clone(),
        }
    }
}
