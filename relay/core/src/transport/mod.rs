//! Tunnel Transport
//!
//! How the relay reaches connected clients. A [`TunnelStream`] is the handle a
//! transport hands to [`Relay::tunnel`](crate::relay::Relay::tunnel) for each
//! accepted connection:
//!
//! - `InProcess`: channel-backed streams for embedded use and tests
//! - `Tcp`: length-prefixed, checksummed frames over TCP
//!
//! The relay never tears a connection down itself; the transport signals
//! closure through [`TunnelStream::closed`].

pub mod frame;
pub mod in_process;
pub mod tcp;
pub mod traits;

// Re-exports for convenience
pub use frame::{encode, FrameDecoder, MAX_FRAME_SIZE};
pub use in_process::InProcessStream;
pub use tcp::{TcpTunnelStream, TunnelClient, DEFAULT_HANDSHAKE_TIMEOUT};
pub use traits::{CloseReason, TransportError, TunnelStream};
