//! TCP Tunnel Transport
//!
//! Streaming connections over TCP using the checksummed frame protocol.
//!
//! # Session Flow
//!
//! ```text
//! client                               relay
//!   │ ── TunnelRequest frame ──────────► │  accept(): handshake (with deadline)
//!   │                                    │  Relay::tunnel(): register
//!   │ ◄── TunnelResponse frame ───────── │  fanout (repeated)
//!   │ ◄── TunnelResponse frame ───────── │
//!   │ ── FIN ──────────────────────────► │  closed(): Disconnected
//! ```
//!
//! After the handshake the relay only writes. Anything else the client sends
//! is read and discarded so that EOF can be observed.
//!
//! A frame write that is abandoned halfway (the caller's deadline expired)
//! leaves the client mid-frame. The stream is then broken: further sends
//! fail and `closed()` resolves with [`CloseReason::Failed`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, trace, warn};

use crate::config::DEFAULT_HANDSHAKE_TIMEOUT_MS;
use crate::messages::{TunnelRequest, TunnelResponse};

use super::frame::{encode, FrameDecoder};
use super::traits::{CloseReason, TransportError, TunnelStream};

const READ_BUFFER_SIZE: usize = 8192;

/// How long a new connection gets to send its opening request
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration =
    Duration::from_millis(DEFAULT_HANDSHAKE_TIMEOUT_MS);

/// Reads whole frames off a byte stream
struct FrameReader<R> {
    inner: R,
    decoder: FrameDecoder,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            decoder: FrameDecoder::new(),
            buf: vec![0u8; READ_BUFFER_SIZE],
        }
    }

    /// Next frame, or `None` on EOF between frames
    async fn read_frame<T: DeserializeOwned>(&mut self) -> Result<Option<T>, TransportError> {
        loop {
            if let Some(msg) = self.decoder.decode()? {
                return Ok(Some(msg));
            }

            let n = self.inner.read(&mut self.buf).await?;
            if n == 0 {
                if self.decoder.available() == 0 {
                    return Ok(None);
                }
                return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
            }
            self.decoder.push(&self.buf[..n]);
        }
    }

    fn into_inner(self) -> R {
        self.inner
    }
}

/// Server side of an accepted TCP tunnel
pub struct TcpTunnelStream {
    peer: SocketAddr,
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    shutdown: watch::Receiver<bool>,
    broken: AtomicBool,
    broken_notify: Notify,
}

/// Marks the stream broken unless the frame write completes
struct WriteGuard<'a> {
    stream: &'a TcpTunnelStream,
    completed: bool,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.stream.broken.store(true, Ordering::SeqCst);
            self.stream.broken_notify.notify_one();
        }
    }
}

impl TcpTunnelStream {
    /// Read the opening [`TunnelRequest`] and wrap the connection
    ///
    /// Uses [`DEFAULT_HANDSHAKE_TIMEOUT`]; see [`TcpTunnelStream::accept_within`].
    ///
    /// # Errors
    ///
    /// Same as [`TcpTunnelStream::accept_within`].
    pub async fn accept(
        stream: TcpStream,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(TunnelRequest, Self), TransportError> {
        Self::accept_within(stream, shutdown, DEFAULT_HANDSHAKE_TIMEOUT).await
    }

    /// Read the opening [`TunnelRequest`] within `deadline` and wrap the connection
    ///
    /// `shutdown` flips to `true` when the server is stopping; `closed()`
    /// then resolves with [`CloseReason::Cancelled`].
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Handshake` if the peer closes, stays silent
    /// past `deadline`, or sends an invalid frame before the request arrives.
    pub async fn accept_within(
        stream: TcpStream,
        shutdown: watch::Receiver<bool>,
        deadline: Duration,
    ) -> Result<(TunnelRequest, Self), TransportError> {
        let peer = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        let mut frames = FrameReader::new(read_half);

        let handshake = frames.read_frame::<TunnelRequest>();
        let request = match tokio::time::timeout(deadline, handshake).await {
            Ok(Ok(Some(request))) => request,
            Ok(Ok(None)) => {
                return Err(TransportError::Handshake(
                    "Connection closed before handshake".to_string(),
                ))
            }
            Ok(Err(e)) => return Err(TransportError::Handshake(e.to_string())),
            Err(_) => {
                return Err(TransportError::Handshake(format!(
                    "No handshake within {}ms",
                    deadline.as_millis()
                )))
            }
        };

        debug!(peer = %peer, client = ?request.client, "Tunnel handshake complete");

        Ok((
            request,
            Self {
                peer,
                reader: Mutex::new(frames.into_inner()),
                writer: Mutex::new(write_half),
                shutdown,
                broken: AtomicBool::new(false),
                broken_notify: Notify::new(),
            },
        ))
    }

    /// Remote address of the client
    #[must_use]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn broken_error() -> TransportError {
        TransportError::SendFailed("Stream broken by an interrupted frame write".to_string())
    }
}

#[async_trait]
impl TunnelStream for TcpTunnelStream {
    async fn send(&self, response: &TunnelResponse) -> Result<(), TransportError> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(Self::broken_error());
        }

        let frame = encode(response)?;
        let mut writer = self.writer.lock().await;

        let mut guard = WriteGuard {
            stream: self,
            completed: false,
        };
        writer
            .write_all(&frame)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        guard.completed = true;
        Ok(())
    }

    async fn closed(&self) -> CloseReason {
        let mut shutdown = self.shutdown.clone();
        if *shutdown.borrow() {
            return CloseReason::Cancelled;
        }
        if self.broken.load(Ordering::SeqCst) {
            return CloseReason::Failed(Self::broken_error());
        }

        let mut reader = self.reader.lock().await;
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let mut watching = true;

        loop {
            tokio::select! {
                changed = shutdown.changed(), if watching => {
                    match changed {
                        Ok(()) => {
                            if *shutdown.borrow() {
                                return CloseReason::Cancelled;
                            }
                        }
                        // Shutdown sender gone: only the socket can end us now
                        Err(_) => watching = false,
                    }
                }
                () = self.broken_notify.notified() => {
                    warn!(peer = %self.peer, "Frame write interrupted, closing tunnel");
                    return CloseReason::Failed(Self::broken_error());
                }
                read = reader.read(&mut buf) => match read {
                    Ok(0) => return CloseReason::Disconnected,
                    Ok(n) => trace!(peer = %self.peer, bytes = n, "Discarding inbound bytes"),
                    Err(e) => return CloseReason::Failed(e.into()),
                }
            }
        }
    }
}

/// Client side of a TCP tunnel
pub struct TunnelClient {
    frames: FrameReader<TcpStream>,
}

impl TunnelClient {
    /// Connect and send the opening request
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or the handshake write fails.
    pub async fn connect(
        addr: impl ToSocketAddrs,
        request: &TunnelRequest,
    ) -> Result<Self, TransportError> {
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(&encode(request)?).await?;

        Ok(Self {
            frames: FrameReader::new(stream),
        })
    }

    /// Wait for the next response from the relay
    ///
    /// # Errors
    ///
    /// Returns `TransportError::ConnectionClosed` when the relay closes the
    /// connection, or a decode/IO error.
    pub async fn recv(&mut self) -> Result<TunnelResponse, TransportError> {
        self.frames
            .read_frame()
            .await?
            .ok_or(TransportError::ConnectionClosed)
    }
}
