//! Tunnel Frame Protocol
//!
//! Wire format between the relay and streaming clients: length-prefixed JSON
//! with a CRC32 checksum.
//!
//! # Frame Format
//!
//! ```text
//! +----------------+----------------+------------------------------------------+
//! | Length (4)     | Checksum (4)   | JSON Payload (variable)                  |
//! | big-endian u32 | CRC32          | TunnelRequest or TunnelResponse          |
//! +----------------+----------------+------------------------------------------+
//! ```
//!
//! Length covers the payload only. The maximum frame size is checked before
//! any buffer is sized from the length field.

use serde::{de::DeserializeOwned, Serialize};

use super::TransportError;

/// Maximum payload size (10 MB)
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Frame header size: 4 bytes length + 4 bytes checksum
pub const HEADER_SIZE: usize = 8;

const MIN_BUFFER_CAPACITY: usize = 4096;

/// Encode a message into a complete frame
///
/// # Errors
///
/// Returns `TransportError::Serialization` if JSON encoding fails or the
/// payload exceeds [`MAX_FRAME_SIZE`].
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, TransportError> {
    let json = serde_json::to_vec(msg).map_err(|e| TransportError::Serialization(e.to_string()))?;

    if json.len() > MAX_FRAME_SIZE {
        return Err(TransportError::Serialization(format!(
            "Frame too large: {} bytes (max: {MAX_FRAME_SIZE})",
            json.len()
        )));
    }

    let len = u32::try_from(json.len())
        .map_err(|_| TransportError::Serialization("Frame length overflow".to_string()))?;

    let mut buf = Vec::with_capacity(HEADER_SIZE + json.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&crc32fast::hash(&json).to_be_bytes());
    buf.extend_from_slice(&json);
    Ok(buf)
}

/// Streaming frame decoder
///
/// Buffers bytes as they arrive from the socket and yields complete messages.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    read_pos: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Create an empty decoder
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(MIN_BUFFER_CAPACITY),
            read_pos: 0,
        }
    }

    /// Append bytes read from the socket
    pub fn push(&mut self, data: &[u8]) {
        // Compact once most of the buffer has been consumed
        if self.read_pos > self.buffer.len() / 2 && self.read_pos > MIN_BUFFER_CAPACITY {
            self.buffer.drain(..self.read_pos);
            self.read_pos = 0;
        }
        self.buffer.extend_from_slice(data);
    }

    /// Bytes buffered but not yet decoded
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    /// Try to decode the next frame
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::ChecksumMismatch` for corrupted payloads and
    /// `TransportError::Serialization` for oversized or malformed frames.
    pub fn decode<T: DeserializeOwned>(&mut self) -> Result<Option<T>, TransportError> {
        if self.available() < HEADER_SIZE {
            return Ok(None);
        }

        let header = &self.buffer[self.read_pos..self.read_pos + HEADER_SIZE];
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let expected = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);

        if len > MAX_FRAME_SIZE {
            return Err(TransportError::Serialization(format!(
                "Frame size {len} exceeds maximum {MAX_FRAME_SIZE}"
            )));
        }

        if self.available() < HEADER_SIZE + len {
            return Ok(None);
        }

        let start = self.read_pos + HEADER_SIZE;
        let end = start + len;
        let payload = &self.buffer[start..end];

        let actual = crc32fast::hash(payload);
        if actual != expected {
            return Err(TransportError::ChecksumMismatch { expected, actual });
        }

        let msg = serde_json::from_slice(payload)
            .map_err(|e| TransportError::Serialization(e.to_string()))?;

        self.read_pos = end;
        Ok(Some(msg))
    }
}
