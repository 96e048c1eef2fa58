//! Packet encoding and deframing.
//!
//! A packet is the outer transport-framing unit:
//!
//! ```text
//! +----------------------+---------------------------+
//! | varint payload length | payload (ciphertext+tag) |
//! +----------------------+---------------------------+
//! ```
//!
//! Packets carry no semantic identity beyond the payload length; the tag
//! is absent before the handshake installs traffic keys. The underlying
//! transport is ordered and reliable, so the [`PacketDeframer`] only has
//! to accumulate bytes and cut complete payloads, never reorder.

use thiserror::Error;

use super::varint;
use crate::core::MAX_PACKET_SIZE;

/// Encode a packet around an already-sealed payload.
pub fn encode_packet(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(payload.len() + 4);
    // Payload length is capped well below the varint range.
    varint::encode(payload.len() as u64, &mut buf).expect("payload length fits varint range");
    buf.extend_from_slice(payload);
    buf
}

/// Errors from packet deframing.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
    /// Advertised payload length exceeds the protocol cap.
    #[error("packet payload of {0} bytes exceeds maximum")]
    TooLarge(usize),
}

/// Accumulates raw transport bytes and yields complete packet payloads.
#[derive(Debug, Default)]
pub struct PacketDeframer {
    buf: Vec<u8>,
}

impl PacketDeframer {
    /// Create an empty deframer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes from the transport.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete packet payload, if one has fully arrived.
    pub fn next_packet(&mut self) -> Result<Option<Vec<u8>>, PacketError> {
        let (len, header) = match varint::decode(&self.buf) {
            Ok(decoded) => decoded,
            Err(_) => return Ok(None), // header not complete yet
        };
        let len = len as usize;
        if len > MAX_PACKET_SIZE {
            return Err(PacketError::TooLarge(len));
        }
        if self.buf.len() < header + len {
            return Ok(None);
        }
        let payload = self.buf[header..header + len].to_vec();
        self.buf.drain(..header + len);
        Ok(Some(payload))
    }

    /// Bytes currently buffered but not yet cut into a packet.
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }
}
