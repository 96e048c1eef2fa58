//! Wire codecs for the QLIC protocol.
//!
//! Two framing layers compose a packet:
//!
//! - [`packet`]: the length-prefixed outer header wrapping an encrypted
//!   payload, plus the [`PacketDeframer`] that cuts packets out of the raw
//!   byte stream
//! - [`frame`]: the tagged frames that make up a decrypted packet payload
//!
//! Both build on the QUIC-style [`varint`] encoding.

pub mod frame;
pub mod packet;
pub mod varint;

pub use frame::{Frame, FrameError, FrameType};
pub use packet::{encode_packet, PacketDeframer};
