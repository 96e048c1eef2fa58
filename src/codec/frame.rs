//! Frame encoding and decoding.
//!
//! A decrypted packet payload is a sequence of tagged frames. Field order
//! is fixed per frame type and MUST remain stable for interop:
//!
//! ```text
//! padding         [0x00]
//! ping            [0x01]
//! ack             [0x02][varint bytes_since_last_ack]
//! reset_stream    [0x03][varint stream_id][varint app_error_code]
//! stop_sending    [0x04][varint stream_id][varint app_error_code]
//! crypto          [0x05][flags][varint len][bytes]
//! stream          [0x06][flags][varint stream_id][varint len][bytes]
//! protocol_close  [0x07][varint code][varint frame_type][varint len][reason]
//! app_close       [0x08][varint code][varint len][reason]
//! ```
//!
//! Every frame is classified two ways: ack-soliciting or ack-eliding, and
//! carrying app data or not. App-data frames are illegal before both
//! directions of the channel reach [`SecurityLevel::App`].
//!
//! [`SecurityLevel::App`]: crate::core::SecurityLevel

use thiserror::Error;

use super::varint::{self, VarintError};
use crate::stream::StreamId;

/// Crypto frame flag: this chunk ends a handshake record.
const CRYPTO_FLAG_END_OF_RECORD: u8 = 0x01;

/// Stream frame flag: final fragment of the stream (half-closes the
/// sender's write side).
const STREAM_FLAG_FIN: u8 = 0x01;

/// Stream frame flag: this fragment ends exactly on a data-unit boundary.
const STREAM_FLAG_BOUNDARY: u8 = 0x02;

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Filler byte, ignored by the receiver.
    Padding = 0x00,
    /// Keep-alive; solicits an ack.
    Ping = 0x01,
    /// Cumulative byte acknowledgment.
    Ack = 0x02,
    /// Abrupt abort of the sender's write side of a stream.
    ResetStream = 0x03,
    /// Abrupt abort of the sender's read side of a stream.
    StopSending = 0x04,
    /// Handshake record bytes.
    Crypto = 0x05,
    /// Application stream data fragment.
    Stream = 0x06,
    /// Fatal protocol-level close.
    ProtocolClose = 0x07,
    /// Application-requested close.
    AppClose = 0x08,
}

impl FrameType {
    /// Parse a frame type from its tag byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::Padding),
            0x01 => Some(Self::Ping),
            0x02 => Some(Self::Ack),
            0x03 => Some(Self::ResetStream),
            0x04 => Some(Self::StopSending),
            0x05 => Some(Self::Crypto),
            0x06 => Some(Self::Stream),
            0x07 => Some(Self::ProtocolClose),
            0x08 => Some(Self::AppClose),
            _ => None,
        }
    }

    /// The tag byte for this frame type.
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// A decoded wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Filler byte.
    Padding,
    /// Keep-alive.
    Ping,
    /// Cumulative acknowledgment of received bytes.
    Ack {
        /// Bytes the peer received since its previous ack.
        bytes_since_last_ack: u64,
    },
    /// Abort of the sender's write side.
    ResetStream {
        /// Target stream.
        stream_id: StreamId,
        /// Application error code.
        app_error_code: u64,
    },
    /// Abort of the sender's read side.
    StopSending {
        /// Target stream.
        stream_id: StreamId,
        /// Application error code.
        app_error_code: u64,
    },
    /// Handshake record chunk.
    Crypto {
        /// True when this chunk completes a record.
        end_of_record: bool,
        /// Opaque record bytes.
        data: Vec<u8>,
    },
    /// Stream data fragment.
    Stream {
        /// Target stream.
        stream_id: StreamId,
        /// True on the final fragment of the stream.
        fin: bool,
        /// True when the fragment ends exactly on a data-unit boundary.
        ends_on_boundary: bool,
        /// Fragment payload.
        data: Vec<u8>,
    },
    /// Fatal protocol-level close.
    ProtocolClose {
        /// Protocol error code.
        code: u64,
        /// Tag of the frame that triggered the error (0 if none).
        frame_type: u64,
        /// Optional human-readable reason bytes.
        reason: Vec<u8>,
    },
    /// Application-requested close.
    AppClose {
        /// Application close code.
        code: u64,
        /// Optional human-readable reason bytes.
        reason: Vec<u8>,
    },
}

impl Frame {
    /// The type tag of this frame.
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Padding => FrameType::Padding,
            Frame::Ping => FrameType::Ping,
            Frame::Ack { .. } => FrameType::Ack,
            Frame::ResetStream { .. } => FrameType::ResetStream,
            Frame::StopSending { .. } => FrameType::StopSending,
            Frame::Crypto { .. } => FrameType::Crypto,
            Frame::Stream { .. } => FrameType::Stream,
            Frame::ProtocolClose { .. } => FrameType::ProtocolClose,
            Frame::AppClose { .. } => FrameType::AppClose,
        }
    }

    /// Whether receiving this frame obliges the peer to schedule an ack.
    pub fn is_ack_soliciting(&self) -> bool {
        !matches!(
            self,
            Frame::Padding
                | Frame::Ack { .. }
                | Frame::ProtocolClose { .. }
                | Frame::AppClose { .. }
        )
    }

    /// Whether this frame carries application data and is therefore
    /// illegal before the channel reaches app security level.
    pub fn carries_app_data(&self) -> bool {
        matches!(
            self,
            Frame::Stream { .. } | Frame::ResetStream { .. } | Frame::StopSending { .. }
        )
    }

    /// Encoded size of this frame in bytes.
    pub fn encoded_len(&self) -> usize {
        match self {
            Frame::Padding | Frame::Ping => 1,
            Frame::Ack { bytes_since_last_ack } => 1 + varint::encoded_len(*bytes_since_last_ack),
            Frame::ResetStream {
                stream_id,
                app_error_code,
            }
            | Frame::StopSending {
                stream_id,
                app_error_code,
            } => 1 + varint::encoded_len(stream_id.encode()) + varint::encoded_len(*app_error_code),
            Frame::Crypto { data, .. } => {
                1 + 1 + varint::encoded_len(data.len() as u64) + data.len()
            }
            Frame::Stream {
                stream_id, data, ..
            } => {
                1 + 1
                    + varint::encoded_len(stream_id.encode())
                    + varint::encoded_len(data.len() as u64)
                    + data.len()
            }
            Frame::ProtocolClose {
                code,
                frame_type,
                reason,
            } => {
                1 + varint::encoded_len(*code)
                    + varint::encoded_len(*frame_type)
                    + varint::encoded_len(reason.len() as u64)
                    + reason.len()
            }
            Frame::AppClose { code, reason } => {
                1 + varint::encoded_len(*code)
                    + varint::encoded_len(reason.len() as u64)
                    + reason.len()
            }
        }
    }

    /// Append the wire encoding of this frame to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), FrameError> {
        buf.push(self.frame_type().as_byte());
        match self {
            Frame::Padding | Frame::Ping => {}
            Frame::Ack { bytes_since_last_ack } => {
                varint::encode(*bytes_since_last_ack, buf)?;
            }
            Frame::ResetStream {
                stream_id,
                app_error_code,
            }
            | Frame::StopSending {
                stream_id,
                app_error_code,
            } => {
                varint::encode(stream_id.encode(), buf)?;
                varint::encode(*app_error_code, buf)?;
            }
            Frame::Crypto { end_of_record, data } => {
                buf.push(if *end_of_record {
                    CRYPTO_FLAG_END_OF_RECORD
                } else {
                    0
                });
                varint::encode(data.len() as u64, buf)?;
                buf.extend_from_slice(data);
            }
            Frame::Stream {
                stream_id,
                fin,
                ends_on_boundary,
                data,
            } => {
                let mut flags = 0u8;
                if *fin {
                    flags |= STREAM_FLAG_FIN;
                }
                if *ends_on_boundary {
                    flags |= STREAM_FLAG_BOUNDARY;
                }
                buf.push(flags);
                varint::encode(stream_id.encode(), buf)?;
                varint::encode(data.len() as u64, buf)?;
                buf.extend_from_slice(data);
            }
            Frame::ProtocolClose {
                code,
                frame_type,
                reason,
            } => {
                varint::encode(*code, buf)?;
                varint::encode(*frame_type, buf)?;
                varint::encode(reason.len() as u64, buf)?;
                buf.extend_from_slice(reason);
            }
            Frame::AppClose { code, reason } => {
                varint::encode(*code, buf)?;
                varint::encode(reason.len() as u64, buf)?;
                buf.extend_from_slice(reason);
            }
        }
        Ok(())
    }

    /// Decode one frame from the front of `bytes`.
    ///
    /// Returns the frame and the number of bytes consumed.
    pub fn decode(bytes: &[u8]) -> Result<(Frame, usize), FrameError> {
        let tag = *bytes.first().ok_or(FrameError::Truncated)?;
        let frame_type = FrameType::from_byte(tag).ok_or(FrameError::InvalidType(tag))?;
        let mut offset = 1;

        let mut read_varint = |offset: &mut usize| -> Result<u64, FrameError> {
            let (value, used) = varint::decode(&bytes[*offset..])?;
            *offset += used;
            Ok(value)
        };

        let frame = match frame_type {
            FrameType::Padding => Frame::Padding,
            FrameType::Ping => Frame::Ping,
            FrameType::Ack => Frame::Ack {
                bytes_since_last_ack: read_varint(&mut offset)?,
            },
            FrameType::ResetStream => Frame::ResetStream {
                stream_id: StreamId::decode(read_varint(&mut offset)?),
                app_error_code: read_varint(&mut offset)?,
            },
            FrameType::StopSending => Frame::StopSending {
                stream_id: StreamId::decode(read_varint(&mut offset)?),
                app_error_code: read_varint(&mut offset)?,
            },
            FrameType::Crypto => {
                let flags = *bytes.get(offset).ok_or(FrameError::Truncated)?;
                offset += 1;
                let len = read_varint(&mut offset)? as usize;
                let data = take_bytes(bytes, &mut offset, len)?;
                Frame::Crypto {
                    end_of_record: flags & CRYPTO_FLAG_END_OF_RECORD != 0,
                    data,
                }
            }
            FrameType::Stream => {
                let flags = *bytes.get(offset).ok_or(FrameError::Truncated)?;
                offset += 1;
                let stream_id = StreamId::decode(read_varint(&mut offset)?);
                let len = read_varint(&mut offset)? as usize;
                let data = take_bytes(bytes, &mut offset, len)?;
                Frame::Stream {
                    stream_id,
                    fin: flags & STREAM_FLAG_FIN != 0,
                    ends_on_boundary: flags & STREAM_FLAG_BOUNDARY != 0,
                    data,
                }
            }
            FrameType::ProtocolClose => {
                let code = read_varint(&mut offset)?;
                let trigger = read_varint(&mut offset)?;
                let len = read_varint(&mut offset)? as usize;
                let reason = take_bytes(bytes, &mut offset, len)?;
                Frame::ProtocolClose {
                    code,
                    frame_type: trigger,
                    reason,
                }
            }
            FrameType::AppClose => {
                let code = read_varint(&mut offset)?;
                let len = read_varint(&mut offset)? as usize;
                let reason = take_bytes(bytes, &mut offset, len)?;
                Frame::AppClose { code, reason }
            }
        };
        Ok((frame, offset))
    }
}

fn take_bytes(bytes: &[u8], offset: &mut usize, len: usize) -> Result<Vec<u8>, FrameError> {
    let end = offset.checked_add(len).ok_or(FrameError::Truncated)?;
    if bytes.len() < end {
        return Err(FrameError::Truncated);
    }
    let data = bytes[*offset..end].to_vec();
    *offset = end;
    Ok(data)
}

/// Errors from frame decoding.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Frame ended before all fields were present.
    #[error("truncated frame")]
    Truncated,

    /// Unknown frame type tag.
    #[error("invalid frame type: 0x{0:02x}")]
    InvalidType(u8),
}

impl From<VarintError> for FrameError {
    fn from(_: VarintError) -> Self {
        FrameError::Truncated
    }
}
