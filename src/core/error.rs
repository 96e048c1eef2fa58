//! Error types for the QLIC protocol.
//!
//! Two taxonomies live here. [`ProtocolError`] covers crypto/protocol
//! failures that always terminate the connection and travel in a
//! `protocol_close` frame as a numeric code. Stream-scoped application
//! errors are plain `u64` codes carried by `reset_stream`/`stop_sending`
//! frames and never unwind the connection; they are represented where the
//! stream engine reports them, not here.

use thiserror::Error;

/// Fatal crypto/protocol errors. Each variant maps to a stable wire code
/// carried in a `protocol_close` frame.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// Packet failed AEAD authentication.
    #[error("bad record MAC")]
    BadRecordMac,

    /// A handshake record or frame carried an out-of-range value.
    #[error("illegal parameter")]
    IllegalParameter,

    /// A required attestation extension was absent.
    #[error("missing extension")]
    MissingExtension,

    /// An attestation certificate or chain failed validation.
    #[error("bad certificate")]
    BadCertificate,

    /// Wire bytes could not be decoded.
    #[error("decode error")]
    DecodeError,

    /// A record or frame arrived in a state where it is not legal.
    #[error("unexpected message")]
    UnexpectedMessage,

    /// A local invariant was violated.
    #[error("internal error")]
    InternalError,

    /// The peer's identity was rejected by policy.
    #[error("access denied")]
    AccessDenied,
}

impl ProtocolError {
    /// The stable wire code for this error.
    pub fn code(self) -> u64 {
        match self {
            ProtocolError::BadRecordMac => 20,
            ProtocolError::UnexpectedMessage => 10,
            ProtocolError::BadCertificate => 42,
            ProtocolError::IllegalParameter => 47,
            ProtocolError::AccessDenied => 49,
            ProtocolError::DecodeError => 50,
            ProtocolError::InternalError => 80,
            ProtocolError::MissingExtension => 109,
        }
    }

    /// Parse a wire code back into an error, if known.
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            20 => Some(ProtocolError::BadRecordMac),
            10 => Some(ProtocolError::UnexpectedMessage),
            42 => Some(ProtocolError::BadCertificate),
            47 => Some(ProtocolError::IllegalParameter),
            49 => Some(ProtocolError::AccessDenied),
            50 => Some(ProtocolError::DecodeError),
            80 => Some(ProtocolError::InternalError),
            109 => Some(ProtocolError::MissingExtension),
            _ => None,
        }
    }
}

/// Errors in the encryption engine and key schedule.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    /// AEAD encryption failed.
    #[error("AEAD encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (invalid tag or corrupted payload).
    #[error("AEAD decryption failed (invalid tag or corrupted)")]
    DecryptionFailed,

    /// Keyed payload shorter than the authentication tag.
    #[error("payload shorter than authentication tag")]
    PayloadTooShort,

    /// Nonce counter exhausted without a key update - connection must
    /// terminate.
    #[error("nonce counter exhausted - connection must terminate")]
    NonceOverflow,

    /// Key derivation failed.
    #[error("key derivation failed")]
    KeyDerivationFailed,
}

impl From<CryptoError> for ProtocolError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::DecryptionFailed => ProtocolError::BadRecordMac,
            CryptoError::PayloadTooShort => ProtocolError::DecodeError,
            _ => ProtocolError::InternalError,
        }
    }
}

/// Errors in the flow-control engine.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FlowError {
    /// No ack arrived within the ack timeout after an ack-soliciting
    /// packet was sent.
    #[error("ack timeout - peer unresponsive")]
    AckTimeout,

    /// The peer acknowledged more bytes than are in flight.
    #[error("ack for {acked} bytes exceeds {in_flight} in flight")]
    AckOverflow {
        /// Bytes the peer acknowledged.
        acked: u64,
        /// Bytes actually in flight.
        in_flight: u64,
    },
}

/// Errors in the stream engine, scoped to a single stream.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StreamError {
    /// The stream cannot carry data in this direction.
    #[error("stream is not writable from this endpoint")]
    NotWritable,

    /// The stream's write side is already closed.
    #[error("stream write side is closed")]
    WriteClosed,

    /// The stream is not present in the stream table.
    #[error("unknown stream")]
    UnknownStream,

    /// Priority value outside the 6-bit range.
    #[error("stream priority out of range")]
    PriorityOutOfRange,
}

/// Top-level QLIC errors.
#[derive(Debug, Error)]
pub enum QlicError {
    /// Fatal protocol error, locally detected or received from the peer.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Crypto layer error.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Flow-control error.
    #[error("flow control error: {0}")]
    Flow(#[from] FlowError),

    /// Stream error.
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    /// I/O error from the underlying transport.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_code_roundtrip() {
        for err in [
            ProtocolError::BadRecordMac,
            ProtocolError::IllegalParameter,
            ProtocolError::MissingExtension,
            ProtocolError::BadCertificate,
            ProtocolError::DecodeError,
            ProtocolError::UnexpectedMessage,
            ProtocolError::InternalError,
            ProtocolError::AccessDenied,
        ] {
            assert_eq!(ProtocolError::from_code(err.code()), Some(err));
        }
        assert_eq!(ProtocolError::from_code(9999), None);
    }

    #[test]
    fn test_crypto_error_maps_to_protocol_code() {
        assert_eq!(
            ProtocolError::from(CryptoError::DecryptionFailed),
            ProtocolError::BadRecordMac
        );
        assert_eq!(
            ProtocolError::from(CryptoError::NonceOverflow),
            ProtocolError::InternalError
        );
    }
}
