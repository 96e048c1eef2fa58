//! Handshake record encoding, decoding, and reassembly.
//!
//! Records travel as opaque byte blobs inside `crypto` frames. A record
//! is a type byte followed by length-delimited fields:
//!
//! ```text
//! +------+----------------+----------------+ ...
//! | type | varint len | f0 | varint len | f1 |
//! +------+----------------+----------------+ ...
//! ```
//!
//! A record that spans multiple crypto frames is reassembled by
//! [`RecordAssembler`] before being interpreted, and a fully delivered
//! record is dispatched exactly once.

use thiserror::Error;

use super::auth::AuthAlgorithm;
use crate::codec::varint;
use crate::core::{HELLO_RANDOM_SIZE, KEY_SHARE_SIZE, MAX_RECORD_SIZE};

/// Handshake record type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// Client hello: random, key share, advertised algorithm lists.
    ClientHello = 1,
    /// Server hello: random, key share.
    ServerHello = 2,
    /// Server's choice of authentication algorithms.
    AuthenticationRequest = 3,
    /// Algorithm-specific attestation payload.
    AuthenticationShare = 4,
    /// Signature over the signing context.
    AuthenticationVerify = 5,
    /// Post-handshake key-update signaling.
    KeyUpdate = 6,
}

impl RecordType {
    /// Parse a record type from its tag byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::ClientHello),
            2 => Some(Self::ServerHello),
            3 => Some(Self::AuthenticationRequest),
            4 => Some(Self::AuthenticationShare),
            5 => Some(Self::AuthenticationVerify),
            6 => Some(Self::KeyUpdate),
            _ => None,
        }
    }

    /// The tag byte for this record type.
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Errors from record decoding and reassembly.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordError {
    /// Record ended before all fields were complete.
    #[error("truncated record")]
    Truncated,

    /// Unknown record type tag.
    #[error("unknown record type: {0}")]
    UnknownType(u8),

    /// Wrong number of fields for the record type.
    #[error("record has {actual} fields, expected {expected}")]
    FieldCount {
        /// Fields the record type defines.
        expected: usize,
        /// Fields actually present.
        actual: usize,
    },

    /// A field had an invalid length for its type.
    #[error("invalid field length")]
    FieldLength,

    /// Reassembled record exceeds the protocol cap.
    #[error("record exceeds {MAX_RECORD_SIZE} bytes")]
    TooLarge,

    /// A field carried an invalid value.
    #[error("invalid field value")]
    InvalidValue,
}

/// A decoded record before type-specific interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    /// The record type tag (may be unknown to this implementation).
    pub kind: u8,
    /// The length-delimited fields, in order.
    pub fields: Vec<Vec<u8>>,
}

impl RawRecord {
    /// Build a record from its parts.
    pub fn new(kind: RecordType, fields: Vec<Vec<u8>>) -> Self {
        Self {
            kind: kind.as_byte(),
            fields,
        }
    }

    /// Encode to record bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.kind];
        for field in &self.fields {
            let _ = varint::encode(field.len() as u64, &mut out);
            out.extend_from_slice(field);
        }
        out
    }

    /// Decode full record bytes. The whole buffer must be consumed.
    pub fn decode(bytes: &[u8]) -> Result<Self, RecordError> {
        let kind = *bytes.first().ok_or(RecordError::Truncated)?;
        let mut fields = Vec::new();
        let mut offset = 1;
        while offset < bytes.len() {
            let (len, used) =
                varint::decode(&bytes[offset..]).map_err(|_| RecordError::Truncated)?;
            offset += used;
            let end = offset
                .checked_add(len as usize)
                .filter(|end| *end <= bytes.len())
                .ok_or(RecordError::Truncated)?;
            fields.push(bytes[offset..end].to_vec());
            offset = end;
        }
        Ok(Self { kind, fields })
    }

    fn expect_fields(&self, expected: usize) -> Result<(), RecordError> {
        if self.fields.len() != expected {
            return Err(RecordError::FieldCount {
                expected,
                actual: self.fields.len(),
            });
        }
        Ok(())
    }
}

/// Reassembles handshake records from crypto-frame chunks.
///
/// Chunks accumulate until one arrives flagged end-of-record; the
/// assembled bytes are then returned exactly once and the buffer resets.
#[derive(Debug, Default)]
pub struct RecordAssembler {
    buf: Vec<u8>,
}

impl RecordAssembler {
    /// Create an empty assembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one crypto-frame chunk.
    ///
    /// Returns the complete record bytes when `end_of_record` closes it.
    pub fn push(
        &mut self,
        end_of_record: bool,
        chunk: &[u8],
    ) -> Result<Option<Vec<u8>>, RecordError> {
        if self.buf.len() + chunk.len() > MAX_RECORD_SIZE {
            return Err(RecordError::TooLarge);
        }
        self.buf.extend_from_slice(chunk);
        if !end_of_record {
            return Ok(None);
        }
        if self.buf.is_empty() {
            return Err(RecordError::Truncated);
        }
        Ok(Some(std::mem::take(&mut self.buf)))
    }

    /// Whether a partial record is buffered.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}

// =============================================================================
// Typed records
// =============================================================================

/// ClientHello: opens the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    /// 32 bytes of client entropy.
    pub random: [u8; HELLO_RANDOM_SIZE],
    /// Uncompressed SEC1 P-384 ephemeral public key.
    pub key_share: Vec<u8>,
    /// Algorithms the client can prove its own identity with.
    pub client_algorithms: Vec<AuthAlgorithm>,
    /// Algorithms the client accepts from the server.
    pub server_algorithms: Vec<AuthAlgorithm>,
}

fn decode_algorithms(field: &[u8]) -> Result<Vec<AuthAlgorithm>, RecordError> {
    if field.is_empty() {
        return Err(RecordError::InvalidValue);
    }
    field
        .iter()
        .map(|byte| AuthAlgorithm::from_byte(*byte).ok_or(RecordError::InvalidValue))
        .collect()
}

fn encode_algorithms(algorithms: &[AuthAlgorithm]) -> Vec<u8> {
    algorithms.iter().map(|alg| alg.as_byte()).collect()
}

impl ClientHello {
    /// Encode to a raw record.
    pub fn to_raw(&self) -> RawRecord {
        RawRecord::new(
            RecordType::ClientHello,
            vec![
                self.random.to_vec(),
                self.key_share.clone(),
                encode_algorithms(&self.client_algorithms),
                encode_algorithms(&self.server_algorithms),
            ],
        )
    }

    /// Interpret a raw record.
    pub fn from_raw(raw: &RawRecord) -> Result<Self, RecordError> {
        raw.expect_fields(4)?;
        let random: [u8; HELLO_RANDOM_SIZE] = raw.fields[0]
            .as_slice()
            .try_into()
            .map_err(|_| RecordError::FieldLength)?;
        if raw.fields[1].len() != KEY_SHARE_SIZE {
            return Err(RecordError::FieldLength);
        }
        Ok(Self {
            random,
            key_share: raw.fields[1].clone(),
            client_algorithms: decode_algorithms(&raw.fields[2])?,
            server_algorithms: decode_algorithms(&raw.fields[3])?,
        })
    }
}

/// ServerHello: the server's entropy and key share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHello {
    /// 32 bytes of server entropy.
    pub random: [u8; HELLO_RANDOM_SIZE],
    /// Uncompressed SEC1 P-384 ephemeral public key.
    pub key_share: Vec<u8>,
}

impl ServerHello {
    /// Encode to a raw record.
    pub fn to_raw(&self) -> RawRecord {
        RawRecord::new(
            RecordType::ServerHello,
            vec![self.random.to_vec(), self.key_share.clone()],
        )
    }

    /// Interpret a raw record.
    pub fn from_raw(raw: &RawRecord) -> Result<Self, RecordError> {
        raw.expect_fields(2)?;
        let random: [u8; HELLO_RANDOM_SIZE] = raw.fields[0]
            .as_slice()
            .try_into()
            .map_err(|_| RecordError::FieldLength)?;
        if raw.fields[1].len() != KEY_SHARE_SIZE {
            return Err(RecordError::FieldLength);
        }
        Ok(Self {
            random,
            key_share: raw.fields[1].clone(),
        })
    }
}

/// AuthenticationRequest: the server's pick from each advertised list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthenticationRequest {
    /// Index into the client's advertised algorithm list.
    pub client_index: u8,
    /// Index into the server's advertised algorithm list.
    pub server_index: u8,
}

impl AuthenticationRequest {
    /// Encode to a raw record.
    pub fn to_raw(&self) -> RawRecord {
        RawRecord::new(
            RecordType::AuthenticationRequest,
            vec![vec![self.client_index], vec![self.server_index]],
        )
    }

    /// Interpret a raw record.
    pub fn from_raw(raw: &RawRecord) -> Result<Self, RecordError> {
        raw.expect_fields(2)?;
        if raw.fields[0].len() != 1 || raw.fields[1].len() != 1 {
            return Err(RecordError::FieldLength);
        }
        Ok(Self {
            client_index: raw.fields[0][0],
            server_index: raw.fields[1][0],
        })
    }
}

/// AuthenticationShare: an algorithm-specific attestation payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticationShare {
    /// Opaque payload interpreted by the negotiated verifier.
    pub payload: Vec<u8>,
}

impl AuthenticationShare {
    /// Encode to a raw record.
    pub fn to_raw(&self) -> RawRecord {
        RawRecord::new(RecordType::AuthenticationShare, vec![self.payload.clone()])
    }

    /// Interpret a raw record.
    pub fn from_raw(raw: &RawRecord) -> Result<Self, RecordError> {
        raw.expect_fields(1)?;
        Ok(Self {
            payload: raw.fields[0].clone(),
        })
    }
}

/// AuthenticationVerify: a signature over the signing context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticationVerify {
    /// The signature bytes.
    pub signature: Vec<u8>,
}

impl AuthenticationVerify {
    /// Encode to a raw record.
    pub fn to_raw(&self) -> RawRecord {
        RawRecord::new(
            RecordType::AuthenticationVerify,
            vec![self.signature.clone()],
        )
    }

    /// Interpret a raw record.
    pub fn from_raw(raw: &RawRecord) -> Result<Self, RecordError> {
        raw.expect_fields(1)?;
        Ok(Self {
            signature: raw.fields[0].clone(),
        })
    }
}

/// KeyUpdate: post-handshake key rotation signaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyUpdate {
    /// True when the sender asks the peer to rotate as well.
    pub update_requested: bool,
}

impl KeyUpdate {
    /// Encode to a raw record.
    pub fn to_raw(&self) -> RawRecord {
        RawRecord::new(
            RecordType::KeyUpdate,
            vec![vec![u8::from(self.update_requested)]],
        )
    }

    /// Interpret a raw record.
    pub fn from_raw(raw: &RawRecord) -> Result<Self, RecordError> {
        raw.expect_fields(1)?;
        if raw.fields[0].len() != 1 {
            return Err(RecordError::FieldLength);
        }
        match raw.fields[0][0] {
            0 => Ok(Self {
                update_requested: false,
            }),
            1 => Ok(Self {
                update_requested: true,
            }),
            _ => Err(RecordError::InvalidValue),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_type_roundtrip() {
        for tag in 1..=6u8 {
            let kind = RecordType::from_byte(tag).unwrap();
            assert_eq!(kind.as_byte(), tag);
        }
        assert_eq!(RecordType::from_byte(0), None);
        assert_eq!(RecordType::from_byte(7), None);
    }

    #[test]
    fn test_raw_record_roundtrip() {
        let record = RawRecord::new(
            RecordType::ServerHello,
            vec![vec![1, 2, 3], Vec::new(), vec![0xFF; 300]],
        );
        let bytes = record.encode();
        assert_eq!(RawRecord::decode(&bytes).unwrap(), record);
    }

    #[test]
    fn test_raw_record_truncated() {
        let record = RawRecord::new(RecordType::ServerHello, vec![vec![1, 2, 3, 4]]);
        let bytes = record.encode();
        assert_eq!(
            RawRecord::decode(&bytes[..bytes.len() - 1]),
            Err(RecordError::Truncated)
        );
        assert_eq!(RawRecord::decode(&[]), Err(RecordError::Truncated));
    }

    #[test]
    fn test_assembler_single_chunk() {
        let mut assembler = RecordAssembler::new();
        let record = assembler.push(true, &[2, 1, 0x42]).unwrap();
        assert_eq!(record, Some(vec![2, 1, 0x42]));
        assert!(!assembler.has_partial());
    }

    #[test]
    fn test_assembler_fragmented_record() {
        // Two fragments; the assembled record's first two length-prefixed
        // fields decode to [2] and [0, 1, 2].
        let mut assembler = RecordAssembler::new();
        assert_eq!(assembler.push(false, &[2, 1, 2]).unwrap(), None);
        assert!(assembler.has_partial());

        let record = assembler.push(true, &[3, 0, 1, 2]).unwrap().unwrap();
        let raw = RawRecord::decode(&record).unwrap();
        assert_eq!(raw.kind, RecordType::ServerHello.as_byte());
        assert_eq!(raw.fields.len(), 2);
        assert_eq!(raw.fields[0], vec![2]);
        assert_eq!(raw.fields[1], vec![0, 1, 2]);
    }

    #[test]
    fn test_assembler_dispatches_once() {
        let mut assembler = RecordAssembler::new();
        assert!(assembler.push(true, &[6, 1, 1]).unwrap().is_some());
        // Buffer reset: the next record starts clean.
        assert_eq!(assembler.push(false, &[6, 1]).unwrap(), None);
        assert_eq!(assembler.push(true, &[0]).unwrap(), Some(vec![6, 1, 0]));
    }

    #[test]
    fn test_assembler_rejects_oversized() {
        let mut assembler = RecordAssembler::new();
        assert_eq!(
            assembler.push(false, &vec![0u8; MAX_RECORD_SIZE + 1]),
            Err(RecordError::TooLarge)
        );
    }

    #[test]
    fn test_assembler_rejects_empty_record() {
        let mut assembler = RecordAssembler::new();
        assert_eq!(assembler.push(true, &[]), Err(RecordError::Truncated));
    }

    fn hello_fixture() -> ClientHello {
        ClientHello {
            random: [0x5A; HELLO_RANDOM_SIZE],
            key_share: vec![0x04; KEY_SHARE_SIZE],
            client_algorithms: vec![
                AuthAlgorithm::AppAttestation,
                AuthAlgorithm::PreTrustedKey,
            ],
            server_algorithms: vec![AuthAlgorithm::KeystoreAttestation],
        }
    }

    #[test]
    fn test_client_hello_roundtrip() {
        let hello = hello_fixture();
        let raw = hello.to_raw();
        assert_eq!(ClientHello::from_raw(&raw).unwrap(), hello);

        let bytes = raw.encode();
        let decoded = RawRecord::decode(&bytes).unwrap();
        assert_eq!(ClientHello::from_raw(&decoded).unwrap(), hello);
    }

    #[test]
    fn test_client_hello_validation() {
        let hello = hello_fixture();

        let mut short_share = hello.to_raw();
        short_share.fields[1].pop();
        assert_eq!(
            ClientHello::from_raw(&short_share),
            Err(RecordError::FieldLength)
        );

        let mut unknown_alg = hello.to_raw();
        unknown_alg.fields[2] = vec![0x99];
        assert_eq!(
            ClientHello::from_raw(&unknown_alg),
            Err(RecordError::InvalidValue)
        );

        let mut empty_algs = hello.to_raw();
        empty_algs.fields[3] = Vec::new();
        assert_eq!(
            ClientHello::from_raw(&empty_algs),
            Err(RecordError::InvalidValue)
        );

        let mut missing_field = hello.to_raw();
        missing_field.fields.pop();
        assert!(matches!(
            ClientHello::from_raw(&missing_field),
            Err(RecordError::FieldCount { expected: 4, .. })
        ));
    }

    #[test]
    fn test_server_hello_roundtrip() {
        let hello = ServerHello {
            random: [0x11; HELLO_RANDOM_SIZE],
            key_share: vec![0x04; KEY_SHARE_SIZE],
        };
        let bytes = hello.to_raw().encode();
        let decoded = RawRecord::decode(&bytes).unwrap();
        assert_eq!(ServerHello::from_raw(&decoded).unwrap(), hello);
    }

    #[test]
    fn test_auth_request_roundtrip() {
        let request = AuthenticationRequest {
            client_index: 1,
            server_index: 0,
        };
        let bytes = request.to_raw().encode();
        let decoded = RawRecord::decode(&bytes).unwrap();
        assert_eq!(AuthenticationRequest::from_raw(&decoded).unwrap(), request);
    }

    #[test]
    fn test_key_update_roundtrip() {
        for requested in [false, true] {
            let update = KeyUpdate {
                update_requested: requested,
            };
            let bytes = update.to_raw().encode();
            let decoded = RawRecord::decode(&bytes).unwrap();
            assert_eq!(KeyUpdate::from_raw(&decoded).unwrap(), update);
        }

        let bad = RawRecord::new(RecordType::KeyUpdate, vec![vec![2]]);
        assert_eq!(KeyUpdate::from_raw(&bad), Err(RecordError::InvalidValue));
    }
}
