//! Pluggable handshake authentication.
//!
//! Authentication is negotiated: each side advertises the algorithms it
//! can prove its own identity with, the device picks one index per
//! direction, and from then on exactly one [`AuthProvider`] (local
//! identity) and one [`AuthVerifier`] (remote identity) are active.
//! Selection happens via the negotiated index, never by inspecting the
//! concrete type.
//!
//! Every scheme signs the same context: 64 bytes of 0x20, an ASCII string
//! distinguishing the signer's role, a zero separator, then the transcript
//! hash. Binding the transcript hash means a signature (or attestation
//! challenge) from one handshake can never be replayed into another.

use p384::ecdsa::signature::{Signer, Verifier};
use p384::ecdsa::{Signature, SigningKey, VerifyingKey};
use thiserror::Error;

use crate::core::{ProtocolError, Role, HASH_SIZE};

/// Context string for signatures made by the client side.
const CONTEXT_CLIENT: &[u8] = b"QLIC 1.0, client attestation";

/// Context string for signatures made by the server side.
const CONTEXT_SERVER: &[u8] = b"QLIC 1.0, server attestation";

/// The closed set of authentication schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AuthAlgorithm {
    /// ECDSA-P384 signature with a pre-shared, pre-trusted public key.
    PreTrustedKey = 1,
    /// Hardware-keystore attestation certificate chain.
    KeystoreAttestation = 2,
    /// App-attestation-service statement, for platforms without hardware
    /// keystore attestation.
    AppAttestation = 3,
    /// Generic X.509 certificate chain to pinned roots.
    X509Chain = 4,
}

impl AuthAlgorithm {
    /// Parse an algorithm from its wire code.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::PreTrustedKey),
            2 => Some(Self::KeystoreAttestation),
            3 => Some(Self::AppAttestation),
            4 => Some(Self::X509Chain),
            _ => None,
        }
    }

    /// The wire code for this algorithm.
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Errors from authentication providers and verifiers.
///
/// Every variant is fatal to the handshake; nothing here is silently
/// downgraded.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Wire code does not name a known algorithm.
    #[error("unknown authentication algorithm: {0}")]
    UnknownAlgorithm(u8),

    /// The presented key is not the pinned one.
    #[error("presented key is not trusted")]
    UntrustedKey,

    /// Signature verification failed.
    #[error("signature verification failed")]
    BadSignature,

    /// The attestation challenge does not equal the transcript hash.
    #[error("attestation challenge does not match transcript")]
    ChallengeMismatch,

    /// Certificate or chain validation failed.
    #[error("certificate validation failed: {0}")]
    BadCertificate(String),

    /// The attestation extension is absent from the leaf certificate.
    #[error("attestation extension missing")]
    MissingExtension,

    /// The attestation violates the configured security policy.
    #[error("attestation policy violation: {0}")]
    PolicyViolation(&'static str),

    /// The share payload could not be decoded.
    #[error("malformed authentication share")]
    MalformedShare,

    /// The platform could not produce an attestation.
    #[error("attestation unavailable: {0}")]
    Unavailable(String),
}

impl From<AuthError> for ProtocolError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::UnknownAlgorithm(_) => ProtocolError::IllegalParameter,
            AuthError::BadCertificate(_) => ProtocolError::BadCertificate,
            AuthError::MissingExtension => ProtocolError::MissingExtension,
            AuthError::MalformedShare => ProtocolError::DecodeError,
            AuthError::Unavailable(_) => ProtocolError::InternalError,
            AuthError::UntrustedKey
            | AuthError::BadSignature
            | AuthError::ChallengeMismatch
            | AuthError::PolicyViolation(_) => ProtocolError::AccessDenied,
        }
    }
}

/// Build the byte string every authentication signature covers.
///
/// ```text
/// [0x20 x 64][context string for the signer's role][0x00][transcript hash]
/// ```
pub fn signing_context(signer: Role, transcript_hash: &[u8; HASH_SIZE]) -> Vec<u8> {
    let context = match signer {
        Role::Client => CONTEXT_CLIENT,
        Role::Server => CONTEXT_SERVER,
    };
    let mut out = Vec::with_capacity(64 + context.len() + 1 + HASH_SIZE);
    out.extend_from_slice(&[0x20u8; 64]);
    out.extend_from_slice(context);
    out.push(0x00);
    out.extend_from_slice(transcript_hash);
    out
}

/// Proves the local identity during the handshake.
///
/// Tied to exactly one [`AuthAlgorithm`]; the handshake engine invokes the
/// provider whose algorithm the peer selected.
pub trait AuthProvider: Send {
    /// The algorithm this provider implements.
    fn algorithm(&self) -> AuthAlgorithm;

    /// Produce the algorithm-specific attestation payload for the
    /// `AuthenticationShare` record. The transcript hash is the challenge
    /// the payload must bind.
    fn make_share_data(&mut self, transcript_hash: &[u8; HASH_SIZE])
        -> Result<Vec<u8>, AuthError>;

    /// Sign the verification context for the `AuthenticationVerify`
    /// record.
    fn make_verify_signature(
        &self,
        transcript_hash: &[u8; HASH_SIZE],
    ) -> Result<Vec<u8>, AuthError>;
}

/// Verifies the remote identity during the handshake.
///
/// `verify_share` runs first and may retain state (the attested key);
/// `verify_signature` then checks the signature over the signing context.
pub trait AuthVerifier: Send {
    /// The algorithm this verifier accepts.
    fn algorithm(&self) -> AuthAlgorithm;

    /// Validate the peer's `AuthenticationShare` payload against the
    /// transcript hash.
    fn verify_share(
        &mut self,
        share: &[u8],
        transcript_hash: &[u8; HASH_SIZE],
    ) -> Result<(), AuthError>;

    /// Validate the peer's `AuthenticationVerify` signature.
    fn verify_signature(
        &self,
        signature: &[u8],
        transcript_hash: &[u8; HASH_SIZE],
    ) -> Result<(), AuthError>;
}

/// Local identity backed by a pre-trusted ECDSA-P384 key.
pub struct PreTrustedKeyProvider {
    key: SigningKey,
    role: Role,
}

impl PreTrustedKeyProvider {
    /// Create a provider signing as `role` with `key`.
    pub fn new(key: SigningKey, role: Role) -> Self {
        Self { key, role }
    }

    /// The public half of the signing key.
    pub fn verifying_key(&self) -> VerifyingKey {
        *self.key.verifying_key()
    }
}

impl AuthProvider for PreTrustedKeyProvider {
    fn algorithm(&self) -> AuthAlgorithm {
        AuthAlgorithm::PreTrustedKey
    }

    fn make_share_data(
        &mut self,
        _transcript_hash: &[u8; HASH_SIZE],
    ) -> Result<Vec<u8>, AuthError> {
        // The share is the public key itself; trust comes from pinning on
        // the other side, the transcript is bound by the signature.
        Ok(self
            .key
            .verifying_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec())
    }

    fn make_verify_signature(
        &self,
        transcript_hash: &[u8; HASH_SIZE],
    ) -> Result<Vec<u8>, AuthError> {
        let context = signing_context(self.role, transcript_hash);
        let signature: Signature = self.key.sign(&context);
        Ok(signature.to_vec())
    }
}

/// Remote identity pinned to one ECDSA-P384 public key.
pub struct PreTrustedKeyVerifier {
    pinned: VerifyingKey,
    signer: Role,
}

impl PreTrustedKeyVerifier {
    /// Create a verifier expecting signatures made by `signer` with the
    /// pinned key.
    pub fn new(pinned: VerifyingKey, signer: Role) -> Self {
        Self { pinned, signer }
    }
}

impl AuthVerifier for PreTrustedKeyVerifier {
    fn algorithm(&self) -> AuthAlgorithm {
        AuthAlgorithm::PreTrustedKey
    }

    fn verify_share(
        &mut self,
        share: &[u8],
        _transcript_hash: &[u8; HASH_SIZE],
    ) -> Result<(), AuthError> {
        let presented =
            VerifyingKey::from_sec1_bytes(share).map_err(|_| AuthError::MalformedShare)?;
        if presented != self.pinned {
            return Err(AuthError::UntrustedKey);
        }
        Ok(())
    }

    fn verify_signature(
        &self,
        signature: &[u8],
        transcript_hash: &[u8; HASH_SIZE],
    ) -> Result<(), AuthError> {
        let signature = Signature::from_slice(signature).map_err(|_| AuthError::BadSignature)?;
        let context = signing_context(self.signer, transcript_hash);
        self.pinned
            .verify(&context, &signature)
            .map_err(|_| AuthError::BadSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn test_algorithm_roundtrip() {
        for alg in [
            AuthAlgorithm::PreTrustedKey,
            AuthAlgorithm::KeystoreAttestation,
            AuthAlgorithm::AppAttestation,
            AuthAlgorithm::X509Chain,
        ] {
            assert_eq!(AuthAlgorithm::from_byte(alg.as_byte()), Some(alg));
        }
        assert_eq!(AuthAlgorithm::from_byte(0), None);
        assert_eq!(AuthAlgorithm::from_byte(5), None);
    }

    #[test]
    fn test_signing_context_layout() {
        let hash = [0xABu8; HASH_SIZE];
        let context = signing_context(Role::Server, &hash);

        assert_eq!(&context[..64], &[0x20u8; 64]);
        let rest = &context[64..];
        assert!(rest.starts_with(CONTEXT_SERVER));
        assert_eq!(rest[CONTEXT_SERVER.len()], 0x00);
        assert_eq!(&rest[CONTEXT_SERVER.len() + 1..], &hash);
    }

    #[test]
    fn test_client_and_server_contexts_differ() {
        let hash = [0u8; HASH_SIZE];
        assert_ne!(
            signing_context(Role::Client, &hash),
            signing_context(Role::Server, &hash)
        );
    }

    #[test]
    fn test_pre_trusted_key_roundtrip() {
        let key = SigningKey::random(&mut OsRng);
        let mut provider = PreTrustedKeyProvider::new(key, Role::Server);
        let mut verifier = PreTrustedKeyVerifier::new(provider.verifying_key(), Role::Server);

        let hash = [0x55u8; HASH_SIZE];
        let share = provider.make_share_data(&hash).unwrap();
        verifier.verify_share(&share, &hash).unwrap();

        let signature = provider.make_verify_signature(&hash).unwrap();
        verifier.verify_signature(&signature, &hash).unwrap();
    }

    #[test]
    fn test_wrong_key_rejected() {
        let key = SigningKey::random(&mut OsRng);
        let other = SigningKey::random(&mut OsRng);
        let mut provider = PreTrustedKeyProvider::new(key, Role::Server);
        let mut verifier =
            PreTrustedKeyVerifier::new(*other.verifying_key(), Role::Server);

        let hash = [0u8; HASH_SIZE];
        let share = provider.make_share_data(&hash).unwrap();
        assert!(matches!(
            verifier.verify_share(&share, &hash),
            Err(AuthError::UntrustedKey)
        ));
    }

    #[test]
    fn test_signature_bound_to_transcript() {
        let key = SigningKey::random(&mut OsRng);
        let provider = PreTrustedKeyProvider::new(key, Role::Server);
        let verifier = PreTrustedKeyVerifier::new(provider.verifying_key(), Role::Server);

        let signature = provider.make_verify_signature(&[0x01u8; HASH_SIZE]).unwrap();
        assert!(matches!(
            verifier.verify_signature(&signature, &[0x02u8; HASH_SIZE]),
            Err(AuthError::BadSignature)
        ));
    }

    #[test]
    fn test_signature_bound_to_role() {
        let key = SigningKey::random(&mut OsRng);
        let provider = PreTrustedKeyProvider::new(key, Role::Client);
        // Verifier expects a server signature over the same transcript.
        let verifier = PreTrustedKeyVerifier::new(provider.verifying_key(), Role::Server);

        let hash = [0x07u8; HASH_SIZE];
        let signature = provider.make_verify_signature(&hash).unwrap();
        assert!(matches!(
            verifier.verify_signature(&signature, &hash),
            Err(AuthError::BadSignature)
        ));
    }

    #[test]
    fn test_error_maps_to_protocol_code() {
        assert_eq!(
            ProtocolError::from(AuthError::ChallengeMismatch),
            ProtocolError::AccessDenied
        );
        assert_eq!(
            ProtocolError::from(AuthError::BadCertificate(String::new())),
            ProtocolError::BadCertificate
        );
        assert_eq!(
            ProtocolError::from(AuthError::MissingExtension),
            ProtocolError::MissingExtension
        );
    }
}
