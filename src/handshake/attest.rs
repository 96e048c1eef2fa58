//! Attestation-backed authentication schemes.
//!
//! Three of the four [`AuthAlgorithm`] variants live here:
//!
//! - **Keystore attestation**: the peer presents an X.509 chain minted by
//!   its hardware keystore. The chain must validate against pinned roots,
//!   the leaf must carry the key-attestation extension, and the
//!   extension's embedded challenge must equal the transcript hash
//!   byte-for-byte. An optional policy additionally requires a
//!   trusted-execution-environment security level and a verified boot
//!   state.
//! - **App attestation**: a service-signed statement binding the
//!   challenge and an attested signing key, for platforms without
//!   hardware keystore attestation.
//! - **Generic X.509**: a plain certificate chain to pinned roots.
//!
//! Chain validation failures and challenge mismatches are fatal
//! authentication errors; nothing here downgrades.

use ed25519_dalek::{Signer as _, Verifier as _};
use x509_parser::der_parser::ber::BerObjectContent;
use x509_parser::der_parser::asn1_rs::{oid, Oid};
use x509_parser::der_parser::parse_der;
use x509_parser::prelude::*;

use super::auth::{
    signing_context, AuthAlgorithm, AuthError, AuthProvider, AuthVerifier,
};
use crate::codec::varint;
use crate::core::{Role, HASH_SIZE};

/// Android key-attestation extension.
const ATTESTATION_EXTENSION_OID: Oid<'static> = oid!(1.3.6.1.4.1.11129.2.1.17);

/// Security level: software only.
pub const SECURITY_LEVEL_SOFTWARE: u32 = 0;
/// Security level: trusted execution environment.
pub const SECURITY_LEVEL_TEE: u32 = 1;
/// Security level: dedicated secure element.
pub const SECURITY_LEVEL_STRONGBOX: u32 = 2;

/// Verified boot state: verified.
const VERIFIED_BOOT_VERIFIED: u32 = 0;

/// Authorization-list tag carrying the root-of-trust structure.
const TAG_ROOT_OF_TRUST: u32 = 704;

// =============================================================================
// Chain share encoding
// =============================================================================

/// Encode a DER certificate chain (leaf first) as a share payload.
pub fn encode_chain(chain: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    let _ = varint::encode(chain.len() as u64, &mut out);
    for cert in chain {
        let _ = varint::encode(cert.len() as u64, &mut out);
        out.extend_from_slice(cert);
    }
    out
}

/// Decode a share payload back into a DER certificate chain.
pub fn decode_chain(share: &[u8]) -> Result<Vec<Vec<u8>>, AuthError> {
    let mut offset = 0;
    let (count, used) = varint::decode(share).map_err(|_| AuthError::MalformedShare)?;
    offset += used;
    if count == 0 || count > 8 {
        return Err(AuthError::MalformedShare);
    }
    let mut chain = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (len, used) =
            varint::decode(&share[offset..]).map_err(|_| AuthError::MalformedShare)?;
        offset += used;
        let end = offset
            .checked_add(len as usize)
            .filter(|end| *end <= share.len())
            .ok_or(AuthError::MalformedShare)?;
        chain.push(share[offset..end].to_vec());
        offset = end;
    }
    if offset != share.len() {
        return Err(AuthError::MalformedShare);
    }
    Ok(chain)
}

// =============================================================================
// Chain validation
// =============================================================================

/// A validated leaf public key, ready to check verify-signatures.
#[derive(Debug)]
pub enum LeafKey {
    /// ECDSA over NIST P-256.
    P256(p256::ecdsa::VerifyingKey),
    /// ECDSA over NIST P-384.
    P384(p384::ecdsa::VerifyingKey),
}

impl LeafKey {
    fn from_spki(spki: &SubjectPublicKeyInfo<'_>) -> Result<Self, AuthError> {
        let curve = spki
            .algorithm
            .parameters
            .as_ref()
            .and_then(|params| params.as_oid().ok())
            .ok_or_else(|| AuthError::BadCertificate("leaf key is not an EC key".into()))?;
        let key_bytes = &spki.subject_public_key.data;

        if curve == oid!(1.2.840.10045.3.1.7) {
            p256::ecdsa::VerifyingKey::from_sec1_bytes(key_bytes)
                .map(LeafKey::P256)
                .map_err(|_| AuthError::BadCertificate("invalid P-256 leaf key".into()))
        } else if curve == oid!(1.3.132.0.34) {
            p384::ecdsa::VerifyingKey::from_sec1_bytes(key_bytes)
                .map(LeafKey::P384)
                .map_err(|_| AuthError::BadCertificate("invalid P-384 leaf key".into()))
        } else {
            Err(AuthError::BadCertificate("unsupported leaf curve".into()))
        }
    }

    fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), AuthError> {
        match self {
            LeafKey::P256(key) => {
                use p256::ecdsa::signature::Verifier;
                let signature = p256::ecdsa::Signature::from_slice(signature)
                    .map_err(|_| AuthError::BadSignature)?;
                key.verify(message, &signature)
                    .map_err(|_| AuthError::BadSignature)
            }
            LeafKey::P384(key) => {
                use p384::ecdsa::signature::Verifier;
                let signature = p384::ecdsa::Signature::from_slice(signature)
                    .map_err(|_| AuthError::BadSignature)?;
                key.verify(message, &signature)
                    .map_err(|_| AuthError::BadSignature)
            }
        }
    }
}

/// Validate a DER chain (leaf first) against pinned root certificates.
///
/// Each certificate must be within its validity window and signed by its
/// successor; the final certificate must either be one of the pinned
/// roots or be signed by one. Returns the leaf's public key.
fn validate_chain(chain_der: &[Vec<u8>], roots_der: &[Vec<u8>]) -> Result<LeafKey, AuthError> {
    if chain_der.is_empty() {
        return Err(AuthError::MalformedShare);
    }

    let mut chain = Vec::with_capacity(chain_der.len());
    for der in chain_der {
        let (rest, cert) = X509Certificate::from_der(der)
            .map_err(|e| AuthError::BadCertificate(format!("unparseable certificate: {e}")))?;
        if !rest.is_empty() {
            return Err(AuthError::BadCertificate("trailing bytes after certificate".into()));
        }
        if !cert.validity().is_valid() {
            return Err(AuthError::BadCertificate("certificate outside validity window".into()));
        }
        chain.push(cert);
    }

    for i in 0..chain.len() - 1 {
        chain[i]
            .verify_signature(Some(chain[i + 1].public_key()))
            .map_err(|_| AuthError::BadCertificate(format!("chain link {i} failed")))?;
    }

    let last = chain.last().expect("chain is non-empty");
    let last_der = chain_der.last().expect("chain is non-empty");
    let anchored = roots_der.iter().any(|root_der| {
        if last_der == root_der {
            return true;
        }
        match X509Certificate::from_der(root_der) {
            Ok((_, root)) => last.verify_signature(Some(root.public_key())).is_ok(),
            Err(_) => false,
        }
    });
    if !anchored {
        return Err(AuthError::BadCertificate("chain does not reach a pinned root".into()));
    }

    LeafKey::from_spki(chain[0].public_key())
}

// =============================================================================
// Keystore attestation
// =============================================================================

/// Policy knobs for keystore attestation.
#[derive(Debug, Clone, Copy, Default)]
pub struct AttestationPolicy {
    /// Require the key to live in a TEE or StrongBox.
    pub require_tee: bool,
    /// Require the device to report a verified boot state.
    pub require_verified_boot: bool,
}

impl AttestationPolicy {
    /// The strictest policy: TEE-resident key on a verified-boot device.
    pub fn strict() -> Self {
        Self {
            require_tee: true,
            require_verified_boot: true,
        }
    }
}

/// Fields extracted from the key-attestation extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttestationRecord {
    /// Security level of the attestation itself.
    pub attestation_security_level: u32,
    /// Security level of the key store holding the key.
    pub keymaster_security_level: u32,
    /// The challenge the key was attested against.
    pub challenge: Vec<u8>,
    /// Verified-boot state from the TEE-enforced root of trust, if present.
    pub verified_boot_state: Option<u32>,
}

impl AttestationRecord {
    /// Check this record against `policy`.
    pub fn check_policy(&self, policy: AttestationPolicy) -> Result<(), AuthError> {
        if policy.require_tee
            && (self.attestation_security_level < SECURITY_LEVEL_TEE
                || self.keymaster_security_level < SECURITY_LEVEL_TEE)
        {
            return Err(AuthError::PolicyViolation("key is not hardware-backed"));
        }
        if policy.require_verified_boot
            && self.verified_boot_state != Some(VERIFIED_BOOT_VERIFIED)
        {
            return Err(AuthError::PolicyViolation("device boot state is not verified"));
        }
        Ok(())
    }
}

/// Parse the key-attestation extension value.
///
/// Expected layout (the KeyDescription prefix):
///
/// ```text
/// SEQUENCE {
///   attestationVersion        INTEGER
///   attestationSecurityLevel  ENUMERATED
///   keymasterVersion          INTEGER
///   keymasterSecurityLevel    ENUMERATED
///   attestationChallenge      OCTET STRING
///   uniqueId                  OCTET STRING
///   softwareEnforced          AuthorizationList
///   teeEnforced               AuthorizationList   -- [704] holds RootOfTrust
/// }
/// ```
pub fn parse_attestation_extension(der: &[u8]) -> Result<AttestationRecord, AuthError> {
    let (_, top) = parse_der(der).map_err(|_| AuthError::MalformedShare)?;
    let fields = top.as_sequence().map_err(|_| AuthError::MalformedShare)?;
    if fields.len() < 8 {
        return Err(AuthError::MalformedShare);
    }

    let attestation_security_level =
        fields[1].as_u32().map_err(|_| AuthError::MalformedShare)?;
    let keymaster_security_level =
        fields[3].as_u32().map_err(|_| AuthError::MalformedShare)?;
    let challenge = fields[4]
        .as_slice()
        .map_err(|_| AuthError::MalformedShare)?
        .to_vec();

    let tee_enforced = fields[7]
        .as_sequence()
        .map_err(|_| AuthError::MalformedShare)?;
    let mut verified_boot_state = None;
    for entry in tee_enforced {
        if entry.header.tag().0 != TAG_ROOT_OF_TRUST {
            continue;
        }
        // RootOfTrust ::= SEQUENCE { verifiedBootKey, deviceLocked,
        // verifiedBootState, .. } behind the explicit [704] tag.
        let state = match &entry.content {
            BerObjectContent::Unknown(any) => parse_der(any.data.as_ref())
                .ok()
                .and_then(|(_, inner)| boot_state_from(&inner)),
            BerObjectContent::Tagged(_, _, inner) => boot_state_from(inner),
            _ => None,
        };
        if state.is_some() {
            verified_boot_state = state;
        }
    }

    Ok(AttestationRecord {
        attestation_security_level,
        keymaster_security_level,
        challenge,
        verified_boot_state,
    })
}

fn boot_state_from(root_of_trust: &x509_parser::der_parser::ber::BerObject<'_>) -> Option<u32> {
    let parts = root_of_trust.as_sequence().ok()?;
    if parts.len() >= 3 {
        parts[2].as_u32().ok()
    } else {
        None
    }
}

/// Mints fresh attestation chains from the platform keystore.
///
/// Implementations wrap the OS keystore; the returned chain is DER, leaf
/// first, with the challenge bound into the leaf's attestation extension.
pub trait KeystoreCertifier: Send {
    /// Produce an attestation chain for `challenge`.
    fn attest(&mut self, challenge: &[u8]) -> Result<Vec<Vec<u8>>, AuthError>;
}

/// Local identity proven by hardware-keystore attestation.
pub struct KeystoreAttestationProvider {
    certifier: Box<dyn KeystoreCertifier>,
    key: p256::ecdsa::SigningKey,
    role: Role,
}

impl KeystoreAttestationProvider {
    /// Create a provider around a platform certifier and the attested
    /// signing key.
    pub fn new(
        certifier: Box<dyn KeystoreCertifier>,
        key: p256::ecdsa::SigningKey,
        role: Role,
    ) -> Self {
        Self {
            certifier,
            key,
            role,
        }
    }
}

impl AuthProvider for KeystoreAttestationProvider {
    fn algorithm(&self) -> AuthAlgorithm {
        AuthAlgorithm::KeystoreAttestation
    }

    fn make_share_data(
        &mut self,
        transcript_hash: &[u8; HASH_SIZE],
    ) -> Result<Vec<u8>, AuthError> {
        let chain = self.certifier.attest(transcript_hash)?;
        Ok(encode_chain(&chain))
    }

    fn make_verify_signature(
        &self,
        transcript_hash: &[u8; HASH_SIZE],
    ) -> Result<Vec<u8>, AuthError> {
        use p256::ecdsa::signature::Signer;
        let context = signing_context(self.role, transcript_hash);
        let signature: p256::ecdsa::Signature = self.key.sign(&context);
        Ok(signature.to_vec())
    }
}

/// Remote identity verified through hardware-keystore attestation.
pub struct KeystoreAttestationVerifier {
    roots: Vec<Vec<u8>>,
    policy: AttestationPolicy,
    signer: Role,
    leaf: Option<LeafKey>,
}

impl KeystoreAttestationVerifier {
    /// Create a verifier with pinned root certificates (DER) and a policy.
    pub fn new(roots: Vec<Vec<u8>>, policy: AttestationPolicy, signer: Role) -> Self {
        Self {
            roots,
            policy,
            signer,
            leaf: None,
        }
    }
}

impl AuthVerifier for KeystoreAttestationVerifier {
    fn algorithm(&self) -> AuthAlgorithm {
        AuthAlgorithm::KeystoreAttestation
    }

    fn verify_share(
        &mut self,
        share: &[u8],
        transcript_hash: &[u8; HASH_SIZE],
    ) -> Result<(), AuthError> {
        let chain = decode_chain(share)?;
        let leaf_key = validate_chain(&chain, &self.roots)?;

        let (_, leaf) = X509Certificate::from_der(&chain[0])
            .map_err(|e| AuthError::BadCertificate(format!("unparseable leaf: {e}")))?;
        let extension = leaf
            .tbs_certificate
            .get_extension_unique(&ATTESTATION_EXTENSION_OID)
            .map_err(|_| AuthError::BadCertificate("duplicate attestation extension".into()))?
            .ok_or(AuthError::MissingExtension)?;

        let record = parse_attestation_extension(extension.value)?;
        if record.challenge != transcript_hash {
            return Err(AuthError::ChallengeMismatch);
        }
        record.check_policy(self.policy)?;

        self.leaf = Some(leaf_key);
        Ok(())
    }

    fn verify_signature(
        &self,
        signature: &[u8],
        transcript_hash: &[u8; HASH_SIZE],
    ) -> Result<(), AuthError> {
        let leaf = self.leaf.as_ref().ok_or(AuthError::BadSignature)?;
        let context = signing_context(self.signer, transcript_hash);
        leaf.verify(&context, signature)
    }
}

// =============================================================================
// Generic X.509 chains
// =============================================================================

/// Local identity proven by a static X.509 chain.
pub struct X509ChainProvider {
    chain: Vec<Vec<u8>>,
    key: p384::ecdsa::SigningKey,
    role: Role,
}

impl X509ChainProvider {
    /// Create a provider from a DER chain (leaf first) and the leaf's
    /// signing key.
    pub fn new(chain: Vec<Vec<u8>>, key: p384::ecdsa::SigningKey, role: Role) -> Self {
        Self { chain, key, role }
    }
}

impl AuthProvider for X509ChainProvider {
    fn algorithm(&self) -> AuthAlgorithm {
        AuthAlgorithm::X509Chain
    }

    fn make_share_data(
        &mut self,
        _transcript_hash: &[u8; HASH_SIZE],
    ) -> Result<Vec<u8>, AuthError> {
        Ok(encode_chain(&self.chain))
    }

    fn make_verify_signature(
        &self,
        transcript_hash: &[u8; HASH_SIZE],
    ) -> Result<Vec<u8>, AuthError> {
        use p384::ecdsa::signature::Signer;
        let context = signing_context(self.role, transcript_hash);
        let signature: p384::ecdsa::Signature = self.key.sign(&context);
        Ok(signature.to_vec())
    }
}

/// Remote identity verified through a generic X.509 chain.
pub struct X509ChainVerifier {
    roots: Vec<Vec<u8>>,
    signer: Role,
    leaf: Option<LeafKey>,
}

impl X509ChainVerifier {
    /// Create a verifier with pinned root certificates (DER).
    pub fn new(roots: Vec<Vec<u8>>, signer: Role) -> Self {
        Self {
            roots,
            signer,
            leaf: None,
        }
    }
}

impl AuthVerifier for X509ChainVerifier {
    fn algorithm(&self) -> AuthAlgorithm {
        AuthAlgorithm::X509Chain
    }

    fn verify_share(
        &mut self,
        share: &[u8],
        _transcript_hash: &[u8; HASH_SIZE],
    ) -> Result<(), AuthError> {
        let chain = decode_chain(share)?;
        self.leaf = Some(validate_chain(&chain, &self.roots)?);
        Ok(())
    }

    fn verify_signature(
        &self,
        signature: &[u8],
        transcript_hash: &[u8; HASH_SIZE],
    ) -> Result<(), AuthError> {
        let leaf = self.leaf.as_ref().ok_or(AuthError::BadSignature)?;
        let context = signing_context(self.signer, transcript_hash);
        leaf.verify(&context, signature)
    }
}

// =============================================================================
// App-attestation-service statements
// =============================================================================

/// Issues service signatures binding a challenge to an attested key.
///
/// On real deployments this calls out to the platform's app-attestation
/// service; tests and development builds use [`StaticStatementService`].
pub trait StatementService: Send {
    /// Sign the statement over `challenge || attested_key`.
    fn attest(&mut self, challenge: &[u8], attested_key: &[u8]) -> Result<Vec<u8>, AuthError>;
}

/// Statement service backed by a locally held Ed25519 key.
pub struct StaticStatementService {
    key: ed25519_dalek::SigningKey,
}

impl StaticStatementService {
    /// Create a service from its signing key.
    pub fn new(key: ed25519_dalek::SigningKey) -> Self {
        Self { key }
    }

    /// The service's public key, to pin on the verifying side.
    pub fn verifying_key(&self) -> ed25519_dalek::VerifyingKey {
        self.key.verifying_key()
    }
}

impl StatementService for StaticStatementService {
    fn attest(&mut self, challenge: &[u8], attested_key: &[u8]) -> Result<Vec<u8>, AuthError> {
        let mut message = Vec::with_capacity(challenge.len() + attested_key.len());
        message.extend_from_slice(challenge);
        message.extend_from_slice(attested_key);
        Ok(self.key.sign(&message).to_bytes().to_vec())
    }
}

fn put_field(out: &mut Vec<u8>, bytes: &[u8]) {
    let _ = varint::encode(bytes.len() as u64, out);
    out.extend_from_slice(bytes);
}

fn get_field<'a>(bytes: &'a [u8], offset: &mut usize) -> Result<&'a [u8], AuthError> {
    let (len, used) = varint::decode(&bytes[*offset..]).map_err(|_| AuthError::MalformedShare)?;
    *offset += used;
    let end = offset
        .checked_add(len as usize)
        .filter(|end| *end <= bytes.len())
        .ok_or(AuthError::MalformedShare)?;
    let field = &bytes[*offset..end];
    *offset = end;
    Ok(field)
}

/// Local identity proven by an app-attestation-service statement.
pub struct AppAttestationProvider {
    key: ed25519_dalek::SigningKey,
    service: Box<dyn StatementService>,
    role: Role,
}

impl AppAttestationProvider {
    /// Create a provider around an attested signing key and the service
    /// that vouches for it.
    pub fn new(
        key: ed25519_dalek::SigningKey,
        service: Box<dyn StatementService>,
        role: Role,
    ) -> Self {
        Self { key, service, role }
    }
}

impl AuthProvider for AppAttestationProvider {
    fn algorithm(&self) -> AuthAlgorithm {
        AuthAlgorithm::AppAttestation
    }

    fn make_share_data(
        &mut self,
        transcript_hash: &[u8; HASH_SIZE],
    ) -> Result<Vec<u8>, AuthError> {
        let attested_key = self.key.verifying_key();
        let statement = self
            .service
            .attest(transcript_hash, attested_key.as_bytes())?;

        let mut share = Vec::new();
        put_field(&mut share, transcript_hash);
        put_field(&mut share, attested_key.as_bytes());
        put_field(&mut share, &statement);
        Ok(share)
    }

    fn make_verify_signature(
        &self,
        transcript_hash: &[u8; HASH_SIZE],
    ) -> Result<Vec<u8>, AuthError> {
        let context = signing_context(self.role, transcript_hash);
        Ok(self.key.sign(&context).to_bytes().to_vec())
    }
}

/// Remote identity verified through an app-attestation-service statement.
pub struct AppAttestationVerifier {
    service_key: ed25519_dalek::VerifyingKey,
    signer: Role,
    attested: Option<ed25519_dalek::VerifyingKey>,
}

impl AppAttestationVerifier {
    /// Create a verifier pinned to the attestation service's public key.
    pub fn new(service_key: ed25519_dalek::VerifyingKey, signer: Role) -> Self {
        Self {
            service_key,
            signer,
            attested: None,
        }
    }
}

impl AuthVerifier for AppAttestationVerifier {
    fn algorithm(&self) -> AuthAlgorithm {
        AuthAlgorithm::AppAttestation
    }

    fn verify_share(
        &mut self,
        share: &[u8],
        transcript_hash: &[u8; HASH_SIZE],
    ) -> Result<(), AuthError> {
        let mut offset = 0;
        let challenge = get_field(share, &mut offset)?;
        let attested_key = get_field(share, &mut offset)?;
        let statement = get_field(share, &mut offset)?;
        if offset != share.len() {
            return Err(AuthError::MalformedShare);
        }

        if challenge != transcript_hash {
            return Err(AuthError::ChallengeMismatch);
        }

        let attested_key: [u8; 32] = attested_key
            .try_into()
            .map_err(|_| AuthError::MalformedShare)?;
        let attested = ed25519_dalek::VerifyingKey::from_bytes(&attested_key)
            .map_err(|_| AuthError::MalformedShare)?;

        let mut message = Vec::with_capacity(challenge.len() + attested_key.len());
        message.extend_from_slice(challenge);
        message.extend_from_slice(&attested_key);
        let statement =
            ed25519_dalek::Signature::from_slice(statement).map_err(|_| AuthError::BadSignature)?;
        self.service_key
            .verify(&message, &statement)
            .map_err(|_| AuthError::BadSignature)?;

        self.attested = Some(attested);
        Ok(())
    }

    fn verify_signature(
        &self,
        signature: &[u8],
        transcript_hash: &[u8; HASH_SIZE],
    ) -> Result<(), AuthError> {
        let attested = self.attested.as_ref().ok_or(AuthError::BadSignature)?;
        let signature =
            ed25519_dalek::Signature::from_slice(signature).map_err(|_| AuthError::BadSignature)?;
        let context = signing_context(self.signer, transcript_hash);
        attested
            .verify(&context, &signature)
            .map_err(|_| AuthError::BadSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn app_attest_pair() -> (AppAttestationProvider, AppAttestationVerifier) {
        let service = StaticStatementService::new(ed25519_dalek::SigningKey::generate(&mut OsRng));
        let service_key = service.verifying_key();
        let provider = AppAttestationProvider::new(
            ed25519_dalek::SigningKey::generate(&mut OsRng),
            Box::new(service),
            Role::Server,
        );
        let verifier = AppAttestationVerifier::new(service_key, Role::Server);
        (provider, verifier)
    }

    #[test]
    fn test_chain_encoding_roundtrip() {
        let chain = vec![vec![0x30u8, 0x01, 0xAA], vec![0x30u8; 200]];
        let share = encode_chain(&chain);
        assert_eq!(decode_chain(&share).unwrap(), chain);
    }

    #[test]
    fn test_chain_decoding_rejects_garbage() {
        assert!(decode_chain(&[]).is_err());
        // count says 2, only 1 cert present
        let share = encode_chain(&[vec![1, 2, 3]]);
        let mut truncated = share.clone();
        truncated[0] = 2;
        assert!(decode_chain(&truncated).is_err());
        // trailing bytes
        let mut trailing = share;
        trailing.push(0);
        assert!(decode_chain(&trailing).is_err());
    }

    #[test]
    fn test_validate_chain_rejects_non_certificates() {
        let err = validate_chain(&[vec![0xDE, 0xAD, 0xBE, 0xEF]], &[]).unwrap_err();
        assert!(matches!(err, AuthError::BadCertificate(_)));
    }

    /// Hand-encoded KeyDescription: version 3, TEE levels, a 4-byte
    /// challenge, and a tee-enforced root of trust reporting verified boot.
    fn attestation_der(challenge: &[u8], boot_state: u8) -> Vec<u8> {
        let mut root_of_trust = vec![
            0x04, 0x00, // verifiedBootKey: empty OCTET STRING
            0x01, 0x01, 0xFF, // deviceLocked: TRUE
            0x0A, 0x01, boot_state, // verifiedBootState
        ];
        root_of_trust.splice(0..0, [0x30, root_of_trust.len() as u8]);

        // [704] EXPLICIT, high-tag-number form: 0xBF 0x85 0x40
        let mut tagged = vec![0xBF, 0x85, 0x40, root_of_trust.len() as u8];
        tagged.extend_from_slice(&root_of_trust);

        let mut tee_enforced = tagged;
        tee_enforced.splice(0..0, [0x30, tee_enforced.len() as u8]);

        let mut body = vec![
            0x02, 0x01, 0x03, // attestationVersion
            0x0A, 0x01, 0x01, // attestationSecurityLevel: TEE
            0x02, 0x01, 0x04, // keymasterVersion
            0x0A, 0x01, 0x01, // keymasterSecurityLevel: TEE
        ];
        body.push(0x04);
        body.push(challenge.len() as u8);
        body.extend_from_slice(challenge);
        body.extend_from_slice(&[0x04, 0x00]); // uniqueId: empty
        body.extend_from_slice(&[0x30, 0x00]); // softwareEnforced: empty
        body.extend_from_slice(&tee_enforced);

        body.splice(0..0, [0x30, body.len() as u8]);
        body
    }

    #[test]
    fn test_parse_attestation_extension() {
        let der = attestation_der(&[0xCA, 0xFE, 0xBA, 0xBE], 0x00);
        let record = parse_attestation_extension(&der).unwrap();
        assert_eq!(record.attestation_security_level, SECURITY_LEVEL_TEE);
        assert_eq!(record.keymaster_security_level, SECURITY_LEVEL_TEE);
        assert_eq!(record.challenge, vec![0xCA, 0xFE, 0xBA, 0xBE]);
        assert_eq!(record.verified_boot_state, Some(0));
    }

    #[test]
    fn test_parse_attestation_rejects_garbage() {
        assert!(parse_attestation_extension(&[0xFF, 0x00]).is_err());
        assert!(parse_attestation_extension(&[0x30, 0x00]).is_err());
    }

    #[test]
    fn test_attestation_policy() {
        let verified = parse_attestation_extension(&attestation_der(&[1], 0x00)).unwrap();
        verified.check_policy(AttestationPolicy::strict()).unwrap();
        verified.check_policy(AttestationPolicy::default()).unwrap();

        let unverified_boot = parse_attestation_extension(&attestation_der(&[1], 0x02)).unwrap();
        assert!(matches!(
            unverified_boot.check_policy(AttestationPolicy::strict()),
            Err(AuthError::PolicyViolation(_))
        ));
        unverified_boot
            .check_policy(AttestationPolicy::default())
            .unwrap();

        let software = AttestationRecord {
            attestation_security_level: SECURITY_LEVEL_SOFTWARE,
            keymaster_security_level: SECURITY_LEVEL_SOFTWARE,
            challenge: vec![1],
            verified_boot_state: Some(0),
        };
        assert!(matches!(
            software.check_policy(AttestationPolicy::strict()),
            Err(AuthError::PolicyViolation(_))
        ));
    }

    #[test]
    fn test_app_attestation_roundtrip() {
        let (mut provider, mut verifier) = app_attest_pair();
        let hash = [0x42u8; HASH_SIZE];

        let share = provider.make_share_data(&hash).unwrap();
        verifier.verify_share(&share, &hash).unwrap();

        let signature = provider.make_verify_signature(&hash).unwrap();
        verifier.verify_signature(&signature, &hash).unwrap();
    }

    #[test]
    fn test_app_attestation_challenge_mismatch() {
        let (mut provider, mut verifier) = app_attest_pair();

        // Statement minted for one transcript must not verify against
        // another.
        let share = provider.make_share_data(&[0x01u8; HASH_SIZE]).unwrap();
        assert!(matches!(
            verifier.verify_share(&share, &[0x02u8; HASH_SIZE]),
            Err(AuthError::ChallengeMismatch)
        ));
    }

    #[test]
    fn test_app_attestation_wrong_service_key() {
        let (mut provider, _) = app_attest_pair();
        let other_service = ed25519_dalek::SigningKey::generate(&mut OsRng);
        let mut verifier =
            AppAttestationVerifier::new(other_service.verifying_key(), Role::Server);

        let hash = [0x03u8; HASH_SIZE];
        let share = provider.make_share_data(&hash).unwrap();
        assert!(matches!(
            verifier.verify_share(&share, &hash),
            Err(AuthError::BadSignature)
        ));
    }

    #[test]
    fn test_app_attestation_signature_requires_verified_share() {
        let (provider, verifier) = app_attest_pair();
        let hash = [0x04u8; HASH_SIZE];
        let signature = provider.make_verify_signature(&hash).unwrap();
        // verify_share never ran, so there is no attested key to check
        // against.
        assert!(verifier.verify_signature(&signature, &hash).is_err());
    }
}
