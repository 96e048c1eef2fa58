//! HKDF-SHA384 key schedule.
//!
//! The schedule mirrors the TLS 1.3 shape with QLIC's own labels:
//!
//! ```text
//! extracted = HKDF-Extract(salt = zeros, ikm = ECDH shared secret)
//! root      = Expand-Label(extracted, "derived", hello-hash)
//!
//! hs        = Expand-Label(root, "Handshakederived", hello-hash)
//! c_hs/s_hs = Expand-Label(hs, "c hs traffic" / "s hs traffic", hello-hash)
//!
//! ap        = Expand-Label(root, "Sessionderived", full-hash)
//! c_ap/s_ap = Expand-Label(ap, "c ap traffic" / "s ap traffic", full-hash)
//!
//! key       = Expand-Label(secret, "key", "")   (16 bytes)
//! iv        = Expand-Label(secret, "iv", "")    (12 bytes)
//! next      = Expand-Label(secret, "traffic upd", "")
//! ```
//!
//! `Expand-Label` uses the HkdfLabel structure (u16 output length,
//! u8-prefixed label with the `"qlic "` prefix, u8-prefixed context).

use hkdf::Hkdf;
use sha2::{Digest, Sha384};
use zeroize::Zeroize;

use crate::core::{CryptoError, HASH_SIZE, TRAFFIC_IV_SIZE, TRAFFIC_KEY_SIZE};

/// Label prefix baked into every Expand-Label invocation.
const LABEL_PREFIX: &[u8] = b"qlic ";

/// Running SHA-384 hash over every handshake record byte exchanged, in
/// order. Used for key derivation and as the attestation challenge.
#[derive(Clone)]
pub struct TranscriptHash {
    digest: Sha384,
}

impl TranscriptHash {
    /// Start an empty transcript.
    pub fn new() -> Self {
        Self {
            digest: Sha384::new(),
        }
    }

    /// Absorb record bytes.
    pub fn update(&mut self, bytes: &[u8]) {
        self.digest.update(bytes);
    }

    /// Snapshot the hash over everything absorbed so far.
    pub fn current(&self) -> [u8; HASH_SIZE] {
        let mut out = [0u8; HASH_SIZE];
        out.copy_from_slice(&self.digest.clone().finalize());
        out
    }
}

impl Default for TranscriptHash {
    fn default() -> Self {
        Self::new()
    }
}

/// HKDF-Expand-Label into `out`.
fn expand_label(
    prk: &[u8],
    label: &str,
    context: &[u8],
    out: &mut [u8],
) -> Result<(), CryptoError> {
    let mut info = Vec::with_capacity(4 + LABEL_PREFIX.len() + label.len() + context.len());
    info.extend_from_slice(&(out.len() as u16).to_be_bytes());
    info.push((LABEL_PREFIX.len() + label.len()) as u8);
    info.extend_from_slice(LABEL_PREFIX);
    info.extend_from_slice(label.as_bytes());
    info.push(context.len() as u8);
    info.extend_from_slice(context);

    let hk = Hkdf::<Sha384>::from_prk(prk).map_err(|_| CryptoError::KeyDerivationFailed)?;
    hk.expand(&info, out)
        .map_err(|_| CryptoError::KeyDerivationFailed)
}

/// One direction's AEAD key material: 16-byte key and 12-byte IV.
#[derive(Clone)]
pub struct TrafficKey {
    key: [u8; TRAFFIC_KEY_SIZE],
    iv: [u8; TRAFFIC_IV_SIZE],
}

impl TrafficKey {
    /// The AES-128 key bytes.
    pub fn key(&self) -> &[u8; TRAFFIC_KEY_SIZE] {
        &self.key
    }

    /// The static IV the nonce counter is XOR-ed into.
    pub fn iv(&self) -> &[u8; TRAFFIC_IV_SIZE] {
        &self.iv
    }
}

impl Drop for TrafficKey {
    fn drop(&mut self) {
        self.key.zeroize();
        self.iv.zeroize();
    }
}

impl PartialEq for TrafficKey {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.iv == other.iv
    }
}

impl Eq for TrafficKey {}

impl std::fmt::Debug for TrafficKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material never appears in logs.
        f.write_str("TrafficKey(..)")
    }
}

/// A per-direction secret in the derivation chain. Expands into a
/// [`TrafficKey`] and ratchets forward via [`TrafficSecret::update`].
pub struct TrafficSecret {
    secret: [u8; HASH_SIZE],
}

impl TrafficSecret {
    /// Wrap raw secret bytes (test vectors, pre-provisioned secrets).
    pub fn from_bytes(secret: [u8; HASH_SIZE]) -> Self {
        Self { secret }
    }

    /// Expand this secret into its traffic key and IV.
    pub fn traffic_key(&self) -> Result<TrafficKey, CryptoError> {
        let mut key = [0u8; TRAFFIC_KEY_SIZE];
        let mut iv = [0u8; TRAFFIC_IV_SIZE];
        expand_label(&self.secret, "key", &[], &mut key)?;
        expand_label(&self.secret, "iv", &[], &mut iv)?;
        Ok(TrafficKey { key, iv })
    }

    /// Ratchet forward. There is no way back from the returned secret to
    /// this one.
    pub fn update(&self) -> Result<TrafficSecret, CryptoError> {
        let mut next = [0u8; HASH_SIZE];
        expand_label(&self.secret, "traffic upd", &[], &mut next)?;
        Ok(TrafficSecret { secret: next })
    }
}

impl Drop for TrafficSecret {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

impl std::fmt::Debug for TrafficSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TrafficSecret(..)")
    }
}

/// The root of the derivation chain for one connection.
///
/// Built once from the ECDH shared secret and the hello transcript hash,
/// then expanded twice: into handshake-phase secrets and, after
/// authentication completes, into application-phase secrets.
pub struct KeySchedule {
    root: [u8; HASH_SIZE],
    hello_hash: [u8; HASH_SIZE],
}

impl KeySchedule {
    /// Derive the root secret from a 32+ byte shared secret and the hash
    /// of the hello exchange.
    pub fn new(shared_secret: &[u8], hello_hash: [u8; HASH_SIZE]) -> Result<Self, CryptoError> {
        if shared_secret.len() < 32 {
            return Err(CryptoError::KeyDerivationFailed);
        }
        let salt = [0u8; HASH_SIZE];
        let (prk, _) = Hkdf::<Sha384>::extract(Some(salt.as_slice()), shared_secret);

        let mut root = [0u8; HASH_SIZE];
        expand_label(prk.as_slice(), "derived", &hello_hash, &mut root)?;
        Ok(Self { root, hello_hash })
    }

    /// Expand the handshake-phase (client, server) traffic secrets.
    pub fn handshake_secrets(&self) -> Result<(TrafficSecret, TrafficSecret), CryptoError> {
        let mut phase = [0u8; HASH_SIZE];
        expand_label(&self.root, "Handshakederived", &self.hello_hash, &mut phase)?;

        let mut client = [0u8; HASH_SIZE];
        let mut server = [0u8; HASH_SIZE];
        expand_label(&phase, "c hs traffic", &self.hello_hash, &mut client)?;
        expand_label(&phase, "s hs traffic", &self.hello_hash, &mut server)?;
        phase.zeroize();

        Ok((
            TrafficSecret { secret: client },
            TrafficSecret { secret: server },
        ))
    }

    /// Expand the application-phase (client, server) traffic secrets from
    /// the full transcript hash.
    pub fn app_secrets(
        &self,
        full_hash: &[u8; HASH_SIZE],
    ) -> Result<(TrafficSecret, TrafficSecret), CryptoError> {
        let mut phase = [0u8; HASH_SIZE];
        expand_label(&self.root, "Sessionderived", full_hash, &mut phase)?;

        let mut client = [0u8; HASH_SIZE];
        let mut server = [0u8; HASH_SIZE];
        expand_label(&phase, "c ap traffic", full_hash, &mut client)?;
        expand_label(&phase, "s ap traffic", full_hash, &mut server)?;
        phase.zeroize();

        Ok((
            TrafficSecret { secret: client },
            TrafficSecret { secret: server },
        ))
    }
}

impl Drop for KeySchedule {
    fn drop(&mut self) {
        self.root.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_schedule() -> KeySchedule {
        KeySchedule::new(&[0x42u8; 48], [0x11u8; HASH_SIZE]).unwrap()
    }

    #[test]
    fn test_schedule_is_deterministic() {
        let a = test_schedule();
        let b = test_schedule();

        let (ac, as_) = a.handshake_secrets().unwrap();
        let (bc, bs) = b.handshake_secrets().unwrap();
        assert_eq!(ac.traffic_key().unwrap(), bc.traffic_key().unwrap());
        assert_eq!(as_.traffic_key().unwrap(), bs.traffic_key().unwrap());
    }

    #[test]
    fn test_directions_differ() {
        let schedule = test_schedule();
        let (client, server) = schedule.handshake_secrets().unwrap();
        assert_ne!(client.traffic_key().unwrap(), server.traffic_key().unwrap());
    }

    #[test]
    fn test_phases_differ() {
        let schedule = test_schedule();
        let (hs_client, _) = schedule.handshake_secrets().unwrap();
        let (ap_client, _) = schedule.app_secrets(&[0x22u8; HASH_SIZE]).unwrap();
        assert_ne!(
            hs_client.traffic_key().unwrap(),
            ap_client.traffic_key().unwrap()
        );
    }

    #[test]
    fn test_transcript_hash_affects_derivation() {
        let a = KeySchedule::new(&[0x42u8; 48], [0x11u8; HASH_SIZE]).unwrap();
        let b = KeySchedule::new(&[0x42u8; 48], [0x12u8; HASH_SIZE]).unwrap();
        let (ac, _) = a.handshake_secrets().unwrap();
        let (bc, _) = b.handshake_secrets().unwrap();
        assert_ne!(ac.traffic_key().unwrap(), bc.traffic_key().unwrap());
    }

    #[test]
    fn test_update_ratchets_forward() {
        let secret = TrafficSecret::from_bytes([0x33u8; HASH_SIZE]);
        let updated = secret.update().unwrap();
        assert_ne!(secret.traffic_key().unwrap(), updated.traffic_key().unwrap());

        // Ratcheting is deterministic
        let again = TrafficSecret::from_bytes([0x33u8; HASH_SIZE]).update().unwrap();
        assert_eq!(updated.traffic_key().unwrap(), again.traffic_key().unwrap());
    }

    #[test]
    fn test_short_shared_secret_rejected() {
        assert!(KeySchedule::new(&[0u8; 16], [0u8; HASH_SIZE]).is_err());
    }

    #[test]
    fn test_transcript_hash_running() {
        let mut transcript = TranscriptHash::new();
        transcript.update(b"hello");
        let first = transcript.current();
        transcript.update(b" world");
        let second = transcript.current();
        assert_ne!(first, second);

        // Same bytes in one call produce the same hash
        let mut one_shot = TranscriptHash::new();
        one_shot.update(b"hello world");
        assert_eq!(one_shot.current(), second);

        // Known SHA-384 vector
        let expected = hex::decode(
            "fdbd8e75a67f29f701a4e040385e2e23986303ea10239211af907fcbb83578b3\
             e417cb71ce646efd0819dd8c088de1bd",
        )
        .unwrap();
        assert_eq!(second.as_slice(), expected.as_slice());
    }
}
