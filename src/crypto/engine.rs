//! AES-128-GCM packet encryption engine.
//!
//! One engine per connection holds independent send and receive
//! directions. Each direction keeps a traffic key and a monotonically
//! increasing operation counter:
//!
//! ```text
//! nonce = IV XOR (big-endian counter, right-aligned into 12 bytes)
//! ```
//!
//! The counter starts at 0 when a key is installed and increments by
//! exactly 1 per seal/open. A counter must never repeat under a given key;
//! exhaustion without a key update is a fatal [`CryptoError::NonceOverflow`],
//! and [`EncryptionEngine::should_update_key`] fires a proactive alarm
//! [`KEY_UPDATE_HEADROOM`] operations before that point.
//!
//! Before the handshake installs keys, sealing is a passthrough so hello
//! records travel in the clear inside ordinary packets.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Nonce};

use crate::core::{CryptoError, AEAD_TAG_SIZE, KEY_UPDATE_HEADROOM, TRAFFIC_IV_SIZE};
use crate::crypto::schedule::TrafficKey;

/// One direction's cipher state.
struct DirectionState {
    cipher: Option<Aes128Gcm>,
    iv: [u8; TRAFFIC_IV_SIZE],
    counter: u64,
}

impl DirectionState {
    fn new() -> Self {
        Self {
            cipher: None,
            iv: [0u8; TRAFFIC_IV_SIZE],
            counter: 0,
        }
    }

    fn install(&mut self, key: &TrafficKey) {
        self.cipher = Some(Aes128Gcm::new(key.key().into()));
        self.iv = *key.iv();
        self.counter = 0;
    }

    /// Nonce for the next operation; advances the counter.
    fn next_nonce(&mut self) -> Result<[u8; TRAFFIC_IV_SIZE], CryptoError> {
        let mut nonce = self.iv;
        for (slot, byte) in nonce[TRAFFIC_IV_SIZE - 8..]
            .iter_mut()
            .zip(self.counter.to_be_bytes())
        {
            *slot ^= byte;
        }
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or(CryptoError::NonceOverflow)?;
        Ok(nonce)
    }

    fn operations_remaining(&self) -> u64 {
        u64::MAX - self.counter
    }
}

/// Per-connection AEAD seal/open with key rotation support.
pub struct EncryptionEngine {
    send: DirectionState,
    recv: DirectionState,
}

impl EncryptionEngine {
    /// Create an engine with no keys installed (pre-handshake).
    pub fn new() -> Self {
        Self {
            send: DirectionState::new(),
            recv: DirectionState::new(),
        }
    }

    /// Install (or replace) the send-direction key. Resets the send
    /// counter to 0.
    pub fn install_send_key(&mut self, key: &TrafficKey) {
        self.send.install(key);
    }

    /// Install (or replace) the receive-direction key. Resets the receive
    /// counter to 0.
    pub fn install_recv_key(&mut self, key: &TrafficKey) {
        self.recv.install(key);
    }

    /// Whether a send key is installed.
    pub fn has_send_key(&self) -> bool {
        self.send.cipher.is_some()
    }

    /// Whether a receive key is installed.
    pub fn has_recv_key(&self) -> bool {
        self.recv.cipher.is_some()
    }

    /// Seal a packet payload.
    ///
    /// With no send key installed this is a passthrough; with a key the
    /// output carries an appended 16-byte tag.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if self.send.cipher.is_none() {
            return Ok(plaintext.to_vec());
        }
        let nonce = self.send.next_nonce()?;
        let cipher = self.send.cipher.as_ref().unwrap();
        cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    /// Open a packet payload.
    ///
    /// With no receive key installed this is a passthrough. A keyed
    /// payload shorter than the tag is a decode error, not an
    /// authentication failure.
    pub fn open(&mut self, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if self.recv.cipher.is_none() {
            return Ok(payload.to_vec());
        }
        if payload.len() < AEAD_TAG_SIZE {
            return Err(CryptoError::PayloadTooShort);
        }
        let nonce = self.recv.next_nonce()?;
        let cipher = self.recv.cipher.as_ref().unwrap();
        cipher
            .decrypt(Nonce::from_slice(&nonce), payload)
            .map_err(|_| CryptoError::DecryptionFailed)
    }

    /// Proactive key-update alarm: true when either direction is within
    /// [`KEY_UPDATE_HEADROOM`] operations of nonce exhaustion. The run
    /// loop must react by requesting a key update through the handshake
    /// engine.
    pub fn should_update_key(&self) -> bool {
        (self.send.cipher.is_some() && self.send.operations_remaining() <= KEY_UPDATE_HEADROOM)
            || (self.recv.cipher.is_some()
                && self.recv.operations_remaining() <= KEY_UPDATE_HEADROOM)
    }

    /// Largest plaintext that seals into a payload of `packet_size` bytes.
    pub fn max_plaintext_len(&self, packet_size: usize) -> usize {
        if self.send.cipher.is_some() {
            packet_size.saturating_sub(AEAD_TAG_SIZE)
        } else {
            packet_size
        }
    }

    /// Sealed payload size for a plaintext of `plaintext_len` bytes.
    pub fn sealed_len(&self, plaintext_len: usize) -> usize {
        if self.send.cipher.is_some() {
            plaintext_len + AEAD_TAG_SIZE
        } else {
            plaintext_len
        }
    }

    /// Send-direction operation counter.
    pub fn send_counter(&self) -> u64 {
        self.send.counter
    }

    /// Receive-direction operation counter.
    pub fn recv_counter(&self) -> u64 {
        self.recv.counter
    }

    #[cfg(test)]
    pub(crate) fn force_send_counter(&mut self, counter: u64) {
        self.send.counter = counter;
    }
}

impl Default for EncryptionEngine {
    fn default() -> Self {
        Self::new()
    }
}
