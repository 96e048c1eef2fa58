//! Security layer: key derivation and packet encryption.
//!
//! - [`schedule`]: the HKDF-SHA384 key schedule turning an ECDH shared
//!   secret plus a running transcript hash into per-direction traffic keys
//! - [`engine`]: AES-128-GCM sealing/opening of packet payloads with
//!   monotonic nonce counters and proactive key-update alarms
//!
//! The derivation chain is strictly one-way:
//!
//! ```text
//! shared secret ──extract──▶ root ──▶ phase secret ──▶ traffic secret ──▶ key+iv
//!                                      (handshake/app)   │  ▲
//!                                                        └──┘ "traffic upd"
//! ```
//!
//! A traffic secret can only ever be ratcheted forward; nothing in this
//! module can recover earlier key material.

pub mod engine;
pub mod schedule;

pub use engine::EncryptionEngine;
pub use schedule::{KeySchedule, TrafficKey, TrafficSecret, TranscriptHash};
