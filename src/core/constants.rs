//! Protocol constants.
//!
//! These values are fixed by the QLIC wire protocol and MUST NOT be changed
//! without breaking interoperability with deployed peers.

use std::time::Duration;

// =============================================================================
// CRYPTOGRAPHIC CONSTANTS
// =============================================================================

/// AES-GCM authentication tag size.
pub const AEAD_TAG_SIZE: usize = 16;

/// AES-128-GCM traffic key size.
pub const TRAFFIC_KEY_SIZE: usize = 16;

/// AEAD nonce / traffic IV size.
pub const TRAFFIC_IV_SIZE: usize = 12;

/// SHA-384 transcript hash output size.
pub const HASH_SIZE: usize = 48;

/// Hello random size (client and server).
pub const HELLO_RANDOM_SIZE: usize = 32;

/// Uncompressed SEC1 P-384 public key share size (0x04 || x || y).
pub const KEY_SHARE_SIZE: usize = 97;

/// Seal/open operations left under a traffic key at which a key update
/// must be requested before the nonce counter is exhausted.
pub const KEY_UPDATE_HEADROOM: u64 = 1000;

// =============================================================================
// WIRE LIMITS
// =============================================================================

/// Hard cap on a single packet payload (ciphertext plus tag).
pub const MAX_PACKET_SIZE: usize = 65535;

/// Hard cap on a reassembled handshake record.
pub const MAX_RECORD_SIZE: usize = 16384;

/// Default estimated transmit size when the transport gives no hint.
/// Empirical value for BLE-backed companion links.
pub const DEFAULT_ESTIMATED_TRANSMIT_SIZE: usize = 4096;

// =============================================================================
// TIMING CONSTANTS
// =============================================================================

/// Send a keep-alive ping if no ack-soliciting packet is in flight for
/// this long.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Consider the link dead if an ack-soliciting packet stays unacknowledged
/// for this long.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Budget for the graceful close handshake before escalating to abort.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// STREAM LIMITS
// =============================================================================

/// Per-stream in-flight byte window before `send` fragments stop being
/// emitted until the peer acknowledges.
pub const STREAM_SEND_WINDOW: u64 = 32 * 1024;

/// Maximum stream priority value (6-bit field in the stream id).
pub const MAX_STREAM_PRIORITY: u8 = 63;
