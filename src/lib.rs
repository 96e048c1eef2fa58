//! # QLIC Protocol
//!
//! QLIC is a secure, multiplexed, flow-controlled transport protocol that
//! runs over any ordered, reliable byte stream (a Bluetooth-backed socket,
//! a TCP connection) between a companion app and a wearable device. It
//! provides:
//!
//! - **Security**: a TLS-like handshake with pluggable mutual attestation,
//!   forward-secret session keys, and authenticated encryption of every packet
//! - **Multiplexing**: independently flow-controlled application streams with
//!   half-close semantics
//! - **Pacing**: credit-based flow control tuned for low-throughput wireless
//!   links, with keep-alive and dead-link detection
//! - **Simplicity**: a single coordinating run loop per connection; no
//!   congestion control, retransmission, or reordering of its own
//!
//! ## Feature Flags
//!
//! - `crypto` (default): key schedule, encryption engine, handshake engine
//! - `transport` (default): byte-transport adapters and the connection run
//!   loop (requires `crypto`)
//!
//! ## Modules
//!
//! - [`core`]: constants, shared types, and error taxonomy (always included)
//! - [`codec`]: varint, frame, and packet wire codecs (always included)
//! - [`flow`]: credit-based flow-control engine (always included)
//! - [`stream`]: stream ids and the stream-multiplexing engine (always included)
//! - [`crypto`]: key derivation and packet encryption (requires `crypto`)
//! - [`handshake`]: handshake records, engine, and pluggable authentication
//!   (requires `crypto`)
//! - [`transport`]: byte-stream abstraction and adapters (requires `transport`)
//! - [`connection`]: the per-connection run loop and public connection API
//!   (requires `transport`)
//!
//! ## Layering
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │         Application streams                │
//! ├────────────────────────────────────────────┤
//! │  Connection run loop                       │  ← one task per connection
//! │  handshake · flow control · stream engine  │
//! ├────────────────────────────────────────────┤
//! │  Frame codec → encryption → packet codec   │
//! ├────────────────────────────────────────────┤
//! │  Ordered reliable byte stream              │
//! └────────────────────────────────────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Core module (always included)
pub mod core;

// Wire codecs (always included)
pub mod codec;

// Flow-control engine (always included)
pub mod flow;

// Stream-multiplexing engine (always included)
pub mod stream;

// Security layer (feature-gated)
#[cfg(feature = "crypto")]
#[cfg_attr(docsrs, doc(cfg(feature = "crypto")))]
pub mod crypto;

// Handshake layer (feature-gated)
#[cfg(feature = "crypto")]
#[cfg_attr(docsrs, doc(cfg(feature = "crypto")))]
pub mod handshake;

// Byte-transport abstraction (feature-gated)
#[cfg(feature = "transport")]
#[cfg_attr(docsrs, doc(cfg(feature = "transport")))]
pub mod transport;

// Connection run loop (feature-gated)
#[cfg(feature = "transport")]
#[cfg_attr(docsrs, doc(cfg(feature = "transport")))]
pub mod connection;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::*;

    pub use crate::codec::{Frame, FrameType, PacketDeframer};
    pub use crate::flow::FlowControlEngine;
    pub use crate::stream::{DataUnit, StreamEngine, StreamEvent, StreamId};

    #[cfg(feature = "crypto")]
    pub use crate::crypto::{EncryptionEngine, KeySchedule, TrafficKey, TrafficSecret};

    #[cfg(feature = "crypto")]
    pub use crate::handshake::{
        AuthAlgorithm, AuthProvider, AuthVerifier, HandshakeEngine, HandshakeEngineConfig,
    };

    #[cfg(feature = "transport")]
    pub use crate::connection::{Connection, ConnectionBuilder, ConnectionConfig, StreamHandle};

    #[cfg(feature = "transport")]
    pub use crate::transport::ByteTransport;
}

// Re-export commonly used items at crate root
pub use crate::core::{ProtocolError, QlicError, Role, SecurityLevel};

pub use crate::stream::{DataUnit, StreamId};

#[cfg(feature = "transport")]
pub use crate::connection::{Connection, ConnectionBuilder, StreamHandle};
