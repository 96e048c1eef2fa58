//! Credit-based flow control.
//!
//! QLIC paces writes to the link's real throughput and detects dead
//! connections without full congestion control; see [`engine`].

pub mod engine;

pub use engine::{FlowControlEngine, StreamAck};
