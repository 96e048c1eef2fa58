//! Stream multiplexing.
//!
//! - [`id`]: stream identifiers packing originator, directionality,
//!   priority, and sequence number
//! - [`engine`]: per-stream state machines, message fragmentation and
//!   reassembly, and the stream table

pub mod engine;
pub mod id;

pub use engine::{DataUnit, StreamEngine, StreamEvent};
pub use id::StreamId;
