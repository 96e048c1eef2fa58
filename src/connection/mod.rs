//! Connection layer: the run loop, its signal queues, and the public
//! connection/stream API.
//!
//! One connection is one independent unit of concurrency. Within it,
//! reading and writing are mutually exclusive activities of a single
//! coordinator task; see [`run_loop`].

pub mod run_loop;
pub mod signal;

pub use run_loop::{
    Connection, ConnectionBuilder, ConnectionConfig, ConnectionError, ConnectionState,
    PeerStreamCallback, StreamCallbacks, StreamHandle,
};
pub use signal::Signal;
