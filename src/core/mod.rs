//! Core types shared by every QLIC layer.
//!
//! This module is always compiled, independent of feature flags. It holds
//! the protocol constants, the connection role and security-level types,
//! and the error taxonomy that the engines report through.

mod constants;
mod error;
mod types;

pub use constants::*;
pub use error::*;
pub use types::*;
