//! Protocol module for the smp wire format.
//!
//! This module provides:
//! - The fixed-offset binary frame (`ClientMessage`) and its codec
//! - Payload type and flag enumerations
//! - Handshake, challenge and control payload definitions

mod handshake;
mod message;

#[cfg(test)]
mod proptest;

pub use handshake::*;
pub use message::*;
