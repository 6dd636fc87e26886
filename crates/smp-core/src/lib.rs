//! smp-core: Shared library for the smp session protocol.
//!
//! This crate provides:
//! - The fixed-offset binary frame format and codec
//! - Handshake and control payload definitions
//! - The websocket message channel with keep-alive and bounded read retry
//! - The data channel: sequencing, acknowledgments, RTO, resend scheduling
//! - KMS-backed AES-GCM payload encryption
//! - Backoff retry and agent version gates

pub mod communicator;
pub mod constants;
pub mod datachannel;
pub mod encryption;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod retry;
pub mod version;

pub use error::{Error, Result};
pub use logging::{LogFormat, init_logging};
