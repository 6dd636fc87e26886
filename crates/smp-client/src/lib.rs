//! smp-client: the session manager plugin executable.
//!
//! This crate provides:
//! - CLI argument validation for the outer-CLI invocation contract
//! - The session dispatcher and subsystem registry
//! - The shell and port forwarding subsystems
//! - AWS control-plane and key-management adapters

pub mod awsapi;
pub mod cli;
pub mod service;
pub mod session;
pub mod terminal;

pub use service::ControlPlane;
pub use session::{Session, SessionRegistry};
