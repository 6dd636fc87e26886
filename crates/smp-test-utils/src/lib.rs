//! Test doubles for the smp workspace: an in-memory message channel, a fixed
//! key provider and wire frame builders.

mod frames;
mod mock_channel;
mod mock_kms;

pub use frames::{output_frame, handshake_complete_frame, handshake_request_frame};
pub use mock_channel::MockChannel;
pub use mock_kms::MockKms;
