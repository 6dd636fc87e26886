//! Control-plane capability consumed by the session dispatcher.

use async_trait::async_trait;

use smp_core::Result;

/// The two control-plane calls the plugin makes during a session's life.
///
/// Both may fail transiently; callers wrap them in the reconnect retryer.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Ask for a fresh token to reconnect the stream.
    ///
    /// `None` means the remote session has timed out and will not resume.
    async fn resume_session(&self, session_id: &str) -> Result<Option<String>>;

    /// Tear down the remote session.
    async fn terminate_session(&self, session_id: &str) -> Result<()>;
}
