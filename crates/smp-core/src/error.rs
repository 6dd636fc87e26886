//! Error types for smp-core.

use thiserror::Error;

/// Main error type for smp operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying system calls.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame failed to deserialize or validate.
    #[error("codec error: {message}")]
    Codec { message: String },

    /// Protocol violation above the frame layer.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Websocket transport failure.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// Send attempted while the channel is closed.
    #[error("channel is closed")]
    ChannelClosed,

    /// A handshake action could not be processed.
    #[error("handshake error: {message}")]
    Handshake { message: String },

    /// Payload encryption or decryption failure.
    #[error("encryption error: {message}")]
    Encryption { message: String },

    /// Handshake finished without announcing a session type.
    #[error("unable to determine SessionType")]
    SessionTypeUnknown,

    /// An unacknowledged frame exhausted its resend budget.
    #[error("stream data was not processed before resend timeout")]
    ResendTimeout,

    /// Control plane or key management service call failed.
    #[error("service error: {message}")]
    Service { message: String },
}

impl Error {
    /// Returns true if this error is transient and reconnection may help.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Transport { .. } | Error::ChannelClosed | Error::Io(_)
        )
    }
}

/// Convenience result type for smp operations.
pub type Result<T> = std::result::Result<T, Error>;
