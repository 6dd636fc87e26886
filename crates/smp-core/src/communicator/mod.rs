//! Message channel abstractions for the data channel.
//!
//! The data channel talks to the service through the `MessageChannel` trait
//! so tests can substitute an in-memory fake for the real websocket.

mod websocket;

pub use websocket::WebSocketChannel;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Kind of websocket message to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// UTF-8 text frame (the token handshake).
    Text,
    /// Binary frame (every protocol frame after the token).
    Binary,
}

/// Callback invoked with each raw incoming message.
pub type OnMessageHandler = Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Callback invoked when the receiver gives up on the connection.
pub type OnErrorHandler = Arc<dyn Fn(Error) -> BoxFuture<'static, ()> + Send + Sync>;

/// A bidirectional message channel to the remote service.
///
/// Contract:
/// - `send_message` fails when the channel is not open or the input is empty;
///   concurrent sends are serialized internally.
/// - Exactly one background receiver reads the connection and invokes the
///   on-message handler; read errors are retried a bounded number of times
///   before the on-error handler fires.
/// - `close` is idempotent.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Open the connection and start the receiver and keep-alive tasks.
    async fn open(&self) -> Result<()>;

    /// Close the connection, stopping background tasks.
    async fn close(&self) -> Result<()>;

    /// Send one message.
    async fn send_message(&self, input: &[u8], kind: MessageKind) -> Result<()>;

    /// The stream URL this channel connects to.
    fn stream_url(&self) -> String;

    /// The current channel token.
    fn channel_token(&self) -> String;

    /// Replace the channel token (after a session resume).
    fn set_channel_token(&self, token: String);

    /// Install the incoming-message handler.
    fn set_on_message(&self, handler: OnMessageHandler);

    /// Install the connection-error handler.
    fn set_on_error(&self, handler: OnErrorHandler);
}
