//! Websocket implementation of the message channel.
//!
//! One background task reads the socket; writes from any task are serialized
//! by a mutex around the sink half. A keep-alive ping goes out every five
//! minutes while the connection is open.

use std::sync::Arc;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};

use crate::communicator::{MessageChannel, MessageKind, OnErrorHandler, OnMessageHandler};
use crate::constants::{PING_TIME_INTERVAL, WEBSOCKET_RETRY_ATTEMPT};
use crate::error::{Error, Result};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Websocket channel to the service stream URL.
pub struct WebSocketChannel {
    inner: Arc<Inner>,
}

struct Inner {
    url: String,
    token: RwLock<String>,
    is_open: AtomicBool,
    writer: Mutex<Option<WsSink>>,
    on_message: RwLock<Option<OnMessageHandler>>,
    on_error: RwLock<Option<OnErrorHandler>>,
}

impl WebSocketChannel {
    /// Create a channel for the given stream URL and token.
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                url: url.into(),
                token: RwLock::new(token.into()),
                is_open: AtomicBool::new(false),
                writer: Mutex::new(None),
                on_message: RwLock::new(None),
                on_error: RwLock::new(None),
            }),
        }
    }
}

impl Inner {
    async fn write(&self, message: Message) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let sink = guard.as_mut().ok_or(Error::ChannelClosed)?;
        sink.send(message).await.map_err(|e| Error::Transport {
            message: format!("websocket write failed: {e}"),
        })
    }

    fn start_pings(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if !inner.is_open.load(Ordering::SeqCst) {
                    return;
                }
                debug!("sending websocket keepalive ping");
                if let Err(e) = inner.write(Message::Ping(b"keepalive".to_vec())).await {
                    error!(error = %e, "error while sending websocket ping");
                    return;
                }
                tokio::time::sleep(PING_TIME_INTERVAL).await;
            }
        });
    }

    fn start_receiver(self: &Arc<Self>, mut stream: WsStream) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let mut retry_count = 0u32;
            loop {
                if !inner.is_open.load(Ordering::SeqCst) {
                    debug!(url = %inner.url, "receiver stopping: channel closed");
                    break;
                }

                match stream.next().await {
                    Some(Ok(Message::Binary(data))) => {
                        retry_count = 0;
                        inner.dispatch_message(data).await;
                    }
                    Some(Ok(Message::Text(text))) => {
                        retry_count = 0;
                        inner.dispatch_message(text.into_bytes()).await;
                    }
                    Some(Ok(other)) => {
                        // Control frames are handled by tungstenite itself
                        debug!(kind = ?other, "skipping non-data websocket message");
                    }
                    Some(Err(e)) => {
                        retry_count += 1;
                        if retry_count >= WEBSOCKET_RETRY_ATTEMPT {
                            error!(
                                attempts = retry_count,
                                "reached the retry limit for receiving messages"
                            );
                            inner
                                .dispatch_error(Error::Transport {
                                    message: format!("websocket read failed: {e}"),
                                })
                                .await;
                            break;
                        }
                        debug!(attempts = retry_count, error = %e, "error receiving websocket message");
                    }
                    None => {
                        // A drained stream keeps yielding None, so this
                        // resolves to the error handler after the retry budget
                        retry_count += 1;
                        if retry_count >= WEBSOCKET_RETRY_ATTEMPT {
                            error!(
                                attempts = retry_count,
                                "reached the retry limit for receiving messages"
                            );
                            inner.dispatch_error(Error::ChannelClosed).await;
                            break;
                        }
                        debug!(attempts = retry_count, "websocket stream yielded no message");
                    }
                }
            }
        });
    }

    async fn dispatch_message(&self, data: Vec<u8>) {
        let handler = self.on_message.read().expect("handler lock poisoned").clone();
        match handler {
            Some(handler) => handler(data).await,
            None => warn!("incoming message dropped: no handler installed"),
        }
    }

    async fn dispatch_error(&self, err: Error) {
        let handler = self.on_error.read().expect("handler lock poisoned").clone();
        match handler {
            Some(handler) => handler(err).await,
            None => error!(error = %err, "websocket error with no handler installed"),
        }
    }
}

#[async_trait]
impl MessageChannel for WebSocketChannel {
    async fn open(&self) -> Result<()> {
        info!(url = %self.inner.url, "opening websocket connection");

        let (ws_stream, _) = connect_async(&self.inner.url).await.map_err(|e| {
            Error::Transport {
                message: format!("failed to dial websocket: {e}"),
            }
        })?;
        let (sink, stream) = ws_stream.split();

        *self.inner.writer.lock().await = Some(sink);
        self.inner.is_open.store(true, Ordering::SeqCst);

        self.inner.start_pings();
        self.inner.start_receiver(stream);

        info!(url = %self.inner.url, "websocket connection established");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.inner.is_open.swap(false, Ordering::SeqCst) {
            info!(url = %self.inner.url, "websocket connection already closed");
            return Ok(());
        }

        info!(url = %self.inner.url, "closing websocket connection");
        let mut guard = self.inner.writer.lock().await;
        if let Some(mut sink) = guard.take() {
            if let Err(e) = sink.close().await {
                return Err(Error::Transport {
                    message: format!("failed to close websocket: {e}"),
                });
            }
        }
        Ok(())
    }

    async fn send_message(&self, input: &[u8], kind: MessageKind) -> Result<()> {
        if !self.inner.is_open.load(Ordering::SeqCst) {
            return Err(Error::ChannelClosed);
        }
        if input.is_empty() {
            return Err(Error::Transport {
                message: "cannot send empty input".to_string(),
            });
        }

        let message = match kind {
            MessageKind::Text => Message::Text(String::from_utf8_lossy(input).into_owned()),
            MessageKind::Binary => Message::Binary(input.to_vec()),
        };
        self.inner.write(message).await
    }

    fn stream_url(&self) -> String {
        self.inner.url.clone()
    }

    fn channel_token(&self) -> String {
        self.inner.token.read().expect("token lock poisoned").clone()
    }

    fn set_channel_token(&self, token: String) {
        *self.inner.token.write().expect("token lock poisoned") = token;
    }

    fn set_on_message(&self, handler: OnMessageHandler) {
        *self.inner.on_message.write().expect("handler lock poisoned") = Some(handler);
    }

    fn set_on_error(&self, handler: OnErrorHandler) {
        *self.inner.on_error.write().expect("handler lock poisoned") = Some(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_fails_when_not_open() {
        let channel = WebSocketChannel::new("wss://example.invalid/stream", "token");
        let err = channel
            .send_message(b"data", MessageKind::Binary)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ChannelClosed));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let channel = WebSocketChannel::new("wss://example.invalid/stream", "token");
        channel.close().await.unwrap();
        channel.close().await.unwrap();
    }

    #[test]
    fn token_can_be_replaced() {
        let channel = WebSocketChannel::new("wss://example.invalid/stream", "first");
        assert_eq!(channel.channel_token(), "first");
        channel.set_channel_token("second".to_string());
        assert_eq!(channel.channel_token(), "second");
    }

    #[test]
    fn stream_url_is_reported() {
        let channel = WebSocketChannel::new("wss://example.invalid/stream", "token");
        assert_eq!(channel.stream_url(), "wss://example.invalid/stream");
    }
}
