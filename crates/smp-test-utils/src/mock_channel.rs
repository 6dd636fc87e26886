//! In-memory message channel for testing without a websocket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;

use smp_core::communicator::{MessageChannel, MessageKind, OnErrorHandler, OnMessageHandler};
use smp_core::error::{Error, Result};
use smp_core::protocol::{ACKNOWLEDGE_MESSAGE, AcknowledgeContent, ClientMessage, INPUT_STREAM_MESSAGE};

/// A message channel that records everything sent through it and lets tests
/// inject incoming traffic.
pub struct MockChannel {
    sent: Mutex<Vec<(Vec<u8>, MessageKind)>>,
    token: RwLock<String>,
    is_open: AtomicBool,
    fail_sends: AtomicBool,
    open_count: Mutex<u32>,
    on_message: RwLock<Option<OnMessageHandler>>,
    on_error: RwLock<Option<OnErrorHandler>>,
}

impl MockChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            token: RwLock::new("mock-token".to_string()),
            is_open: AtomicBool::new(false),
            fail_sends: AtomicBool::new(false),
            open_count: Mutex::new(0),
            on_message: RwLock::new(None),
            on_error: RwLock::new(None),
        })
    }

    /// Make every subsequent send fail with a transport error.
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// How many times `open` was called.
    pub fn open_count(&self) -> u32 {
        *self.open_count.lock().unwrap()
    }

    /// Everything sent, raw.
    pub fn sent_messages(&self) -> Vec<(Vec<u8>, MessageKind)> {
        self.sent.lock().unwrap().clone()
    }

    /// Binary frames sent, parsed.
    pub fn sent_frames(&self) -> Vec<ClientMessage> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, kind)| *kind == MessageKind::Binary)
            .map(|(raw, _)| ClientMessage::deserialize(raw).expect("sent frame must parse"))
            .collect()
    }

    /// Acknowledge payloads sent, in order.
    pub fn sent_acks(&self) -> Vec<AcknowledgeContent> {
        self.sent_frames()
            .iter()
            .filter(|m| m.message_type == ACKNOWLEDGE_MESSAGE)
            .map(|m| m.acknowledge_content().expect("ack payload must parse"))
            .collect()
    }

    /// Input stream frames sent, in order.
    pub fn sent_inputs(&self) -> Vec<ClientMessage> {
        self.sent_frames()
            .into_iter()
            .filter(|m| m.message_type == INPUT_STREAM_MESSAGE)
            .collect()
    }

    /// Text messages sent (the token handshake).
    pub fn sent_texts(&self) -> Vec<Vec<u8>> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, kind)| *kind == MessageKind::Text)
            .map(|(raw, _)| raw.clone())
            .collect()
    }

    /// Deliver a raw message to the installed on-message handler.
    pub async fn deliver(&self, raw: Vec<u8>) {
        let handler = self.on_message.read().unwrap().clone();
        if let Some(handler) = handler {
            handler(raw).await;
        }
    }

    /// Invoke the installed on-error handler.
    pub async fn raise_error(&self, err: Error) {
        let handler = self.on_error.read().unwrap().clone();
        if let Some(handler) = handler {
            handler(err).await;
        }
    }
}

#[async_trait]
impl MessageChannel for MockChannel {
    async fn open(&self) -> Result<()> {
        self.is_open.store(true, Ordering::SeqCst);
        *self.open_count.lock().unwrap() += 1;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.is_open.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send_message(&self, input: &[u8], kind: MessageKind) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(Error::Transport {
                message: "mock send failure".to_string(),
            });
        }
        self.sent.lock().unwrap().push((input.to_vec(), kind));
        Ok(())
    }

    fn stream_url(&self) -> String {
        "wss://mock/stream".to_string()
    }

    fn channel_token(&self) -> String {
        self.token.read().unwrap().clone()
    }

    fn set_channel_token(&self, token: String) {
        *self.token.write().unwrap() = token;
    }

    fn set_on_message(&self, handler: OnMessageHandler) {
        *self.on_message.write().unwrap() = Some(handler);
    }

    fn set_on_error(&self, handler: OnErrorHandler) {
        *self.on_error.write().unwrap() = Some(handler);
    }
}
