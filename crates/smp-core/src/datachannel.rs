//! The reliability and negotiation layer above the websocket.
//!
//! Responsibilities:
//! - Assign monotonic sequence numbers to outgoing stream frames and keep
//!   them buffered until acknowledged
//! - Acknowledge incoming frames and deliver them to the registered handlers
//!   strictly in sequence order, buffering reordered arrivals
//! - Estimate the retransmission timeout from acknowledged round trips and
//!   resend the head-of-line frame when it expires
//! - Drive the handshake: KMS encryption setup and session type selection

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::communicator::{MessageChannel, MessageKind};
use crate::constants::{
    CLIENT_VERSION, CLOCK_GRANULARITY, DEFAULT_ROUND_TRIP_TIME,
    DEFAULT_ROUND_TRIP_TIME_VARIATION, DEFAULT_TRANSMISSION_TIMEOUT,
    INCOMING_MESSAGE_BUFFER_CAPACITY, INTERACTIVE_COMMANDS_PLUGIN_NAME, MAX_TRANSMISSION_TIMEOUT,
    MESSAGE_SCHEMA_VERSION, NON_INTERACTIVE_COMMANDS_PLUGIN_NAME,
    OPEN_DATA_CHANNEL_SCHEMA_VERSION, OUTGOING_MESSAGE_BUFFER_CAPACITY, PORT_PLUGIN_NAME,
    RESEND_MAX_ATTEMPT, RESEND_SLEEP_INTERVAL, RTT_CONSTANT, RTTV_CONSTANT, SHELL_PLUGIN_NAME,
};
use crate::encryption::{Encrypter, KmsKeyProvider};
use crate::error::{Error, Result};
use crate::protocol::{
    ACKNOWLEDGE_MESSAGE, ACTION_KMS_ENCRYPTION, ACTION_SESSION_TYPE, AcknowledgeContent,
    CHANNEL_CLOSED_MESSAGE, ClientMessage, EncryptionChallengeResponse, HEADER_LENGTH,
    HandshakeResponsePayload, INPUT_STREAM_MESSAGE, KmsEncryptionRequest, KmsEncryptionResponse,
    OUTPUT_STREAM_MESSAGE, OpenDataChannelInput, PAUSE_PUBLICATION_MESSAGE, PayloadType,
    PayloadTypeFlag, ProcessedClientAction, START_PUBLICATION_MESSAGE, ActionStatus,
    SessionTypeRequest, now_millis, serialize_acknowledge,
};

/// Handler for output-stream frames. Returns whether the handler was ready to
/// take the frame; unready frames are not acknowledged.
pub type OutputStreamHandler =
    Arc<dyn Fn(ClientMessage) -> BoxFuture<'static, Result<bool>> + Send + Sync>;

/// Handler invoked when the remote closes the channel.
pub type StopHandler = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Opaque id for a registered output-stream handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// One buffered outgoing frame awaiting acknowledgment.
struct OutgoingMessage {
    content: Vec<u8>,
    sequence_number: i64,
    last_sent_time: Instant,
    resend_attempt: u32,
}

/// One buffered incoming frame that arrived ahead of the expectation.
struct IncomingMessage {
    content: Vec<u8>,
    sequence_number: i64,
    received_time: Instant,
}

struct OutgoingBuffer {
    messages: VecDeque<OutgoingMessage>,
    next_sequence: i64,
}

struct IncomingBuffer {
    messages: HashMap<i64, IncomingMessage>,
    expected_sequence: i64,
}

/// Round-trip timing state feeding the retransmission timeout.
struct TimingState {
    round_trip_time: f64,
    round_trip_time_variation: f64,
    retransmission_timeout: Duration,
}

/// The data channel: owns the message channel and optionally an encrypter.
pub struct DataChannel {
    channel: Arc<dyn MessageChannel>,
    client_id: String,
    session_id: String,
    target_id: String,
    is_aws_cli_upgrade_needed: bool,

    outgoing: Mutex<OutgoingBuffer>,
    incoming: Mutex<IncomingBuffer>,
    timing: RwLock<TimingState>,

    kms_provider: RwLock<Option<Arc<dyn KmsKeyProvider>>>,
    encrypter: RwLock<Option<Arc<Encrypter>>>,
    encryption_enabled: AtomicBool,

    session_type: RwLock<Option<String>>,
    session_properties: RwLock<Value>,
    agent_version: RwLock<String>,

    handlers: RwLock<Vec<(HandlerId, OutputStreamHandler)>>,
    is_session_specific_handler_set: AtomicBool,
    next_handler_id: AtomicU64,
    stop_handler: RwLock<Option<StopHandler>>,

    session_type_tx: mpsc::Sender<bool>,
    session_type_rx: Mutex<mpsc::Receiver<bool>>,
    resend_timeout_tx: mpsc::Sender<bool>,
    resend_timeout_rx: Mutex<mpsc::Receiver<bool>>,
}

impl DataChannel {
    /// Create a data channel over the given message channel.
    pub fn new(
        channel: Arc<dyn MessageChannel>,
        client_id: impl Into<String>,
        session_id: impl Into<String>,
        target_id: impl Into<String>,
        is_aws_cli_upgrade_needed: bool,
    ) -> Self {
        let (session_type_tx, session_type_rx) = mpsc::channel(1);
        let (resend_timeout_tx, resend_timeout_rx) = mpsc::channel(1);
        Self {
            channel,
            client_id: client_id.into(),
            session_id: session_id.into(),
            target_id: target_id.into(),
            is_aws_cli_upgrade_needed,
            outgoing: Mutex::new(OutgoingBuffer {
                messages: VecDeque::new(),
                next_sequence: 0,
            }),
            incoming: Mutex::new(IncomingBuffer {
                messages: HashMap::new(),
                expected_sequence: 0,
            }),
            timing: RwLock::new(TimingState {
                round_trip_time: DEFAULT_ROUND_TRIP_TIME.as_secs_f64(),
                round_trip_time_variation: DEFAULT_ROUND_TRIP_TIME_VARIATION,
                retransmission_timeout: DEFAULT_TRANSMISSION_TIMEOUT,
            }),
            kms_provider: RwLock::new(None),
            encrypter: RwLock::new(None),
            encryption_enabled: AtomicBool::new(false),
            session_type: RwLock::new(None),
            session_properties: RwLock::new(Value::Null),
            agent_version: RwLock::new(String::new()),
            handlers: RwLock::new(Vec::new()),
            is_session_specific_handler_set: AtomicBool::new(false),
            next_handler_id: AtomicU64::new(0),
            stop_handler: RwLock::new(None),
            session_type_tx,
            session_type_rx: Mutex::new(session_type_rx),
            resend_timeout_tx,
            resend_timeout_rx: Mutex::new(resend_timeout_rx),
        }
    }

    /// Install the key provider used when the remote requests KMS encryption.
    pub fn set_kms_provider(&self, provider: Arc<dyn KmsKeyProvider>) {
        *self.kms_provider.write().expect("kms lock poisoned") = Some(provider);
    }

    /// Install the handler invoked when the remote closes the channel.
    pub fn set_stop_handler(&self, handler: StopHandler) {
        *self.stop_handler.write().expect("stop lock poisoned") = Some(handler);
    }

    /// The underlying message channel.
    pub fn channel(&self) -> &Arc<dyn MessageChannel> {
        &self.channel
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Open the websocket and present the token to the service.
    pub async fn open(&self) -> Result<()> {
        self.channel.open().await?;
        self.finalize_data_channel_handshake(&self.channel.channel_token())
            .await
    }

    /// Close the underlying websocket.
    pub async fn close(&self) -> Result<()> {
        info!(url = %self.channel.stream_url(), "closing data channel");
        self.channel.close().await
    }

    /// Close and re-open the websocket after the token was refreshed.
    pub async fn reconnect(&self) -> Result<()> {
        if let Err(e) = self.close().await {
            debug!(error = %e, "closing data channel before reconnect failed");
        }
        self.open().await?;
        info!(url = %self.channel.stream_url(), "successfully reconnected data channel");
        Ok(())
    }

    /// Send the token as the first (text) frame so the service acknowledges
    /// the connection.
    pub async fn finalize_data_channel_handshake(&self, token_value: &str) -> Result<()> {
        info!(url = %self.channel.stream_url(), "sending token to acknowledge connection");
        let input = OpenDataChannelInput {
            message_schema_version: OPEN_DATA_CHANNEL_SCHEMA_VERSION.to_string(),
            request_id: uuid::Uuid::new_v4().to_string(),
            token_value: token_value.to_string(),
            client_id: self.client_id.clone(),
            client_version: CLIENT_VERSION.to_string(),
        };
        let payload = serde_json::to_vec(&input).map_err(|e| Error::Protocol {
            message: format!("cannot serialize open data channel input: {e}"),
        })?;
        self.channel.send_message(&payload, MessageKind::Text).await
    }

    // =========================================================================
    // Outgoing Path
    // =========================================================================

    /// Send a stream data frame, assigning the next sequence number and
    /// buffering the frame until it is acknowledged.
    pub async fn send_input_data_message(
        &self,
        payload_type: PayloadType,
        input_data: &[u8],
    ) -> Result<()> {
        // The remote pseudo-terminal takes a bare line feed as "next line";
        // rewrite it to carriage return before anything else looks at it
        let mut payload = if input_data == [0x0A] {
            vec![0x0D]
        } else {
            input_data.to_vec()
        };

        if payload_type == PayloadType::Output && self.encryption_enabled.load(Ordering::SeqCst) {
            let encrypter = self
                .encrypter
                .read()
                .expect("encrypter lock poisoned")
                .clone()
                .ok_or_else(|| Error::Encryption {
                    message: "encryption enabled without an encrypter".to_string(),
                })?;
            payload = encrypter.encrypt(&payload)?;
        }

        let mut outgoing = self.outgoing.lock().await;
        let sequence_number = outgoing.next_sequence;

        let message = ClientMessage {
            header_length: HEADER_LENGTH,
            message_type: INPUT_STREAM_MESSAGE.to_string(),
            schema_version: MESSAGE_SCHEMA_VERSION,
            created_date: now_millis(),
            sequence_number,
            flags: 0,
            message_id: uuid::Uuid::new_v4(),
            payload_digest: [0; 32],
            payload_type: payload_type as u32,
            payload_length: payload.len() as u32,
            payload,
        };
        let content = message.serialize()?;

        trace!(sequence_number, "sending stream data message");
        self.channel
            .send_message(&content, MessageKind::Binary)
            .await
            .map_err(|e| {
                error!(error = %e, "error sending stream data message");
                e
            })?;

        if outgoing.messages.len() == OUTGOING_MESSAGE_BUFFER_CAPACITY {
            outgoing.messages.pop_front();
        }
        outgoing.messages.push_back(OutgoingMessage {
            content,
            sequence_number,
            last_sent_time: Instant::now(),
            resend_attempt: 0,
        });
        outgoing.next_sequence += 1;
        Ok(())
    }

    /// Send a control flag as a stream data frame.
    pub async fn send_flag(&self, flag: PayloadTypeFlag) -> Result<()> {
        self.send_input_data_message(PayloadType::Flag, &flag.to_payload())
            .await
    }

    /// Spawn the background task that resends the head of the outgoing
    /// buffer whenever it outlives the retransmission timeout.
    pub fn start_resend_scheduler(self: &Arc<Self>) {
        let channel = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(RESEND_SLEEP_INTERVAL).await;

                let resend = {
                    let mut outgoing = channel.outgoing.lock().await;
                    let timeout = channel.retransmission_timeout();
                    match outgoing.messages.front_mut() {
                        Some(head) if head.last_sent_time.elapsed() > timeout => {
                            debug!(
                                sequence_number = head.sequence_number,
                                attempt = head.resend_attempt,
                                "resending stream data message"
                            );
                            if head.resend_attempt >= RESEND_MAX_ATTEMPT {
                                warn!(
                                    sequence_number = head.sequence_number,
                                    attempts = RESEND_MAX_ATTEMPT,
                                    "message was resent over the attempt limit"
                                );
                                // Single-slot event; extra fires are dropped
                                let _ = channel.resend_timeout_tx.try_send(true);
                            }
                            head.resend_attempt += 1;
                            head.last_sent_time = Instant::now();
                            Some(head.content.clone())
                        }
                        _ => None,
                    }
                };

                // The write happens outside the lock; a concurrent ack may
                // remove the entry first and the remote drops the duplicate
                if let Some(content) = resend {
                    if let Err(e) = channel
                        .channel
                        .send_message(&content, MessageKind::Binary)
                        .await
                    {
                        error!(error = %e, "unable to resend stream data message");
                    }
                }
            }
        });
    }

    // =========================================================================
    // Incoming Path
    // =========================================================================

    /// Entry point for every raw message read off the websocket.
    pub async fn output_message_handler(&self, raw_message: &[u8]) -> Result<()> {
        let message = ClientMessage::deserialize(raw_message).map_err(|e| {
            error!(error = %e, "cannot deserialize raw message");
            e
        })?;
        message.validate().map_err(|e| {
            error!(error = %e, message_type = %message.message_type, "invalid message");
            e
        })?;

        trace!(message_type = %message.message_type, "processing stream data message");
        match message.message_type.as_str() {
            OUTPUT_STREAM_MESSAGE => self.handle_output_message(message, raw_message).await,
            ACKNOWLEDGE_MESSAGE => self.handle_acknowledge_message(message).await,
            CHANNEL_CLOSED_MESSAGE => {
                self.handle_channel_closed_message(message).await;
                Ok(())
            }
            START_PUBLICATION_MESSAGE | PAUSE_PUBLICATION_MESSAGE => Ok(()),
            other => {
                warn!(message_type = other, "invalid message type received");
                Ok(())
            }
        }
    }

    async fn handle_output_message(
        &self,
        mut message: ClientMessage,
        raw_message: &[u8],
    ) -> Result<()> {
        let mut incoming = self.incoming.lock().await;

        if message.sequence_number == incoming.expected_sequence {
            match PayloadType::from_u32(message.payload_type) {
                Some(PayloadType::HandshakeRequest) => {
                    self.send_acknowledge_message(&message).await?;
                    debug!("processing handshake request message");
                    self.handle_handshake_request(&message).await.map_err(|e| {
                        error!(error = %e, "unable to process handshake request");
                        e
                    })?;
                }
                Some(PayloadType::HandshakeComplete) => {
                    self.send_acknowledge_message(&message).await?;
                    self.handle_handshake_complete(&message).await.map_err(|e| {
                        error!(error = %e, "unable to process handshake complete");
                        e
                    })?;
                }
                Some(PayloadType::EncChallengeRequest) => {
                    self.send_acknowledge_message(&message).await?;
                    self.handle_encryption_challenge_request(&message)
                        .await
                        .map_err(|e| {
                            error!(error = %e, "unable to process encryption challenge");
                            e
                        })?;
                }
                _ => {
                    trace!(
                        sequence_number = message.sequence_number,
                        "processing new incoming stream data message"
                    );
                    self.decrypt_if_needed(&mut message)?;

                    let is_handler_ready = self.process_with_handlers(message.clone()).await?;
                    if !is_handler_ready {
                        warn!(
                            sequence_number = message.sequence_number,
                            "stream data message not processed: session handler is not ready"
                        );
                        return Ok(());
                    }
                    // Only acknowledge once the session handler took the frame
                    self.send_acknowledge_message(&message).await?;
                }
            }
            incoming.expected_sequence += 1;
            self.process_incoming_buffer_items(&mut incoming).await;
        } else if message.sequence_number > incoming.expected_sequence {
            debug!(
                received = message.sequence_number,
                expected = incoming.expected_sequence,
                "received out-of-order sequence number, buffering"
            );
            if incoming.messages.len() < INCOMING_MESSAGE_BUFFER_CAPACITY {
                self.send_acknowledge_message(&message).await?;
                incoming.messages.insert(
                    message.sequence_number,
                    IncomingMessage {
                        content: raw_message.to_vec(),
                        sequence_number: message.sequence_number,
                        received_time: Instant::now(),
                    },
                );
            }
        } else {
            // Already delivered; the remote will stop resending without a new ack
            debug!(
                received = message.sequence_number,
                expected = incoming.expected_sequence,
                "dropping duplicate stream data message"
            );
        }
        Ok(())
    }

    /// Deliver buffered frames while the expectation is present in the
    /// reorder buffer.
    async fn process_incoming_buffer_items(&self, incoming: &mut IncomingBuffer) {
        while let Some(buffered) = incoming.messages.remove(&incoming.expected_sequence) {
            debug!(
                sequence_number = buffered.sequence_number,
                buffered_for_ms = buffered.received_time.elapsed().as_millis() as u64,
                "processing stream data message from the incoming buffer"
            );

            let mut message = match ClientMessage::deserialize(&buffered.content) {
                Ok(message) => message,
                Err(e) => {
                    error!(error = %e, "cannot deserialize buffered message");
                    return;
                }
            };
            if let Err(e) = self.decrypt_if_needed(&mut message) {
                error!(error = %e, "unable to decrypt buffered message payload");
                return;
            }

            // Replay from the buffer ignores handler readiness
            let _ = self.process_with_handlers(message).await;
            incoming.expected_sequence += 1;
        }
    }

    fn decrypt_if_needed(&self, message: &mut ClientMessage) -> Result<()> {
        if self.encryption_enabled.load(Ordering::SeqCst)
            && PayloadType::is_encryptable(message.payload_type)
        {
            let encrypter = self
                .encrypter
                .read()
                .expect("encrypter lock poisoned")
                .clone()
                .ok_or_else(|| Error::Encryption {
                    message: "encryption enabled without an encrypter".to_string(),
                })?;
            message.payload = encrypter.decrypt(&message.payload).map_err(|e| {
                error!(
                    payload_type = message.payload_type,
                    "unable to decrypt incoming data payload"
                );
                e
            })?;
        }
        Ok(())
    }

    async fn process_with_handlers(&self, message: ClientMessage) -> Result<bool> {
        // A known session type without its session handler means not ready
        if self.session_type.read().expect("session type lock poisoned").is_some()
            && !self.is_session_specific_handler_set.load(Ordering::SeqCst)
        {
            return Ok(false);
        }

        let handlers: Vec<OutputStreamHandler> = self
            .handlers
            .read()
            .expect("handlers lock poisoned")
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        let mut is_handler_ready = false;
        for handler in handlers {
            is_handler_ready = handler(message.clone()).await?;
            if !is_handler_ready {
                break;
            }
        }
        Ok(is_handler_ready)
    }

    // =========================================================================
    // Acknowledgments
    // =========================================================================

    async fn handle_acknowledge_message(&self, message: ClientMessage) -> Result<()> {
        let content = message.acknowledge_content().map_err(|e| {
            error!(error = %e, "cannot deserialize acknowledge payload");
            e
        })?;
        self.process_acknowledged_message(content).await;
        Ok(())
    }

    /// Drop the acknowledged frame from the outgoing buffer and fold its
    /// round trip into the retransmission timeout.
    pub async fn process_acknowledged_message(&self, acknowledge: AcknowledgeContent) {
        let mut outgoing = self.outgoing.lock().await;
        if let Some(index) = outgoing
            .messages
            .iter()
            .position(|m| m.sequence_number == acknowledge.sequence_number)
        {
            let sent_at = outgoing.messages[index].last_sent_time;
            self.update_retransmission_timeout(sent_at.elapsed());
            outgoing.messages.remove(index);
        } else {
            trace!(
                sequence_number = acknowledge.sequence_number,
                "acknowledge for unknown sequence number"
            );
        }
    }

    /// Acknowledge one received stream data frame.
    async fn send_acknowledge_message(&self, message: &ClientMessage) -> Result<()> {
        let content = AcknowledgeContent {
            message_type: message.message_type.clone(),
            message_id: message.message_id.to_string(),
            sequence_number: message.sequence_number,
            is_sequential_message: true,
        };
        let reply = serialize_acknowledge(&content)?;
        self.channel
            .send_message(&reply, MessageKind::Binary)
            .await
            .map_err(|e| {
                error!(error = %e, "error sending acknowledge message");
                e
            })
    }

    // =========================================================================
    // Retransmission Timeout
    // =========================================================================

    fn retransmission_timeout(&self) -> Duration {
        self.timing
            .read()
            .expect("timing lock poisoned")
            .retransmission_timeout
    }

    /// Fold one observed round trip into the RTT estimate:
    /// `RTTVar <- (1-b)RTTVar + b|RTT - r|`, `RTT <- (1-a)RTT + a*r`,
    /// `RTO <- RTT + max(granularity, 4*RTTVar)` capped at the maximum.
    fn update_retransmission_timeout(&self, round_trip: Duration) {
        let sample = round_trip.as_secs_f64();
        let mut timing = self.timing.write().expect("timing lock poisoned");

        timing.round_trip_time_variation = (1.0 - RTTV_CONSTANT)
            * timing.round_trip_time_variation
            + RTTV_CONSTANT * (timing.round_trip_time - sample).abs();

        timing.round_trip_time =
            (1.0 - RTT_CONSTANT) * timing.round_trip_time + RTT_CONSTANT * sample;

        let variation = (4.0 * timing.round_trip_time_variation)
            .max(CLOCK_GRANULARITY.as_secs_f64());
        let timeout = Duration::from_secs_f64(timing.round_trip_time + variation);
        timing.retransmission_timeout = timeout.min(MAX_TRANSMISSION_TIMEOUT);
    }

    // =========================================================================
    // Handshake
    // =========================================================================

    async fn handle_handshake_request(&self, message: &ClientMessage) -> Result<()> {
        let request = message.handshake_request()?;
        *self.agent_version.write().expect("agent version lock poisoned") =
            request.agent_version.clone();

        let mut errors: Vec<String> = Vec::new();
        let mut processed_actions: Vec<ProcessedClientAction> = Vec::new();

        for action in &request.requested_client_actions {
            let processed = match action.action_type.as_str() {
                ACTION_KMS_ENCRYPTION => {
                    match self
                        .process_kms_encryption_action(action.action_parameters.clone())
                        .await
                    {
                        Ok(blob) => ProcessedClientAction {
                            action_type: action.action_type.clone(),
                            action_status: ActionStatus::Success,
                            action_result: serde_json::to_value(KmsEncryptionResponse {
                                kms_cipher_text_key: blob,
                            })
                            .unwrap_or(Value::Null),
                            error: String::new(),
                        },
                        Err(e) => {
                            let text =
                                format!("Failed to process action {ACTION_KMS_ENCRYPTION}: {e}");
                            errors.push(e.to_string());
                            ProcessedClientAction {
                                action_type: action.action_type.clone(),
                                action_status: ActionStatus::Failed,
                                action_result: Value::Null,
                                error: text,
                            }
                        }
                    }
                }
                ACTION_SESSION_TYPE => {
                    match self.process_session_type_action(action.action_parameters.clone()) {
                        Ok(()) => ProcessedClientAction {
                            action_type: action.action_type.clone(),
                            action_status: ActionStatus::Success,
                            action_result: Value::Null,
                            error: String::new(),
                        },
                        Err(e) => {
                            let text =
                                format!("Failed to process action {ACTION_SESSION_TYPE}: {e}");
                            errors.push(e.to_string());
                            ProcessedClientAction {
                                action_type: action.action_type.clone(),
                                action_status: ActionStatus::Failed,
                                action_result: Value::Null,
                                error: text,
                            }
                        }
                    }
                }
                unsupported => {
                    let text = format!("Unsupported action {unsupported}");
                    errors.push(text.clone());
                    ProcessedClientAction {
                        action_type: action.action_type.clone(),
                        action_status: ActionStatus::Unsupported,
                        action_result: Value::Null,
                        error: text,
                    }
                }
            };
            processed_actions.push(processed);
        }

        let response = HandshakeResponsePayload {
            client_version: CLIENT_VERSION.to_string(),
            processed_client_actions: processed_actions,
            errors,
        };
        let payload = serde_json::to_vec(&response).map_err(|e| Error::Protocol {
            message: format!("cannot serialize handshake response: {e}"),
        })?;
        trace!("sending handshake response message");
        self.send_input_data_message(PayloadType::HandshakeResponse, &payload)
            .await
    }

    /// Set up the encrypter for the KMS key the agent named. Returns the
    /// encrypted data key blob for the handshake response.
    async fn process_kms_encryption_action(&self, parameters: Value) -> Result<Vec<u8>> {
        if self.is_aws_cli_upgrade_needed {
            return Err(Error::Handshake {
                message: "Installed version of CLI does not support Session Manager encryption \
                          feature. Please upgrade to the latest version of your CLI (e.g., AWS CLI)."
                    .to_string(),
            });
        }

        let request: KmsEncryptionRequest =
            serde_json::from_value(parameters).map_err(|e| Error::Handshake {
                message: format!("invalid KMSEncryption action parameters: {e}"),
            })?;

        let provider = self
            .kms_provider
            .read()
            .expect("kms lock poisoned")
            .clone()
            .ok_or_else(|| Error::Handshake {
                message: "no key management service configured".to_string(),
            })?;

        let context = HashMap::from([
            ("aws:ssm:SessionId".to_string(), self.session_id.clone()),
            ("aws:ssm:TargetId".to_string(), self.target_id.clone()),
        ]);
        let encrypter = Encrypter::new(provider.as_ref(), &request.kms_key_id, context).await?;
        let blob = encrypter.encrypted_data_key().to_vec();

        *self.encrypter.write().expect("encrypter lock poisoned") = Some(Arc::new(encrypter));
        self.encryption_enabled.store(true, Ordering::SeqCst);
        Ok(blob)
    }

    /// Record the announced session type; shell-like types collapse to the
    /// canonical shell name, Port passes through.
    fn process_session_type_action(&self, parameters: Value) -> Result<()> {
        let request: SessionTypeRequest =
            serde_json::from_value(parameters).map_err(|e| Error::Handshake {
                message: format!("invalid SessionType action parameters: {e}"),
            })?;

        let resolved = match request.session_type.as_str() {
            SHELL_PLUGIN_NAME
            | INTERACTIVE_COMMANDS_PLUGIN_NAME
            | NON_INTERACTIVE_COMMANDS_PLUGIN_NAME => SHELL_PLUGIN_NAME.to_string(),
            PORT_PLUGIN_NAME => request.session_type.clone(),
            other => {
                return Err(Error::Handshake {
                    message: format!("Unknown session type {other}"),
                });
            }
        };

        *self.session_type.write().expect("session type lock poisoned") = Some(resolved);
        *self
            .session_properties
            .write()
            .expect("session properties lock poisoned") = request.properties;
        Ok(())
    }

    async fn handle_handshake_complete(&self, message: &ClientMessage) -> Result<()> {
        let complete = message.handshake_complete()?;

        let type_set = self
            .session_type
            .read()
            .expect("session type lock poisoned")
            .is_some();
        let _ = self.session_type_tx.try_send(type_set);

        debug!(
            handshake_time_ns = complete.handshake_time_to_complete,
            "handshake complete"
        );
        if !complete.customer_message.is_empty() {
            println!("{}", complete.customer_message);
        }
        Ok(())
    }

    async fn handle_encryption_challenge_request(&self, message: &ClientMessage) -> Result<()> {
        let request = message.encryption_challenge_request()?;
        let encrypter = self
            .encrypter
            .read()
            .expect("encrypter lock poisoned")
            .clone()
            .ok_or_else(|| Error::Encryption {
                message: "encryption challenge before encrypter setup".to_string(),
            })?;

        let challenge = encrypter.decrypt(&request.challenge)?;
        let challenge = encrypter.encrypt(&challenge)?;

        let response = EncryptionChallengeResponse { challenge };
        let payload = serde_json::to_vec(&response).map_err(|e| Error::Protocol {
            message: format!("cannot serialize encryption challenge response: {e}"),
        })?;
        trace!("sending encryption challenge response message");
        self.send_input_data_message(PayloadType::EncChallengeResponse, &payload)
            .await
    }

    async fn handle_channel_closed_message(&self, message: ClientMessage) {
        let output = match message.channel_closed() {
            Ok(closed) => closed.output,
            Err(e) => {
                error!(error = %e, "cannot deserialize channel_closed payload");
                String::new()
            }
        };

        info!(session_id = %self.session_id, output = %output, "exiting session");
        if output.is_empty() {
            println!("\n\nExiting session with sessionId: {}.\n\n", self.session_id);
        } else {
            println!("\n\nSessionId: {} : {}\n\n", self.session_id, output);
        }

        self.stop_session().await;
    }

    /// Run the installed stop handler: the session teardown path shared by
    /// the channel-closed frame and the resend-timeout watcher.
    pub async fn stop_session(&self) {
        let handler = self.stop_handler.read().expect("stop lock poisoned").clone();
        if let Some(handler) = handler {
            handler().await;
        }
    }

    // =========================================================================
    // Handlers and Session State
    // =========================================================================

    /// Register an output-stream handler; session-specific handlers mark the
    /// channel ready for stream data.
    pub fn register_output_stream_handler(
        &self,
        handler: OutputStreamHandler,
        is_session_specific_handler: bool,
    ) -> HandlerId {
        let id = HandlerId(self.next_handler_id.fetch_add(1, Ordering::SeqCst));
        self.is_session_specific_handler_set
            .store(is_session_specific_handler, Ordering::SeqCst);
        self.handlers
            .write()
            .expect("handlers lock poisoned")
            .push((id, handler));
        id
    }

    /// Remove a handler registered with `register_output_stream_handler`.
    pub fn deregister_output_stream_handler(&self, id: HandlerId) {
        self.handlers
            .write()
            .expect("handlers lock poisoned")
            .retain(|(handler_id, _)| *handler_id != id);
    }

    /// Block until the handshake reports whether a session type was set.
    pub async fn wait_for_session_type(&self) -> bool {
        self.session_type_rx
            .lock()
            .await
            .recv()
            .await
            .unwrap_or(false)
    }

    /// Block until a frame exhausts its resend budget.
    pub async fn wait_for_resend_timeout(&self) {
        let _ = self.resend_timeout_rx.lock().await.recv().await;
    }

    /// The session type, once set by handshake or fallback.
    pub fn session_type(&self) -> Option<String> {
        self.session_type
            .read()
            .expect("session type lock poisoned")
            .clone()
    }

    /// Set the session type outside the handshake (legacy first-output
    /// fallback) and signal the waiting dispatcher.
    pub fn set_session_type(&self, session_type: impl Into<String>) {
        *self.session_type.write().expect("session type lock poisoned") =
            Some(session_type.into());
        let _ = self.session_type_tx.try_send(true);
    }

    /// Opaque properties announced with the session type.
    pub fn session_properties(&self) -> Value {
        self.session_properties
            .read()
            .expect("session properties lock poisoned")
            .clone()
    }

    /// Agent version learned from the handshake.
    pub fn agent_version(&self) -> String {
        self.agent_version
            .read()
            .expect("agent version lock poisoned")
            .clone()
    }

    /// Next outgoing sequence number (diagnostics).
    pub async fn stream_data_sequence_number(&self) -> i64 {
        self.outgoing.lock().await.next_sequence
    }

    /// Next incoming sequence number the channel will deliver.
    pub async fn expected_sequence_number(&self) -> i64 {
        self.incoming.lock().await.expected_sequence
    }

    /// Unacknowledged frames currently buffered.
    pub async fn outgoing_buffer_len(&self) -> usize {
        self.outgoing.lock().await.messages.len()
    }

    /// Reordered frames waiting for the expectation to catch up.
    pub async fn incoming_buffer_len(&self) -> usize {
        self.incoming.lock().await.messages.len()
    }

    /// Whether payload encryption was negotiated.
    pub fn encryption_enabled(&self) -> bool {
        self.encryption_enabled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communicator::{OnErrorHandler, OnMessageHandler};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    /// In-memory channel capturing everything the data channel sends.
    struct RecordingChannel {
        sent: StdMutex<Vec<(Vec<u8>, MessageKind)>>,
    }

    impl RecordingChannel {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: StdMutex::new(Vec::new()),
            })
        }

        fn sent_frames(&self) -> Vec<ClientMessage> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, kind)| *kind == MessageKind::Binary)
                .map(|(raw, _)| ClientMessage::deserialize(raw).unwrap())
                .collect()
        }

        fn sent_acks(&self) -> Vec<AcknowledgeContent> {
            self.sent_frames()
                .iter()
                .filter(|m| m.message_type == ACKNOWLEDGE_MESSAGE)
                .map(|m| m.acknowledge_content().unwrap())
                .collect()
        }

        fn sent_inputs(&self) -> Vec<ClientMessage> {
            self.sent_frames()
                .into_iter()
                .filter(|m| m.message_type == INPUT_STREAM_MESSAGE)
                .collect()
        }
    }

    #[async_trait]
    impl MessageChannel for RecordingChannel {
        async fn open(&self) -> Result<()> {
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }

        async fn send_message(&self, input: &[u8], kind: MessageKind) -> Result<()> {
            self.sent.lock().unwrap().push((input.to_vec(), kind));
            Ok(())
        }

        fn stream_url(&self) -> String {
            "wss://mock/stream".to_string()
        }

        fn channel_token(&self) -> String {
            "mock-token".to_string()
        }

        fn set_channel_token(&self, _token: String) {}

        fn set_on_message(&self, _handler: OnMessageHandler) {}

        fn set_on_error(&self, _handler: OnErrorHandler) {}
    }

    fn data_channel(channel: Arc<RecordingChannel>) -> Arc<DataChannel> {
        Arc::new(DataChannel::new(
            channel,
            "client-id",
            "session-id",
            "target-id",
            false,
        ))
    }

    fn output_frame(sequence_number: i64, payload_type: PayloadType, payload: &[u8]) -> Vec<u8> {
        ClientMessage {
            header_length: HEADER_LENGTH,
            message_type: OUTPUT_STREAM_MESSAGE.to_string(),
            schema_version: 1,
            created_date: now_millis(),
            sequence_number,
            flags: 0,
            message_id: uuid::Uuid::new_v4(),
            payload_digest: [0; 32],
            payload_type: payload_type as u32,
            payload_length: payload.len() as u32,
            payload: payload.to_vec(),
        }
        .serialize()
        .unwrap()
    }

    fn recording_handler(
        delivered: Arc<StdMutex<Vec<Vec<u8>>>>,
        ready: bool,
    ) -> OutputStreamHandler {
        Arc::new(move |message: ClientMessage| {
            let delivered = Arc::clone(&delivered);
            Box::pin(async move {
                delivered.lock().unwrap().push(message.payload);
                Ok(ready)
            })
        })
    }

    #[tokio::test]
    async fn sequence_numbers_are_monotonic() {
        let channel = RecordingChannel::new();
        let dc = data_channel(Arc::clone(&channel));

        for _ in 0..5 {
            dc.send_input_data_message(PayloadType::Output, b"data")
                .await
                .unwrap();
        }

        let sent = channel.sent_inputs();
        let sequences: Vec<i64> = sent.iter().map(|m| m.sequence_number).collect();
        assert_eq!(sequences, vec![0, 1, 2, 3, 4]);
        assert_eq!(dc.stream_data_sequence_number().await, 5);
    }

    #[tokio::test]
    async fn lone_line_feed_becomes_carriage_return() {
        let channel = RecordingChannel::new();
        let dc = data_channel(Arc::clone(&channel));

        dc.send_input_data_message(PayloadType::Output, &[0x0A])
            .await
            .unwrap();
        dc.send_input_data_message(PayloadType::Output, &[0x0A, 0x0A])
            .await
            .unwrap();
        dc.send_input_data_message(PayloadType::Size, &[0x0A])
            .await
            .unwrap();

        let sent = channel.sent_inputs();
        assert_eq!(sent[0].payload, vec![0x0D]);
        assert_eq!(sent[1].payload, vec![0x0A, 0x0A]);
        // The rewrite applies to any lone line feed regardless of payload type
        assert_eq!(sent[2].payload, vec![0x0D]);
    }

    #[tokio::test]
    async fn acknowledged_message_leaves_outgoing_buffer() {
        let channel = RecordingChannel::new();
        let dc = data_channel(Arc::clone(&channel));

        dc.send_input_data_message(PayloadType::Output, b"one")
            .await
            .unwrap();
        dc.send_input_data_message(PayloadType::Output, b"two")
            .await
            .unwrap();

        dc.process_acknowledged_message(AcknowledgeContent {
            message_type: INPUT_STREAM_MESSAGE.to_string(),
            message_id: uuid::Uuid::new_v4().to_string(),
            sequence_number: 0,
            is_sequential_message: true,
        })
        .await;

        let outgoing = dc.outgoing.lock().await;
        assert_eq!(outgoing.messages.len(), 1);
        assert_eq!(outgoing.messages[0].sequence_number, 1);
    }

    #[tokio::test]
    async fn unknown_acknowledge_is_dropped() {
        let channel = RecordingChannel::new();
        let dc = data_channel(Arc::clone(&channel));

        dc.send_input_data_message(PayloadType::Output, b"one")
            .await
            .unwrap();
        dc.process_acknowledged_message(AcknowledgeContent {
            message_type: INPUT_STREAM_MESSAGE.to_string(),
            message_id: uuid::Uuid::new_v4().to_string(),
            sequence_number: 99,
            is_sequential_message: true,
        })
        .await;

        assert_eq!(dc.outgoing.lock().await.messages.len(), 1);
    }

    #[tokio::test]
    async fn retransmission_timeout_update_matches_the_estimator() {
        let channel = RecordingChannel::new();
        let dc = data_channel(channel);

        // r = 140ms from RTT=100ms, RTTVar=0:
        // RTTVar = 0.25 * 40ms = 10ms, RTT = 105ms, RTO = 105 + max(10, 40) = 145ms
        dc.update_retransmission_timeout(Duration::from_millis(140));

        let timing = dc.timing.read().unwrap();
        assert!((timing.round_trip_time_variation - 0.010).abs() < 1e-9);
        assert!((timing.round_trip_time - 0.105).abs() < 1e-9);
        assert_eq!(timing.retransmission_timeout, Duration::from_millis(145));
    }

    #[tokio::test]
    async fn retransmission_timeout_is_capped() {
        let channel = RecordingChannel::new();
        let dc = data_channel(channel);

        for _ in 0..64 {
            dc.update_retransmission_timeout(Duration::from_secs(10));
        }
        assert_eq!(dc.retransmission_timeout(), MAX_TRANSMISSION_TIMEOUT);
    }

    #[tokio::test]
    async fn in_order_messages_are_delivered_and_acked() {
        let channel = RecordingChannel::new();
        let dc = data_channel(Arc::clone(&channel));
        let delivered = Arc::new(StdMutex::new(Vec::new()));
        dc.register_output_stream_handler(recording_handler(Arc::clone(&delivered), true), true);

        dc.output_message_handler(&output_frame(0, PayloadType::Output, b"zero"))
            .await
            .unwrap();
        dc.output_message_handler(&output_frame(1, PayloadType::Output, b"one"))
            .await
            .unwrap();

        assert_eq!(*delivered.lock().unwrap(), vec![b"zero".to_vec(), b"one".to_vec()]);
        let acks = channel.sent_acks();
        assert_eq!(acks.len(), 2);
        assert_eq!(acks[0].sequence_number, 0);
        assert_eq!(acks[1].sequence_number, 1);
        assert_eq!(dc.incoming.lock().await.expected_sequence, 2);
    }

    #[tokio::test]
    async fn reordered_messages_are_delivered_in_sequence() {
        let channel = RecordingChannel::new();
        let dc = data_channel(Arc::clone(&channel));
        let delivered = Arc::new(StdMutex::new(Vec::new()));
        dc.register_output_stream_handler(recording_handler(Arc::clone(&delivered), true), true);

        // Wall-clock arrival order 0, 2, 1
        dc.output_message_handler(&output_frame(0, PayloadType::Output, b"zero"))
            .await
            .unwrap();
        dc.output_message_handler(&output_frame(2, PayloadType::Output, b"two"))
            .await
            .unwrap();
        assert_eq!(dc.incoming.lock().await.messages.len(), 1);
        dc.output_message_handler(&output_frame(1, PayloadType::Output, b"one"))
            .await
            .unwrap();

        assert_eq!(
            *delivered.lock().unwrap(),
            vec![b"zero".to_vec(), b"one".to_vec(), b"two".to_vec()]
        );
        assert_eq!(channel.sent_acks().len(), 3);
        assert_eq!(dc.incoming.lock().await.expected_sequence, 3);
        assert!(dc.incoming.lock().await.messages.is_empty());
    }

    #[tokio::test]
    async fn duplicate_messages_are_silently_dropped() {
        let channel = RecordingChannel::new();
        let dc = data_channel(Arc::clone(&channel));
        let delivered = Arc::new(StdMutex::new(Vec::new()));
        dc.register_output_stream_handler(recording_handler(Arc::clone(&delivered), true), true);

        let frame = output_frame(0, PayloadType::Output, b"zero");
        dc.output_message_handler(&frame).await.unwrap();
        dc.output_message_handler(&frame).await.unwrap();

        assert_eq!(delivered.lock().unwrap().len(), 1);
        assert_eq!(channel.sent_acks().len(), 1);
    }

    #[tokio::test]
    async fn unready_handler_suppresses_the_acknowledge() {
        let channel = RecordingChannel::new();
        let dc = data_channel(Arc::clone(&channel));
        let delivered = Arc::new(StdMutex::new(Vec::new()));
        dc.register_output_stream_handler(recording_handler(Arc::clone(&delivered), false), true);

        dc.output_message_handler(&output_frame(0, PayloadType::Output, b"zero"))
            .await
            .unwrap();

        assert_eq!(delivered.lock().unwrap().len(), 1);
        assert!(channel.sent_acks().is_empty());
        assert_eq!(dc.incoming.lock().await.expected_sequence, 0);
    }

    #[tokio::test]
    async fn handshake_request_sets_session_type_and_responds() {
        let channel = RecordingChannel::new();
        let dc = data_channel(Arc::clone(&channel));

        let request = serde_json::json!({
            "AgentVersion": "3.0.500.0",
            "RequestedClientActions": [{
                "ActionType": "SessionType",
                "ActionParameters": {
                    "SessionType": "InteractiveCommands",
                    "Properties": {"foo": "bar"}
                }
            }]
        });
        let frame = output_frame(
            0,
            PayloadType::HandshakeRequest,
            &serde_json::to_vec(&request).unwrap(),
        );
        dc.output_message_handler(&frame).await.unwrap();

        // Shell-like session types collapse to the canonical shell name
        assert_eq!(dc.session_type().as_deref(), Some(SHELL_PLUGIN_NAME));
        assert_eq!(dc.session_properties()["foo"], "bar");
        assert_eq!(dc.agent_version(), "3.0.500.0");

        let acks = channel.sent_acks();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].sequence_number, 0);

        let inputs = channel.sent_inputs();
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs[0].payload_type, PayloadType::HandshakeResponse as u32);
        let response: HandshakeResponsePayload =
            serde_json::from_slice(&inputs[0].payload).unwrap();
        assert_eq!(response.processed_client_actions.len(), 1);
        assert_eq!(
            response.processed_client_actions[0].action_status,
            ActionStatus::Success
        );
        assert!(response.errors.is_empty());
    }

    #[tokio::test]
    async fn unknown_session_type_fails_the_action() {
        let channel = RecordingChannel::new();
        let dc = data_channel(Arc::clone(&channel));

        let request = serde_json::json!({
            "AgentVersion": "3.0.500.0",
            "RequestedClientActions": [{
                "ActionType": "SessionType",
                "ActionParameters": { "SessionType": "SomethingElse", "Properties": null }
            }]
        });
        let frame = output_frame(
            0,
            PayloadType::HandshakeRequest,
            &serde_json::to_vec(&request).unwrap(),
        );
        dc.output_message_handler(&frame).await.unwrap();

        assert_eq!(dc.session_type(), None);
        let response: HandshakeResponsePayload =
            serde_json::from_slice(&channel.sent_inputs()[0].payload).unwrap();
        assert_eq!(
            response.processed_client_actions[0].action_status,
            ActionStatus::Failed
        );
        assert_eq!(response.errors.len(), 1);
    }

    #[tokio::test]
    async fn unknown_action_is_marked_unsupported() {
        let channel = RecordingChannel::new();
        let dc = data_channel(Arc::clone(&channel));

        let request = serde_json::json!({
            "AgentVersion": "3.0.500.0",
            "RequestedClientActions": [{ "ActionType": "Telemetry", "ActionParameters": {} }]
        });
        let frame = output_frame(
            0,
            PayloadType::HandshakeRequest,
            &serde_json::to_vec(&request).unwrap(),
        );
        dc.output_message_handler(&frame).await.unwrap();

        let response: HandshakeResponsePayload =
            serde_json::from_slice(&channel.sent_inputs()[0].payload).unwrap();
        assert_eq!(
            response.processed_client_actions[0].action_status,
            ActionStatus::Unsupported
        );
        assert_eq!(
            response.processed_client_actions[0].error,
            "Unsupported action Telemetry"
        );
    }

    #[tokio::test]
    async fn kms_action_fails_for_legacy_cli() {
        let channel = RecordingChannel::new();
        let dc = Arc::new(DataChannel::new(
            Arc::clone(&channel) as Arc<dyn MessageChannel>,
            "client-id",
            "session-id",
            "target-id",
            true,
        ));

        let request = serde_json::json!({
            "AgentVersion": "3.0.500.0",
            "RequestedClientActions": [{
                "ActionType": "KMSEncryption",
                "ActionParameters": { "KMSKeyId": "alias/key" }
            }]
        });
        let frame = output_frame(
            0,
            PayloadType::HandshakeRequest,
            &serde_json::to_vec(&request).unwrap(),
        );
        dc.output_message_handler(&frame).await.unwrap();

        assert!(!dc.encryption_enabled());
        let response: HandshakeResponsePayload =
            serde_json::from_slice(&channel.sent_inputs()[0].payload).unwrap();
        assert_eq!(
            response.processed_client_actions[0].action_status,
            ActionStatus::Failed
        );
        assert!(response.processed_client_actions[0]
            .error
            .contains("Please upgrade"));
    }

    #[tokio::test]
    async fn handshake_complete_signals_the_session_type_event() {
        let channel = RecordingChannel::new();
        let dc = data_channel(Arc::clone(&channel));
        dc.set_session_type(SHELL_PLUGIN_NAME);
        // Drain the event the setter itself fired
        assert!(dc.wait_for_session_type().await);

        let frame = output_frame(0, PayloadType::HandshakeComplete, b"{}");
        dc.output_message_handler(&frame).await.unwrap();

        assert!(dc.wait_for_session_type().await);
        assert_eq!(channel.sent_acks().len(), 1);
    }

    #[tokio::test]
    async fn handshake_complete_without_session_type_signals_false() {
        let channel = RecordingChannel::new();
        let dc = data_channel(Arc::clone(&channel));

        let frame = output_frame(0, PayloadType::HandshakeComplete, b"{}");
        dc.output_message_handler(&frame).await.unwrap();

        assert!(!dc.wait_for_session_type().await);
    }

    #[tokio::test]
    async fn malformed_frames_are_dropped() {
        let channel = RecordingChannel::new();
        let dc = data_channel(Arc::clone(&channel));

        assert!(dc.output_message_handler(&[1, 2, 3]).await.is_err());
        assert!(channel.sent_frames().is_empty());
        assert_eq!(dc.incoming.lock().await.expected_sequence, 0);
    }

    #[tokio::test]
    async fn publication_notifications_are_ignored() {
        let channel = RecordingChannel::new();
        let dc = data_channel(Arc::clone(&channel));

        let frame = ClientMessage {
            header_length: HEADER_LENGTH,
            message_type: START_PUBLICATION_MESSAGE.to_string(),
            schema_version: 1,
            created_date: now_millis(),
            sequence_number: 0,
            flags: 0,
            message_id: uuid::Uuid::new_v4(),
            payload_digest: [0; 32],
            payload_type: 0,
            payload_length: 0,
            payload: Vec::new(),
        }
        .serialize()
        .unwrap();

        dc.output_message_handler(&frame).await.unwrap();
        assert!(channel.sent_frames().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn resend_scheduler_resends_the_head_of_line() {
        let channel = RecordingChannel::new();
        let dc = data_channel(Arc::clone(&channel));

        dc.send_input_data_message(PayloadType::Output, b"never acked")
            .await
            .unwrap();
        dc.start_resend_scheduler();

        tokio::time::sleep(Duration::from_millis(700)).await;

        let inputs = channel.sent_inputs();
        assert!(inputs.len() >= 2, "expected at least one resend, got {}", inputs.len());
        // Byte-identical resend: same message id and sequence number
        assert_eq!(inputs[0].message_id, inputs[1].message_id);
        assert_eq!(inputs[0].sequence_number, inputs[1].sequence_number);

        let outgoing = dc.outgoing.lock().await;
        assert!(outgoing.messages[0].resend_attempt >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn resend_exhaustion_fires_the_timeout_event() {
        let channel = RecordingChannel::new();
        let dc = data_channel(Arc::clone(&channel));

        dc.send_input_data_message(PayloadType::Output, b"never acked")
            .await
            .unwrap();
        dc.start_resend_scheduler();

        dc.wait_for_resend_timeout().await;

        let outgoing = dc.outgoing.lock().await;
        assert!(outgoing.messages[0].resend_attempt >= RESEND_MAX_ATTEMPT);
    }

    #[tokio::test]
    async fn deregistered_handlers_stop_receiving() {
        let channel = RecordingChannel::new();
        let dc = data_channel(Arc::clone(&channel));
        let delivered = Arc::new(StdMutex::new(Vec::new()));
        let id =
            dc.register_output_stream_handler(recording_handler(Arc::clone(&delivered), true), true);

        dc.output_message_handler(&output_frame(0, PayloadType::Output, b"zero"))
            .await
            .unwrap();
        dc.deregister_output_stream_handler(id);
        // Next frame finds no handler; nothing is delivered and readiness is false
        dc.output_message_handler(&output_frame(1, PayloadType::Output, b"one"))
            .await
            .unwrap();

        assert_eq!(delivered.lock().unwrap().len(), 1);
        assert_eq!(channel.sent_acks().len(), 1);
    }
}
