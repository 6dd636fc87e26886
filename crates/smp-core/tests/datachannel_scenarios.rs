//! End-to-end data channel scenarios against an in-memory channel.

use std::sync::{Arc, Mutex};

use smp_core::communicator::MessageChannel;
use smp_core::constants::{INCOMING_MESSAGE_BUFFER_CAPACITY, SHELL_PLUGIN_NAME};
use smp_core::datachannel::{DataChannel, OutputStreamHandler};
use smp_core::encryption::{Encrypter, GeneratedDataKey};
use smp_core::protocol::{
    ClientMessage, EncryptionChallengeRequest, EncryptionChallengeResponse,
    HandshakeResponsePayload, KmsEncryptionResponse, PayloadType,
};
use smp_test_utils::{MockChannel, MockKms, handshake_complete_frame, handshake_request_frame, output_frame};

fn data_channel(channel: Arc<MockChannel>) -> Arc<DataChannel> {
    Arc::new(DataChannel::new(
        channel,
        "client-id",
        "user-012345",
        "i-0123456789abcdef0",
        false,
    ))
}

fn recording_handler(delivered: Arc<Mutex<Vec<Vec<u8>>>>) -> OutputStreamHandler {
    Arc::new(move |message: ClientMessage| {
        let delivered = Arc::clone(&delivered);
        Box::pin(async move {
            delivered.lock().unwrap().push(message.payload);
            Ok(true)
        })
    })
}

/// Peer-side encrypter: same data key with the halves swapped.
fn peer_encrypter(kms: &MockKms) -> Encrypter {
    Encrypter::from_data_key(
        "alias/session-key",
        GeneratedDataKey {
            ciphertext_blob: b"peer-blob".to_vec(),
            plaintext: kms.peer_key(),
        },
    )
    .expect("peer key must build")
}

#[tokio::test]
async fn open_presents_the_token_as_a_text_frame() {
    let channel = MockChannel::new();
    let dc = data_channel(Arc::clone(&channel));

    dc.open().await.unwrap();

    assert_eq!(channel.open_count(), 1);
    let texts = channel.sent_texts();
    assert_eq!(texts.len(), 1);
    let token: serde_json::Value = serde_json::from_slice(&texts[0]).unwrap();
    assert_eq!(token["MessageSchemaVersion"], "1.0");
    assert_eq!(token["TokenValue"], "mock-token");
    assert_eq!(token["ClientId"], "client-id");
    assert!(!token["RequestId"].as_str().unwrap().is_empty());
    assert!(!token["ClientVersion"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn reconnect_reopens_and_represents_the_token() {
    let channel = MockChannel::new();
    let dc = data_channel(Arc::clone(&channel));

    dc.open().await.unwrap();
    channel.set_channel_token("refreshed-token".to_string());
    dc.reconnect().await.unwrap();

    assert_eq!(channel.open_count(), 2);
    let texts = channel.sent_texts();
    let token: serde_json::Value = serde_json::from_slice(&texts[1]).unwrap();
    assert_eq!(token["TokenValue"], "refreshed-token");
}

// Happy shell path: handshake announces the shell session type, the
// handshake completes, and the first output frame reaches the handler.
#[tokio::test]
async fn happy_shell_session_startup() {
    let channel = MockChannel::new();
    let dc = data_channel(Arc::clone(&channel));

    dc.output_message_handler(&handshake_request_frame(0, "3.1.0.0", "Standard_Stream", None))
        .await
        .unwrap();
    dc.output_message_handler(&handshake_complete_frame(1, ""))
        .await
        .unwrap();

    assert!(dc.wait_for_session_type().await);
    assert_eq!(dc.session_type().as_deref(), Some(SHELL_PLUGIN_NAME));
    assert_eq!(dc.agent_version(), "3.1.0.0");

    let delivered = Arc::new(Mutex::new(Vec::new()));
    dc.register_output_stream_handler(recording_handler(Arc::clone(&delivered)), true);

    dc.output_message_handler(&output_frame(2, PayloadType::Output, b"hello"))
        .await
        .unwrap();

    assert_eq!(*delivered.lock().unwrap(), vec![b"hello".to_vec()]);
    assert_eq!(dc.expected_sequence_number().await, 3);

    let acks = channel.sent_acks();
    assert_eq!(acks.len(), 3);
    assert_eq!(
        acks.iter().map(|a| a.sequence_number).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );

    // The handshake response went out as an input frame
    let inputs = channel.sent_inputs();
    assert_eq!(inputs.len(), 1);
    let response: HandshakeResponsePayload = serde_json::from_slice(&inputs[0].payload).unwrap();
    assert!(response.errors.is_empty());
}

// Reorder: arrival order 0, 2, 1 delivers 0, 1, 2 with a buffer peak of one.
#[tokio::test]
async fn reordered_frames_deliver_in_order() {
    let channel = MockChannel::new();
    let dc = data_channel(Arc::clone(&channel));
    let delivered = Arc::new(Mutex::new(Vec::new()));
    dc.register_output_stream_handler(recording_handler(Arc::clone(&delivered)), true);

    dc.output_message_handler(&output_frame(0, PayloadType::Output, b"zero"))
        .await
        .unwrap();
    dc.output_message_handler(&output_frame(2, PayloadType::Output, b"two"))
        .await
        .unwrap();
    assert_eq!(dc.incoming_buffer_len().await, 1);
    dc.output_message_handler(&output_frame(1, PayloadType::Output, b"one"))
        .await
        .unwrap();

    assert_eq!(
        *delivered.lock().unwrap(),
        vec![b"zero".to_vec(), b"one".to_vec(), b"two".to_vec()]
    );
    assert_eq!(channel.sent_acks().len(), 3);
    assert_eq!(dc.incoming_buffer_len().await, 0);
    assert_eq!(dc.expected_sequence_number().await, 3);
}

// Duplicate: the second copy of an already-delivered frame is dropped with
// no second ack and no second delivery.
#[tokio::test]
async fn duplicate_frames_are_dropped_without_reack() {
    let channel = MockChannel::new();
    let dc = data_channel(Arc::clone(&channel));
    let delivered = Arc::new(Mutex::new(Vec::new()));
    dc.register_output_stream_handler(recording_handler(Arc::clone(&delivered)), true);

    let frame = output_frame(0, PayloadType::Output, b"once");
    dc.output_message_handler(&frame).await.unwrap();
    dc.output_message_handler(&frame).await.unwrap();

    assert_eq!(delivered.lock().unwrap().len(), 1);
    assert_eq!(channel.sent_acks().len(), 1);
}

// KMS handshake followed by an encrypted output frame: the payload reaches
// the handler as plaintext.
#[tokio::test]
async fn encrypted_output_is_decrypted_before_delivery() {
    let channel = MockChannel::new();
    let dc = data_channel(Arc::clone(&channel));
    let kms = Arc::new(MockKms::new());
    dc.set_kms_provider(Arc::clone(&kms) as _);

    dc.output_message_handler(&handshake_request_frame(
        0,
        "3.1.0.0",
        "Standard_Stream",
        Some("alias/session-key"),
    ))
    .await
    .unwrap();

    assert!(dc.encryption_enabled());

    // The data key request carried the session encryption context
    let requests = kms.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].0, "alias/session-key");
    assert_eq!(requests[0].1["aws:ssm:SessionId"], "user-012345");
    assert_eq!(requests[0].1["aws:ssm:TargetId"], "i-0123456789abcdef0");

    // The response returned the encrypted data key blob
    let inputs = channel.sent_inputs();
    let response: HandshakeResponsePayload = serde_json::from_slice(&inputs[0].payload).unwrap();
    let kms_result: KmsEncryptionResponse =
        serde_json::from_value(response.processed_client_actions[1].action_result.clone()).unwrap();
    assert_eq!(kms_result.kms_cipher_text_key, b"mock-cipher-text-key");

    let delivered = Arc::new(Mutex::new(Vec::new()));
    dc.register_output_stream_handler(recording_handler(Arc::clone(&delivered)), true);

    let peer = peer_encrypter(&kms);
    let cipher = peer.encrypt(b"secret output").unwrap();
    dc.output_message_handler(&output_frame(1, PayloadType::Output, &cipher))
        .await
        .unwrap();

    assert_eq!(*delivered.lock().unwrap(), vec![b"secret output".to_vec()]);
}

// Encryption challenge: the channel decrypts the challenge and returns it
// re-encrypted with its own half of the key.
#[tokio::test]
async fn encryption_challenge_round_trips() {
    let channel = MockChannel::new();
    let dc = data_channel(Arc::clone(&channel));
    let kms = Arc::new(MockKms::new());
    dc.set_kms_provider(Arc::clone(&kms) as _);

    dc.output_message_handler(&handshake_request_frame(
        0,
        "3.1.0.0",
        "Standard_Stream",
        Some("alias/session-key"),
    ))
    .await
    .unwrap();

    let peer = peer_encrypter(&kms);
    let request = EncryptionChallengeRequest {
        challenge: peer.encrypt(b"challenge-bytes").unwrap(),
    };
    dc.output_message_handler(&output_frame(
        1,
        PayloadType::EncChallengeRequest,
        &serde_json::to_vec(&request).unwrap(),
    ))
    .await
    .unwrap();

    let inputs = channel.sent_inputs();
    let challenge_frame = inputs
        .iter()
        .find(|m| m.payload_type == PayloadType::EncChallengeResponse as u32)
        .expect("challenge response must be sent");
    let response: EncryptionChallengeResponse =
        serde_json::from_slice(&challenge_frame.payload).unwrap();
    assert_eq!(peer.decrypt(&response.challenge).unwrap(), b"challenge-bytes");
    assert_eq!(dc.expected_sequence_number().await, 2);
}

// Out-of-order frames are only acknowledged while the reorder buffer has
// room; overflow entries are dropped so the remote resends them.
#[tokio::test]
async fn reorder_buffer_overflow_is_not_acked() {
    let channel = MockChannel::new();
    let dc = data_channel(Arc::clone(&channel));
    let delivered = Arc::new(Mutex::new(Vec::new()));
    dc.register_output_stream_handler(recording_handler(Arc::clone(&delivered)), true);

    // Sequence 0 never arrives, so these all buffer
    for seq in 1..=(INCOMING_MESSAGE_BUFFER_CAPACITY as i64) {
        dc.output_message_handler(&output_frame(seq, PayloadType::Output, b"x"))
            .await
            .unwrap();
    }
    assert_eq!(dc.incoming_buffer_len().await, INCOMING_MESSAGE_BUFFER_CAPACITY);
    assert_eq!(channel.sent_acks().len(), INCOMING_MESSAGE_BUFFER_CAPACITY);

    // One more gets neither buffered nor acknowledged
    dc.output_message_handler(&output_frame(
        INCOMING_MESSAGE_BUFFER_CAPACITY as i64 + 1,
        PayloadType::Output,
        b"overflow",
    ))
    .await
    .unwrap();

    assert_eq!(dc.incoming_buffer_len().await, INCOMING_MESSAGE_BUFFER_CAPACITY);
    assert_eq!(channel.sent_acks().len(), INCOMING_MESSAGE_BUFFER_CAPACITY);
    assert!(delivered.lock().unwrap().is_empty());
}

// Channel-closed from the remote invokes the stop handler.
#[tokio::test]
async fn channel_closed_invokes_the_stop_handler() {
    let channel = MockChannel::new();
    let dc = data_channel(Arc::clone(&channel));

    let stopped = Arc::new(Mutex::new(false));
    let stopped_clone = Arc::clone(&stopped);
    dc.set_stop_handler(Arc::new(move || {
        let stopped = Arc::clone(&stopped_clone);
        Box::pin(async move {
            *stopped.lock().unwrap() = true;
        })
    }));

    let payload = serde_json::json!({
        "MessageId": "00000000-0000-0000-0000-000000000000",
        "SessionId": "user-012345",
        "Output": "it is over",
    });
    let frame = {
        use smp_core::protocol::{CHANNEL_CLOSED_MESSAGE, HEADER_LENGTH, now_millis};
        ClientMessage {
            header_length: HEADER_LENGTH,
            message_type: CHANNEL_CLOSED_MESSAGE.to_string(),
            schema_version: 1,
            created_date: now_millis(),
            sequence_number: 0,
            flags: 0,
            message_id: uuid::Uuid::new_v4(),
            payload_digest: [0; 32],
            payload_type: 0,
            payload_length: payload.to_string().len() as u32,
            payload: payload.to_string().into_bytes(),
        }
        .serialize()
        .unwrap()
    };

    dc.output_message_handler(&frame).await.unwrap();
    assert!(*stopped.lock().unwrap());
}

// Failed sends neither buffer the frame nor consume a sequence number.
#[tokio::test]
async fn failed_sends_do_not_consume_sequence_numbers() {
    let channel = MockChannel::new();
    let dc = data_channel(Arc::clone(&channel));

    channel.fail_sends(true);
    assert!(dc
        .send_input_data_message(PayloadType::Output, b"lost")
        .await
        .is_err());
    assert_eq!(dc.stream_data_sequence_number().await, 0);
    assert_eq!(dc.outgoing_buffer_len().await, 0);

    channel.fail_sends(false);
    dc.send_input_data_message(PayloadType::Output, b"sent")
        .await
        .unwrap();
    assert_eq!(dc.stream_data_sequence_number().await, 1);
    assert_eq!(dc.outgoing_buffer_len().await, 1);
}
