//! Builders for wire frames the remote agent would send.

use uuid::Uuid;

use smp_core::protocol::{
    ClientMessage, HEADER_LENGTH, OUTPUT_STREAM_MESSAGE, PayloadType, now_millis,
};

/// An `output_stream_data` frame with the given sequence number and payload.
pub fn output_frame(sequence_number: i64, payload_type: PayloadType, payload: &[u8]) -> Vec<u8> {
    ClientMessage {
        header_length: HEADER_LENGTH,
        message_type: OUTPUT_STREAM_MESSAGE.to_string(),
        schema_version: 1,
        created_date: now_millis(),
        sequence_number,
        flags: 0,
        message_id: Uuid::new_v4(),
        payload_digest: [0; 32],
        payload_type: payload_type as u32,
        payload_length: payload.len() as u32,
        payload: payload.to_vec(),
    }
    .serialize()
    .expect("frame must serialize")
}

/// A handshake request frame announcing a session type and, optionally, a
/// KMS key for payload encryption.
pub fn handshake_request_frame(
    sequence_number: i64,
    agent_version: &str,
    session_type: &str,
    kms_key_id: Option<&str>,
) -> Vec<u8> {
    let mut actions = vec![serde_json::json!({
        "ActionType": "SessionType",
        "ActionParameters": { "SessionType": session_type, "Properties": null }
    })];
    if let Some(key_id) = kms_key_id {
        actions.push(serde_json::json!({
            "ActionType": "KMSEncryption",
            "ActionParameters": { "KMSKeyId": key_id }
        }));
    }
    let payload = serde_json::json!({
        "AgentVersion": agent_version,
        "RequestedClientActions": actions,
    });
    output_frame(
        sequence_number,
        PayloadType::HandshakeRequest,
        &serde_json::to_vec(&payload).expect("handshake payload must serialize"),
    )
}

/// A handshake complete frame, optionally carrying a customer message.
pub fn handshake_complete_frame(sequence_number: i64, customer_message: &str) -> Vec<u8> {
    let payload = serde_json::json!({
        "HandshakeTimeToComplete": 1_000_000,
        "CustomerMessage": customer_message,
    });
    output_frame(
        sequence_number,
        PayloadType::HandshakeComplete,
        &serde_json::to_vec(&payload).expect("handshake payload must serialize"),
    )
}
