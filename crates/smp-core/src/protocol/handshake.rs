//! Handshake and challenge payloads exchanged during session negotiation.
//!
//! All field names are part of the wire contract. Byte fields travel as
//! base64 strings inside the JSON payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::protocol::message::{ClientMessage, PayloadType};

/// Handshake action asking the client to set up KMS payload encryption.
pub const ACTION_KMS_ENCRYPTION: &str = "KMSEncryption";

/// Handshake action announcing the session type.
pub const ACTION_SESSION_TYPE: &str = "SessionType";

/// Outcome of processing one requested client action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
pub enum ActionStatus {
    Success = 1,
    Failed = 2,
    Unsupported = 3,
}

impl From<ActionStatus> for u32 {
    fn from(status: ActionStatus) -> Self {
        status as u32
    }
}

impl TryFrom<u32> for ActionStatus {
    type Error = String;

    fn try_from(value: u32) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Success),
            2 => Ok(Self::Failed),
            3 => Ok(Self::Unsupported),
            other => Err(format!("unknown action status {other}")),
        }
    }
}

/// Parameters of the KMSEncryption action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KmsEncryptionRequest {
    #[serde(rename = "KMSKeyId")]
    pub kms_key_id: String,
}

/// Result the client reports for a successful KMSEncryption action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KmsEncryptionResponse {
    #[serde(rename = "KMSCipherTextKey", with = "base64_bytes")]
    pub kms_cipher_text_key: Vec<u8>,
}

/// Parameters of the SessionType action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionTypeRequest {
    #[serde(rename = "SessionType")]
    pub session_type: String,
    #[serde(rename = "Properties", default)]
    pub properties: Value,
}

/// Handshake payload sent by the remote agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeRequestPayload {
    #[serde(rename = "AgentVersion", default)]
    pub agent_version: String,
    #[serde(rename = "RequestedClientActions", default)]
    pub requested_client_actions: Vec<RequestedClientAction>,
}

/// One action requested by the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestedClientAction {
    #[serde(rename = "ActionType")]
    pub action_type: String,
    #[serde(rename = "ActionParameters", default)]
    pub action_parameters: Value,
}

/// The client's result for one requested action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedClientAction {
    #[serde(rename = "ActionType")]
    pub action_type: String,
    #[serde(rename = "ActionStatus")]
    pub action_status: ActionStatus,
    #[serde(rename = "ActionResult")]
    pub action_result: Value,
    #[serde(rename = "Error", default)]
    pub error: String,
}

/// Handshake response sent by the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeResponsePayload {
    #[serde(rename = "ClientVersion")]
    pub client_version: String,
    #[serde(rename = "ProcessedClientActions")]
    pub processed_client_actions: Vec<ProcessedClientAction>,
    #[serde(rename = "Errors", default)]
    pub errors: Vec<String>,
}

/// Challenge the agent encrypted with its half of the data key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionChallengeRequest {
    #[serde(rename = "Challenge", with = "base64_bytes")]
    pub challenge: Vec<u8>,
}

/// The challenge decrypted and re-encrypted with the client's half.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionChallengeResponse {
    #[serde(rename = "Challenge", with = "base64_bytes")]
    pub challenge: Vec<u8>,
}

/// Payload telling the client the handshake finished.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandshakeCompletePayload {
    /// Time the handshake took, in nanoseconds.
    #[serde(rename = "HandshakeTimeToComplete", default)]
    pub handshake_time_to_complete: i64,
    #[serde(rename = "CustomerMessage", default)]
    pub customer_message: String,
}

/// First frame after the websocket opens: the token presented as text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenDataChannelInput {
    #[serde(rename = "MessageSchemaVersion")]
    pub message_schema_version: String,
    #[serde(rename = "RequestId")]
    pub request_id: String,
    #[serde(rename = "TokenValue")]
    pub token_value: String,
    #[serde(rename = "ClientId")]
    pub client_id: String,
    #[serde(rename = "ClientVersion")]
    pub client_version: String,
}

impl ClientMessage {
    /// Parse a `HandshakeRequest` payload.
    pub fn handshake_request(&self) -> Result<HandshakeRequestPayload> {
        if self.payload_type != PayloadType::HandshakeRequest as u32 {
            return Err(Error::Protocol {
                message: format!(
                    "not a handshake request: found payload type {}",
                    self.payload_type
                ),
            });
        }
        serde_json::from_slice(&self.payload).map_err(|e| Error::Codec {
            message: format!("invalid handshake request payload: {e}"),
        })
    }

    /// Parse a `HandshakeComplete` payload.
    pub fn handshake_complete(&self) -> Result<HandshakeCompletePayload> {
        if self.payload_type != PayloadType::HandshakeComplete as u32 {
            return Err(Error::Protocol {
                message: format!(
                    "not a handshake complete: found payload type {}",
                    self.payload_type
                ),
            });
        }
        serde_json::from_slice(&self.payload).map_err(|e| Error::Codec {
            message: format!("invalid handshake complete payload: {e}"),
        })
    }

    /// Parse an `EncChallengeRequest` payload.
    pub fn encryption_challenge_request(&self) -> Result<EncryptionChallengeRequest> {
        serde_json::from_slice(&self.payload).map_err(|e| Error::Codec {
            message: format!("invalid encryption challenge payload: {e}"),
        })
    }
}

/// Byte fields encoded as base64 strings, the way the agent marshals them.
mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::{HEADER_LENGTH, INPUT_STREAM_MESSAGE, now_millis};
    use uuid::Uuid;

    #[test]
    fn handshake_request_parses_agent_fields() {
        let json = serde_json::json!({
            "AgentVersion": "3.1.1732.0",
            "RequestedClientActions": [
                {
                    "ActionType": "SessionType",
                    "ActionParameters": {
                        "SessionType": "Standard_Stream",
                        "Properties": null
                    }
                },
                {
                    "ActionType": "KMSEncryption",
                    "ActionParameters": { "KMSKeyId": "alias/session-key" }
                }
            ]
        });

        let request: HandshakeRequestPayload = serde_json::from_value(json).unwrap();
        assert_eq!(request.agent_version, "3.1.1732.0");
        assert_eq!(request.requested_client_actions.len(), 2);
        assert_eq!(
            request.requested_client_actions[0].action_type,
            ACTION_SESSION_TYPE
        );

        let kms: KmsEncryptionRequest = serde_json::from_value(
            request.requested_client_actions[1].action_parameters.clone(),
        )
        .unwrap();
        assert_eq!(kms.kms_key_id, "alias/session-key");
    }

    #[test]
    fn unknown_action_types_still_parse() {
        let json = serde_json::json!({
            "AgentVersion": "2.0.0.0",
            "RequestedClientActions": [
                { "ActionType": "SomethingNew", "ActionParameters": {} }
            ]
        });
        let request: HandshakeRequestPayload = serde_json::from_value(json).unwrap();
        assert_eq!(request.requested_client_actions[0].action_type, "SomethingNew");
    }

    #[test]
    fn action_status_serializes_as_number() {
        let action = ProcessedClientAction {
            action_type: ACTION_SESSION_TYPE.to_string(),
            action_status: ActionStatus::Success,
            action_result: Value::Null,
            error: String::new(),
        };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["ActionStatus"], 1);
    }

    #[test]
    fn byte_fields_travel_as_base64() {
        let response = KmsEncryptionResponse {
            kms_cipher_text_key: vec![1, 2, 3, 255],
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["KMSCipherTextKey"], "AQID/w==");

        let challenge: EncryptionChallengeRequest =
            serde_json::from_value(serde_json::json!({ "Challenge": "AQID/w==" })).unwrap();
        assert_eq!(challenge.challenge, vec![1, 2, 3, 255]);
    }

    #[test]
    fn handshake_complete_defaults() {
        let complete: HandshakeCompletePayload = serde_json::from_str("{}").unwrap();
        assert_eq!(complete.handshake_time_to_complete, 0);
        assert!(complete.customer_message.is_empty());
    }

    #[test]
    fn payload_type_checked_before_parse() {
        let message = ClientMessage {
            header_length: HEADER_LENGTH,
            message_type: INPUT_STREAM_MESSAGE.to_string(),
            schema_version: 1,
            created_date: now_millis(),
            sequence_number: 0,
            flags: 0,
            message_id: Uuid::new_v4(),
            payload_digest: [0; 32],
            payload_type: PayloadType::Output as u32,
            payload_length: 2,
            payload: b"{}".to_vec(),
        };
        assert!(message.handshake_request().is_err());
        assert!(message.handshake_complete().is_err());
    }
}
