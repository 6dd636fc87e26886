//! The fixed-offset binary frame and its codec.
//!
//! Wire layout, all fields big-endian:
//!
//! ```text
//! | HL|         MessageType           |Ver|  CD   |  Seq  | Flags |
//! |         MessageId                 |       Digest      |PayType|PayLen|
//! |         Payload ...
//! ```
//!
//! The MessageId field stores the UUID as two 64-bit halves with the high
//! half second: bytes 0..8 of the field carry UUID bytes 8..16 and bytes
//! 8..16 carry UUID bytes 0..8. Peers depend on this exact layout.

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::constants::MESSAGE_SCHEMA_VERSION;
use crate::error::{Error, Result};

// =============================================================================
// Message Type Tags
// =============================================================================

/// Message type for input data sent by this client.
pub const INPUT_STREAM_MESSAGE: &str = "input_stream_data";

/// Message type for output data sent by the remote agent.
pub const OUTPUT_STREAM_MESSAGE: &str = "output_stream_data";

/// Message type for acknowledgments.
pub const ACKNOWLEDGE_MESSAGE: &str = "acknowledge";

/// Message type telling the client the remote closed the channel.
pub const CHANNEL_CLOSED_MESSAGE: &str = "channel_closed";

/// Message type asking the client to resume sending stream messages.
pub const START_PUBLICATION_MESSAGE: &str = "start_publication";

/// Message type asking the client to pause sending stream messages.
pub const PAUSE_PUBLICATION_MESSAGE: &str = "pause_publication";

// =============================================================================
// Field Offsets and Lengths
// =============================================================================

const HL_OFFSET: usize = 0;
const HL_LENGTH: usize = 4;
const MESSAGE_TYPE_OFFSET: usize = HL_OFFSET + HL_LENGTH;
const MESSAGE_TYPE_LENGTH: usize = 32;
const SCHEMA_VERSION_OFFSET: usize = MESSAGE_TYPE_OFFSET + MESSAGE_TYPE_LENGTH;
const SCHEMA_VERSION_LENGTH: usize = 4;
const CREATED_DATE_OFFSET: usize = SCHEMA_VERSION_OFFSET + SCHEMA_VERSION_LENGTH;
const CREATED_DATE_LENGTH: usize = 8;
const SEQUENCE_NUMBER_OFFSET: usize = CREATED_DATE_OFFSET + CREATED_DATE_LENGTH;
const SEQUENCE_NUMBER_LENGTH: usize = 8;
const FLAGS_OFFSET: usize = SEQUENCE_NUMBER_OFFSET + SEQUENCE_NUMBER_LENGTH;
const FLAGS_LENGTH: usize = 8;
const MESSAGE_ID_OFFSET: usize = FLAGS_OFFSET + FLAGS_LENGTH;
const MESSAGE_ID_LENGTH: usize = 16;
const PAYLOAD_DIGEST_OFFSET: usize = MESSAGE_ID_OFFSET + MESSAGE_ID_LENGTH;
const PAYLOAD_DIGEST_LENGTH: usize = 32;
const PAYLOAD_TYPE_OFFSET: usize = PAYLOAD_DIGEST_OFFSET + PAYLOAD_DIGEST_LENGTH;
const PAYLOAD_TYPE_LENGTH: usize = 4;
const PAYLOAD_LENGTH_OFFSET: usize = PAYLOAD_TYPE_OFFSET + PAYLOAD_TYPE_LENGTH;
const PAYLOAD_LENGTH_LENGTH: usize = 4;

/// Fixed header length written into the HL field.
pub const HEADER_LENGTH: u32 = PAYLOAD_LENGTH_OFFSET as u32;

/// Offset of the first payload byte.
pub const PAYLOAD_OFFSET: usize = PAYLOAD_LENGTH_OFFSET + PAYLOAD_LENGTH_LENGTH;

// =============================================================================
// Payload Types and Flags
// =============================================================================

/// Payload type stored in the frame's payload-type field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PayloadType {
    Output = 1,
    Error = 2,
    Size = 3,
    Parameter = 4,
    HandshakeRequest = 5,
    HandshakeResponse = 6,
    HandshakeComplete = 7,
    EncChallengeRequest = 8,
    EncChallengeResponse = 9,
    Flag = 10,
    StdErr = 11,
    ExitCode = 12,
}

impl PayloadType {
    /// Map a wire value back to a payload type.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::Output),
            2 => Some(Self::Error),
            3 => Some(Self::Size),
            4 => Some(Self::Parameter),
            5 => Some(Self::HandshakeRequest),
            6 => Some(Self::HandshakeResponse),
            7 => Some(Self::HandshakeComplete),
            8 => Some(Self::EncChallengeRequest),
            9 => Some(Self::EncChallengeResponse),
            10 => Some(Self::Flag),
            11 => Some(Self::StdErr),
            12 => Some(Self::ExitCode),
            _ => None,
        }
    }

    /// Payload types whose contents are encrypted when encryption is on.
    pub fn is_encryptable(value: u32) -> bool {
        matches!(
            Self::from_u32(value),
            Some(Self::Output | Self::StdErr | Self::ExitCode)
        )
    }
}

/// Control flag carried in a `Flag` payload as a big-endian u32.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PayloadTypeFlag {
    DisconnectToPort = 1,
    TerminateSession = 2,
    ConnectToPortError = 3,
}

impl PayloadTypeFlag {
    /// Encode the flag as a 4-byte big-endian payload.
    pub fn to_payload(self) -> Vec<u8> {
        (self as u32).to_be_bytes().to_vec()
    }

    /// Decode a flag from a `Flag` payload.
    pub fn from_payload(payload: &[u8]) -> Option<Self> {
        if payload.len() < 4 {
            return None;
        }
        match u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) {
            1 => Some(Self::DisconnectToPort),
            2 => Some(Self::TerminateSession),
            3 => Some(Self::ConnectToPortError),
            _ => None,
        }
    }
}

// =============================================================================
// Control Payloads
// =============================================================================

/// Acknowledgment payload, JSON-encoded in `acknowledge` frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcknowledgeContent {
    #[serde(rename = "AcknowledgedMessageType")]
    pub message_type: String,
    #[serde(rename = "AcknowledgedMessageId")]
    pub message_id: String,
    #[serde(rename = "AcknowledgedMessageSequenceNumber")]
    pub sequence_number: i64,
    #[serde(rename = "IsSequentialMessage")]
    pub is_sequential_message: bool,
}

/// Payload of a `channel_closed` frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelClosed {
    #[serde(rename = "MessageId", default)]
    pub message_id: String,
    #[serde(rename = "CreatedDate", default)]
    pub created_date: String,
    #[serde(rename = "DestinationId", default)]
    pub destination_id: String,
    #[serde(rename = "SessionId", default)]
    pub session_id: String,
    #[serde(rename = "MessageType", default)]
    pub message_type: String,
    #[serde(rename = "SchemaVersion", default)]
    pub schema_version: i32,
    #[serde(rename = "Output", default)]
    pub output: String,
}

/// Terminal dimensions, JSON-encoded in `Size` payloads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeData {
    pub cols: u32,
    pub rows: u32,
}

// =============================================================================
// ClientMessage
// =============================================================================

/// One frame on the data channel, in either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientMessage {
    pub header_length: u32,
    pub message_type: String,
    pub schema_version: u32,
    pub created_date: u64,
    pub sequence_number: i64,
    pub flags: u64,
    pub message_id: Uuid,
    pub payload_digest: [u8; 32],
    pub payload_type: u32,
    pub payload_length: u32,
    pub payload: Vec<u8>,
}

/// Current time as milliseconds since the epoch, for frame timestamps.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn codec_err(message: impl Into<String>) -> Error {
    Error::Codec { message: message.into() }
}

impl ClientMessage {
    /// Serialize the frame into its wire representation.
    ///
    /// The payload digest and payload length are computed from the payload;
    /// the stored fields are ignored.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        if self.message_type.len() > MESSAGE_TYPE_LENGTH {
            return Err(codec_err(format!(
                "message type too long: {} bytes (max {})",
                self.message_type.len(),
                MESSAGE_TYPE_LENGTH
            )));
        }

        let mut buf = BytesMut::with_capacity(PAYLOAD_OFFSET + self.payload.len());
        buf.put_u32(HEADER_LENGTH);

        // Message type, right-padded with spaces to the fixed width
        buf.put_slice(self.message_type.as_bytes());
        buf.put_bytes(b' ', MESSAGE_TYPE_LENGTH - self.message_type.len());

        buf.put_u32(self.schema_version);
        buf.put_u64(self.created_date);
        buf.put_i64(self.sequence_number);
        buf.put_u64(self.flags);

        // UUID halves swapped: low half first, high half second
        let id = self.message_id.as_bytes();
        buf.put_slice(&id[8..16]);
        buf.put_slice(&id[0..8]);

        let digest = Sha256::digest(&self.payload);
        buf.put_slice(&digest);

        buf.put_u32(self.payload_type);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);

        Ok(buf.to_vec())
    }

    /// Deserialize a frame from its wire representation.
    ///
    /// Fails with a codec error if any fixed field lies beyond the input.
    pub fn deserialize(input: &[u8]) -> Result<Self> {
        let header_length = get_u32(input, HL_OFFSET)?;
        let message_type = get_string(input, MESSAGE_TYPE_OFFSET, MESSAGE_TYPE_LENGTH)?;
        let schema_version = get_u32(input, SCHEMA_VERSION_OFFSET)?;
        let created_date = get_u64(input, CREATED_DATE_OFFSET)?;
        let sequence_number = get_i64(input, SEQUENCE_NUMBER_OFFSET)?;
        let flags = get_u64(input, FLAGS_OFFSET)?;
        let message_id = get_uuid(input, MESSAGE_ID_OFFSET)?;
        let payload_digest = get_digest(input, PAYLOAD_DIGEST_OFFSET)?;
        let payload_type = get_u32(input, PAYLOAD_TYPE_OFFSET)?;
        let payload_length = get_u32(input, PAYLOAD_LENGTH_OFFSET)?;

        let payload_start = header_length as usize + PAYLOAD_LENGTH_LENGTH;
        if payload_start > input.len() {
            return Err(codec_err("payload offset is outside the frame"));
        }

        Ok(Self {
            header_length,
            message_type,
            schema_version,
            created_date,
            sequence_number,
            flags,
            message_id,
            payload_digest,
            payload_type,
            payload_length,
            payload: input[payload_start..].to_vec(),
        })
    }

    /// Check structural validity of a received frame.
    ///
    /// Publication notifications carry no content and always pass.
    pub fn validate(&self) -> Result<()> {
        if self.message_type == START_PUBLICATION_MESSAGE
            || self.message_type == PAUSE_PUBLICATION_MESSAGE
        {
            return Ok(());
        }
        if self.header_length == 0 {
            return Err(codec_err("HeaderLength cannot be zero"));
        }
        if self.message_type.is_empty() {
            return Err(codec_err("MessageType is missing"));
        }
        if self.created_date == 0 {
            return Err(codec_err("CreatedDate is missing"));
        }
        if self.payload_length != 0 {
            let digest = Sha256::digest(&self.payload);
            if digest.as_slice() != self.payload_digest {
                return Err(codec_err("payload hash is not valid"));
            }
        }
        Ok(())
    }

    /// Parse the acknowledgment payload of an `acknowledge` frame.
    pub fn acknowledge_content(&self) -> Result<AcknowledgeContent> {
        if self.message_type != ACKNOWLEDGE_MESSAGE {
            return Err(Error::Protocol {
                message: format!(
                    "not an acknowledge message: found type {}",
                    self.message_type
                ),
            });
        }
        serde_json::from_slice(&self.payload)
            .map_err(|e| codec_err(format!("invalid acknowledge payload: {e}")))
    }

    /// Parse the payload of a `channel_closed` frame.
    pub fn channel_closed(&self) -> Result<ChannelClosed> {
        if self.message_type != CHANNEL_CLOSED_MESSAGE {
            return Err(Error::Protocol {
                message: format!(
                    "not a channel_closed message: found type {}",
                    self.message_type
                ),
            });
        }
        serde_json::from_slice(&self.payload)
            .map_err(|e| codec_err(format!("invalid channel_closed payload: {e}")))
    }
}

/// Build and serialize an `acknowledge` frame for the given content.
pub fn serialize_acknowledge(content: &AcknowledgeContent) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(content)
        .map_err(|e| codec_err(format!("cannot marshal acknowledge content: {e}")))?;

    let message = ClientMessage {
        header_length: HEADER_LENGTH,
        message_type: ACKNOWLEDGE_MESSAGE.to_string(),
        schema_version: MESSAGE_SCHEMA_VERSION,
        created_date: now_millis(),
        sequence_number: 0,
        flags: 3,
        message_id: Uuid::new_v4(),
        payload_digest: [0; 32],
        payload_type: 0,
        payload_length: payload.len() as u32,
        payload,
    };
    message.serialize()
}

// =============================================================================
// Field Readers
// =============================================================================

fn check_range(input: &[u8], offset: usize, len: usize) -> Result<()> {
    if offset.checked_add(len).map_or(true, |end| end > input.len()) {
        return Err(codec_err("offset is outside the byte array"));
    }
    Ok(())
}

fn get_u32(input: &[u8], offset: usize) -> Result<u32> {
    check_range(input, offset, 4)?;
    Ok(u32::from_be_bytes(input[offset..offset + 4].try_into().unwrap()))
}

fn get_u64(input: &[u8], offset: usize) -> Result<u64> {
    check_range(input, offset, 8)?;
    Ok(u64::from_be_bytes(input[offset..offset + 8].try_into().unwrap()))
}

fn get_i64(input: &[u8], offset: usize) -> Result<i64> {
    check_range(input, offset, 8)?;
    Ok(i64::from_be_bytes(input[offset..offset + 8].try_into().unwrap()))
}

fn get_string(input: &[u8], offset: usize, len: usize) -> Result<String> {
    check_range(input, offset, len)?;
    let raw: Vec<u8> = input[offset..offset + len]
        .iter()
        .copied()
        .filter(|b| *b != 0)
        .collect();
    Ok(String::from_utf8_lossy(&raw).trim().to_string())
}

fn get_digest(input: &[u8], offset: usize) -> Result<[u8; 32]> {
    check_range(input, offset, PAYLOAD_DIGEST_LENGTH)?;
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&input[offset..offset + PAYLOAD_DIGEST_LENGTH]);
    Ok(digest)
}

fn get_uuid(input: &[u8], offset: usize) -> Result<Uuid> {
    check_range(input, offset, MESSAGE_ID_LENGTH)?;
    // Low half stored first on the wire, high half second
    let mut bytes = [0u8; 16];
    bytes[8..16].copy_from_slice(&input[offset..offset + 8]);
    bytes[0..8].copy_from_slice(&input[offset + 8..offset + 16]);
    Ok(Uuid::from_bytes(bytes))
}

// =============================================================================
// Tests
// =============================================================================
