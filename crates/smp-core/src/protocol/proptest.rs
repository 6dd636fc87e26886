//! Property-based tests for the frame codec.
//!
//! These verify:
//! - Serialize/deserialize round-trip for arbitrary well-formed frames
//! - Deserialize never panics on arbitrary input
//! - Valid serialized frames always pass validation

#![cfg(test)]

use proptest::prelude::*;
use uuid::Uuid;

use crate::protocol::{
    ClientMessage, HEADER_LENGTH, INPUT_STREAM_MESSAGE, OUTPUT_STREAM_MESSAGE, PAYLOAD_OFFSET,
};

prop_compose! {
    fn arb_message()(
        message_type in prop::sample::select(vec![
            INPUT_STREAM_MESSAGE,
            OUTPUT_STREAM_MESSAGE,
            "acknowledge",
            "channel_closed",
        ]),
        schema_version in any::<u32>(),
        created_date in 1u64..=u64::MAX,
        sequence_number in any::<i64>(),
        flags in any::<u64>(),
        message_id in any::<[u8; 16]>(),
        payload_type in 0u32..=16,
        payload in prop::collection::vec(any::<u8>(), 0..2048),
    ) -> ClientMessage {
        ClientMessage {
            header_length: HEADER_LENGTH,
            message_type: message_type.to_string(),
            schema_version,
            created_date,
            sequence_number,
            flags,
            message_id: Uuid::from_bytes(message_id),
            payload_digest: [0; 32],
            payload_type,
            payload_length: payload.len() as u32,
            payload,
        }
    }
}

proptest! {
    #[test]
    fn roundtrip_preserves_all_fields(msg in arb_message()) {
        let wire = msg.serialize().unwrap();
        let parsed = ClientMessage::deserialize(&wire).unwrap();

        prop_assert_eq!(parsed.message_type, msg.message_type);
        prop_assert_eq!(parsed.schema_version, msg.schema_version);
        prop_assert_eq!(parsed.created_date, msg.created_date);
        prop_assert_eq!(parsed.sequence_number, msg.sequence_number);
        prop_assert_eq!(parsed.flags, msg.flags);
        prop_assert_eq!(parsed.message_id, msg.message_id);
        prop_assert_eq!(parsed.payload_type, msg.payload_type);
        prop_assert_eq!(parsed.payload, msg.payload);
    }

    #[test]
    fn serialized_frames_validate(msg in arb_message()) {
        let wire = msg.serialize().unwrap();
        let parsed = ClientMessage::deserialize(&wire).unwrap();
        prop_assert!(parsed.validate().is_ok());
    }

    #[test]
    fn deserialize_never_panics(data in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = ClientMessage::deserialize(&data);
    }

    #[test]
    fn wire_length_is_header_plus_payload(msg in arb_message()) {
        let wire = msg.serialize().unwrap();
        prop_assert_eq!(wire.len(), PAYLOAD_OFFSET + msg.payload.len());
    }
}
