//! Protocol codec for encoding/decoding events
//!
//! Each transport message carries exactly one event:
//! - 2 magic bytes
//! - 1 byte protocol version
//! - bincode (varint) encoding of the `(name, args)` tuple

use bincode::Options;
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::{NetworkEvent, WireEvent, MAGIC_BYTES, PROTOCOL_VERSION};
use crate::state::TOO_DEEP;

/// Maximum message size (10 MB)
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Header size: magic(2) + version(1) = 3 bytes
const HEADER_SIZE: usize = 3;

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Invalid magic bytes")]
    InvalidMagic,

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Incomplete message")]
    Incomplete,

    #[error("Unknown system event id: {0}")]
    UnknownSystemEvent(u8),

    #[error("Malformed {event} event: {detail}")]
    MalformedEvent {
        event: &'static str,
        detail: &'static str,
    },
}

fn options() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_MESSAGE_SIZE as u64)
}

/// Encode an event into one transport message
pub fn encode(event: NetworkEvent) -> Result<Bytes, CodecError> {
    let payload = options().serialize(&event.into_wire())?;

    if payload.len() + HEADER_SIZE > MAX_MESSAGE_SIZE {
        return Err(CodecError::MessageTooLarge(
            payload.len() + HEADER_SIZE,
            MAX_MESSAGE_SIZE,
        ));
    }

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_slice(&MAGIC_BYTES);
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_slice(&payload);

    Ok(buf.freeze())
}

/// Decode one transport message.
///
/// Any error here is a protocol violation; the connection is not recoverable.
pub fn decode(frame: &[u8]) -> Result<NetworkEvent, CodecError> {
    if frame.len() > MAX_MESSAGE_SIZE {
        return Err(CodecError::MessageTooLarge(frame.len(), MAX_MESSAGE_SIZE));
    }

    if frame.len() < HEADER_SIZE {
        return Err(CodecError::Incomplete);
    }

    if frame[0..2] != MAGIC_BYTES {
        return Err(CodecError::InvalidMagic);
    }

    if frame[2] != PROTOCOL_VERSION {
        return Err(CodecError::UnsupportedVersion(frame[2]));
    }

    let wire: WireEvent = options()
        .deserialize(&frame[HEADER_SIZE..])
        .map_err(payload_error)?;
    NetworkEvent::from_wire(wire)
}

fn payload_error(error: bincode::Error) -> CodecError {
    match error.as_ref() {
        bincode::ErrorKind::Custom(message) if message == TOO_DEEP => CodecError::MalformedEvent {
            event: "argument",
            detail: TOO_DEEP,
        },
        _ => CodecError::Serialization(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DisconnectCode, DisconnectReason};
    use crate::state::{map_from_json, Value};
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_encode_decode_roundtrip() {
        let original = NetworkEvent::InitialData {
            state: Arc::new(map_from_json(json!({"counter": 3, "list": [1, "two", 3.5]}))),
            welcome: Value::from(json!({"motd": "hi"})),
        };

        let frame = encode(original.clone()).unwrap();
        assert_eq!(&frame[0..2], &MAGIC_BYTES);
        assert_eq!(decode(&frame).unwrap(), original);
    }

    #[test]
    fn test_app_event_keeps_argument_order() {
        let original = NetworkEvent::app(
            "move",
            vec![Value::from(1), Value::Null, Value::from("up"), Value::from(false)],
        );
        let decoded = decode(&encode(original.clone()).unwrap()).unwrap();
        assert_eq!(decoded, original);
        assert!(!decoded.is_system());
    }

    #[test]
    fn test_disconnection_reason_roundtrip() {
        let original = NetworkEvent::DisconnectionReason(DisconnectReason::new(
            DisconnectCode::Throttler,
            "Message threshold broken",
        ));
        assert_eq!(decode(&encode(original.clone()).unwrap()).unwrap(), original);
    }

    #[test]
    fn test_invalid_magic() {
        let mut frame = encode(NetworkEvent::Ping).unwrap().to_vec();
        frame[0] = 0;
        assert!(matches!(decode(&frame), Err(CodecError::InvalidMagic)));
    }

    #[test]
    fn test_wrong_version() {
        let mut frame = encode(NetworkEvent::Ping).unwrap().to_vec();
        frame[2] = PROTOCOL_VERSION + 1;
        assert!(matches!(decode(&frame), Err(CodecError::UnsupportedVersion(_))));
    }

    #[test]
    fn test_garbage_payload() {
        let mut frame = MAGIC_BYTES.to_vec();
        frame.push(PROTOCOL_VERSION);
        frame.extend_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF, 0x13]);
        assert!(decode(&frame).is_err());
    }

    #[test]
    fn test_deeply_nested_argument_is_rejected() {
        // an app event whose last byte is the single Null argument
        let frame = encode(NetworkEvent::app("deep", vec![Value::Null])).unwrap();
        let mut hostile = frame[..frame.len() - 1].to_vec();
        for _ in 0..200_000 {
            // List variant, one element
            hostile.extend_from_slice(&[5, 1]);
        }
        hostile.push(0);

        assert!(hostile.len() < MAX_MESSAGE_SIZE);
        assert!(matches!(
            decode(&hostile),
            Err(CodecError::MalformedEvent { detail, .. }) if detail == TOO_DEEP
        ));
    }

    #[test]
    fn test_nesting_within_limit_decodes() {
        let mut value = Value::from(1);
        for _ in 0..64 {
            value = Value::list(vec![value]);
        }
        let original = NetworkEvent::app("nested", vec![value]);
        assert_eq!(decode(&encode(original.clone()).unwrap()).unwrap(), original);
    }

    #[test]
    fn test_short_frame() {
        assert!(matches!(decode(&[0x53]), Err(CodecError::Incomplete)));
    }
}
