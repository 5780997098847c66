//! Codecs for the client and relay protocols.
//!
//! Client messages are JSON text. Relay frames use MessagePack with a 4-byte
//! big-endian length prefix so they can be streamed over a plain TCP socket.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde_json::Value;
use thiserror::Error;

use crate::events::{ClientEvent, ServerEvent, StreamId, StreamView};
use crate::relay::RelayFrame;

/// Maximum relay frame size (64 KiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Payload is not valid JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Envelope is not `[event, ...args]`.
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(&'static str),

    /// Event name is not part of the protocol.
    #[error("Unknown event: {0}")]
    UnknownEvent(String),

    /// Arguments do not fit the event.
    #[error("Invalid arguments for {event}: {reason}")]
    InvalidArgs {
        /// Event name.
        event: &'static str,
        /// What was wrong.
        reason: &'static str,
    },

    /// Relay frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Decode a message sent by a viewer.
///
/// Returns `Ok(None)` for an empty payload, which clients send as a heartbeat.
/// Both the flat `[event, arg, ...]` form and the nested `[event, [args]]` form
/// are accepted.
///
/// # Errors
///
/// Returns an error if the payload is not a well-formed client event.
pub fn decode_client(text: &str) -> Result<Option<ClientEvent>, ProtocolError> {
    if text.trim().is_empty() {
        return Ok(None);
    }

    let mut items = match serde_json::from_str::<Value>(text)? {
        Value::Array(items) => items,
        _ => return Err(ProtocolError::InvalidEnvelope("expected an array")),
    };
    if items.is_empty() {
        return Err(ProtocolError::InvalidEnvelope("missing event name"));
    }
    let event = match items.remove(0) {
        Value::String(event) => event,
        _ => return Err(ProtocolError::InvalidEnvelope("event name must be a string")),
    };

    let nested = matches!(items.as_slice(), [Value::Array(_)]);
    let args = if nested {
        match items.pop() {
            Some(Value::Array(args)) => args,
            _ => Vec::new(),
        }
    } else {
        items
    };

    match event.as_str() {
        "getStream" => {
            let stream_id = args
                .first()
                .and_then(stream_id_arg)
                .ok_or(ProtocolError::InvalidArgs {
                    event: "getStream",
                    reason: "expected a stream id",
                })?;
            Ok(Some(ClientEvent::GetStream { stream_id }))
        }
        "setStream" => Ok(Some(ClientEvent::SetStream {
            channel: optional_string(args.first(), "setStream")?,
            service: optional_string(args.get(1), "setStream")?,
        })),
        _ => Err(ProtocolError::UnknownEvent(event)),
    }
}

fn stream_id_arg(value: &Value) -> Option<StreamId> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|id| u32::try_from(id).ok()).map(StreamId::new),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn optional_string(
    value: Option<&Value>,
    event: &'static str,
) -> Result<Option<String>, ProtocolError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(ProtocolError::InvalidArgs {
            event,
            reason: "expected a string or null",
        }),
    }
}

/// Encode an event for a viewer.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_server(event: &ServerEvent) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(event)?)
}

/// Decode an event sent by the server.
///
/// Used by clients and tests; the server never reads its own events.
///
/// # Errors
///
/// Returns an error if the payload is not a well-formed server event.
pub fn decode_server(text: &str) -> Result<ServerEvent, ProtocolError> {
    let mut items = match serde_json::from_str::<Value>(text)? {
        Value::Array(items) => items.into_iter(),
        _ => return Err(ProtocolError::InvalidEnvelope("expected an array")),
    };
    let event = match items.next() {
        Some(Value::String(event)) => event,
        _ => return Err(ProtocolError::InvalidEnvelope("event name must be a string")),
    };
    let first = items.next().unwrap_or(Value::Null);

    match event.as_str() {
        ServerEvent::STREAM_SET => Ok(ServerEvent::StreamSet(serde_json::from_value::<
            Option<StreamView>,
        >(first)?)),
        ServerEvent::STREAM_GET => Ok(ServerEvent::StreamGet(serde_json::from_value::<
            Option<StreamView>,
        >(first)?)),
        ServerEvent::STREAMS_SET => Ok(ServerEvent::StreamsSet(serde_json::from_value(first)?)),
        ServerEvent::RUSTLERS_SET => {
            let rustlers = items.next().unwrap_or(Value::Null);
            Ok(ServerEvent::RustlersSet {
                stream_id: serde_json::from_value(first)?,
                rustlers: serde_json::from_value(rustlers)?,
            })
        }
        _ => Err(ProtocolError::UnknownEvent(event)),
    }
}

/// Encode a relay frame to bytes.
///
/// The encoded format is:
/// - 4 bytes: Big-endian length prefix
/// - N bytes: MessagePack-encoded frame
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode_frame(frame: &RelayFrame) -> Result<Bytes, ProtocolError> {
    let payload = rmp_serde::to_vec_named(frame)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);

    Ok(buf.freeze())
}

/// Try to decode a relay frame from a buffer, advancing it if successful.
///
/// Returns `Ok(Some(frame))` if a complete frame was decoded,
/// `Ok(None)` if more data is needed, or `Err` on protocol error.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<RelayFrame>, ProtocolError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if buf.len() < total_size {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let payload = buf.split_to(length);
    let frame = rmp_serde::from_slice(&payload)?;

    Ok(Some(frame))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::RelayCommand;

    #[test]
    fn test_empty_payload_is_heartbeat() {
        assert_eq!(decode_client("").unwrap(), None);
        assert_eq!(decode_client("  \n").unwrap(), None);
    }

    #[test]
    fn test_decode_flat_set_stream() {
        let event = decode_client(r#"["setStream","Destiny","twitch"]"#).unwrap();
        assert_eq!(
            event,
            Some(ClientEvent::SetStream {
                channel: Some("Destiny".to_string()),
                service: Some("twitch".to_string()),
            })
        );
    }

    #[test]
    fn test_decode_nested_set_stream() {
        let event = decode_client(r#"["setStream",[null,null]]"#).unwrap();
        assert_eq!(
            event,
            Some(ClientEvent::SetStream {
                channel: None,
                service: None,
            })
        );
    }

    #[test]
    fn test_decode_set_stream_alias_only() {
        let event = decode_client(r#"["setStream","someuser"]"#).unwrap();
        assert_eq!(
            event,
            Some(ClientEvent::SetStream {
                channel: Some("someuser".to_string()),
                service: None,
            })
        );
    }

    #[test]
    fn test_decode_get_stream() {
        let expected = Some(ClientEvent::GetStream {
            stream_id: StreamId::new(123),
        });
        assert_eq!(decode_client(r#"["getStream",123]"#).unwrap(), expected);
        assert_eq!(decode_client(r#"["getStream","123"]"#).unwrap(), expected);
        assert_eq!(decode_client(r#"["getStream",[123]]"#).unwrap(), expected);
    }

    #[test]
    fn test_decode_malformed() {
        assert!(matches!(
            decode_client("not json"),
            Err(ProtocolError::Json(_))
        ));
        assert!(matches!(
            decode_client(r#"{"event":"setStream"}"#),
            Err(ProtocolError::InvalidEnvelope(_))
        ));
        assert!(matches!(
            decode_client("[]"),
            Err(ProtocolError::InvalidEnvelope(_))
        ));
        assert!(matches!(
            decode_client(r#"["joinChat"]"#),
            Err(ProtocolError::UnknownEvent(name)) if name == "joinChat"
        ));
        assert!(matches!(
            decode_client(r#"["getStream"]"#),
            Err(ProtocolError::InvalidArgs { .. })
        ));
        assert!(matches!(
            decode_client(r#"["setStream",5,"twitch"]"#),
            Err(ProtocolError::InvalidArgs { .. })
        ));
    }

    #[test]
    fn test_decode_server_events() {
        let rustlers = decode_server(r#"["RUSTLERS_SET",5,2]"#).unwrap();
        assert_eq!(
            rustlers,
            ServerEvent::RustlersSet {
                stream_id: StreamId::new(5),
                rustlers: 2,
            }
        );

        let lobby = decode_server(r#"["STREAM_SET",null]"#).unwrap();
        assert_eq!(lobby, ServerEvent::StreamSet(None));

        let listing = decode_server(r#"["STREAMS_SET",[]]"#).unwrap();
        assert_eq!(listing, ServerEvent::StreamsSet(Vec::new()));
    }

    #[test]
    fn test_streaming_frame_decode() {
        let first = RelayFrame::hello("worker-1");
        let second = RelayFrame::command("worker-1", RelayCommand::UpdateRustlers(StreamId::new(77)));

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_frame(&first).unwrap());
        buf.extend_from_slice(&encode_frame(&second).unwrap());

        assert_eq!(decode_frame(&mut buf).unwrap(), Some(first));
        assert_eq!(decode_frame(&mut buf).unwrap(), Some(second));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_waits_for_more() {
        let encoded = encode_frame(&RelayFrame::Welcome).unwrap();

        let mut buf = BytesMut::from(&encoded[..encoded.len() - 1]);
        assert_eq!(decode_frame(&mut buf).unwrap(), None);

        buf.extend_from_slice(&encoded[encoded.len() - 1..]);
        assert_eq!(decode_frame(&mut buf).unwrap(), Some(RelayFrame::Welcome));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
        match decode_frame(&mut buf) {
            Err(ProtocolError::FrameTooLarge(_)) => {}
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }
    }
}
