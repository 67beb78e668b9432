//! The MessagePack hub protocol: each message is a MessagePack array whose
//! first element is the numeric message type, prefixed by its LEB128-encoded
//! byte length.
//!
//! A length prefix exceeding the receive size cap is rejected before any of
//! the body is buffered; the oversized body is drained chunk by chunk.

use bytes::{Buf, BufMut, BytesMut};
use rmpv::Value;

use super::message::{Headers, Message, RawArgument};
use super::{FrameParser, HubProtocol, ParseOutcome, TransferMode};
use crate::error::SignalRError;

/// Longest accepted length prefix; five LEB128 bytes cover the 2 GiB the
/// binary format allows.
const MAX_VARINT_LEN: usize = 5;

/// Completion discriminators of the binary format.
const RESULT_KIND_ERROR: u8 = 1;
const RESULT_KIND_VOID: u8 = 2;
const RESULT_KIND_NON_VOID: u8 = 3;

/// The MessagePack binary encoding of the hub protocol.
pub struct MessagePackHubProtocol;

impl HubProtocol for MessagePackHubProtocol {
    fn name(&self) -> &'static str {
        "messagepack"
    }

    fn transfer_mode(&self) -> TransferMode {
        TransferMode::Binary
    }

    fn write_message(&self, message: &Message, out: &mut BytesMut) -> Result<(), SignalRError> {
        let body = encode_body(message)?;
        write_varint(body.len() as u64, out);
        out.extend_from_slice(&body);
        Ok(())
    }

    fn new_parser(&self, max_message_size: usize) -> Box<dyn FrameParser> {
        Box::new(MessagePackFrameParser::new(max_message_size))
    }
}

fn encode_err(e: impl std::fmt::Display) -> SignalRError {
    SignalRError::Protocol(format!("cannot encode message: {e}"))
}

fn pack_arguments(arguments: &[RawArgument]) -> Result<Vec<Value>, SignalRError> {
    arguments.iter().map(RawArgument::to_pack_value).collect()
}

fn headers_value(headers: &Option<Headers>) -> Headers {
    headers.clone().unwrap_or_default()
}

fn encode_body(message: &Message) -> Result<Vec<u8>, SignalRError> {
    let mut body = Vec::new();
    match message {
        Message::Invocation {
            invocation_id,
            target,
            arguments,
            stream_ids,
            headers,
        } => rmp_serde::encode::write(
            &mut body,
            &(
                1u8,
                headers_value(headers),
                invocation_id.as_deref(),
                target,
                pack_arguments(arguments)?,
                stream_ids,
            ),
        )
        .map_err(encode_err)?,
        Message::StreamItem {
            invocation_id,
            item,
            headers,
        } => rmp_serde::encode::write(
            &mut body,
            &(
                2u8,
                headers_value(headers),
                invocation_id,
                item.to_pack_value()?,
            ),
        )
        .map_err(encode_err)?,
        Message::Completion {
            invocation_id,
            result,
            error,
            headers,
        } => match (result, error) {
            (Some(_), Some(_)) => {
                return Err(SignalRError::Protocol(
                    "completion carries both result and error".into(),
                ))
            }
            (None, Some(error)) => rmp_serde::encode::write(
                &mut body,
                &(
                    3u8,
                    headers_value(headers),
                    invocation_id,
                    RESULT_KIND_ERROR,
                    error,
                ),
            )
            .map_err(encode_err)?,
            (Some(result), None) => rmp_serde::encode::write(
                &mut body,
                &(
                    3u8,
                    headers_value(headers),
                    invocation_id,
                    RESULT_KIND_NON_VOID,
                    result.to_pack_value()?,
                ),
            )
            .map_err(encode_err)?,
            (None, None) => rmp_serde::encode::write(
                &mut body,
                &(
                    3u8,
                    headers_value(headers),
                    invocation_id,
                    RESULT_KIND_VOID,
                ),
            )
            .map_err(encode_err)?,
        },
        Message::StreamInvocation {
            invocation_id,
            target,
            arguments,
            stream_ids,
            headers,
        } => rmp_serde::encode::write(
            &mut body,
            &(
                4u8,
                headers_value(headers),
                invocation_id,
                target,
                pack_arguments(arguments)?,
                stream_ids,
            ),
        )
        .map_err(encode_err)?,
        Message::CancelInvocation {
            invocation_id,
            headers,
        } => rmp_serde::encode::write(&mut body, &(5u8, headers_value(headers), invocation_id))
            .map_err(encode_err)?,
        Message::Ping => rmp_serde::encode::write(&mut body, &(6u8,)).map_err(encode_err)?,
        Message::Close {
            error,
            allow_reconnect,
        } => match allow_reconnect {
            Some(allow) => rmp_serde::encode::write(&mut body, &(7u8, error.as_deref(), allow))
                .map_err(encode_err)?,
            None => {
                rmp_serde::encode::write(&mut body, &(7u8, error.as_deref())).map_err(encode_err)?
            }
        },
        Message::HandshakeRequest { .. } | Message::HandshakeResponse { .. } => {
            return Err(SignalRError::Protocol(
                "handshake frames are text-framed".into(),
            ));
        }
    }
    Ok(body)
}

fn write_varint(mut value: u64, out: &mut BytesMut) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.put_u8(byte);
        if value == 0 {
            break;
        }
    }
}

/// Reads a LEB128 length prefix. `Ok(None)` means more bytes are needed.
fn read_varint(buf: &[u8]) -> Result<Option<(u64, usize)>, SignalRError> {
    let mut value = 0u64;
    for (i, &byte) in buf.iter().take(MAX_VARINT_LEN).enumerate() {
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if buf.len() >= MAX_VARINT_LEN {
        return Err(SignalRError::Protocol("malformed length prefix".into()));
    }
    Ok(None)
}

fn decode_err(e: impl std::fmt::Display) -> SignalRError {
    SignalRError::Protocol(format!("malformed frame: {e}"))
}

fn decode_body(body: &[u8]) -> ParseOutcome {
    let value = rmpv::decode::read_value(&mut &body[..]).map_err(decode_err)?;
    let items = match value {
        Value::Array(items) if !items.is_empty() => items,
        _ => return Err(SignalRError::Protocol("frame is not a message array".into())),
    };
    let tag = items[0]
        .as_u64()
        .ok_or_else(|| SignalRError::Protocol("message type is not numeric".into()))?;

    let element = |index: usize| -> Result<&Value, SignalRError> {
        items
            .get(index)
            .ok_or_else(|| SignalRError::Protocol(format!("message array too short for type {tag}")))
    };
    let string_at = |index: usize| -> Result<String, SignalRError> {
        element(index)?
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| SignalRError::Protocol(format!("expected string at element {index}")))
    };

    let message = match tag {
        1 => Message::Invocation {
            invocation_id: optional_string(element(2)?)?,
            target: string_at(3)?,
            arguments: arguments_at(element(4)?)?,
            stream_ids: stream_ids_at(items.get(5))?,
            headers: headers_at(element(1)?)?,
        },
        2 => Message::StreamItem {
            invocation_id: string_at(2)?,
            item: RawArgument::Pack(element(3)?.clone()),
            headers: headers_at(element(1)?)?,
        },
        3 => {
            let kind = element(3)?
                .as_u64()
                .ok_or_else(|| SignalRError::Protocol("completion kind is not numeric".into()))?;
            let (result, error) = match kind as u8 {
                RESULT_KIND_ERROR => (None, Some(string_at(4)?)),
                RESULT_KIND_VOID => (None, None),
                RESULT_KIND_NON_VOID => (Some(RawArgument::Pack(element(4)?.clone())), None),
                other => {
                    return Err(SignalRError::Protocol(format!(
                        "unknown completion kind {other}"
                    )))
                }
            };
            Message::Completion {
                invocation_id: string_at(2)?,
                result,
                error,
                headers: headers_at(element(1)?)?,
            }
        }
        4 => Message::StreamInvocation {
            invocation_id: string_at(2)?,
            target: string_at(3)?,
            arguments: arguments_at(element(4)?)?,
            stream_ids: stream_ids_at(items.get(5))?,
            headers: headers_at(element(1)?)?,
        },
        5 => Message::CancelInvocation {
            invocation_id: string_at(2)?,
            headers: headers_at(element(1)?)?,
        },
        6 => Message::Ping,
        7 => Message::Close {
            error: items.get(1).map(optional_string).transpose()?.flatten(),
            allow_reconnect: match items.get(2) {
                None | Some(Value::Nil) => None,
                Some(value) => Some(value.as_bool().ok_or_else(|| {
                    SignalRError::Protocol("allowReconnect is not a boolean".into())
                })?),
            },
        },
        other => {
            return Err(SignalRError::Protocol(format!(
                "unknown message type {other}"
            )))
        }
    };
    Ok(message)
}

fn optional_string(value: &Value) -> Result<Option<String>, SignalRError> {
    match value {
        Value::Nil => Ok(None),
        Value::String(s) => Ok(s
            .as_str()
            .map(str::to_owned)
            .filter(|s| !s.is_empty())),
        _ => Err(SignalRError::Protocol("expected string or nil".into())),
    }
}

fn arguments_at(value: &Value) -> Result<Vec<RawArgument>, SignalRError> {
    match value {
        Value::Array(items) => Ok(items.iter().cloned().map(RawArgument::Pack).collect()),
        _ => Err(SignalRError::Protocol("arguments are not an array".into())),
    }
}

fn stream_ids_at(value: Option<&Value>) -> Result<Vec<String>, SignalRError> {
    match value {
        None | Some(Value::Nil) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_owned)
                    .ok_or_else(|| SignalRError::Protocol("stream id is not a string".into()))
            })
            .collect(),
        Some(_) => Err(SignalRError::Protocol("streamIds are not an array".into())),
    }
}

fn headers_at(value: &Value) -> Result<Option<Headers>, SignalRError> {
    match value {
        Value::Nil => Ok(None),
        Value::Map(pairs) => {
            if pairs.is_empty() {
                return Ok(None);
            }
            let mut headers = Headers::with_capacity(pairs.len());
            for (key, item) in pairs {
                let key = key
                    .as_str()
                    .ok_or_else(|| SignalRError::Protocol("header key is not a string".into()))?;
                let item = item
                    .as_str()
                    .ok_or_else(|| SignalRError::Protocol("header value is not a string".into()))?;
                headers.insert(key.to_owned(), item.to_owned());
            }
            Ok(Some(headers))
        }
        _ => Err(SignalRError::Protocol("headers are not a map".into())),
    }
}

/// Incremental parser for length-prefixed binary frames.
struct MessagePackFrameParser {
    max_message_size: usize,
    residual: BytesMut,
    /// Bytes of an oversized body still to drain without buffering.
    skip_remaining: usize,
}

impl MessagePackFrameParser {
    fn new(max_message_size: usize) -> Self {
        Self {
            max_message_size,
            residual: BytesMut::new(),
            skip_remaining: 0,
        }
    }
}

impl FrameParser for MessagePackFrameParser {
    fn parse(&mut self, chunk: &[u8], out: &mut Vec<ParseOutcome>) {
        if self.skip_remaining > 0 {
            let drained = self.skip_remaining.min(chunk.len());
            self.skip_remaining -= drained;
            if self.skip_remaining > 0 {
                return;
            }
            self.residual.extend_from_slice(&chunk[drained..]);
        } else {
            self.residual.extend_from_slice(chunk);
        }
        loop {
            match read_varint(&self.residual) {
                Err(e) => {
                    // Framing is unrecoverable; drop what we have and
                    // resynchronize on the next chunk.
                    out.push(Err(e));
                    self.residual.clear();
                    return;
                }
                Ok(None) => return,
                Ok(Some((length, prefix_len))) => {
                    let length = length as usize;
                    if length > self.max_message_size {
                        out.push(Err(SignalRError::Protocol(format!(
                            "frame of {length} bytes exceeds maximum receive message size of {}",
                            self.max_message_size
                        ))));
                        self.residual.advance(prefix_len);
                        let buffered = self.residual.len().min(length);
                        self.residual.advance(buffered);
                        self.skip_remaining = length - buffered;
                        if self.skip_remaining > 0 {
                            return;
                        }
                        continue;
                    }
                    if self.residual.len() < prefix_len + length {
                        return;
                    }
                    out.push(decode_body(&self.residual[prefix_len..prefix_len + length]));
                    self.residual.advance(prefix_len + length);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(message: &Message) -> BytesMut {
        let mut out = BytesMut::new();
        MessagePackHubProtocol
            .write_message(message, &mut out)
            .unwrap();
        out
    }

    fn parse_all(bytes: &[u8], max: usize) -> Vec<ParseOutcome> {
        let mut parser = MessagePackHubProtocol.new_parser(max);
        let mut out = Vec::new();
        parser.parse(bytes, &mut out);
        out
    }

    fn round_trip(message: Message) {
        let bytes = encode(&message);
        let mut outcomes = parse_all(&bytes, 32 * 1024);
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes.remove(0).unwrap(), message);
    }

    #[test]
    fn ping_wire_shape() {
        // Length prefix 2, then the array [6].
        assert_eq!(&encode(&Message::Ping)[..], &[0x02, 0x91, 0x06]);
    }

    #[test]
    fn round_trip_invocation() {
        round_trip(Message::Invocation {
            invocation_id: Some("1".into()),
            target: "Add".into(),
            arguments: vec![
                RawArgument::Pack(Value::from(2)),
                RawArgument::Pack(Value::from(3)),
            ],
            stream_ids: vec![],
            headers: None,
        });
    }

    #[test]
    fn round_trip_fire_and_forget() {
        round_trip(Message::Invocation {
            invocation_id: None,
            target: "Notify".into(),
            arguments: vec![RawArgument::Pack(Value::from("hello"))],
            stream_ids: vec![],
            headers: None,
        });
    }

    #[test]
    fn round_trip_stream_messages() {
        round_trip(Message::StreamInvocation {
            invocation_id: "2".into(),
            target: "Counter".into(),
            arguments: vec![RawArgument::Pack(Value::from(3))],
            stream_ids: vec!["s1".into()],
            headers: None,
        });
        round_trip(Message::StreamItem {
            invocation_id: "2".into(),
            item: RawArgument::Pack(Value::from(0)),
            headers: None,
        });
        round_trip(Message::CancelInvocation {
            invocation_id: "2".into(),
            headers: None,
        });
    }

    #[test]
    fn round_trip_completion_kinds() {
        round_trip(Message::Completion {
            invocation_id: "1".into(),
            result: Some(RawArgument::Pack(Value::from(5))),
            error: None,
            headers: None,
        });
        round_trip(Message::Completion {
            invocation_id: "1".into(),
            result: None,
            error: Some("boom".into()),
            headers: None,
        });
        round_trip(Message::Completion {
            invocation_id: "1".into(),
            result: None,
            error: None,
            headers: None,
        });
    }

    #[test]
    fn round_trip_close_and_headers() {
        round_trip(Message::Close {
            error: Some("bye".into()),
            allow_reconnect: Some(true),
        });
        round_trip(Message::Close {
            error: None,
            allow_reconnect: None,
        });
        round_trip(Message::StreamItem {
            invocation_id: "7".into(),
            item: RawArgument::Pack(Value::from(1)),
            headers: Some(Headers::from([("trace".to_string(), "abc".to_string())])),
        });
    }

    #[test]
    fn json_built_arguments_encode_as_messagepack() {
        // A message assembled for the text protocol writes cleanly here.
        round_trip(Message::Invocation {
            invocation_id: Some("1".into()),
            target: "Add".into(),
            arguments: vec![RawArgument::from_serialize(&serde_json::json!({"n": 2})).unwrap()],
            stream_ids: vec![],
            headers: None,
        });
    }

    #[test]
    fn frame_split_across_chunks() {
        let bytes = encode(&Message::Completion {
            invocation_id: "1".into(),
            result: Some(RawArgument::Pack(Value::from(5))),
            error: None,
            headers: None,
        });
        let mut parser = MessagePackHubProtocol.new_parser(1024);
        let mut out = Vec::new();
        for byte in bytes.iter() {
            parser.parse(std::slice::from_ref(byte), &mut out);
        }
        assert_eq!(out.len(), 1);
        assert!(out[0].is_ok());
    }

    #[test]
    fn oversized_prefix_rejected_before_body_arrives() {
        let max = 64;
        let mut parser = MessagePackHubProtocol.new_parser(max);
        let mut out = Vec::new();
        let mut prefix = BytesMut::new();
        write_varint((max + 1) as u64, &mut prefix);
        // The declared body has not arrived at all, yet the frame is
        // already rejected.
        parser.parse(&prefix, &mut out);
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], Err(SignalRError::Protocol(_))));

        // Drain the oversized body in pieces, then a valid ping decodes.
        let body = vec![0u8; max + 1];
        parser.parse(&body[..30], &mut out);
        parser.parse(&body[30..], &mut out);
        parser.parse(&encode(&Message::Ping), &mut out);
        assert_eq!(out.len(), 2);
        assert_eq!(*out[1].as_ref().unwrap(), Message::Ping);
    }

    #[test]
    fn malformed_body_is_protocol_error() {
        let mut framed = BytesMut::new();
        write_varint(3, &mut framed);
        framed.extend_from_slice(&[0xc1, 0xc1, 0xc1]);
        framed.extend_from_slice(&encode(&Message::Ping));
        let out = parse_all(&framed, 1024);
        assert_eq!(out.len(), 2);
        assert!(matches!(out[0], Err(SignalRError::Protocol(_))));
        assert_eq!(*out[1].as_ref().unwrap(), Message::Ping);
    }

    #[test]
    fn varint_round_trip() {
        for value in [0u64, 1, 127, 128, 300, 16_384, u64::from(u32::MAX)] {
            let mut buf = BytesMut::new();
            write_varint(value, &mut buf);
            let (decoded, consumed) = read_varint(&buf).unwrap().unwrap();
            assert_eq!(decoded, value);
            assert_eq!(consumed, buf.len());
        }
    }

    #[test]
    fn truncated_varint_waits_for_more() {
        assert!(read_varint(&[0x80]).unwrap().is_none());
    }

    #[test]
    fn runaway_varint_is_rejected() {
        let err = read_varint(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x01]);
        assert!(err.is_err());
    }

    #[test]
    fn handshake_frames_are_refused() {
        let mut out = BytesMut::new();
        let err = MessagePackHubProtocol.write_message(
            &Message::HandshakeRequest {
                protocol: "messagepack".into(),
                version: 1,
            },
            &mut out,
        );
        assert!(err.is_err());
    }
}
