//! The JSON hub protocol: one JSON object per message, terminated by the
//! ASCII record separator `0x1E`.
//!
//! Field names are the lowercase wire names (`type`, `invocationId`, …) and
//! unknown fields are ignored. The parser splits on the record separator
//! only outside JSON string values, so a `0x1E` byte embedded in a string
//! does not break framing.

use std::collections::HashMap;

use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use super::message::{Message, RawArgument};
use super::{handshake, FrameParser, HubProtocol, ParseOutcome, TransferMode};
use crate::error::SignalRError;

/// The record separator terminating every text-framed message.
pub(crate) const RECORD_SEPARATOR: u8 = 0x1E;

/// The JSON text encoding of the hub protocol.
pub struct JsonHubProtocol;

impl HubProtocol for JsonHubProtocol {
    fn name(&self) -> &'static str {
        "json"
    }

    fn transfer_mode(&self) -> TransferMode {
        TransferMode::Text
    }

    fn write_message(&self, message: &Message, out: &mut BytesMut) -> Result<(), SignalRError> {
        match message {
            Message::HandshakeRequest { .. } | Message::HandshakeResponse { .. } => {
                return handshake::write_handshake_frame(message, out);
            }
            _ => {}
        }
        let envelope = JsonEnvelope::try_from(message)?;
        let text = serde_json::to_vec(&envelope)
            .map_err(|e| SignalRError::Protocol(format!("cannot encode message: {e}")))?;
        out.extend_from_slice(&text);
        out.extend_from_slice(&[RECORD_SEPARATOR]);
        Ok(())
    }

    fn new_parser(&self, max_message_size: usize) -> Box<dyn FrameParser> {
        Box::new(JsonFrameParser::new(max_message_size))
    }
}

/// Wire envelope covering every tagged message shape.
///
/// `arguments`, `item` and `result` stay raw fragments so their dynamic
/// shape survives until the dispatcher binds them.
#[derive(Serialize, Deserialize)]
struct JsonEnvelope {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(
        rename = "invocationId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    invocation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    arguments: Option<Vec<Box<RawValue>>>,
    #[serde(rename = "streamIds", default, skip_serializing_if = "Option::is_none")]
    stream_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    item: Option<Box<RawValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Box<RawValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(
        rename = "allowReconnect",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    allow_reconnect: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    headers: Option<HashMap<String, String>>,
}

impl JsonEnvelope {
    fn empty(kind: u8) -> Self {
        Self {
            kind,
            invocation_id: None,
            target: None,
            arguments: None,
            stream_ids: None,
            item: None,
            result: None,
            error: None,
            allow_reconnect: None,
            headers: None,
        }
    }
}

fn to_json_raw(argument: &RawArgument) -> Result<Box<RawValue>, SignalRError> {
    match argument {
        RawArgument::Json(raw) => Ok(raw.clone()),
        RawArgument::Pack(_) => {
            let value = argument.to_json_value()?;
            let text = serde_json::to_string(&value)
                .map_err(|e| SignalRError::Protocol(format!("cannot encode argument: {e}")))?;
            RawValue::from_string(text)
                .map_err(|e| SignalRError::Protocol(format!("cannot encode argument: {e}")))
        }
    }
}

fn to_json_raw_list(arguments: &[RawArgument]) -> Result<Vec<Box<RawValue>>, SignalRError> {
    arguments.iter().map(to_json_raw).collect()
}

impl TryFrom<&Message> for JsonEnvelope {
    type Error = SignalRError;

    fn try_from(message: &Message) -> Result<Self, SignalRError> {
        let envelope = match message {
            Message::Invocation {
                invocation_id,
                target,
                arguments,
                stream_ids,
                headers,
            } => JsonEnvelope {
                invocation_id: invocation_id.clone(),
                target: Some(target.clone()),
                arguments: Some(to_json_raw_list(arguments)?),
                stream_ids: (!stream_ids.is_empty()).then(|| stream_ids.clone()),
                headers: headers.clone(),
                ..JsonEnvelope::empty(1)
            },
            Message::StreamItem {
                invocation_id,
                item,
                headers,
            } => JsonEnvelope {
                invocation_id: Some(invocation_id.clone()),
                item: Some(to_json_raw(item)?),
                headers: headers.clone(),
                ..JsonEnvelope::empty(2)
            },
            Message::Completion {
                invocation_id,
                result,
                error,
                headers,
            } => {
                if result.is_some() && error.is_some() {
                    return Err(SignalRError::Protocol(
                        "completion carries both result and error".into(),
                    ));
                }
                JsonEnvelope {
                    invocation_id: Some(invocation_id.clone()),
                    result: result.as_ref().map(to_json_raw).transpose()?,
                    error: error.clone(),
                    headers: headers.clone(),
                    ..JsonEnvelope::empty(3)
                }
            }
            Message::StreamInvocation {
                invocation_id,
                target,
                arguments,
                stream_ids,
                headers,
            } => JsonEnvelope {
                invocation_id: Some(invocation_id.clone()),
                target: Some(target.clone()),
                arguments: Some(to_json_raw_list(arguments)?),
                stream_ids: (!stream_ids.is_empty()).then(|| stream_ids.clone()),
                headers: headers.clone(),
                ..JsonEnvelope::empty(4)
            },
            Message::CancelInvocation {
                invocation_id,
                headers,
            } => JsonEnvelope {
                invocation_id: Some(invocation_id.clone()),
                headers: headers.clone(),
                ..JsonEnvelope::empty(5)
            },
            Message::Ping => JsonEnvelope::empty(6),
            Message::Close {
                error,
                allow_reconnect,
            } => JsonEnvelope {
                error: error.clone(),
                allow_reconnect: *allow_reconnect,
                ..JsonEnvelope::empty(7)
            },
            Message::HandshakeRequest { .. } | Message::HandshakeResponse { .. } => {
                return Err(SignalRError::Protocol(
                    "handshake frames are not tagged messages".into(),
                ));
            }
        };
        Ok(envelope)
    }
}

fn decode_frame(frame: &[u8]) -> ParseOutcome {
    let envelope: JsonEnvelope = serde_json::from_slice(frame)
        .map_err(|e| SignalRError::Protocol(format!("malformed frame: {e}")))?;
    envelope_to_message(envelope)
}

fn envelope_to_message(envelope: JsonEnvelope) -> ParseOutcome {
    fn required(field: Option<String>, name: &str) -> Result<String, SignalRError> {
        field.filter(|v| !v.is_empty()).ok_or_else(|| {
            SignalRError::Protocol(format!("missing required field '{name}'"))
        })
    }

    let arguments = envelope
        .arguments
        .unwrap_or_default()
        .into_iter()
        .map(RawArgument::Json)
        .collect();
    let message = match envelope.kind {
        1 => Message::Invocation {
            // An absent or empty id marks the call fire-and-forget.
            invocation_id: envelope.invocation_id.filter(|id| !id.is_empty()),
            target: required(envelope.target, "target")?,
            arguments,
            stream_ids: envelope.stream_ids.unwrap_or_default(),
            headers: envelope.headers,
        },
        2 => Message::StreamItem {
            invocation_id: required(envelope.invocation_id, "invocationId")?,
            item: envelope
                .item
                .map(RawArgument::Json)
                .ok_or_else(|| SignalRError::Protocol("missing required field 'item'".into()))?,
            headers: envelope.headers,
        },
        3 => {
            if envelope.result.is_some() && envelope.error.is_some() {
                return Err(SignalRError::Protocol(
                    "completion carries both result and error".into(),
                ));
            }
            Message::Completion {
                invocation_id: required(envelope.invocation_id, "invocationId")?,
                result: envelope.result.map(RawArgument::Json),
                error: envelope.error,
                headers: envelope.headers,
            }
        }
        4 => Message::StreamInvocation {
            invocation_id: required(envelope.invocation_id, "invocationId")?,
            target: required(envelope.target, "target")?,
            arguments,
            stream_ids: envelope.stream_ids.unwrap_or_default(),
            headers: envelope.headers,
        },
        5 => Message::CancelInvocation {
            invocation_id: required(envelope.invocation_id, "invocationId")?,
            headers: envelope.headers,
        },
        6 => Message::Ping,
        7 => Message::Close {
            error: envelope.error,
            allow_reconnect: envelope.allow_reconnect,
        },
        other => {
            return Err(SignalRError::Protocol(format!(
                "unknown message type {other}"
            )))
        }
    };
    Ok(message)
}

/// Incremental splitter for record-separated JSON frames.
///
/// Tracks JSON string state across chunks so a `0x1E` inside a string is
/// never mistaken for a frame boundary, and drops oversized frames without
/// retaining their bytes.
struct JsonFrameParser {
    max_message_size: usize,
    residual: BytesMut,
    /// Scan resume offset into `residual`; bytes before it were examined.
    scan_pos: usize,
    in_string: bool,
    escaped: bool,
    /// Oversized frame in progress: drop bytes until the next separator.
    skipping: bool,
}

impl JsonFrameParser {
    fn new(max_message_size: usize) -> Self {
        Self {
            max_message_size,
            residual: BytesMut::new(),
            scan_pos: 0,
            in_string: false,
            escaped: false,
            skipping: false,
        }
    }

    /// Finds the next record separator outside a JSON string, resuming the
    /// scan where the previous call stopped.
    fn find_separator(&mut self) -> Option<usize> {
        while self.scan_pos < self.residual.len() {
            let byte = self.residual[self.scan_pos];
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if byte == b'\\' {
                    self.escaped = true;
                } else if byte == b'"' {
                    self.in_string = false;
                }
            } else if byte == b'"' {
                self.in_string = true;
            } else if byte == RECORD_SEPARATOR {
                return Some(self.scan_pos);
            }
            self.scan_pos += 1;
        }
        None
    }
}

impl FrameParser for JsonFrameParser {
    fn parse(&mut self, chunk: &[u8], out: &mut Vec<ParseOutcome>) {
        self.residual.extend_from_slice(chunk);
        while let Some(separator) = self.find_separator() {
            let frame_len = separator;
            if self.skipping {
                self.skipping = false;
            } else if frame_len > self.max_message_size {
                out.push(Err(SignalRError::Protocol(format!(
                    "frame of {frame_len} bytes exceeds maximum receive message size"
                ))));
            } else {
                out.push(decode_frame(&self.residual[..frame_len]));
            }
            self.residual.advance(frame_len + 1);
            self.scan_pos = 0;
        }
        // No separator in sight: once the partial frame outgrows the cap,
        // report it and stop retaining its bytes. The string-scan state at
        // scan_pos stays valid because only examined bytes are dropped.
        if !self.skipping && self.residual.len() > self.max_message_size {
            out.push(Err(SignalRError::Protocol(format!(
                "frame exceeds maximum receive message size of {} bytes",
                self.max_message_size
            ))));
            self.skipping = true;
        }
        if self.skipping {
            self.residual.advance(self.scan_pos);
            self.scan_pos = 0;
        }
    }
}
