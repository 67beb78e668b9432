//! The hub message model shared by both wire encodings.
//!
//! Messages carry their arguments, stream items and results as opaque
//! [`RawArgument`] payloads: the codec preserves the original dynamic shape
//! and the dispatcher binds each element to its declared parameter type
//! lazily, so one badly-typed argument cannot corrupt the connection.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::value::RawValue;

use crate::error::SignalRError;

/// Optional per-message metadata, never interpreted by the core.
pub type Headers = HashMap<String, String>;

/// A SignalR hub protocol message.
///
/// Each variant corresponds to a message type of the hub protocol (v1);
/// the numeric tags on the wire are 1..=7. The handshake shapes are
/// untagged and always travel as text-framed JSON.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A call to a named target. Without an `invocation_id` the call is
    /// fire-and-forget and the peer must not answer it.
    ///
    /// Wire (JSON): `{"type":1,"invocationId":"1","target":"Add","arguments":[2,3]}`
    Invocation {
        invocation_id: Option<String>,
        target: String,
        arguments: Vec<RawArgument>,
        stream_ids: Vec<String>,
        headers: Option<Headers>,
    },

    /// One element of a live stream.
    ///
    /// Wire (JSON): `{"type":2,"invocationId":"2","item":0}`
    StreamItem {
        invocation_id: String,
        item: RawArgument,
        headers: Option<Headers>,
    },

    /// The terminal answer to an invocation or stream.
    ///
    /// Carries either a result or an error, never both; absence of both
    /// means void-return success.
    Completion {
        invocation_id: String,
        result: Option<RawArgument>,
        error: Option<String>,
        headers: Option<Headers>,
    },

    /// A call whose response is a stream of items ended by a Completion.
    StreamInvocation {
        invocation_id: String,
        target: String,
        arguments: Vec<RawArgument>,
        stream_ids: Vec<String>,
        headers: Option<Headers>,
    },

    /// Requests the peer stop a stream it is producing.
    CancelInvocation {
        invocation_id: String,
        headers: Option<Headers>,
    },

    /// Keep-alive. Either side may send it; no response is expected.
    ///
    /// Wire (JSON): `{"type":6}`
    Ping,

    /// Graceful termination, optionally permitting a client reconnect.
    ///
    /// Wire (JSON): `{"type":7,"error":"bye","allowReconnect":true}`
    Close {
        error: Option<String>,
        allow_reconnect: Option<bool>,
    },

    /// First frame from the client: protocol name and version.
    HandshakeRequest { protocol: String, version: u32 },

    /// First frame from the server: empty on success, error text otherwise.
    HandshakeResponse {
        error: Option<String>,
        minor_version: Option<u32>,
    },
}

impl Message {
    /// The numeric wire tag, or `None` for the untagged handshake shapes.
    pub fn message_type(&self) -> Option<u8> {
        match self {
            Message::Invocation { .. } => Some(1),
            Message::StreamItem { .. } => Some(2),
            Message::Completion { .. } => Some(3),
            Message::StreamInvocation { .. } => Some(4),
            Message::CancelInvocation { .. } => Some(5),
            Message::Ping => Some(6),
            Message::Close { .. } => Some(7),
            Message::HandshakeRequest { .. } | Message::HandshakeResponse { .. } => None,
        }
    }

    /// The invocation id the message is correlated with, if any.
    pub fn invocation_id(&self) -> Option<&str> {
        match self {
            Message::Invocation { invocation_id, .. } => invocation_id.as_deref(),
            Message::StreamItem { invocation_id, .. }
            | Message::Completion { invocation_id, .. }
            | Message::StreamInvocation { invocation_id, .. }
            | Message::CancelInvocation { invocation_id, .. } => Some(invocation_id),
            _ => None,
        }
    }
}

/// One argument, item or result, preserved in its original encoding.
///
/// The text protocol produces `Json` values (raw JSON fragments), the
/// binary protocol produces `Pack` values (decoded MessagePack trees).
/// Either codec can re-encode either representation, so a message built
/// for one protocol can be written with the other.
#[derive(Debug, Clone)]
pub enum RawArgument {
    /// A raw JSON fragment, exactly as it appeared on the wire.
    Json(Box<RawValue>),
    /// A dynamically-typed MessagePack value.
    Pack(rmpv::Value),
}

impl RawArgument {
    /// Encodes a typed value for the send path.
    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self, SignalRError> {
        let text = serde_json::to_string(value)
            .map_err(|e| SignalRError::Protocol(format!("cannot encode argument: {e}")))?;
        let raw = RawValue::from_string(text)
            .map_err(|e| SignalRError::Protocol(format!("cannot encode argument: {e}")))?;
        Ok(RawArgument::Json(raw))
    }

    /// Binds the payload to a concrete type.
    ///
    /// `index` is the argument's position in its message, used only for
    /// error reporting.
    pub fn bind<T: DeserializeOwned>(&self, index: usize) -> Result<T, SignalRError> {
        let result = match self {
            RawArgument::Json(raw) => {
                serde_json::from_str(raw.get()).map_err(|e| e.to_string())
            }
            RawArgument::Pack(value) => {
                rmpv::ext::from_value(value.clone()).map_err(|e| e.to_string())
            }
        };
        result.map_err(|message| SignalRError::Bind { index, message })
    }

    /// The payload as a JSON value tree, converting if necessary.
    pub fn to_json_value(&self) -> Result<serde_json::Value, SignalRError> {
        match self {
            RawArgument::Json(raw) => serde_json::from_str(raw.get())
                .map_err(|e| SignalRError::Protocol(format!("invalid JSON payload: {e}"))),
            RawArgument::Pack(value) => pack_to_json(value),
        }
    }

    /// The payload as a MessagePack value tree, converting if necessary.
    pub fn to_pack_value(&self) -> Result<rmpv::Value, SignalRError> {
        match self {
            RawArgument::Json(raw) => {
                let value: serde_json::Value = serde_json::from_str(raw.get())
                    .map_err(|e| SignalRError::Protocol(format!("invalid JSON payload: {e}")))?;
                Ok(json_to_pack(&value))
            }
            RawArgument::Pack(value) => Ok(value.clone()),
        }
    }
}

/// Payload equality is semantic: both sides are reduced to JSON value
/// trees, so a round trip through either encoding compares equal.
impl PartialEq for RawArgument {
    fn eq(&self, other: &Self) -> bool {
        match (self.to_json_value(), other.to_json_value()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

fn pack_to_json(value: &rmpv::Value) -> Result<serde_json::Value, SignalRError> {
    use serde_json::Value as Json;
    let converted = match value {
        rmpv::Value::Nil => Json::Null,
        rmpv::Value::Boolean(b) => Json::Bool(*b),
        rmpv::Value::Integer(i) => {
            if let Some(n) = i.as_i64() {
                Json::Number(n.into())
            } else if let Some(n) = i.as_u64() {
                Json::Number(n.into())
            } else {
                return Err(SignalRError::Protocol("integer out of range".into()));
            }
        }
        rmpv::Value::F32(f) => serde_json::Number::from_f64(f64::from(*f))
            .map(Json::Number)
            .ok_or_else(|| SignalRError::Protocol("non-finite number".into()))?,
        rmpv::Value::F64(f) => serde_json::Number::from_f64(*f)
            .map(Json::Number)
            .ok_or_else(|| SignalRError::Protocol("non-finite number".into()))?,
        rmpv::Value::String(s) => Json::String(
            s.as_str()
                .ok_or_else(|| SignalRError::Protocol("non-UTF-8 string".into()))?
                .to_owned(),
        ),
        rmpv::Value::Binary(bytes) => {
            Json::Array(bytes.iter().map(|b| Json::Number((*b).into())).collect())
        }
        rmpv::Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(pack_to_json(item)?);
            }
            Json::Array(out)
        }
        rmpv::Value::Map(pairs) => {
            let mut map = serde_json::Map::with_capacity(pairs.len());
            for (key, item) in pairs {
                let key = key
                    .as_str()
                    .ok_or_else(|| SignalRError::Protocol("non-string map key".into()))?;
                map.insert(key.to_owned(), pack_to_json(item)?);
            }
            Json::Object(map)
        }
        rmpv::Value::Ext(..) => {
            return Err(SignalRError::Protocol("extension type not supported".into()))
        }
    };
    Ok(converted)
}

fn json_to_pack(value: &serde_json::Value) -> rmpv::Value {
    use serde_json::Value as Json;
    match value {
        Json::Null => rmpv::Value::Nil,
        Json::Bool(b) => rmpv::Value::Boolean(*b),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                rmpv::Value::from(i)
            } else if let Some(u) = n.as_u64() {
                rmpv::Value::from(u)
            } else {
                rmpv::Value::F64(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Json::String(s) => rmpv::Value::from(s.as_str()),
        Json::Array(items) => rmpv::Value::Array(items.iter().map(json_to_pack).collect()),
        Json::Object(map) => rmpv::Value::Map(
            map.iter()
                .map(|(k, v)| (rmpv::Value::from(k.as_str()), json_to_pack(v)))
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_json_argument() {
        let arg = RawArgument::from_serialize(&42).unwrap();
        let value: i32 = arg.bind(0).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn bind_pack_argument() {
        let arg = RawArgument::Pack(rmpv::Value::from("hello"));
        let value: String = arg.bind(0).unwrap();
        assert_eq!(value, "hello");
    }

    #[test]
    fn bind_reports_index_on_type_mismatch() {
        let arg = RawArgument::from_serialize(&"not a number").unwrap();
        let err = arg.bind::<i32>(3).unwrap_err();
        match err {
            SignalRError::Bind { index, .. } => assert_eq!(index, 3),
            other => panic!("expected bind error, got {other:?}"),
        }
    }

    #[test]
    fn cross_encoding_equality() {
        let json = RawArgument::from_serialize(&serde_json::json!({"a": [1, 2], "b": "x"})).unwrap();
        let pack = RawArgument::Pack(rmpv::Value::Map(vec![
            (
                rmpv::Value::from("a"),
                rmpv::Value::Array(vec![rmpv::Value::from(1), rmpv::Value::from(2)]),
            ),
            (rmpv::Value::from("b"), rmpv::Value::from("x")),
        ]));
        assert_eq!(json, pack);
    }

    #[test]
    fn pack_round_trips_through_json_tree() {
        let original = rmpv::Value::Array(vec![
            rmpv::Value::Nil,
            rmpv::Value::Boolean(true),
            rmpv::Value::from(-7),
            rmpv::Value::from("text"),
        ]);
        let arg = RawArgument::Pack(original);
        let json = arg.to_json_value().unwrap();
        assert_eq!(json, serde_json::json!([null, true, -7, "text"]));
    }

    #[test]
    fn message_type_tags() {
        assert_eq!(Message::Ping.message_type(), Some(6));
        let close = Message::Close {
            error: None,
            allow_reconnect: None,
        };
        assert_eq!(close.message_type(), Some(7));
        let handshake = Message::HandshakeRequest {
            protocol: "json".into(),
            version: 1,
        };
        assert_eq!(handshake.message_type(), None);
    }

    #[test]
    fn invocation_id_accessor() {
        let message = Message::Completion {
            invocation_id: "42".into(),
            result: None,
            error: None,
            headers: None,
        };
        assert_eq!(message.invocation_id(), Some("42"));
        assert_eq!(Message::Ping.invocation_id(), None);
    }
}
