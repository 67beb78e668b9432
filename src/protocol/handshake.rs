//! The first-frame exchange selecting a protocol and version.
//!
//! Handshake frames are always text-framed JSON terminated by the record
//! separator, regardless of the protocol being negotiated; only after a
//! successful exchange does framing switch to the negotiated encoding.
//! Bytes a peer pipelines behind its handshake frame are returned to the
//! caller so the message pump can start on them.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::json::RECORD_SEPARATOR;
use super::{protocol_by_name, HubProtocol, Message};
use crate::error::SignalRError;

/// Read granularity while waiting for the handshake terminator.
const READ_CHUNK: usize = 4 * 1024;

#[derive(Serialize, Deserialize)]
struct RequestEnvelope {
    protocol: String,
    version: u32,
}

#[derive(Serialize, Deserialize, Default)]
struct ResponseEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(
        rename = "minorVersion",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    minor_version: Option<u32>,
}

/// Serializes a handshake frame (request or response) with its terminator.
pub fn write_handshake_frame(message: &Message, out: &mut BytesMut) -> Result<(), SignalRError> {
    let text = match message {
        Message::HandshakeRequest { protocol, version } => serde_json::to_vec(&RequestEnvelope {
            protocol: protocol.clone(),
            version: *version,
        }),
        Message::HandshakeResponse {
            error,
            minor_version,
        } => serde_json::to_vec(&ResponseEnvelope {
            error: error.clone(),
            minor_version: *minor_version,
        }),
        _ => {
            return Err(SignalRError::Protocol(
                "not a handshake message".into(),
            ))
        }
    };
    let text = text.map_err(|e| SignalRError::Protocol(format!("cannot encode handshake: {e}")))?;
    out.extend_from_slice(&text);
    out.extend_from_slice(&[RECORD_SEPARATOR]);
    Ok(())
}

pub(crate) fn parse_request(frame: &[u8]) -> Result<Message, SignalRError> {
    let envelope: RequestEnvelope = serde_json::from_slice(frame)
        .map_err(|e| SignalRError::Handshake(format!("malformed handshake request: {e}")))?;
    Ok(Message::HandshakeRequest {
        protocol: envelope.protocol,
        version: envelope.version,
    })
}

pub(crate) fn parse_response(frame: &[u8]) -> Result<Message, SignalRError> {
    let envelope: ResponseEnvelope = serde_json::from_slice(frame)
        .map_err(|e| SignalRError::Handshake(format!("malformed handshake response: {e}")))?;
    Ok(Message::HandshakeResponse {
        error: envelope.error,
        minor_version: envelope.minor_version,
    })
}

/// Locates the record separator outside JSON string values.
fn find_separator(buf: &[u8]) -> Option<usize> {
    let mut in_string = false;
    let mut escaped = false;
    for (index, &byte) in buf.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
        } else if byte == b'"' {
            in_string = true;
        } else if byte == RECORD_SEPARATOR {
            return Some(index);
        }
    }
    None
}

/// Reads from `reader` until one complete handshake frame is buffered, and
/// splits it off. Anything already read past the terminator stays in `buf`.
async fn read_frame<R>(
    reader: &mut R,
    buf: &mut BytesMut,
    max_frame_size: usize,
) -> Result<BytesMut, SignalRError>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        if let Some(position) = find_separator(buf) {
            let frame = buf.split_to(position);
            buf.advance(1);
            return Ok(frame);
        }
        if buf.len() > max_frame_size {
            return Err(SignalRError::Handshake("handshake frame too large".into()));
        }
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(SignalRError::Handshake(
                "connection closed during handshake".into(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Client side of the exchange: sends the request for `protocol`, awaits
/// the server's verdict. Returns bytes pipelined behind the response.
pub async fn exchange_client<R, W>(
    reader: &mut R,
    writer: &mut W,
    protocol: &dyn HubProtocol,
    timeout: Duration,
    max_frame_size: usize,
) -> Result<BytesMut, SignalRError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let exchange = async {
        let mut out = BytesMut::new();
        write_handshake_frame(
            &Message::HandshakeRequest {
                protocol: protocol.name().to_owned(),
                version: protocol.version(),
            },
            &mut out,
        )?;
        writer.write_all(&out).await?;
        writer.flush().await?;

        let mut buf = BytesMut::new();
        let frame = read_frame(reader, &mut buf, max_frame_size).await?;
        match parse_response(&frame)? {
            Message::HandshakeResponse { error: None, .. } => {
                debug!(protocol = protocol.name(), "handshake accepted");
                Ok(buf)
            }
            Message::HandshakeResponse {
                error: Some(error), ..
            } => Err(SignalRError::Handshake(error)),
            _ => unreachable!("parse_response yields handshake responses"),
        }
    };
    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| SignalRError::Handshake("handshake timed out".into()))?
}

/// Server side of the exchange: awaits the client's request, selects the
/// protocol by name, and answers. An unknown protocol or unsupported
/// version is answered with an error frame before this returns `Err`.
pub async fn exchange_server<R, W>(
    reader: &mut R,
    writer: &mut W,
    timeout: Duration,
    max_frame_size: usize,
) -> Result<(Arc<dyn HubProtocol>, BytesMut), SignalRError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let exchange = async {
        let mut buf = BytesMut::new();
        let frame = read_frame(reader, &mut buf, max_frame_size).await?;
        let (protocol_name, version) = match parse_request(&frame)? {
            Message::HandshakeRequest { protocol, version } => (protocol, version),
            _ => unreachable!("parse_request yields handshake requests"),
        };

        let selected = protocol_by_name(&protocol_name)
            .filter(|protocol| version <= protocol.version());
        let response = match &selected {
            Some(_) => Message::HandshakeResponse {
                error: None,
                minor_version: None,
            },
            None => Message::HandshakeResponse {
                error: Some(format!(
                    "unsupported protocol '{protocol_name}' version {version}"
                )),
                minor_version: None,
            },
        };
        let mut out = BytesMut::new();
        write_handshake_frame(&response, &mut out)?;
        writer.write_all(&out).await?;
        writer.flush().await?;

        match selected {
            Some(protocol) => {
                debug!(protocol = protocol.name(), "handshake accepted");
                Ok((protocol, buf))
            }
            None => Err(SignalRError::Handshake(format!(
                "unsupported protocol '{protocol_name}' version {version}"
            ))),
        }
    };
    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| SignalRError::Handshake("handshake timed out".into()))?
}
