//! Wire protocol codecs for the hub connection.
//!
//! Two encodings satisfy the same contract: a JSON text format with
//! record-separator framing and a MessagePack binary format with LEB128
//! length prefixes. Both carry the same logical [`Message`] shapes with
//! identical semantics; the connection pump is encoding-agnostic.

pub mod handshake;
mod json;
mod message;
mod messagepack;

pub use json::JsonHubProtocol;
pub use message::{Headers, Message, RawArgument};
pub use messagepack::MessagePackHubProtocol;

use std::sync::Arc;

use bytes::BytesMut;

use crate::error::SignalRError;

/// Frame kind hint for transports that distinguish text and binary frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Text,
    Binary,
}

/// One decoded message, or the error produced at its position in the byte
/// stream.
pub type ParseOutcome = Result<Message, SignalRError>;

/// A hub protocol encoding.
///
/// Implementations are stateless; per-connection parse state (the residual
/// buffer that lets messages span reads) lives in the [`FrameParser`] a
/// protocol hands out.
pub trait HubProtocol: Send + Sync + 'static {
    /// The protocol name exchanged in the handshake (`"json"`,
    /// `"messagepack"`).
    fn name(&self) -> &'static str;

    /// The protocol version exchanged in the handshake.
    fn version(&self) -> u32 {
        1
    }

    /// Whether frames are text or binary on frame-oriented transports.
    fn transfer_mode(&self) -> TransferMode;

    /// Serializes one logical message, appending its framed bytes to `out`.
    ///
    /// A codec may emit several byte chunks per message; the caller holds
    /// the write mutex across this call so chunks never interleave.
    fn write_message(&self, message: &Message, out: &mut BytesMut) -> Result<(), SignalRError>;

    /// Creates a parser enforcing the given frame size cap.
    fn new_parser(&self, max_message_size: usize) -> Box<dyn FrameParser>;
}

/// Incremental frame parser owned by the connection's parser stage.
pub trait FrameParser: Send {
    /// Consumes one chunk of transport bytes and appends every completed
    /// outcome, in parse order, to `out`.
    ///
    /// Decoded messages and protocol errors are interleaved at exactly the
    /// position they occurred; an incomplete trailing frame is retained
    /// until the next chunk. A frame whose declared size exceeds the cap
    /// produces one error and is discarded without being buffered.
    fn parse(&mut self, chunk: &[u8], out: &mut Vec<ParseOutcome>);
}

/// Looks up a protocol by its handshake name.
pub fn protocol_by_name(name: &str) -> Option<Arc<dyn HubProtocol>> {
    match name {
        "json" => Some(Arc::new(JsonHubProtocol)),
        "messagepack" => Some(Arc::new(MessagePackHubProtocol)),
        _ => None,
    }
}
