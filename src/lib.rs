//! Transport-agnostic core of the ASP.NET Core SignalR hub protocol.
//!
//! This crate implements the machinery between a raw bidirectional byte
//! transport and an application-level hub of invocable methods: the framed
//! message pump with at-most-one-writer discipline, the connection
//! lifecycle (handshake, keep-alive, orderly shutdown), the invocation
//! bookkeeping for calls and streams, and both wire encodings — JSON with
//! record-separator framing and length-prefixed MessagePack.
//!
//! It does not dial sockets, negotiate over HTTP, or dispatch hub methods;
//! those live outside, behind the [`Transport`] contract and the receive
//! stream.
//!
//! # Quick start
//!
//! ```rust
//! use bytes::BytesMut;
//! use signalr_hub::protocol::{HubProtocol, JsonHubProtocol, Message};
//!
//! let mut frame = BytesMut::new();
//! JsonHubProtocol
//!     .write_message(&Message::Ping, &mut frame)
//!     .unwrap();
//! assert_eq!(&frame[..], b"{\"type\":6}\x1e");
//!
//! let mut parser = JsonHubProtocol.new_parser(32 * 1024);
//! let mut decoded = Vec::new();
//! parser.parse(&frame, &mut decoded);
//! assert_eq!(decoded.remove(0).unwrap(), Message::Ping);
//! ```
//!
//! For a live connection, hand a connected [`Transport`] to
//! [`HubConnection::connect`] (client role) or [`HubConnection::accept`]
//! (server role) and consume the stream returned by
//! [`HubConnection::receive`].

pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod transport;

pub use config::HubConfig;
pub use connection::{
    next_invocation_id, ConnectionState, HubConnection, HubReceiver, InvocationRegistry,
    ReceiveResult,
};
pub use error::SignalRError;
pub use protocol::{
    HubProtocol, JsonHubProtocol, Message, MessagePackHubProtocol, RawArgument, TransferMode,
};
pub use transport::{MemoryTransport, Transport};
