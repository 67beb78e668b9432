//! The byte-transport contract the hub connection consumes.
//!
//! Connection setup is deliberately not part of the trait — WebSocket
//! upgrades, TCP dials and test pipes have nothing in common there.
//! Construct a connected transport externally and hand it to a
//! [`HubConnection`](crate::connection::HubConnection) constructor.

use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::protocol::TransferMode;

/// Tells a frame-oriented transport whether payloads are text or binary.
/// Consulted once, immediately after the handshake.
pub type TransferModeSink = Box<dyn FnOnce(TransferMode) + Send>;

/// An ordered, full-duplex byte channel with a stable identity and a
/// cancellation scope tied to its liveness.
///
/// Only the connection's read pump reads and only write-mutex holders
/// write, so the halves need no internal synchronization of their own.
pub trait Transport: Send + 'static {
    type Reader: AsyncRead + Send + Unpin + 'static;
    type Writer: AsyncWrite + Send + Unpin + 'static;

    /// Stable identifier of this transport instance.
    fn connection_id(&self) -> &str;

    /// Scope that fires when the transport dies. The hub connection
    /// derives its own scope from it.
    fn scope(&self) -> CancellationToken;

    /// Frame-kind sink for transports that distinguish text and binary
    /// frames. Byte-oriented transports have no use for it.
    fn transfer_mode_sink(&mut self) -> Option<TransferModeSink> {
        None
    }

    /// Consumes the transport into its owned halves.
    fn into_split(self) -> (Self::Reader, Self::Writer);
}

/// In-process transport over a [`tokio::io::duplex`] pipe.
///
/// Backs the test suite; it records the transfer mode it is told so tests
/// can observe the sink being consulted.
pub struct MemoryTransport {
    connection_id: String,
    scope: CancellationToken,
    io: DuplexStream,
    transfer_mode: Arc<Mutex<Option<TransferMode>>>,
}

impl MemoryTransport {
    /// Creates a connected pair with the given pipe capacity per direction.
    pub fn pair(capacity: usize) -> (MemoryTransport, MemoryTransport) {
        let (left, right) = tokio::io::duplex(capacity);
        (Self::new(left), Self::new(right))
    }

    fn new(io: DuplexStream) -> Self {
        Self {
            connection_id: Uuid::new_v4().to_string(),
            scope: CancellationToken::new(),
            io,
            transfer_mode: Arc::new(Mutex::new(None)),
        }
    }

    /// The transfer mode the peer announced, if any.
    pub fn recorded_transfer_mode(&self) -> Option<TransferMode> {
        *self.transfer_mode.lock().unwrap()
    }

    /// A handle observing the transfer mode after `into_split`.
    pub fn transfer_mode_handle(&self) -> Arc<Mutex<Option<TransferMode>>> {
        Arc::clone(&self.transfer_mode)
    }
}

impl Transport for MemoryTransport {
    type Reader = ReadHalf<DuplexStream>;
    type Writer = WriteHalf<DuplexStream>;

    fn connection_id(&self) -> &str {
        &self.connection_id
    }

    fn scope(&self) -> CancellationToken {
        self.scope.clone()
    }

    fn transfer_mode_sink(&mut self) -> Option<TransferModeSink> {
        let slot = Arc::clone(&self.transfer_mode);
        Some(Box::new(move |mode| {
            *slot.lock().unwrap() = Some(mode);
        }))
    }

    fn into_split(self) -> (Self::Reader, Self::Writer) {
        tokio::io::split(self.io)
    }
}
