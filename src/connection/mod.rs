//! The hub connection: one transport, one codec, two pump stages, one
//! writer.
//!
//! A [`HubConnection`] sits between a raw byte [`Transport`] and the hub
//! dispatch layer. It reads the byte stream through a two-stage pipeline
//! (byte reader → in-memory pipe → frame parser) into a bounded receive
//! channel, serializes every outbound message under a single write mutex,
//! and owns the cancellation scope that defines the connection's lifetime.

mod keepalive;
pub mod registry;

pub use registry::{next_invocation_id, CompletionResult, InvocationRegistry, StreamItemResult};

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex as StdMutex};

use bytes::BytesMut;
use futures_channel::mpsc;
use futures_util::SinkExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HubConfig;
use crate::error::SignalRError;
use crate::protocol::{handshake, HubProtocol, Message, RawArgument};
use crate::transport::Transport;

/// Receive-channel capacity. A slow consumer backs the parser up, the
/// parser backs the pipe up, and the pipe stops the byte reader from
/// draining the transport; this is the only backpressure signal.
const RECEIVE_CHANNEL_CAPACITY: usize = 20;

/// One entry of the receive stream: a decoded message, or the error that
/// occurred at exactly that position.
pub type ReceiveResult = Result<Message, SignalRError>;

/// Receiving end of a connection's message stream. Single consumer.
pub type HubReceiver = mpsc::Receiver<ReceiveResult>;

/// Free-form per-connection metadata. The core never reads it.
pub type ItemStore = Arc<RwLock<HashMap<String, serde_json::Value>>>;

/// Lifecycle of a hub connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// The first-frame exchange is in flight.
    Handshaking,
    /// Handshake accepted; the pumps are running.
    Active,
    /// A terminal signal fired; the pumps are draining.
    Closing,
    /// Both pumps drained; writes are rejected without I/O.
    Closed,
}

struct WriterState {
    sink: Box<dyn AsyncWrite + Send + Unpin>,
    last_write: Instant,
}

struct Inner {
    connection_id: String,
    protocol: Arc<dyn HubProtocol>,
    config: HubConfig,
    scope: CancellationToken,
    writer: Mutex<WriterState>,
    last_receive: StdMutex<Instant>,
    items: ItemStore,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    receiver: StdMutex<Option<HubReceiver>>,
}

/// An active hub connection. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct HubConnection {
    inner: Arc<Inner>,
}

impl HubConnection {
    /// Client role: performs the handshake for `protocol` on `transport`
    /// and starts the pumps.
    pub async fn connect<T: Transport>(
        mut transport: T,
        protocol: Arc<dyn HubProtocol>,
        config: HubConfig,
    ) -> Result<Self, SignalRError> {
        let connection_id = transport.connection_id().to_owned();
        let scope = transport.scope().child_token();
        let mode_sink = transport.transfer_mode_sink();
        let (mut reader, mut writer) = transport.into_split();

        let leftover = handshake::exchange_client(
            &mut reader,
            &mut writer,
            protocol.as_ref(),
            config.handshake_timeout,
            config.maximum_receive_message_size,
        )
        .await?;
        if let Some(sink) = mode_sink {
            sink(protocol.transfer_mode());
        }
        info!(%connection_id, protocol = protocol.name(), "hub connection established");
        Ok(Self::start(
            connection_id,
            scope,
            protocol,
            config,
            reader,
            writer,
            leftover,
        ))
    }

    /// Server role: awaits the peer's handshake, selects the protocol it
    /// names, and starts the pumps.
    pub async fn accept<T: Transport>(
        mut transport: T,
        config: HubConfig,
    ) -> Result<Self, SignalRError> {
        let connection_id = transport.connection_id().to_owned();
        let scope = transport.scope().child_token();
        let mode_sink = transport.transfer_mode_sink();
        let (mut reader, mut writer) = transport.into_split();

        let (protocol, leftover) = handshake::exchange_server(
            &mut reader,
            &mut writer,
            config.handshake_timeout,
            config.maximum_receive_message_size,
        )
        .await?;
        if let Some(sink) = mode_sink {
            sink(protocol.transfer_mode());
        }
        info!(%connection_id, protocol = protocol.name(), "hub connection accepted");
        Ok(Self::start(
            connection_id,
            scope,
            protocol,
            config,
            reader,
            writer,
            leftover,
        ))
    }

    fn start<R, W>(
        connection_id: String,
        scope: CancellationToken,
        protocol: Arc<dyn HubProtocol>,
        config: HubConfig,
        reader: R,
        writer: W,
        handshake_leftover: BytesMut,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Handshaking);
        let (message_tx, message_rx) = mpsc::channel(RECEIVE_CHANNEL_CAPACITY);
        let now = Instant::now();
        let connection = HubConnection {
            inner: Arc::new(Inner {
                connection_id,
                protocol: Arc::clone(&protocol),
                config: config.clone(),
                scope: scope.clone(),
                writer: Mutex::new(WriterState {
                    sink: Box::new(writer),
                    last_write: now,
                }),
                last_receive: StdMutex::new(now),
                items: Arc::new(RwLock::new(HashMap::new())),
                state_tx,
                state_rx,
                receiver: StdMutex::new(Some(message_rx)),
            }),
        };
        connection.inner.state_tx.send_replace(ConnectionState::Active);

        // The pipe between the byte-reader and parser stages; its capacity
        // bounds how far the reader can run ahead of the parser.
        let (pipe_reader, pipe_writer) =
            tokio::io::simplex(config.maximum_receive_message_size.max(1));

        let reader_task = tokio::spawn(run_byte_reader(
            connection.clone(),
            reader,
            pipe_writer,
            message_tx.clone(),
        ));
        let parser_task = tokio::spawn(run_parser(
            connection.clone(),
            pipe_reader,
            handshake_leftover,
            message_tx.clone(),
        ));
        keepalive::spawn(
            connection.clone(),
            message_tx,
            config.keep_alive_interval,
            config.client_timeout_interval,
        );

        // Terminal-signal watcher: Active -> Closing once the scope fires.
        {
            let scope = scope.clone();
            let state_tx = connection.inner.state_tx.clone();
            tokio::spawn(async move {
                scope.cancelled().await;
                state_tx.send_modify(|state| {
                    if *state == ConnectionState::Active {
                        *state = ConnectionState::Closing;
                    }
                });
            });
        }
        // Once both pump stages signal done the connection is Closed; the
        // receive channel closes when the last sender clone drops.
        {
            let state_tx = connection.inner.state_tx.clone();
            let connection_id = connection.inner.connection_id.clone();
            tokio::spawn(async move {
                let _ = tokio::join!(reader_task, parser_task);
                debug!(%connection_id, "hub connection pumps drained");
                state_tx.send_replace(ConnectionState::Closed);
            });
        }
        connection
    }

    /// Stable identifier of the underlying transport.
    pub fn connection_id(&self) -> &str {
        &self.inner.connection_id
    }

    /// The single hot receive stream. The first call takes it; later calls
    /// return `None`.
    ///
    /// Errors on the stream do not close it — the consumer decides whether
    /// to abort. The stream terminates once the scope has fired and both
    /// pump stages drained.
    pub fn receive(&self) -> Option<HubReceiver> {
        self.inner.receiver.lock().unwrap().take()
    }

    /// The connection's cancellation scope.
    pub fn context(&self) -> CancellationToken {
        self.inner.scope.clone()
    }

    /// Fires the cancellation scope. Idempotent; sends no Close frame.
    pub fn abort(&self) {
        self.inner.scope.cancel();
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_rx.borrow()
    }

    /// Resolves when both pump stages have drained.
    pub async fn wait_until_closed(&self) {
        let mut state_rx = self.inner.state_rx.clone();
        // An error means the sender is gone, which only happens past Closed.
        let _ = state_rx
            .wait_for(|state| *state == ConnectionState::Closed)
            .await;
    }

    /// Per-connection metadata store; the core never interprets it.
    pub fn items(&self) -> ItemStore {
        Arc::clone(&self.inner.items)
    }

    /// A registry sized from this connection's configuration, with its
    /// sinks tied to the connection's lifetime.
    pub fn new_registry(&self) -> InvocationRegistry {
        let registry = InvocationRegistry::new(self.inner.config.stream_buffer_capacity);
        registry.attach(self);
        registry
    }

    /// Instant of the most recent write attempt.
    pub async fn last_write_stamp(&self) -> Instant {
        self.inner.writer.lock().await.last_write
    }

    pub(crate) fn last_receive_stamp(&self) -> Instant {
        *self.inner.last_receive.lock().unwrap()
    }

    /// Sends an Invocation; without an id the call is fire-and-forget.
    pub async fn send_invocation(
        &self,
        invocation_id: Option<&str>,
        target: &str,
        arguments: Vec<RawArgument>,
    ) -> Result<(), SignalRError> {
        self.write_message(&Message::Invocation {
            invocation_id: invocation_id.map(str::to_owned),
            target: target.to_owned(),
            arguments,
            stream_ids: Vec::new(),
            headers: None,
        })
        .await
    }

    /// Sends a StreamInvocation.
    pub async fn send_stream_invocation(
        &self,
        invocation_id: &str,
        target: &str,
        arguments: Vec<RawArgument>,
        stream_ids: Vec<String>,
    ) -> Result<(), SignalRError> {
        self.write_message(&Message::StreamInvocation {
            invocation_id: invocation_id.to_owned(),
            target: target.to_owned(),
            arguments,
            stream_ids,
            headers: None,
        })
        .await
    }

    /// Sends one StreamItem of a live stream.
    pub async fn stream_item(
        &self,
        invocation_id: &str,
        item: RawArgument,
    ) -> Result<(), SignalRError> {
        self.write_message(&Message::StreamItem {
            invocation_id: invocation_id.to_owned(),
            item,
            headers: None,
        })
        .await
    }

    /// Sends the terminal Completion for an invocation or stream.
    pub async fn completion(
        &self,
        invocation_id: &str,
        result: Option<RawArgument>,
        error: Option<&str>,
    ) -> Result<(), SignalRError> {
        self.write_message(&Message::Completion {
            invocation_id: invocation_id.to_owned(),
            result,
            error: error.map(str::to_owned),
            headers: None,
        })
        .await
    }

    /// Asks the peer to stop producing a stream.
    pub async fn cancel_invocation(&self, invocation_id: &str) -> Result<(), SignalRError> {
        self.write_message(&Message::CancelInvocation {
            invocation_id: invocation_id.to_owned(),
            headers: None,
        })
        .await
    }

    /// Sends a keep-alive Ping.
    pub async fn ping(&self) -> Result<(), SignalRError> {
        self.write_message(&Message::Ping).await
    }

    /// Sends a Close frame, optionally inviting the peer to reconnect.
    pub async fn close(
        &self,
        error: Option<&str>,
        allow_reconnect: bool,
    ) -> Result<(), SignalRError> {
        self.write_message(&Message::Close {
            error: error.map(str::to_owned),
            allow_reconnect: allow_reconnect.then_some(true),
        })
        .await
    }

    /// Serializes `message` and hands its bytes to the transport, under
    /// the write mutex.
    ///
    /// The mutex spans the codec call and the transport handoff so a
    /// multi-chunk encoding never interleaves with another writer. The
    /// write stamp advances under the mutex before encoding, which is
    /// what the keep-alive supervisor observes.
    async fn write_message(&self, message: &Message) -> Result<(), SignalRError> {
        if self.inner.scope.is_cancelled() {
            return Err(SignalRError::ConnectionClosed);
        }
        let mut writer = self.inner.writer.lock().await;
        if self.inner.scope.is_cancelled() {
            return Err(SignalRError::ConnectionClosed);
        }
        writer.last_write = Instant::now();

        let mut buf = BytesMut::new();
        let result = match self.inner.protocol.write_message(message, &mut buf) {
            Err(e) => Err(e),
            Ok(()) => {
                let sink = &mut writer.sink;
                tokio::select! {
                    _ = self.inner.scope.cancelled() => Err(SignalRError::ConnectionClosed),
                    written = async {
                        sink.write_all(&buf).await?;
                        sink.flush().await
                    } => written.map_err(SignalRError::from),
                }
            }
        };
        drop(writer);

        if let Err(e) = &result {
            if !matches!(e, SignalRError::ConnectionClosed) {
                warn!(
                    connection_id = %self.inner.connection_id,
                    message_type = ?message.message_type(),
                    error = %e,
                    "write failed, aborting connection"
                );
                self.abort();
            }
        }
        result
    }

    fn note_bytes_received(&self) {
        *self.inner.last_receive.lock().unwrap() = Instant::now();
    }
}

/// Byte-reader stage: drains the transport into the parse pipe.
///
/// The first non-cancellation read failure (EOF included) is delivered on
/// the receive channel and ends the stage; it never retries.
async fn run_byte_reader<R>(
    connection: HubConnection,
    mut reader: R,
    mut pipe: tokio::io::WriteHalf<tokio::io::SimplexStream>,
    mut messages: mpsc::Sender<ReceiveResult>,
) where
    R: AsyncRead + Send + Unpin,
{
    let scope = connection.context();
    let mut buf = vec![0u8; connection.inner.config.maximum_receive_message_size.max(1)];
    loop {
        let read = tokio::select! {
            _ = scope.cancelled() => break,
            read = reader.read(&mut buf) => read,
        };
        // The scope may have fired while the read was in flight.
        match read {
            _ if scope.is_cancelled() => break,
            Ok(0) => {
                let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "transport closed");
                let _ = messages.send(Err(SignalRError::Transport(eof))).await;
                scope.cancel();
                break;
            }
            Ok(n) => {
                connection.note_bytes_received();
                if pipe.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                let _ = messages.send(Err(SignalRError::Transport(e))).await;
                scope.cancel();
                break;
            }
        }
    }
    // Dropping the pipe writer is the parser stage's end-of-input.
}

/// Parser stage: turns pipe bytes into messages on the receive channel.
///
/// Parse errors are delivered in place and the stage continues; a decoded
/// Close is delivered and then ends the connection.
async fn run_parser(
    connection: HubConnection,
    mut pipe: tokio::io::ReadHalf<tokio::io::SimplexStream>,
    handshake_leftover: BytesMut,
    mut messages: mpsc::Sender<ReceiveResult>,
) {
    let scope = connection.context();
    let max = connection.inner.config.maximum_receive_message_size.max(1);
    let mut parser = connection.inner.protocol.new_parser(max);
    let mut outcomes = Vec::new();
    if !handshake_leftover.is_empty() {
        parser.parse(&handshake_leftover, &mut outcomes);
    }
    let mut chunk = vec![0u8; max];
    'pump: loop {
        for outcome in outcomes.drain(..) {
            let is_close = matches!(outcome, Ok(Message::Close { .. }));
            if messages.send(outcome).await.is_err() {
                // Consumer is gone; nothing can be delivered any more.
                scope.cancel();
                break 'pump;
            }
            if is_close {
                debug!(connection_id = %connection.connection_id(), "close received");
                scope.cancel();
                break 'pump;
            }
        }
        // No cancellation arm here: the byte reader observes the scope,
        // exits, and drops its end of the pipe, so EOF lands only after
        // every byte it buffered has been drained and delivered.
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => parser.parse(&chunk[..n], &mut outcomes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{JsonHubProtocol, MessagePackHubProtocol, TransferMode};
    use crate::transport::MemoryTransport;
    use futures_util::StreamExt;
    use std::time::Duration;

    fn arg<T: serde::Serialize>(value: &T) -> RawArgument {
        RawArgument::from_serialize(value).unwrap()
    }

    async fn connected_pair(
        client_config: HubConfig,
        server_config: HubConfig,
    ) -> (HubConnection, HubReceiver, HubConnection, HubReceiver) {
        let (client_transport, server_transport) = MemoryTransport::pair(64 * 1024);
        let server_task =
            tokio::spawn(async move { HubConnection::accept(server_transport, server_config).await });
        let client = HubConnection::connect(
            client_transport,
            Arc::new(JsonHubProtocol),
            client_config,
        )
        .await
        .unwrap();
        let server = server_task.await.unwrap().unwrap();
        let client_rx = client.receive().unwrap();
        let server_rx = server.receive().unwrap();
        (client, client_rx, server, server_rx)
    }

    async fn default_pair() -> (HubConnection, HubReceiver, HubConnection, HubReceiver) {
        connected_pair(HubConfig::default(), HubConfig::default()).await
    }

    #[tokio::test]
    async fn handshake_then_ping() {
        let (client, _client_rx, server, mut server_rx) = default_pair().await;
        assert_eq!(client.state(), ConnectionState::Active);
        assert_eq!(server.state(), ConnectionState::Active);

        let before = client.last_write_stamp().await;
        client.ping().await.unwrap();
        assert_eq!(server_rx.next().await.unwrap().unwrap(), Message::Ping);
        assert!(client.last_write_stamp().await >= before);
    }

    #[tokio::test]
    async fn invocation_round_trip() {
        let (client, mut client_rx, server, mut server_rx) = default_pair().await;
        let registry = client.new_registry();
        let pending = registry.register_awaiting("1").await.unwrap();

        client
            .send_invocation(Some("1"), "Add", vec![arg(&2), arg(&3)])
            .await
            .unwrap();

        // Server side: bind the arguments, run the "hub method", answer.
        match server_rx.next().await.unwrap().unwrap() {
            Message::Invocation {
                invocation_id,
                target,
                arguments,
                ..
            } => {
                assert_eq!(target, "Add");
                let a: i32 = arguments[0].bind(0).unwrap();
                let b: i32 = arguments[1].bind(1).unwrap();
                server
                    .completion(invocation_id.as_deref().unwrap(), Some(arg(&(a + b))), None)
                    .await
                    .unwrap();
            }
            other => panic!("unexpected message {other:?}"),
        }

        // Client side: route the completion into the registry.
        match client_rx.next().await.unwrap().unwrap() {
            Message::Completion {
                invocation_id,
                result,
                error,
                ..
            } => registry
                .deliver_completion(&invocation_id, result, error)
                .await
                .unwrap(),
            other => panic!("unexpected message {other:?}"),
        }
        let result = pending.await.unwrap().unwrap().unwrap();
        assert_eq!(result.bind::<i32>(0).unwrap(), 5);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn server_stream_to_client() {
        let (client, mut client_rx, server, mut server_rx) = default_pair().await;
        let registry = InvocationRegistry::default();
        let mut items = registry.register_streaming("2").await.unwrap();

        client
            .send_stream_invocation("2", "Counter", vec![arg(&3), arg(&1)], Vec::new())
            .await
            .unwrap();
        match server_rx.next().await.unwrap().unwrap() {
            Message::StreamInvocation { invocation_id, .. } => {
                for k in 0..3 {
                    server.stream_item(&invocation_id, arg(&k)).await.unwrap();
                }
                server.completion(&invocation_id, None, None).await.unwrap();
            }
            other => panic!("unexpected message {other:?}"),
        }

        let deliver = async {
            while let Some(received) = client_rx.next().await {
                match received.unwrap() {
                    Message::StreamItem {
                        invocation_id,
                        item,
                        ..
                    } => registry
                        .deliver_stream_item(&invocation_id, item)
                        .await
                        .unwrap(),
                    Message::Completion {
                        invocation_id,
                        result,
                        error,
                        ..
                    } => {
                        registry
                            .deliver_completion(&invocation_id, result, error)
                            .await
                            .unwrap();
                        break;
                    }
                    other => panic!("unexpected message {other:?}"),
                }
            }
        };
        deliver.await;

        let mut seen = Vec::new();
        while let Some(item) = items.next().await {
            seen.push(item.unwrap().bind::<i32>(0).unwrap());
        }
        assert_eq!(seen, vec![0, 1, 2]);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn cancelled_stream_stops_at_the_server() {
        let (client, _client_rx, server, mut server_rx) = default_pair().await;
        let registry = InvocationRegistry::default();
        let _items = registry.register_streaming("2").await.unwrap();

        client
            .send_stream_invocation("2", "Counter", Vec::new(), Vec::new())
            .await
            .unwrap();
        assert!(matches!(
            server_rx.next().await.unwrap().unwrap(),
            Message::StreamInvocation { .. }
        ));

        registry.cancel(&client, "2").await.unwrap();
        match server_rx.next().await.unwrap().unwrap() {
            Message::CancelInvocation { invocation_id, .. } => {
                // The producer stops and finalizes the stream.
                server.completion(&invocation_id, None, None).await.unwrap();
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_frame_is_an_error_in_place() {
        // Drive the server with a raw peer so arbitrary bytes can be sent.
        let (raw, server_transport) = MemoryTransport::pair(4096);
        let server_task = tokio::spawn(async move {
            HubConnection::accept(server_transport, HubConfig::default()).await
        });
        let (mut raw_read, mut raw_write) = raw.into_split();
        raw_write
            .write_all(b"{\"protocol\":\"json\",\"version\":1}\x1e")
            .await
            .unwrap();
        let mut response = [0u8; 3];
        raw_read.read_exact(&mut response).await.unwrap();
        assert_eq!(&response, b"{}\x1e");

        let server = server_task.await.unwrap().unwrap();
        let mut server_rx = server.receive().unwrap();
        raw_write
            .write_all(b"{not json}\x1e{\"type\":6}\x1e")
            .await
            .unwrap();

        assert!(matches!(
            server_rx.next().await.unwrap(),
            Err(SignalRError::Protocol(_))
        ));
        assert_eq!(server_rx.next().await.unwrap().unwrap(), Message::Ping);
        // One bad frame does not terminate the connection.
        assert_eq!(server.state(), ConnectionState::Active);
        server.ping().await.unwrap();
    }

    #[tokio::test]
    async fn peer_close_drains_and_closes() {
        let (client, _client_rx, server, mut server_rx) = default_pair().await;
        client.close(Some("bye"), true).await.unwrap();

        match server_rx.next().await.unwrap().unwrap() {
            Message::Close {
                error,
                allow_reconnect,
            } => {
                assert_eq!(error.as_deref(), Some("bye"));
                assert_eq!(allow_reconnect, Some(true));
            }
            other => panic!("unexpected message {other:?}"),
        }
        // The channel closes once the pumps drain.
        assert!(server_rx.next().await.is_none());
        server.wait_until_closed().await;
        assert_eq!(server.state(), ConnectionState::Closed);
        assert!(matches!(
            server.ping().await,
            Err(SignalRError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn abort_is_idempotent_and_closes_once() {
        let (client, mut client_rx, _server, _server_rx) = default_pair().await;
        client.abort();
        client.abort();
        client.wait_until_closed().await;
        assert_eq!(client.state(), ConnectionState::Closed);

        // Exactly one stream termination: every pending element is
        // drained, then `None`, and it stays `None`.
        while let Some(outcome) = client_rx.next().await {
            drop(outcome);
        }
        assert!(client_rx.next().await.is_none());
        assert!(matches!(
            client.ping().await,
            Err(SignalRError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn writes_from_one_task_stay_ordered() {
        let (client, _client_rx, _server, mut server_rx) = default_pair().await;
        for k in 0..10 {
            client.stream_item("s", arg(&k)).await.unwrap();
        }
        for k in 0..10 {
            match server_rx.next().await.unwrap().unwrap() {
                Message::StreamItem { item, .. } => {
                    assert_eq!(item.bind::<i32>(0).unwrap(), k);
                }
                other => panic!("unexpected message {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn receive_preserves_transmission_order() {
        let (client, _client_rx, _server, mut server_rx) = default_pair().await;
        client.ping().await.unwrap();
        client
            .send_invocation(None, "Notify", vec![arg(&1)])
            .await
            .unwrap();
        client.stream_item("s", arg(&2)).await.unwrap();

        assert!(matches!(
            server_rx.next().await.unwrap().unwrap(),
            Message::Ping
        ));
        assert!(matches!(
            server_rx.next().await.unwrap().unwrap(),
            Message::Invocation { .. }
        ));
        assert!(matches!(
            server_rx.next().await.unwrap().unwrap(),
            Message::StreamItem { .. }
        ));
    }

    #[tokio::test]
    async fn messagepack_pair_and_transfer_mode_sink() {
        let (client_transport, server_transport) = MemoryTransport::pair(64 * 1024);
        let client_mode = client_transport.transfer_mode_handle();
        let server_mode = server_transport.transfer_mode_handle();

        let server_task = tokio::spawn(async move {
            HubConnection::accept(server_transport, HubConfig::default()).await
        });
        let client = HubConnection::connect(
            client_transport,
            Arc::new(MessagePackHubProtocol),
            HubConfig::default(),
        )
        .await
        .unwrap();
        let server = server_task.await.unwrap().unwrap();
        let mut server_rx = server.receive().unwrap();

        assert_eq!(*client_mode.lock().unwrap(), Some(TransferMode::Binary));
        assert_eq!(*server_mode.lock().unwrap(), Some(TransferMode::Binary));

        client
            .send_invocation(Some("1"), "Add", vec![arg(&2), arg(&3)])
            .await
            .unwrap();
        match server_rx.next().await.unwrap().unwrap() {
            Message::Invocation { arguments, .. } => {
                assert_eq!(arguments[0].bind::<i32>(0).unwrap(), 2);
                assert_eq!(arguments[1].bind::<i32>(1).unwrap(), 3);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn transport_eof_is_one_error_then_close() {
        let (raw, server_transport) = MemoryTransport::pair(4096);
        let server_task = tokio::spawn(async move {
            HubConnection::accept(server_transport, HubConfig::default()).await
        });
        let (mut raw_read, mut raw_write) = raw.into_split();
        raw_write
            .write_all(b"{\"protocol\":\"json\",\"version\":1}\x1e")
            .await
            .unwrap();
        let mut response = [0u8; 3];
        raw_read.read_exact(&mut response).await.unwrap();

        let server = server_task.await.unwrap().unwrap();
        let mut server_rx = server.receive().unwrap();
        drop(raw_write);
        drop(raw_read);

        assert!(matches!(
            server_rx.next().await.unwrap(),
            Err(SignalRError::Transport(_))
        ));
        assert!(server_rx.next().await.is_none());
        server.wait_until_closed().await;
    }

    #[tokio::test]
    async fn keep_alive_pings_when_idle() {
        let quick = HubConfig {
            keep_alive_interval: Duration::from_millis(40),
            client_timeout_interval: Duration::from_secs(30),
            ..HubConfig::default()
        };
        let (_client, _client_rx, _server, mut server_rx) =
            connected_pair(quick, HubConfig::default()).await;

        // No application writes: the client's supervisor must ping.
        let ping = tokio::time::timeout(Duration::from_millis(500), server_rx.next())
            .await
            .expect("expected a keep-alive ping")
            .unwrap()
            .unwrap();
        assert_eq!(ping, Message::Ping);
    }

    #[tokio::test]
    async fn receive_silence_times_out_and_aborts() {
        let impatient = HubConfig {
            keep_alive_interval: Duration::from_secs(60),
            client_timeout_interval: Duration::from_millis(60),
            ..HubConfig::default()
        };
        let silent = HubConfig {
            keep_alive_interval: Duration::from_secs(60),
            client_timeout_interval: Duration::from_secs(60),
            ..HubConfig::default()
        };
        let (client, mut client_rx, _server, _server_rx) =
            connected_pair(impatient, silent).await;

        let mut saw_timeout = false;
        while let Some(outcome) = client_rx.next().await {
            if matches!(outcome, Err(SignalRError::TimedOut)) {
                saw_timeout = true;
            }
        }
        assert!(saw_timeout);
        client.wait_until_closed().await;
        assert_eq!(client.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn registry_attached_to_scope_fails_pending_on_abort() {
        let (client, _client_rx, _server, _server_rx) = default_pair().await;
        let registry = InvocationRegistry::default();
        registry.attach(&client);
        let pending = registry.register_awaiting("1").await.unwrap();

        client.abort();
        assert!(matches!(
            pending.await.unwrap(),
            Err(SignalRError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn items_store_is_shared_between_clones() {
        let (client, _client_rx, _server, _server_rx) = default_pair().await;
        let clone = client.clone();
        client
            .items()
            .write()
            .await
            .insert("user".into(), serde_json::json!("alice"));
        assert_eq!(
            clone.items().read().await.get("user"),
            Some(&serde_json::json!("alice"))
        );
    }

    #[tokio::test]
    async fn receive_can_only_be_taken_once() {
        let (client, _client_rx, _server, _server_rx) = default_pair().await;
        assert!(client.receive().is_none());
    }

    #[tokio::test]
    async fn rejected_handshake_never_builds_a_connection() {
        let (raw, server_transport) = MemoryTransport::pair(4096);
        let server_task = tokio::spawn(async move {
            HubConnection::accept(server_transport, HubConfig::default()).await
        });
        let (_raw_read, mut raw_write) = raw.into_split();
        raw_write
            .write_all(b"{\"protocol\":\"cbor\",\"version\":1}\x1e")
            .await
            .unwrap();
        assert!(matches!(
            server_task.await.unwrap(),
            Err(SignalRError::Handshake(_))
        ));
    }
}
