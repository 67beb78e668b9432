//! Bookkeeping for in-flight invocations.
//!
//! Whichever side initiates invocations keeps a registry mapping
//! invocation ids to the sinks their answers flow into: a single-shot
//! slot for plain calls, a bounded queue for streams. Completions are
//! delivered at most once; anything addressed to an id the registry does
//! not know is a protocol error the caller surfaces on the receive
//! channel.

use std::collections::HashMap;
use std::sync::Arc;

use futures_channel::{mpsc, oneshot};
use futures_util::SinkExt;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::config::DEFAULT_STREAM_BUFFER_CAPACITY;
use crate::connection::HubConnection;
use crate::error::SignalRError;
use crate::protocol::RawArgument;

/// Allocates an invocation id: unique for the connection's lifetime,
/// never reused.
pub fn next_invocation_id() -> String {
    Uuid::new_v4().to_string()
}

/// The answer to a plain invocation: a result payload, void, or an error.
pub type CompletionResult = Result<Option<RawArgument>, SignalRError>;

/// One element of a streaming invocation's answer.
pub type StreamItemResult = Result<RawArgument, SignalRError>;

enum Sink {
    Single(oneshot::Sender<CompletionResult>),
    Stream(mpsc::Sender<StreamItemResult>),
}

struct PendingInvocation {
    sink: Sink,
    /// Local cancellation was requested; late items are dropped and the
    /// peer's terminal Completion removes the entry.
    cancelled: bool,
}

/// Pending-invocation table, shared by the dispatcher and the callers.
#[derive(Clone)]
pub struct InvocationRegistry {
    pending: Arc<RwLock<HashMap<String, PendingInvocation>>>,
    stream_buffer_capacity: usize,
}

impl Default for InvocationRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_STREAM_BUFFER_CAPACITY)
    }
}

impl InvocationRegistry {
    /// `stream_buffer_capacity` bounds each stream sink; a full sink
    /// blocks delivery, which is the backpressure signal.
    pub fn new(stream_buffer_capacity: usize) -> Self {
        Self {
            pending: Arc::new(RwLock::new(HashMap::new())),
            stream_buffer_capacity,
        }
    }

    /// Registers a plain invocation and returns the slot its Completion
    /// resolves. Fails if `id` is already live.
    pub async fn register_awaiting(
        &self,
        id: &str,
    ) -> Result<oneshot::Receiver<CompletionResult>, SignalRError> {
        let (tx, rx) = oneshot::channel();
        self.insert(id, Sink::Single(tx)).await?;
        Ok(rx)
    }

    /// Registers a streaming invocation and returns the bounded item
    /// queue. The queue closes on terminal Completion; a terminal error
    /// arrives as its last element.
    pub async fn register_streaming(
        &self,
        id: &str,
    ) -> Result<mpsc::Receiver<StreamItemResult>, SignalRError> {
        let (tx, rx) = mpsc::channel(self.stream_buffer_capacity);
        self.insert(id, Sink::Stream(tx)).await?;
        Ok(rx)
    }

    async fn insert(&self, id: &str, sink: Sink) -> Result<(), SignalRError> {
        if id.is_empty() {
            return Err(SignalRError::Protocol(
                "empty invocation id is reserved for fire-and-forget".into(),
            ));
        }
        let mut pending = self.pending.write().await;
        if pending.contains_key(id) {
            return Err(SignalRError::Protocol(format!(
                "invocation id '{id}' is already live"
            )));
        }
        pending.insert(
            id.to_owned(),
            PendingInvocation {
                sink,
                cancelled: false,
            },
        );
        Ok(())
    }

    /// Routes a StreamItem into its stream sink, in transport order.
    ///
    /// Blocks when the sink is full; that is the per-stream backpressure.
    pub async fn deliver_stream_item(
        &self,
        id: &str,
        item: RawArgument,
    ) -> Result<(), SignalRError> {
        // Clone the sender out so delivery does not hold the table lock.
        let mut sender = {
            let pending = self.pending.read().await;
            match pending.get(id) {
                None => {
                    return Err(SignalRError::Protocol(format!(
                        "stream item for unknown invocation '{id}'"
                    )))
                }
                Some(entry) if entry.cancelled => return Ok(()),
                Some(entry) => match &entry.sink {
                    Sink::Stream(tx) => tx.clone(),
                    Sink::Single(_) => {
                        return Err(SignalRError::Protocol(format!(
                            "stream item for non-streaming invocation '{id}'"
                        )))
                    }
                },
            }
        };
        // A dropped receiver means the caller lost interest; not an error.
        let _ = sender.send(Ok(item)).await;
        Ok(())
    }

    /// Resolves an invocation with its terminal Completion and removes it.
    ///
    /// At most one Completion reaches any sink: a second one no longer
    /// finds the entry and is reported as a protocol error.
    pub async fn deliver_completion(
        &self,
        id: &str,
        result: Option<RawArgument>,
        error: Option<String>,
    ) -> Result<(), SignalRError> {
        if result.is_some() && error.is_some() {
            return Err(SignalRError::Protocol(
                "completion carries both result and error".into(),
            ));
        }
        let entry = {
            let mut pending = self.pending.write().await;
            pending.remove(id).ok_or_else(|| {
                SignalRError::Protocol(format!("completion for unknown invocation '{id}'"))
            })?
        };
        if entry.cancelled {
            // The caller asked for the cancellation; resolve its sink with
            // a typed error rather than a bare channel close.
            debug!(id, "completion for cancelled invocation");
            match entry.sink {
                Sink::Single(tx) => {
                    let _ = tx.send(Err(SignalRError::Cancelled));
                }
                Sink::Stream(mut tx) => {
                    let _ = tx.send(Err(SignalRError::Cancelled)).await;
                }
            }
            return Ok(());
        }
        match entry.sink {
            Sink::Single(tx) => {
                let outcome = match error {
                    Some(text) => Err(SignalRError::Invocation(text)),
                    None => Ok(result),
                };
                let _ = tx.send(outcome);
            }
            Sink::Stream(mut tx) => {
                if let Some(text) = error {
                    let _ = tx.send(Err(SignalRError::Invocation(text))).await;
                }
                // Dropping the sender ends the stream.
            }
        }
        Ok(())
    }

    /// Requests cancellation of a live invocation: marks it Cancelled and
    /// sends CancelInvocation to the peer. The entry stays until the
    /// peer's terminal Completion removes it, at which point the sink
    /// resolves with [`SignalRError::Cancelled`].
    pub async fn cancel(
        &self,
        connection: &HubConnection,
        id: &str,
    ) -> Result<(), SignalRError> {
        if !self.mark_cancelled(id).await {
            return Ok(());
        }
        connection.cancel_invocation(id).await
    }

    async fn mark_cancelled(&self, id: &str) -> bool {
        let mut pending = self.pending.write().await;
        match pending.get_mut(id) {
            Some(entry) if !entry.cancelled => {
                entry.cancelled = true;
                true
            }
            _ => false,
        }
    }

    /// Resolves every pending sink with `err` and clears the table.
    /// Called when the connection dies.
    pub async fn fail_all<F>(&self, err: F)
    where
        F: Fn() -> SignalRError,
    {
        let entries: Vec<PendingInvocation> = {
            let mut pending = self.pending.write().await;
            pending.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            match entry.sink {
                Sink::Single(tx) => {
                    let _ = tx.send(Err(err()));
                }
                Sink::Stream(mut tx) => {
                    let _ = tx.send(Err(err())).await;
                }
            }
        }
    }

    /// Ties this registry to a connection's lifetime: when the scope
    /// fires, every pending sink resolves with `ConnectionClosed`.
    pub fn attach(&self, connection: &HubConnection) {
        let registry = self.clone();
        let scope = connection.context();
        tokio::spawn(async move {
            scope.cancelled().await;
            registry.fail_all(|| SignalRError::ConnectionClosed).await;
        });
    }

    /// Number of live entries, for diagnostics and tests.
    pub async fn len(&self) -> usize {
        self.pending.read().await.len()
    }

    /// True when nothing is in flight.
    pub async fn is_empty(&self) -> bool {
        self.pending.read().await.is_empty()
    }
}
