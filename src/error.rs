use thiserror::Error;

/// Errors produced by the hub-connection core.
///
/// The variants mirror the places a hub connection can fail: the byte
/// transport underneath, the wire protocol, the handshake, the remote hub
/// method, argument binding, and the local lifecycle (cancellation,
/// keep-alive timeout, terminal close).
#[derive(Error, Debug)]
pub enum SignalRError {
    /// The underlying byte channel failed.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// A malformed frame, an unknown required field, a size-cap violation,
    /// or a Completion for an unknown invocation.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peer rejected the handshake, or it did not complete in time.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The peer reported an application-level error in a Completion.
    #[error("invocation error: {0}")]
    Invocation(String),

    /// An argument could not be coerced to the declared parameter type.
    #[error("cannot bind argument {index}: {message}")]
    Bind { index: usize, message: String },

    /// The connection scope was cancelled locally.
    #[error("operation cancelled")]
    Cancelled,

    /// No inbound bytes within the client timeout interval.
    #[error("connection timed out")]
    TimedOut,

    /// The connection is terminal; further operations reject without I/O.
    #[error("connection closed")]
    ConnectionClosed,
}

impl SignalRError {
    /// The error text a server embeds in a Completion frame.
    ///
    /// With detailed errors disabled the real cause is redacted, matching
    /// the wire behavior hub servers default to. Invocation errors are
    /// application-authored and pass through either way.
    pub fn completion_text(&self, detailed: bool) -> String {
        match self {
            SignalRError::Invocation(text) => text.clone(),
            _ if detailed => self.to_string(),
            _ => "An unexpected error occurred invoking the hub method on the server.".to_owned(),
        }
    }
}
