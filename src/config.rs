//! Configuration surface of the hub-connection core.

use std::time::Duration;

/// Default minimum write idleness before an outbound Ping.
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Default maximum receive idleness before the connection is aborted.
pub const DEFAULT_CLIENT_TIMEOUT_INTERVAL: Duration = Duration::from_secs(30);

/// Default maximum time between connect and handshake completion.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Default per-read byte cap; frames declared larger are rejected.
pub const DEFAULT_MAXIMUM_RECEIVE_MESSAGE_SIZE: usize = 32 * 1024;

/// Default per-stream buffered items before backpressure.
pub const DEFAULT_STREAM_BUFFER_CAPACITY: usize = 10;

/// Tunables for a single hub connection.
///
/// `client_timeout_interval` is conventionally about twice
/// `keep_alive_interval`, so a peer that misses two pings is declared dead.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Minimum idle time before an outbound Ping is emitted.
    pub keep_alive_interval: Duration,
    /// Maximum inbound idle time before the connection is aborted.
    pub client_timeout_interval: Duration,
    /// Maximum time the handshake exchange may take.
    pub handshake_timeout: Duration,
    /// Per-read byte cap; the parsers reject frames declared larger.
    pub maximum_receive_message_size: usize,
    /// Buffered items per invocation stream before the sender blocks.
    pub stream_buffer_capacity: usize,
    /// Include server-side error detail in Completion error text.
    pub enable_detailed_errors: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            client_timeout_interval: DEFAULT_CLIENT_TIMEOUT_INTERVAL,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            maximum_receive_message_size: DEFAULT_MAXIMUM_RECEIVE_MESSAGE_SIZE,
            stream_buffer_capacity: DEFAULT_STREAM_BUFFER_CAPACITY,
            enable_detailed_errors: false,
        }
    }
}
