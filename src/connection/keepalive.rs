//! Application-level keep-alive.
//!
//! One supervisor task per connection pings the peer when the write side
//! has been idle and declares the connection dead when nothing has been
//! received for the client timeout interval. Pings travel through the
//! ordinary write path, so a failed ping aborts the connection like any
//! other failed write.

use std::time::Duration;

use futures_channel::mpsc;
use futures_util::SinkExt;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use super::HubConnection;
use crate::error::SignalRError;
use crate::protocol::ParseOutcome;

/// Smallest supervision granularity; keeps short test intervals honest.
const MIN_TICK: Duration = Duration::from_millis(10);

pub(crate) fn spawn(
    connection: HubConnection,
    mut errors: mpsc::Sender<ParseOutcome>,
    keep_alive_interval: Duration,
    client_timeout_interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let tick = (keep_alive_interval.min(client_timeout_interval) / 4).max(MIN_TICK);
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let scope = connection.context();
        loop {
            tokio::select! {
                _ = scope.cancelled() => break,
                _ = interval.tick() => {}
            }
            let now = Instant::now();
            if now.saturating_duration_since(connection.last_receive_stamp())
                >= client_timeout_interval
            {
                warn!(
                    connection_id = %connection.connection_id(),
                    "no bytes received within the client timeout interval, aborting"
                );
                let _ = errors.send(Err(SignalRError::TimedOut)).await;
                connection.abort();
                break;
            }
            if now.saturating_duration_since(connection.last_write_stamp().await)
                >= keep_alive_interval
            {
                // Sending the ping advances the write stamp, so the next
                // one is due a full interval from now.
                if let Err(e) = connection.ping().await {
                    debug!(
                        connection_id = %connection.connection_id(),
                        error = %e,
                        "keep-alive ping failed"
                    );
                    break;
                }
            }
        }
    })
}
