//! Keep-alive probing and the receive-side watchdog.
//!
//! With a period `P`, a ping goes out every `P / 2`. If nothing at all
//! (frame, ping, pong) has arrived for `P`, the channel is closed with
//! [`KEEP_ALIVE_TIMEOUT`] as its reason. The close surfaces on the event
//! stream like any close from the peer, so pending calls are rejected the
//! same way.

use std::sync::Arc;
use std::time::Duration;

use duplex_rpc::Channel;
use metrics::counter;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::channel::WsChannel;
use crate::metrics::WS_KEEPALIVE_TIMEOUTS_TOTAL;

/// Close reason used by the watchdog.
pub const KEEP_ALIVE_TIMEOUT: &str = "keep-alive timeout";

/// Shortest probe interval, so tiny periods still tick.
const MIN_PROBE_INTERVAL: Duration = Duration::from_millis(1);

/// Outcome of the keep-alive loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeepAliveResult {
    /// No liveness signal within the period.
    TimedOut,
    /// The channel ended or the loop was cancelled externally.
    Cancelled,
}

/// Probe `channel` until it goes quiet for `period` or `cancel` fires.
pub async fn run_keep_alive(
    channel: Arc<WsChannel>,
    period: Duration,
    cancel: CancellationToken,
) -> KeepAliveResult {
    let mut probe = time::interval((period / 2).max(MIN_PROBE_INTERVAL));
    probe.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Skip the immediate first tick
    let _ = probe.tick().await;

    loop {
        tokio::select! {
            _ = probe.tick() => {
                if channel.last_seen_elapsed() >= period {
                    return KeepAliveResult::TimedOut;
                }
                if !channel.probe() {
                    return KeepAliveResult::Cancelled;
                }
            }
            () = cancel.cancelled() => {
                return KeepAliveResult::Cancelled;
            }
        }
    }
}

/// Run the keep-alive loop for `channel` and close it on timeout.
///
/// Stops by itself once the channel terminates.
pub fn spawn_keep_alive(channel: Arc<WsChannel>, period: Duration) -> JoinHandle<KeepAliveResult> {
    let cancel = channel.closed_token();
    tokio::spawn(async move {
        let result = run_keep_alive(channel.clone(), period, cancel).await;
        if result == KeepAliveResult::TimedOut {
            warn!(channel = %channel.id(), ?period, "no liveness signal, closing channel");
            counter!(WS_KEEPALIVE_TIMEOUTS_TOTAL).increment(1);
            channel.close(KEEP_ALIVE_TIMEOUT).await;
        } else {
            debug!(channel = %channel.id(), "keep-alive stopped");
        }
        result
    })
}
