//! The physical channel contract every transport binding satisfies.
//!
//! A [`Channel`] is the write half plus identity; inbound traffic arrives on
//! the paired [`ChannelEvents`] receiver handed out when the channel is
//! created. The Router and the transport plugins depend on nothing else.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use duplex_core::RpcError;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

/// Capacity of the inbound event queue of a channel.
pub const EVENT_BUFFER: usize = 1024;

/// Something that happened on the inbound side of a channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A text frame arrived.
    Message(String),
    /// The channel is closed; no further events follow.
    Closed {
        /// Why the channel closed.
        reason: String,
    },
    /// The channel failed; no further events follow.
    Error(String),
}

/// Inbound event stream of one channel.
pub type ChannelEvents = mpsc::Receiver<ChannelEvent>;

/// One duplex text channel (socket, in-process pipe, IPC link).
#[async_trait]
pub trait Channel: Send + Sync {
    /// Stable identity used in logs.
    fn id(&self) -> &str;

    /// Whether frames can currently be sent.
    fn is_open(&self) -> bool;

    /// Send one text frame. Fails with a network error once closed.
    async fn send(&self, frame: String) -> Result<(), RpcError>;

    /// Close the channel. Idempotent.
    async fn close(&self, reason: &str);
}

/// In-memory channel half returned by [`memory_pair`].
pub struct MemoryChannel {
    id: String,
    open: Arc<AtomicBool>,
    own_events: mpsc::Sender<ChannelEvent>,
    peer_events: mpsc::Sender<ChannelEvent>,
}

/// Create two connected in-memory channels.
///
/// Frames sent on one side arrive on the other side's event stream. Closing
/// either side closes both, and both streams receive [`ChannelEvent::Closed`].
pub fn memory_pair() -> (
    (Arc<MemoryChannel>, ChannelEvents),
    (Arc<MemoryChannel>, ChannelEvents),
) {
    let (a_tx, a_rx) = mpsc::channel(EVENT_BUFFER);
    let (b_tx, b_rx) = mpsc::channel(EVENT_BUFFER);
    let open = Arc::new(AtomicBool::new(true));
    let pair = uuid::Uuid::now_v7();

    let a = Arc::new(MemoryChannel {
        id: format!("mem_{pair}_a"),
        open: open.clone(),
        own_events: a_tx.clone(),
        peer_events: b_tx.clone(),
    });
    let b = Arc::new(MemoryChannel {
        id: format!("mem_{pair}_b"),
        open,
        own_events: b_tx,
        peer_events: a_tx,
    });
    ((a, a_rx), (b, b_rx))
}

#[async_trait]
impl Channel for MemoryChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn send(&self, frame: String) -> Result<(), RpcError> {
        if !self.is_open() {
            return Err(RpcError::network("Channel is closed"));
        }
        self.peer_events
            .send(ChannelEvent::Message(frame))
            .await
            .map_err(|_| RpcError::network("Peer dropped its event stream"))
    }

    async fn close(&self, reason: &str) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }
        debug!(channel = %self.id, reason, "memory channel closed");
        let closed = ChannelEvent::Closed {
            reason: reason.to_owned(),
        };
        deliver_terminal(&self.own_events, closed.clone());
        deliver_terminal(&self.peer_events, closed);
    }
}

/// Queue a terminal event without waiting on the queue's consumer.
///
/// `close` may run on the very task draining that queue, so a full queue
/// hands the event to a separate task.
fn deliver_terminal(events: &mpsc::Sender<ChannelEvent>, event: ChannelEvent) {
    if let Err(TrySendError::Full(event)) = events.try_send(event) {
        let events = events.clone();
        let _ = tokio::spawn(async move {
            let _ = events.send(event).await;
        });
    }
}
