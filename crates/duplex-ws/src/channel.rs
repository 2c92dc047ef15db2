//! WebSocket [`Channel`] over either end of a connection.
//!
//! A [`WsChannel`] owns two tasks: a writer draining an outbound queue into
//! the socket sink, and a reader turning socket frames into
//! [`ChannelEvent`]s. Every inbound frame counts as liveness for the
//! keep-alive watchdog, pings and pongs included.
//!
//! The same code drives client sockets (`tokio-tungstenite`) and upgraded
//! server sockets (`axum`); [`WsMessage`] adapts the two message types.

use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{self as axum_ws, close_code};
use duplex_core::RpcError;
use duplex_rpc::channel::EVENT_BUFFER;
use duplex_rpc::{Channel, ChannelEvent, ChannelEvents};
use futures::{Sink, SinkExt, Stream, StreamExt};
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::metrics::{WS_FRAMES_RECEIVED_TOTAL, WS_FRAMES_SENT_TOTAL};

/// Capacity of the outbound frame queue.
const OUTBOUND_BUFFER: usize = 1024;

/// How long a queued close may take to flush before the writer is dropped.
const WRITER_CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Longest close reason a close frame can carry.
const MAX_CLOSE_REASON: usize = 123;

/// One socket frame, reduced to what the channel cares about.
#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    /// Text payload (binary frames holding UTF-8 are folded in here).
    Text(String),
    /// Binary frame that is not UTF-8; only its length is kept.
    Binary(usize),
    /// Ping.
    Ping,
    /// Pong.
    Pong,
    /// Close, with the peer's reason if it sent one.
    Close(Option<String>),
    /// Raw frames the channel never produces itself.
    Other,
}

/// Socket message type a [`WsChannel`] can drive.
pub trait WsMessage: Send + Sized + Unpin + 'static {
    /// Text frame.
    fn text(frame: String) -> Self;
    /// Empty ping.
    fn ping() -> Self;
    /// Normal close with a reason.
    fn close(reason: &str) -> Self;
    /// Reduce to a [`Frame`].
    fn into_frame(self) -> Frame;
}

fn binary_frame(data: &[u8]) -> Frame {
    match std::str::from_utf8(data) {
        Ok(text) => Frame::Text(text.to_owned()),
        Err(_) => Frame::Binary(data.len()),
    }
}

fn close_reason(reason: &str) -> String {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason.to_owned();
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_owned()
}

impl WsMessage for Message {
    fn text(frame: String) -> Self {
        Self::Text(frame.into())
    }

    fn ping() -> Self {
        Self::Ping(Vec::new().into())
    }

    fn close(reason: &str) -> Self {
        Self::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: close_reason(reason).into(),
        }))
    }

    fn into_frame(self) -> Frame {
        match self {
            Self::Text(text) => Frame::Text(text.as_str().to_owned()),
            Self::Binary(data) => binary_frame(&data),
            Self::Ping(_) => Frame::Ping,
            Self::Pong(_) => Frame::Pong,
            Self::Close(frame) => Frame::Close(frame.map(|f| f.reason.as_str().to_owned())),
            Self::Frame(_) => Frame::Other,
        }
    }
}

impl WsMessage for axum_ws::Message {
    fn text(frame: String) -> Self {
        Self::Text(frame.into())
    }

    fn ping() -> Self {
        Self::Ping(Vec::new().into())
    }

    fn close(reason: &str) -> Self {
        Self::Close(Some(axum_ws::CloseFrame {
            code: close_code::NORMAL,
            reason: close_reason(reason).into(),
        }))
    }

    fn into_frame(self) -> Frame {
        match self {
            Self::Text(text) => Frame::Text(text.as_str().to_owned()),
            Self::Binary(data) => binary_frame(&data),
            Self::Ping(_) => Frame::Ping,
            Self::Pong(_) => Frame::Pong,
            Self::Close(frame) => Frame::Close(frame.map(|f| f.reason.as_str().to_owned())),
        }
    }
}

enum Outbound {
    Text(String),
    Ping,
    Close(String),
    Stop,
}

/// Duplex text channel over one WebSocket.
pub struct WsChannel {
    id: String,
    open: AtomicBool,
    terminated: AtomicBool,
    outbound: mpsc::Sender<Outbound>,
    events: mpsc::Sender<ChannelEvent>,
    last_seen: Mutex<Instant>,
    cancel: CancellationToken,
    abort_writer: CancellationToken,
}

impl WsChannel {
    /// Take over an open socket and start its reader and writer tasks.
    pub fn spawn<S, M, E>(socket: S, id: impl Into<String>) -> (Arc<Self>, ChannelEvents)
    where
        S: Stream<Item = Result<M, E>> + Sink<M> + Send + 'static,
        <S as Sink<M>>::Error: Display + Send,
        M: WsMessage,
        E: Display + Send + 'static,
    {
        let (sink, stream) = socket.split();
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let (events, events_rx) = mpsc::channel(EVENT_BUFFER);

        let channel = Arc::new(Self {
            id: id.into(),
            open: AtomicBool::new(true),
            terminated: AtomicBool::new(false),
            outbound,
            events,
            last_seen: Mutex::new(Instant::now()),
            cancel: CancellationToken::new(),
            abort_writer: CancellationToken::new(),
        });
        debug!(channel = %channel.id, "websocket channel started");

        let _ = tokio::spawn(write_loop(
            sink,
            outbound_rx,
            channel.abort_writer.clone(),
            channel.id.clone(),
        ));
        let _ = tokio::spawn(read_loop(stream, channel.clone()));
        (channel, events_rx)
    }

    /// Record a liveness signal.
    pub fn mark_alive(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    /// Time since the last inbound frame.
    pub fn last_seen_elapsed(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    /// Queue a ping without waiting. Returns `false` once the writer is gone.
    ///
    /// A full outbound queue means the peer is not draining the socket; the
    /// ping is skipped and only the watchdog decides the channel's fate.
    pub fn probe(&self) -> bool {
        if !self.is_open() {
            return false;
        }
        match self.outbound.try_send(Outbound::Ping) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!(channel = %self.id, "outbound queue full, ping skipped");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Token cancelled when the channel terminates.
    pub fn closed_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Hand `item` to the writer, or stop it outright if it is backed up.
    ///
    /// A writer that is still stuck after [`WRITER_CLOSE_GRACE`] is aborted.
    fn stop_writer(&self, item: Outbound) {
        if self.outbound.try_send(item).is_err() {
            debug!(channel = %self.id, "writer backed up, aborting it");
            self.abort_writer.cancel();
            return;
        }
        let abort = self.abort_writer.clone();
        let _ = tokio::spawn(async move {
            tokio::time::sleep(WRITER_CLOSE_GRACE).await;
            abort.cancel();
        });
    }

    /// Queue the terminal event without waiting on the consumer.
    ///
    /// The consumer may be the caller of `close`, so a full queue hands the
    /// event to a task instead of blocking.
    fn emit_terminal(&self, event: ChannelEvent) {
        if let Err(TrySendError::Full(event)) = self.events.try_send(event) {
            let events = self.events.clone();
            let _ = tokio::spawn(async move {
                let _ = events.send(event).await;
            });
        }
    }

    /// Emit the terminal event for a peer-side end, once.
    fn finish(&self, event: ChannelEvent) {
        self.open.store(false, Ordering::Release);
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        info!(channel = %self.id, event = ?event, "websocket channel ended by peer");
        self.emit_terminal(event);
        self.stop_writer(Outbound::Stop);
    }
}

#[async_trait]
impl Channel for WsChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn send(&self, frame: String) -> Result<(), RpcError> {
        if !self.is_open() {
            return Err(RpcError::network(format!("WebSocket {} is closed", self.id)));
        }
        self.outbound
            .send(Outbound::Text(frame))
            .await
            .map_err(|_| RpcError::network(format!("WebSocket {} writer stopped", self.id)))
    }

    async fn close(&self, reason: &str) {
        self.open.store(false, Ordering::Release);
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(channel = %self.id, reason, "closing websocket channel");
        self.cancel.cancel();
        self.emit_terminal(ChannelEvent::Closed {
            reason: reason.to_owned(),
        });
        self.stop_writer(Outbound::Close(reason.to_owned()));
    }
}

async fn write_loop<K, M>(
    mut sink: K,
    mut outbound: mpsc::Receiver<Outbound>,
    abort: CancellationToken,
    id: String,
) where
    K: Sink<M> + Unpin,
    K::Error: Display,
    M: WsMessage,
{
    loop {
        let item = tokio::select! {
            item = outbound.recv() => item,
            () = abort.cancelled() => None,
        };
        let Some(item) = item else {
            break;
        };
        let (msg, last) = match item {
            Outbound::Text(text) => (M::text(text), false),
            Outbound::Ping => (M::ping(), false),
            Outbound::Close(reason) => (M::close(&reason), true),
            Outbound::Stop => break,
        };
        let sent = tokio::select! {
            sent = sink.send(msg) => sent,
            () = abort.cancelled() => {
                // The peer stopped reading; flushing a close would block too.
                debug!(channel = %id, "websocket writer aborted");
                return;
            }
        };
        if let Err(e) = sent {
            debug!(channel = %id, error = %e, "websocket write failed");
            break;
        }
        counter!(WS_FRAMES_SENT_TOTAL).increment(1);
        if last {
            break;
        }
    }
    let _ = sink.close().await;
    debug!(channel = %id, "websocket writer stopped");
}

async fn read_loop<R, M, E>(mut stream: R, channel: Arc<WsChannel>)
where
    R: Stream<Item = Result<M, E>> + Unpin,
    M: WsMessage,
    E: Display,
{
    let terminal = loop {
        let next = tokio::select! {
            next = stream.next() => next,
            () = channel.cancel.cancelled() => return,
        };
        let msg = match next {
            None => {
                break ChannelEvent::Closed {
                    reason: "Connection reset".into(),
                };
            }
            Some(Err(e)) => break ChannelEvent::Error(e.to_string()),
            Some(Ok(msg)) => msg,
        };

        channel.mark_alive();
        counter!(WS_FRAMES_RECEIVED_TOTAL).increment(1);
        match msg.into_frame() {
            Frame::Text(text) => {
                let delivered = tokio::select! {
                    sent = channel.events.send(ChannelEvent::Message(text)) => sent.is_ok(),
                    () = channel.cancel.cancelled() => return,
                };
                if !delivered {
                    break ChannelEvent::Closed {
                        reason: "Event stream dropped".into(),
                    };
                }
            }
            Frame::Close(reason) => {
                break ChannelEvent::Closed {
                    reason: reason
                        .filter(|r| !r.is_empty())
                        .unwrap_or_else(|| "Closed by peer".into()),
                };
            }
            Frame::Binary(len) => {
                debug!(channel = %channel.id, len, "ignoring non-UTF-8 binary frame");
            }
            Frame::Ping | Frame::Pong | Frame::Other => {}
        }
    };
    channel.finish(terminal);
}
