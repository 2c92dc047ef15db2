//! Reconnecting, keep-alive-aware transport plugin.
//!
//! [`ReconnectingTransport`] binds a Call Engine to whatever channel its
//! [`Connector`] opened last. Calls made while no channel is open wait for
//! [`ReconnectingTransport::await_ready`], which dials a fresh channel when
//! auto-reconnect is on. Readiness is bounded by the ready timeout; after a
//! failed attempt the next one waits out the reconnect delay first.
//!
//! When a channel ends, every pending call is rejected with a network
//! error. Attaching a [`Router`] makes each opened channel bidirectional:
//! requests from the peer go to the Router's Dispatch Engine and the peer
//! can call back through the same socket.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use duplex_core::envelope::{self, FrameKind};
use duplex_core::{CallId, RpcError};
use duplex_rpc::channel::EVENT_BUFFER;
use duplex_rpc::transport::{route_response, transmit};
use duplex_rpc::{
    CallEngine, Channel, ChannelEvent, ChannelEvents, ClientPlugin, OutgoingMessage, PendingCalls,
    Router, TransportPlugin, WeakCallEngine,
};
use duplex_settings::ClientSettings;
use metrics::counter;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::connector::{Connector, WsConnector};
use crate::metrics::WS_CONNECT_ATTEMPTS_TOTAL;

/// Readiness of the transport's current channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadyState {
    /// No channel.
    Disconnected,
    /// A channel is being opened.
    Connecting,
    /// Calls go straight out.
    Open,
    /// A local close is in progress.
    Closing,
}

/// Runs on every freshly opened channel before calls may use it.
///
/// Typical use is re-authentication. An error fails readiness and closes
/// the channel.
#[async_trait]
pub trait ReconnectHook: Send + Sync {
    /// Prepare `channel` for use.
    async fn on_reconnect(&self, channel: &Arc<dyn Channel>) -> Result<(), RpcError>;
}

struct RouterAttachment {
    router: Router,
    endpoint_path: String,
    engine: WeakCallEngine,
}

#[derive(Default)]
struct ConnectAttempt {
    last_failure: Option<Instant>,
    opened: u64,
}

/// Transport plugin that (re)opens its channel on demand.
pub struct ReconnectingTransport {
    connector: Arc<dyn Connector>,
    settings: ClientSettings,
    state: RwLock<ReadyState>,
    current: RwLock<Option<Arc<dyn Channel>>>,
    pending: PendingCalls,
    connect_lock: Mutex<ConnectAttempt>,
    hooks: RwLock<Vec<Arc<dyn ReconnectHook>>>,
    attachment: RwLock<Option<RouterAttachment>>,
    me: Weak<Self>,
}

impl ReconnectingTransport {
    /// Create a transport. Nothing is dialed until the first call or
    /// [`connect`](Self::connect).
    pub fn new(connector: Arc<dyn Connector>, settings: ClientSettings) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            connector,
            settings,
            state: RwLock::new(ReadyState::Disconnected),
            current: RwLock::new(None),
            pending: PendingCalls::new(),
            connect_lock: Mutex::new(ConnectAttempt::default()),
            hooks: RwLock::new(Vec::new()),
            attachment: RwLock::new(None),
            me: me.clone(),
        })
    }

    /// Transport dialing a WebSocket URL, keep-alive taken from `settings`.
    pub fn websocket(url: impl Into<String>, settings: ClientSettings) -> Arc<Self> {
        let connector = WsConnector::new(url).with_keep_alive(settings.keep_alive());
        Self::new(Arc::new(connector), settings)
    }

    /// Settings in effect.
    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    /// Current readiness.
    pub fn ready_state(&self) -> ReadyState {
        *self.state.read()
    }

    /// Channels opened so far.
    pub async fn connections_opened(&self) -> u64 {
        self.connect_lock.lock().await.opened
    }

    /// Run `hook` on every new channel before it becomes ready.
    pub fn on_reconnect(&self, hook: Arc<dyn ReconnectHook>) {
        self.hooks.write().push(hook);
    }

    /// Route requests arriving on future channels through `router`.
    ///
    /// `engine` must be the Call Engine this transport is bound to; it
    /// becomes the reverse client of every session the transport opens.
    /// Attach before the first channel is opened.
    pub fn attach_router(
        &self,
        router: Router,
        endpoint_path: &str,
        engine: &CallEngine,
    ) -> Result<(), RpcError> {
        let me = std::ptr::from_ref(self).cast::<()>();
        let bound = engine
            .transport()
            .is_some_and(|t| std::ptr::eq(Arc::as_ptr(&t).cast::<()>(), me));
        if !bound {
            return Err(RpcError::precondition(
                "Call Engine is not bound to this transport",
            ));
        }
        if self.current.read().is_some() {
            return Err(RpcError::precondition(
                "Router must be attached before a channel is opened",
            ));
        }
        *self.attachment.write() = Some(RouterAttachment {
            router,
            endpoint_path: endpoint_path.to_owned(),
            engine: engine.downgrade(),
        });
        Ok(())
    }

    /// Current channel, if it is open and ready.
    pub fn channel(&self) -> Option<Arc<dyn Channel>> {
        if self.ready_state() != ReadyState::Open {
            return None;
        }
        self.current.read().as_ref().filter(|c| c.is_open()).cloned()
    }

    /// Resolve once a channel is open, dialing one if allowed.
    pub async fn await_ready(&self) -> Result<Arc<dyn Channel>, RpcError> {
        if let Some(channel) = self.channel() {
            return Ok(channel);
        }
        let mut attempt = self.connect_lock.lock().await;
        if let Some(channel) = self.channel() {
            return Ok(channel);
        }
        if !self.settings.auto_reconnect {
            return Err(RpcError::network(
                "WebSocket is not open and auto-reconnect is disabled",
            ));
        }
        self.open_locked(&mut attempt).await
    }

    /// Open a channel now unless one is already open.
    pub async fn connect(&self) -> Result<(), RpcError> {
        let mut attempt = self.connect_lock.lock().await;
        if self.channel().is_some() {
            return Ok(());
        }
        self.open_locked(&mut attempt).await.map(|_| ())
    }

    /// Close the current channel and reject every pending call.
    pub async fn close(&self, reason: &str) {
        self.set_state(ReadyState::Closing);
        let channel = self.current.write().take();
        if let Some(channel) = &channel {
            channel.close(reason).await;
        }
        let rejected = self
            .pending
            .reject_all(&RpcError::network(format!("Connection closed: {reason}")));
        self.set_state(ReadyState::Disconnected);
        info!(
            channel = ?channel.as_ref().map(|c| c.id()),
            reason,
            rejected,
            "transport closed"
        );
    }

    fn set_state(&self, state: ReadyState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "transport state changed");
        }
    }

    async fn open_locked(&self, attempt: &mut ConnectAttempt) -> Result<Arc<dyn Channel>, RpcError> {
        self.discard_stale();

        if let Some(failed_at) = attempt.last_failure {
            let delay = self.settings.reconnect_delay().saturating_sub(failed_at.elapsed());
            if !delay.is_zero() {
                debug!(?delay, "waiting before reconnecting");
                time::sleep(delay).await;
            }
        }

        self.set_state(ReadyState::Connecting);
        let ready_timeout = self.settings.ready_timeout();
        let opened = match time::timeout(ready_timeout, self.open_and_prepare()).await {
            Ok(result) => result,
            Err(_) => Err(RpcError::network(format!(
                "WebSocket not ready within {}ms",
                ready_timeout.as_millis()
            ))),
        };

        match opened {
            Ok(channel) => {
                attempt.last_failure = None;
                attempt.opened += 1;
                self.set_state(ReadyState::Open);
                counter!(WS_CONNECT_ATTEMPTS_TOTAL, "outcome" => "ok").increment(1);
                info!(channel = channel.id(), opened = attempt.opened, "transport ready");
                Ok(channel)
            }
            Err(err) => {
                attempt.last_failure = Some(Instant::now());
                let half_open = self.current.write().take();
                if let Some(channel) = half_open {
                    channel.close(&err.message).await;
                }
                self.set_state(ReadyState::Disconnected);
                counter!(WS_CONNECT_ATTEMPTS_TOTAL, "outcome" => "failed").increment(1);
                warn!(error = %err, "transport failed to become ready");
                Err(err)
            }
        }
    }

    async fn open_and_prepare(&self) -> Result<Arc<dyn Channel>, RpcError> {
        let (channel, events) = self.connector.connect().await?;
        *self.current.write() = Some(channel.clone());
        self.watch(channel.clone(), events)?;

        let hooks = self.hooks.read().clone();
        for hook in hooks {
            hook.on_reconnect(&channel).await?;
        }
        Ok(channel)
    }

    /// Drop a dead channel left behind by a close not yet observed.
    ///
    /// Every pending call belongs to it, since no other channel is open.
    fn discard_stale(&self) {
        let stale = {
            let mut current = self.current.write();
            if current.as_ref().is_some_and(|c| !c.is_open()) {
                current.take()
            } else {
                None
            }
        };
        if let Some(channel) = stale {
            let rejected = self.pending.reject_all(&RpcError::network(format!(
                "Connection {} closed",
                channel.id()
            )));
            debug!(channel = channel.id(), rejected, "discarded stale channel");
        }
    }

    /// Start consuming the event stream of a new channel.
    fn watch(&self, channel: Arc<dyn Channel>, mut events: ChannelEvents) -> Result<(), RpcError> {
        let forward = match self.attachment.read().as_ref() {
            Some(attachment) => match attachment.engine.upgrade() {
                Some(engine) => {
                    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
                    let _ = attachment.router.serve_adopted(
                        channel.clone(),
                        rx,
                        &attachment.endpoint_path,
                        engine,
                    )?;
                    Some(tx)
                }
                None => None,
            },
            None => None,
        };

        let me = self.me.clone();
        let _ = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(transport) = me.upgrade() else {
                    break;
                };
                let terminal = match &event {
                    ChannelEvent::Message(_) => None,
                    ChannelEvent::Closed { reason } => Some(reason.clone()),
                    ChannelEvent::Error(message) => Some(message.clone()),
                };
                match &forward {
                    Some(router) => {
                        let _ = router.send(event).await;
                    }
                    None => {
                        if let ChannelEvent::Message(frame) = event {
                            transport.handle_frame(&channel, frame).await;
                        }
                    }
                }
                if let Some(reason) = terminal {
                    transport.channel_ended(&channel, &reason);
                    break;
                }
            }
        });
        Ok(())
    }

    /// Frames on a channel with no Router: replies only.
    async fn handle_frame(&self, channel: &Arc<dyn Channel>, frame: String) {
        let decoded: Value = match serde_json::from_str(&frame) {
            Ok(value) => value,
            Err(e) => {
                warn!(channel = channel.id(), error = %e, "undecodable frame dropped");
                return;
            }
        };
        match envelope::classify(&decoded) {
            FrameKind::Response => {
                let _ = self.deliver_response(frame, &decoded).await;
            }
            FrameKind::Request => {
                let Some(id) = decoded.get("id").and_then(CallId::from_value) else {
                    debug!(channel = channel.id(), "notification dropped, no router attached");
                    return;
                };
                let method = decoded.get("method").and_then(Value::as_str).unwrap_or_default();
                let reply = envelope::error_response(Some(&id), &RpcError::method_not_found(method));
                if let Err(e) = channel.send(reply.to_string()).await {
                    debug!(channel = channel.id(), error = %e, "could not refuse request");
                }
            }
            FrameKind::Malformed => {
                warn!(channel = channel.id(), "malformed frame dropped");
            }
        }
    }

    fn channel_ended(&self, channel: &Arc<dyn Channel>, reason: &str) {
        let was_current = {
            let mut current = self.current.write();
            if current.as_ref().is_some_and(|c| c.id() == channel.id()) {
                *current = None;
                true
            } else {
                false
            }
        };
        if !was_current {
            return;
        }
        if self.ready_state() == ReadyState::Open {
            self.set_state(ReadyState::Disconnected);
        }
        let rejected = self
            .pending
            .reject_all(&RpcError::network(format!("Connection closed: {reason}")));
        info!(channel = channel.id(), reason, rejected, "channel ended");
    }
}

#[async_trait]
impl ClientPlugin for ReconnectingTransport {
    async fn claim_transmission(&self, msg: &mut OutgoingMessage) -> Result<(), RpcError> {
        msg.claim()?;
        let channel = self.await_ready().await?;
        transmit(msg, &self.pending, channel.as_ref()).await
    }
}

#[async_trait]
impl TransportPlugin for ReconnectingTransport {
    async fn deliver_response(&self, body: String, envelope: &Value) -> Result<(), RpcError> {
        if let Err(err) = route_response(&self.pending, body, envelope) {
            warn!(error = %err, "protocol violation, closing transport");
            self.close(&err.message).await;
            return Err(err);
        }
        Ok(())
    }

    fn reject_all(&self, reason: &RpcError) -> usize {
        self.pending.reject_all(reason)
    }

    fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
