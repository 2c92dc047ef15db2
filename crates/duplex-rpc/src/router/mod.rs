//! Router & session registry.
//!
//! One Router serves many channels. For every inbound frame it decides
//! whether the frame is a call for the endpoint bound to that connection
//! (handed to the shared [`DispatchEngine`]) or a reply to a call this side
//! issued over the same channel (handed to the session's reverse Call
//! Engine transport).
//!
//! Requests are dispatched on their own tasks, so a method may await a
//! reverse call on the same channel while further frames keep flowing.
//! Replies are delivered inline, before any later close event is seen.

pub mod session;

use std::collections::HashMap;
use std::sync::Arc;

use duplex_core::envelope::{self, FrameKind};
use duplex_core::{ConnectionId, ConnectionIdAllocator, RpcError, normalize_endpoint_path};
use metrics::{counter, gauge};
use parking_lot::RwLock;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::channel::{Channel, ChannelEvent, ChannelEvents};
use crate::client::CallEngine;
use crate::message::{IncomingMessage, ReverseClientSource};
use crate::metrics::{
    PROTOCOL_VIOLATIONS_TOTAL, SESSIONS_ACTIVE, SESSIONS_CLOSED_TOTAL, SESSIONS_OPENED_TOTAL,
};
use crate::server::DispatchEngine;
use crate::transport::ChannelTransport;

pub use session::{ReverseClient, Session};

/// Reserved bootstrap method rebinding a connection to another endpoint.
///
/// `params: [path]`. Meant for channels that carry no URL of their own.
pub const CONNECT_TO_ENDPOINT: &str = "rpc.connectToEndpoint";

/// Callback fired once per session when its reverse Call Engine is created.
pub type ReverseClientHook = Arc<dyn Fn(ConnectionId, &CallEngine) + Send + Sync>;

struct RouterInner {
    dispatcher: Arc<DispatchEngine>,
    sessions: RwLock<HashMap<ConnectionId, Arc<Session>>>,
    ids: ConnectionIdAllocator,
    reverse_hooks: RwLock<Vec<ReverseClientHook>>,
}

/// Connection router. Cheap to clone; clones share the registry.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Router {
    /// Create a router feeding the given Dispatch Engine.
    pub fn new(dispatcher: Arc<DispatchEngine>) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                dispatcher,
                sessions: RwLock::new(HashMap::new()),
                ids: ConnectionIdAllocator::new(),
                reverse_hooks: RwLock::new(Vec::new()),
            }),
        }
    }

    /// The shared Dispatch Engine.
    pub fn dispatcher(&self) -> &Arc<DispatchEngine> {
        &self.inner.dispatcher
    }

    /// Run `hook` whenever a session's reverse Call Engine is created.
    ///
    /// The hook runs synchronously before the engine is handed to anyone,
    /// so plugins it adds apply to the very first reverse call. It must not
    /// call [`Router::reverse_client`] for the same connection.
    pub fn on_reverse_client<F>(&self, hook: F)
    where
        F: Fn(ConnectionId, &CallEngine) + Send + Sync + 'static,
    {
        self.inner.reverse_hooks.write().push(Arc::new(hook));
    }

    /// Register a channel. The reverse Call Engine is not created yet.
    pub fn open(&self, channel: Arc<dyn Channel>, endpoint_path: &str) -> ConnectionId {
        let id = self.inner.ids.next_id();
        let path = normalize_endpoint_path(endpoint_path);
        info!(conn = %id, channel = channel.id(), path, "session opened");
        let session = Arc::new(Session::new(id, channel, path));
        let _ = self.inner.sessions.write().insert(id, session);
        counter!(SESSIONS_OPENED_TOTAL).increment(1);
        gauge!(SESSIONS_ACTIVE).increment(1.0);
        id
    }

    /// Register a channel whose reverse client is an existing Call Engine.
    ///
    /// Used when this side opened the channel itself: replies arriving on it
    /// go to `engine`'s transport. Reverse-client hooks do not fire.
    pub fn adopt(
        &self,
        channel: Arc<dyn Channel>,
        endpoint_path: &str,
        engine: CallEngine,
    ) -> Result<ConnectionId, RpcError> {
        let transport = engine
            .transport()
            .ok_or_else(|| RpcError::precondition("Adopted Call Engine has no transport"))?;
        let id = self.open(channel, endpoint_path);
        if let Some(session) = self.session(id) {
            let _ = session.reverse_or_init(|| ReverseClient { engine, transport });
        }
        Ok(id)
    }

    /// Reverse Call Engine of a connection, created on first access.
    pub fn reverse_client(&self, id: ConnectionId) -> Result<CallEngine, RpcError> {
        let session = self
            .session(id)
            .ok_or_else(|| RpcError::network(format!("Connection {id} is closed")))?;
        let hooks = self.inner.reverse_hooks.read().clone();
        let client = session.reverse_or_init(|| {
            let transport = Arc::new(ChannelTransport::new(session.channel().clone()));
            let engine = CallEngine::with_transport(transport.clone());
            for hook in &hooks {
                hook(id, &engine);
            }
            debug!(conn = %id, "reverse client created");
            ReverseClient { engine, transport }
        });
        Ok(client.engine.clone())
    }

    /// Remove a session, close its channel, and reject its pending reverse calls.
    ///
    /// Returns `false` if the session was already gone.
    pub async fn close(&self, id: ConnectionId, reason: &str) -> bool {
        let Some(session) = self.inner.sessions.write().remove(&id) else {
            return false;
        };
        session.channel().close(reason).await;
        let rejected = session.reverse().map_or(0, |reverse| {
            reverse
                .transport
                .reject_all(&RpcError::network(format!("Connection closed: {reason}")))
        });
        counter!(SESSIONS_CLOSED_TOTAL).increment(1);
        gauge!(SESSIONS_ACTIVE).decrement(1.0);
        info!(
            conn = %id,
            reason,
            rejected,
            age_secs = session.age().as_secs_f64(),
            "session closed"
        );
        true
    }

    /// Close every session. Returns how many were closed.
    pub async fn close_all(&self, reason: &str) -> usize {
        let mut closed = 0;
        for id in self.connection_ids() {
            if self.close(id, reason).await {
                closed += 1;
            }
        }
        closed
    }

    /// Route one inbound frame. Returns its classification, or `None` when
    /// the connection is unknown.
    pub async fn handle_frame(&self, id: ConnectionId, frame: String) -> Option<FrameKind> {
        let Some(session) = self.session(id) else {
            debug!(conn = %id, "frame for unknown connection dropped");
            return None;
        };

        let decoded: Value = match serde_json::from_str(&frame) {
            Ok(value) => value,
            Err(e) => {
                self.reject_malformed(&session, RpcError::parse_error(e)).await;
                return Some(FrameKind::Malformed);
            }
        };

        let kind = envelope::classify(&decoded);
        match kind {
            FrameKind::Request => {
                let router = self.clone();
                let _ = tokio::spawn(async move {
                    router.dispatch_request(session, frame, decoded).await;
                });
            }
            FrameKind::Response => self.deliver_response(&session, frame, &decoded).await,
            FrameKind::Malformed => {
                let err = RpcError::invalid_request("Frame is neither a request nor a response");
                self.reject_malformed(&session, err).await;
            }
        }
        Some(kind)
    }

    /// Register a channel and drive its event stream on a new task.
    pub fn serve(
        &self,
        channel: Arc<dyn Channel>,
        events: ChannelEvents,
        endpoint_path: &str,
    ) -> (ConnectionId, JoinHandle<()>) {
        let id = self.open(channel, endpoint_path);
        (id, tokio::spawn(self.clone().run_session(id, events)))
    }

    /// [`Router::serve`] for a channel adopted by an existing Call Engine.
    pub fn serve_adopted(
        &self,
        channel: Arc<dyn Channel>,
        events: ChannelEvents,
        endpoint_path: &str,
        engine: CallEngine,
    ) -> Result<(ConnectionId, JoinHandle<()>), RpcError> {
        let id = self.adopt(channel, endpoint_path, engine)?;
        Ok((id, tokio::spawn(self.clone().run_session(id, events))))
    }

    /// Session by id.
    pub fn session(&self, id: ConnectionId) -> Option<Arc<Session>> {
        self.inner.sessions.read().get(&id).cloned()
    }

    /// Open sessions.
    pub fn session_count(&self) -> usize {
        self.inner.sessions.read().len()
    }

    /// Ids of open sessions (sorted).
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self.inner.sessions.read().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Endpoint path a connection is bound to.
    pub fn endpoint_path(&self, id: ConnectionId) -> Option<String> {
        self.session(id).map(|s| s.endpoint_path())
    }

    #[instrument(skip(self, events), fields(conn = %id))]
    async fn run_session(self, id: ConnectionId, mut events: ChannelEvents) {
        while let Some(event) = events.recv().await {
            match event {
                ChannelEvent::Message(frame) => {
                    let _ = self.handle_frame(id, frame).await;
                }
                ChannelEvent::Closed { reason } => {
                    let _ = self.close(id, &reason).await;
                    return;
                }
                ChannelEvent::Error(error) => {
                    warn!(error, "channel error");
                    let _ = self.close(id, &error).await;
                    return;
                }
            }
        }
        let _ = self.close(id, "channel event stream ended").await;
    }

    async fn dispatch_request(&self, session: Arc<Session>, frame: String, decoded: Value) {
        let method = decoded.get("method").and_then(Value::as_str).unwrap_or_default();
        let mut msg = if method == CONNECT_TO_ENDPOINT {
            self.connect_to_endpoint(&session, frame, &decoded)
        } else {
            let path = session.endpoint_path();
            let endpoint = self.inner.dispatcher.endpoint(&path);
            let mut msg = IncomingMessage::new(session.id(), path, frame)
                .with_endpoint(endpoint.clone())
                .with_reverse_source(Arc::new(self.clone()));
            if let (None, Some(request)) = (endpoint, decoded.as_object()) {
                msg.identify(request);
                let _ = msg.set_call(method, Vec::new());
                msg.set_error(RpcError::method_not_found(method));
            }
            msg
        };

        let Some(reply) = self.inner.dispatcher.process(&mut msg).await else {
            return;
        };
        if let Err(e) = session.channel().send(reply).await {
            debug!(conn = %session.id(), error = %e, "reply dropped");
        }
    }

    /// Settle a bootstrap call; the Dispatch Engine only encodes the reply.
    fn connect_to_endpoint(&self, session: &Session, frame: String, decoded: &Value) -> IncomingMessage {
        let mut msg = IncomingMessage::new(session.id(), session.endpoint_path(), frame);
        let params = match decoded.get("params") {
            Some(Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        };
        if let Some(request) = decoded.as_object() {
            msg.identify(request);
        }

        let outcome = match params.first().and_then(Value::as_str) {
            Some(requested) => {
                let path = normalize_endpoint_path(requested);
                if self.inner.dispatcher.endpoint(&path).is_some() {
                    info!(conn = %session.id(), path, "connection rebound to endpoint");
                    session.set_endpoint_path(path.clone());
                    Ok(Value::String(path))
                } else {
                    Err(RpcError::invalid_params(format!("No endpoint registered at {path}")))
                }
            }
            None => Err(RpcError::invalid_params(format!(
                "{CONNECT_TO_ENDPOINT} expects [path]"
            ))),
        };

        let _ = msg.set_call(CONNECT_TO_ENDPOINT, params);
        match outcome {
            Ok(path) => {
                if let Err(e) = msg.set_result(path) {
                    msg.set_error(e);
                }
            }
            Err(e) => msg.set_error(e),
        }
        msg
    }

    async fn deliver_response(&self, session: &Session, frame: String, decoded: &Value) {
        let Some(reverse) = session.reverse() else {
            counter!(PROTOCOL_VIOLATIONS_TOTAL, "reason" => "unexpected_response").increment(1);
            warn!(conn = %session.id(), "response received with no outstanding calls, closing");
            let _ = self
                .close(session.id(), "Response received with no outstanding calls")
                .await;
            return;
        };
        let transport = reverse.transport.clone();
        if let Err(e) = transport.deliver_response(frame, decoded).await {
            counter!(PROTOCOL_VIOLATIONS_TOTAL, "reason" => "unmatched_response").increment(1);
            let _ = self.close(session.id(), &e.message).await;
        }
    }

    async fn reject_malformed(&self, session: &Session, err: RpcError) {
        counter!(PROTOCOL_VIOLATIONS_TOTAL, "reason" => "malformed").increment(1);
        warn!(conn = %session.id(), error = %err, "malformed frame, closing");
        match serde_json::to_string(&envelope::error_response(None, &err)) {
            Ok(body) => {
                if let Err(e) = session.channel().send(body).await {
                    debug!(conn = %session.id(), error = %e, "error reply dropped");
                }
            }
            Err(e) => tracing::error!(error = %e, "failed to encode error reply"),
        }
        let _ = self.close(session.id(), &err.message).await;
    }
}

impl ReverseClientSource for Router {
    fn reverse_client(&self, connection_id: ConnectionId) -> Result<CallEngine, RpcError> {
        Router::reverse_client(self, connection_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::memory_pair;
    use crate::server::plugins::{AuthenticationSkip, AuthorizeAll};
    use crate::server::{Endpoint, handler_fn};
    use assert_matches::assert_matches;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn router() -> Router {
        let dispatcher = Arc::new(DispatchEngine::new());
        dispatcher
            .register_endpoint(Arc::new(Endpoint::new("main", "/").with_method(
                "ping",
                handler_fn(|_, params| async move { Ok(params.into_iter().next().unwrap_or(Value::Null)) }),
            )))
            .unwrap();
        dispatcher
            .register_endpoint(Arc::new(Endpoint::new("admin", "/admin").with_method(
                "whoami",
                handler_fn(|_, _| async { Ok(json!("admin")) }),
            )))
            .unwrap();
        dispatcher.add_plugin(Arc::new(AuthenticationSkip)).unwrap();
        dispatcher.add_plugin(Arc::new(AuthorizeAll)).unwrap();
        Router::new(dispatcher)
    }

    async fn next_frame(events: &mut ChannelEvents) -> Value {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for a frame");
        match event {
            Some(ChannelEvent::Message(frame)) => serde_json::from_str(&frame).unwrap(),
            other => panic!("expected a frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn open_allocates_increasing_ids() {
        let router = router();
        let ((a, _), _) = memory_pair();
        let ((b, _), _) = memory_pair();
        let first = router.open(a, "/");
        let second = router.open(b, "/");
        assert!(second > first);
        assert_eq!(router.session_count(), 2);
        assert!(router.session(first).unwrap().reverse().is_none());
    }

    #[tokio::test]
    async fn request_is_dispatched_and_answered() {
        let router = router();
        let ((server, _), (_client, mut client_rx)) = memory_pair();
        let id = router.open(server, "/");
        let kind = router
            .handle_frame(id, r#"{"method":"ping","params":["hi"],"id":1,"jsonrpc":"2.0"}"#.into())
            .await;
        assert_eq!(kind, Some(FrameKind::Request));
        let reply = next_frame(&mut client_rx).await;
        assert_eq!(reply["result"], "hi");
        assert_eq!(reply["id"], 1);
    }

    #[tokio::test]
    async fn unknown_path_is_method_not_found() {
        let router = router();
        let ((server, _), (_client, mut client_rx)) = memory_pair();
        let id = router.open(server, "/nowhere");
        let _ = router.handle_frame(id, r#"{"method":"ping","id":4}"#.into()).await;
        let reply = next_frame(&mut client_rx).await;
        assert_eq!(reply["error"]["code"], duplex_core::errors::METHOD_NOT_FOUND);
        assert_eq!(reply["id"], 4);
    }

    #[tokio::test]
    async fn unknown_path_notification_is_silent() {
        let router = router();
        let ((server, _), (client, mut client_rx)) = memory_pair();
        let id = router.open(server, "/nowhere");
        let _ = router.handle_frame(id, r#"{"method":"ping"}"#.into()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(client_rx.try_recv().is_err());
        assert!(client.is_open());
    }

    #[tokio::test]
    async fn malformed_frame_answered_then_closed() {
        let router = router();
        let ((server, _), (client, mut client_rx)) = memory_pair();
        let id = router.open(server, "/");
        let kind = router.handle_frame(id, "not json".into()).await;
        assert_eq!(kind, Some(FrameKind::Malformed));
        let reply = next_frame(&mut client_rx).await;
        assert!(reply["id"].is_null());
        assert_eq!(reply["error"]["code"], duplex_core::errors::PARSE_ERROR);
        assert!(!client.is_open());
        assert_eq!(router.session_count(), 0);

        let ((server, _), (_client, mut client_rx)) = memory_pair();
        let id = router.open(server, "/");
        let _ = router.handle_frame(id, r#"{"id":1}"#.into()).await;
        assert_eq!(next_frame(&mut client_rx).await["error"]["code"], duplex_core::errors::INVALID_REQUEST);
        assert_matches!(client_rx.recv().await, Some(ChannelEvent::Closed { .. }));
    }

    #[tokio::test]
    async fn response_without_reverse_client_closes_channel() {
        let router = router();
        let ((server, _), (client, _)) = memory_pair();
        let id = router.open(server, "/");
        let kind = router.handle_frame(id, r#"{"result":1,"id":1,"jsonrpc":"2.0"}"#.into()).await;
        assert_eq!(kind, Some(FrameKind::Response));
        assert!(!client.is_open());
        assert!(router.session(id).is_none());
    }

    #[tokio::test]
    async fn reverse_client_is_lazy_singleton_and_hook_fires_once() {
        let router = router();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        router.on_reverse_client(move |_, _| {
            let _ = counter.fetch_add(1, Ordering::SeqCst);
        });
        let ((server, _), _) = memory_pair();
        let id = router.open(server, "/");
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        let a = router.reverse_client(id).unwrap();
        let b = router.reverse_client(id).unwrap();
        assert!(a.ptr_eq(&b));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_rejects_pending_reverse_calls() {
        let router = router();
        let ((server, _), (_client, mut client_rx)) = memory_pair();
        let id = router.open(server, "/");
        let engine = router.reverse_client(id).unwrap();

        let calls: Vec<_> = (0..3)
            .map(|n| {
                let engine = engine.clone();
                tokio::spawn(async move { engine.call("slow", vec![json!(n)]).await })
            })
            .collect();
        for _ in 0..3 {
            let _ = next_frame(&mut client_rx).await;
        }
        assert!(router.close(id, "test over").await);
        for call in calls {
            let err = call.await.unwrap().unwrap_err();
            assert!(err.is_network());
        }
        assert!(!router.close(id, "again").await);
        assert!(router.reverse_client(id).is_err());
    }

    #[tokio::test]
    async fn connect_to_endpoint_rebinds() {
        let router = router();
        let ((server, _), (_client, mut client_rx)) = memory_pair();
        let id = router.open(server, "/");
        let _ = router
            .handle_frame(id, r#"{"method":"rpc.connectToEndpoint","params":["/admin"],"id":1}"#.into())
            .await;
        assert_eq!(next_frame(&mut client_rx).await["result"], "/admin/");
        assert_eq!(router.endpoint_path(id).as_deref(), Some("/admin/"));

        let _ = router.handle_frame(id, r#"{"method":"whoami","id":2}"#.into()).await;
        assert_eq!(next_frame(&mut client_rx).await["result"], "admin");

        let _ = router
            .handle_frame(id, r#"{"method":"rpc.connectToEndpoint","params":["/missing"],"id":3}"#.into())
            .await;
        assert_eq!(
            next_frame(&mut client_rx).await["error"]["code"],
            duplex_core::errors::INVALID_PARAMS
        );
        assert_eq!(router.endpoint_path(id).as_deref(), Some("/admin/"));
    }

    #[tokio::test]
    async fn serve_closes_session_when_peer_closes() {
        let router = router();
        let ((server, server_rx), (client, _client_rx)) = memory_pair();
        let (id, task) = router.serve(server, server_rx, "/");
        assert!(router.session(id).is_some());
        client.close("bye").await;
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(router.session_count(), 0);
    }

    #[tokio::test]
    async fn adopt_requires_transport() {
        let router = router();
        let ((server, _), _) = memory_pair();
        assert!(router.adopt(server, "/", CallEngine::new()).is_err());
        assert_eq!(router.session_count(), 0);
    }
}
