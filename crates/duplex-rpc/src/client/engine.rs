//! Call Engine: turns method calls into settled outcomes.

use std::sync::{Arc, Weak};

use duplex_core::envelope::{self, ResponseEnvelope};
use duplex_core::{CallIdAllocator, RpcError};
use metrics::counter;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;

use crate::client::ClientPlugin;
use crate::message::OutgoingMessage;
use crate::metrics::{RPC_CALLS_TOTAL, RPC_CALL_FAILURES_TOTAL};
use crate::same_plugin;
use crate::transport::TransportPlugin;

/// The transport plugin, kept twice so it can be driven as a hook without
/// trait upcasting.
#[derive(Clone)]
struct TransportSlot {
    transport: Arc<dyn TransportPlugin>,
    hooks: Arc<dyn ClientPlugin>,
}

struct EngineInner {
    ids: CallIdAllocator,
    plugins: RwLock<Vec<Arc<dyn ClientPlugin>>>,
    transport: RwLock<Option<TransportSlot>>,
}

/// Client-role engine. Cheap to clone; clones share ids, plugins and transport.
///
/// Plugins run in registration order; the transport plugin always runs
/// after them, so it only claims transmission when no plugin did.
#[derive(Clone)]
pub struct CallEngine {
    inner: Arc<EngineInner>,
}

/// Non-owning handle to a [`CallEngine`].
#[derive(Clone)]
pub struct WeakCallEngine {
    inner: Weak<EngineInner>,
}

impl WeakCallEngine {
    /// Recover the engine if it is still alive.
    pub fn upgrade(&self) -> Option<CallEngine> {
        self.inner.upgrade().map(|inner| CallEngine { inner })
    }
}

impl CallEngine {
    /// Create an engine with no plugins and no transport.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EngineInner {
                ids: CallIdAllocator::new(),
                plugins: RwLock::new(Vec::new()),
                transport: RwLock::new(None),
            }),
        }
    }

    /// Create an engine bound to a transport.
    pub fn with_transport<T: TransportPlugin + 'static>(transport: Arc<T>) -> Self {
        let engine = Self::new();
        engine.set_transport(transport);
        engine
    }

    /// Non-owning handle, for transports that need to refer back.
    pub fn downgrade(&self) -> WeakCallEngine {
        WeakCallEngine {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Whether two handles refer to the same engine.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Register a plugin. The same plugin instance cannot be added twice.
    pub fn add_plugin(&self, plugin: Arc<dyn ClientPlugin>) -> Result<(), RpcError> {
        let mut plugins = self.inner.plugins.write();
        if plugins.iter().any(|p| same_plugin(p, &plugin)) {
            return Err(RpcError::precondition("Plugin is already registered"));
        }
        plugins.push(plugin);
        Ok(())
    }

    /// Unregister a plugin. Returns `false` if it was not registered.
    pub fn remove_plugin(&self, plugin: &Arc<dyn ClientPlugin>) -> bool {
        let mut plugins = self.inner.plugins.write();
        let before = plugins.len();
        plugins.retain(|p| !same_plugin(p, plugin));
        plugins.len() != before
    }

    /// Registered plugins, in order.
    pub fn plugins(&self) -> Vec<Arc<dyn ClientPlugin>> {
        self.inner.plugins.read().clone()
    }

    /// Set the default transport plugin, replacing any previous one.
    pub fn set_transport<T: TransportPlugin + 'static>(&self, transport: Arc<T>) {
        let slot = TransportSlot {
            transport: transport.clone(),
            hooks: transport,
        };
        *self.inner.transport.write() = Some(slot);
    }

    /// Current transport plugin.
    pub fn transport(&self) -> Option<Arc<dyn TransportPlugin>> {
        self.inner
            .transport
            .read()
            .as_ref()
            .map(|slot| slot.transport.clone())
    }

    /// Call ids allocated so far.
    pub fn calls_issued(&self) -> i64 {
        self.inner.ids.allocated()
    }

    /// Call a remote method and wait for its outcome.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcError> {
        let id = self.inner.ids.next_id();
        let msg = OutgoingMessage::new(method, params, Some(id))?;
        self.run(msg).await
    }

    /// Send a notification. Settles once the frame has been transmitted.
    pub async fn notify(&self, method: &str, params: Vec<Value>) -> Result<(), RpcError> {
        let msg = OutgoingMessage::new(method, params, None)?;
        self.run(msg).await.map(|_| ())
    }

    /// Plugins followed by the transport, snapshotted for one call.
    fn hooks(&self) -> Vec<Arc<dyn ClientPlugin>> {
        let mut hooks = self.inner.plugins.read().clone();
        if let Some(slot) = self.inner.transport.read().as_ref() {
            hooks.push(slot.hooks.clone());
        }
        hooks
    }

    async fn run(&self, mut msg: OutgoingMessage) -> Result<Value, RpcError> {
        let hooks = self.hooks();
        counter!(RPC_CALLS_TOTAL, "method" => msg.method().to_owned()).increment(1);

        if let Err(err) = drive(&mut msg, &hooks).await {
            msg.set_error(err);
        }

        if msg.error().is_some() {
            for hook in hooks.iter().rev() {
                if let Err(replacement) = hook.exception_catch(&mut msg).await {
                    msg.set_error(replacement);
                }
            }
        }

        if let Some(err) = msg.error() {
            counter!(
                RPC_CALL_FAILURES_TOTAL,
                "method" => msg.method().to_owned(),
                "code" => err.code.to_string()
            )
            .increment(1);
            debug!(method = msg.method(), code = err.code, error = %err, "call failed");
        }
        msg.into_outcome()
    }
}

impl Default for CallEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// The forward part of the pipeline. Failures are returned, not stored.
async fn drive(msg: &mut OutgoingMessage, hooks: &[Arc<dyn ClientPlugin>]) -> Result<(), RpcError> {
    if msg.request_object().is_none() {
        let request = envelope::request(msg.method(), msg.params(), msg.call_id());
        msg.set_request_object(request)?;
    }
    for hook in hooks {
        hook.before_encode(msg).await?;
    }

    if msg.request_body().is_none() {
        let request = msg
            .request_object()
            .ok_or_else(|| RpcError::internal("Request envelope missing at encode"))?;
        let body = serde_json::to_string(request)
            .map_err(|e| RpcError::internal(format!("Failed to encode request: {e}")))?;
        msg.set_request_body(body);
    }
    for hook in hooks {
        hook.after_encode(msg).await?;
    }

    for hook in hooks {
        hook.claim_transmission(msg).await?;
        if msg.is_claimed() {
            break;
        }
    }
    if !msg.is_claimed() {
        return Err(RpcError::precondition(format!(
            "No plugin or transport claimed transmission of {}",
            msg.method()
        )));
    }

    if msg.is_settled() {
        return Ok(());
    }
    if msg.is_notification() {
        return msg.set_result(Value::Null);
    }

    for hook in hooks {
        hook.before_decode(msg).await?;
    }
    if msg.response_object().is_none() {
        let body = msg
            .response_body()
            .ok_or_else(|| RpcError::internal(format!("No reply received for {}", msg.method())))?;
        let decoded: Value = serde_json::from_str(body).map_err(RpcError::parse_error)?;
        msg.set_response_object(decoded);
    }
    for hook in hooks {
        hook.after_decode(msg).await?;
    }
    if msg.is_settled() {
        return Ok(());
    }

    let response = msg
        .response_object()
        .ok_or_else(|| RpcError::internal("Response envelope missing at settle"))?;
    let response = envelope::parse_response(response)?;
    if response.id() != msg.call_id() {
        return Err(RpcError::invalid_request(format!(
            "Response id {:?} does not match call id {:?}",
            response.id(),
            msg.call_id()
        )));
    }
    match response {
        ResponseEnvelope::Success { result, .. } => msg.set_result(result),
        ResponseEnvelope::Failure { error, .. } => {
            msg.set_error(error);
            Ok(())
        }
    }
}
