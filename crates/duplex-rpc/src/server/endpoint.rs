//! Endpoints and method handlers.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use duplex_core::{CallId, ConnectionId, RpcError, normalize_endpoint_path};
use serde_json::Value;

use crate::client::CallEngine;
use crate::message::ReverseClientSource;

/// What a method sees about the call it is serving.
#[derive(Clone)]
pub struct CallContext {
    connection_id: ConnectionId,
    endpoint_path: String,
    method: String,
    call_id: Option<CallId>,
    reverse: Option<Arc<dyn ReverseClientSource>>,
}

impl CallContext {
    pub(crate) fn new(
        connection_id: ConnectionId,
        endpoint_path: String,
        method: String,
        call_id: Option<CallId>,
        reverse: Option<Arc<dyn ReverseClientSource>>,
    ) -> Self {
        Self {
            connection_id,
            endpoint_path,
            method,
            call_id,
            reverse,
        }
    }

    /// Connection the call arrived on.
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Endpoint path the call was routed to.
    pub fn endpoint_path(&self) -> &str {
        &self.endpoint_path
    }

    /// Invoked method name.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Correlation id; `None` for notifications.
    pub fn call_id(&self) -> Option<&CallId> {
        self.call_id.as_ref()
    }

    /// Call Engine aimed back at the caller over the same channel.
    ///
    /// Reverse calls may be awaited from inside the method; the Router keeps
    /// dispatching other frames meanwhile.
    pub fn reverse_client(&self) -> Result<CallEngine, RpcError> {
        self.reverse
            .as_ref()
            .ok_or_else(|| RpcError::precondition("No reverse channel for this call"))?
            .reverse_client(self.connection_id)
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("connection_id", &self.connection_id)
            .field("endpoint_path", &self.endpoint_path)
            .field("method", &self.method)
            .field("call_id", &self.call_id)
            .finish_non_exhaustive()
    }
}

/// Trait implemented by every exported method.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    /// Execute the method with its positional params.
    async fn handle(&self, ctx: &CallContext, params: Vec<Value>) -> Result<Value, RpcError>;
}

/// Handler built from an async closure. See [`handler_fn`].
pub struct FnHandler<F>(F);

/// Adapt an async closure into a [`MethodHandler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(CallContext, Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, RpcError>> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> MethodHandler for FnHandler<F>
where
    F: Fn(CallContext, Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, RpcError>> + Send,
{
    async fn handle(&self, ctx: &CallContext, params: Vec<Value>) -> Result<Value, RpcError> {
        (self.0)(ctx.clone(), params).await
    }
}

/// A named, path-addressed set of callable methods.
pub struct Endpoint {
    name: String,
    path: String,
    methods: HashMap<String, Arc<dyn MethodHandler>>,
}

impl Endpoint {
    /// Create an empty endpoint. The path is normalized.
    pub fn new(name: impl Into<String>, path: &str) -> Self {
        Self {
            name: name.into(),
            path: normalize_endpoint_path(path),
            methods: HashMap::new(),
        }
    }

    /// Builder form of [`Endpoint::register`].
    #[must_use]
    pub fn with_method(mut self, method: &str, handler: impl MethodHandler + 'static) -> Self {
        self.register(method, handler);
        self
    }

    /// Export a method, replacing any handler of the same name.
    pub fn register(&mut self, method: &str, handler: impl MethodHandler + 'static) {
        let _ = self.methods.insert(method.to_owned(), Arc::new(handler));
    }

    /// Endpoint name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Normalized path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Handler for a method.
    pub fn method(&self, method: &str) -> Option<Arc<dyn MethodHandler>> {
        self.methods.get(method).cloned()
    }

    /// List all exported method names (sorted).
    pub fn methods(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.keys().cloned().collect();
        names.sort();
        names
    }

    /// Check whether a method is exported.
    pub fn has_method(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("methods", &self.methods())
            .finish()
    }
}
