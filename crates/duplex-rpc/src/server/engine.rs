//! Dispatch Engine: runs incoming calls against registered endpoints.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use duplex_core::envelope::{self, JSONRPC_VERSION};
use duplex_core::{CallId, RpcError, normalize_endpoint_path};
use metrics::{counter, histogram};
use parking_lot::RwLock;
use serde_json::{Value, json};
use tracing::{debug, error, warn};

use crate::message::outgoing::json_type;
use crate::message::{DispatchState, IncomingMessage};
use crate::metrics::{RPC_ERRORS_TOTAL, RPC_REQUEST_DURATION_SECONDS, RPC_REQUESTS_TOTAL};
use crate::same_plugin;
use crate::server::{CallContext, Endpoint, ServerPlugin};

/// Requests slower than this are logged.
const SLOW_REQUEST: Duration = Duration::from_secs(5);

/// Server-role engine: endpoint registry plus the dispatch pipeline.
pub struct DispatchEngine {
    endpoints: RwLock<HashMap<String, Arc<Endpoint>>>,
    plugins: RwLock<Vec<Arc<dyn ServerPlugin>>>,
    handler_timeout: Option<Duration>,
}

impl DispatchEngine {
    /// Create an engine with no endpoints and no plugins.
    pub fn new() -> Self {
        Self {
            endpoints: RwLock::new(HashMap::new()),
            plugins: RwLock::new(Vec::new()),
            handler_timeout: None,
        }
    }

    /// Fail methods that run longer than `timeout` with an internal error.
    ///
    /// Listeners take this from `server.handlerTimeoutMs`.
    #[must_use]
    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = Some(timeout);
        self
    }

    /// Method time limit, if any.
    pub fn handler_timeout(&self) -> Option<Duration> {
        self.handler_timeout
    }

    /// Register an endpoint at its path.
    ///
    /// Registering the same endpoint again is a no-op; a different endpoint
    /// at an occupied path is rejected.
    pub fn register_endpoint(&self, endpoint: Arc<Endpoint>) -> Result<(), RpcError> {
        let mut endpoints = self.endpoints.write();
        if let Some(existing) = endpoints.get(endpoint.path()) {
            if Arc::ptr_eq(existing, &endpoint) {
                return Ok(());
            }
            return Err(RpcError::precondition(format!(
                "Endpoint path {} is already taken by {}",
                endpoint.path(),
                existing.name()
            )));
        }
        debug!(name = endpoint.name(), path = endpoint.path(), "endpoint registered");
        let _ = endpoints.insert(endpoint.path().to_owned(), endpoint);
        Ok(())
    }

    /// Remove the endpoint at a path.
    pub fn unregister_endpoint(&self, path: &str) -> Option<Arc<Endpoint>> {
        self.endpoints.write().remove(&normalize_endpoint_path(path))
    }

    /// Endpoint registered at a path.
    pub fn endpoint(&self, path: &str) -> Option<Arc<Endpoint>> {
        self.endpoints.read().get(&normalize_endpoint_path(path)).cloned()
    }

    /// Registered paths (sorted).
    pub fn endpoint_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.endpoints.read().keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Register a plugin. The same plugin instance cannot be added twice.
    pub fn add_plugin(&self, plugin: Arc<dyn ServerPlugin>) -> Result<(), RpcError> {
        let mut plugins = self.plugins.write();
        if plugins.iter().any(|p| same_plugin(p, &plugin)) {
            return Err(RpcError::precondition("Plugin is already registered"));
        }
        plugins.push(plugin);
        Ok(())
    }

    /// Unregister a plugin. Returns `false` if it was not registered.
    pub fn remove_plugin(&self, plugin: &Arc<dyn ServerPlugin>) -> bool {
        let mut plugins = self.plugins.write();
        let before = plugins.len();
        plugins.retain(|p| !same_plugin(p, plugin));
        plugins.len() != before
    }

    /// Registered plugins, in order.
    pub fn plugins(&self) -> Vec<Arc<dyn ServerPlugin>> {
        self.plugins.read().clone()
    }

    /// Run one incoming call through the pipeline.
    ///
    /// Returns the encoded reply, or `None` for notifications (whose
    /// failures are logged, never transmitted). A message that arrives
    /// already settled skips straight to the result/failure hooks.
    pub async fn process(&self, msg: &mut IncomingMessage) -> Option<String> {
        let plugins = self.plugins();
        let start = Instant::now();

        if !msg.is_settled() {
            if let Err(err) = self.execute(msg, &plugins).await {
                msg.set_error(err);
            }
        }

        if msg.result().is_some() {
            for plugin in &plugins {
                if let Err(err) = plugin.result(msg).await {
                    msg.set_error(err);
                    break;
                }
            }
        }
        if msg.error().is_some() {
            for plugin in plugins.iter().rev() {
                if let Err(replacement) = plugin.exception_catch(msg).await {
                    msg.set_error(replacement);
                }
            }
        }

        let method = msg.method().unwrap_or("<unknown>").to_owned();
        counter!(RPC_REQUESTS_TOTAL, "method" => method.clone()).increment(1);
        histogram!(RPC_REQUEST_DURATION_SECONDS, "method" => method.clone())
            .record(start.elapsed().as_secs_f64());
        if start.elapsed() >= SLOW_REQUEST {
            warn!(
                method,
                duration_secs = start.elapsed().as_secs_f64(),
                "slow RPC request"
            );
        }

        match msg.error() {
            Some(err) => {
                counter!(RPC_ERRORS_TOTAL, "method" => method.clone(), "code" => err.code.to_string())
                    .increment(1);
                msg.set_state(DispatchState::Failed);
            }
            None => msg.set_state(DispatchState::Succeeded),
        }

        if msg.is_notification() {
            if let Some(err) = msg.error() {
                warn!(method, code = err.code, error = %err, "notification failed");
            }
            return None;
        }

        let reply = response_envelope(msg.call_id(), msg.outcome());
        let body = match serde_json::to_string(&reply) {
            Ok(body) => body,
            Err(e) => {
                error!(method, error = %e, "failed to encode reply");
                return None;
            }
        };
        msg.set_response_body(body);
        for plugin in &plugins {
            if let Err(err) = plugin.after_encode(msg).await {
                warn!(method, error = %err, "after_encode hook failed");
            }
        }
        msg.set_state(DispatchState::Responded);
        msg.response_body().map(ToOwned::to_owned)
    }

    /// Steps up to and including execution. Failures are returned, not stored.
    async fn execute(
        &self,
        msg: &mut IncomingMessage,
        plugins: &[Arc<dyn ServerPlugin>],
    ) -> Result<(), RpcError> {
        msg.set_state(DispatchState::Decoding);
        for plugin in plugins {
            plugin.before_decode(msg).await?;
        }
        if msg.is_settled() {
            return Ok(());
        }
        decode(msg)?;

        for plugin in plugins {
            plugin.after_decode(msg).await?;
        }
        if msg.is_settled() {
            return Ok(());
        }

        msg.set_state(DispatchState::Authorizing);
        if !msg.is_authenticated() {
            return Err(RpcError::not_authenticated());
        }
        if !msg.is_authorized() {
            return Err(RpcError::not_authorized());
        }

        msg.set_state(DispatchState::Executing);
        for plugin in plugins {
            plugin.claim_execution(msg).await?;
            if msg.is_claimed() {
                break;
            }
        }
        if msg.is_claimed() {
            if !msg.is_settled() {
                return Err(RpcError::internal("Execution was claimed but never settled"));
            }
            return Ok(());
        }
        msg.claim()?;

        let method = msg
            .method()
            .ok_or_else(|| RpcError::internal("Method missing after decode"))?
            .to_owned();
        let handler = msg
            .endpoint()
            .and_then(|endpoint| endpoint.method(&method))
            .ok_or_else(|| RpcError::method_not_found(&method))?;
        let ctx = CallContext::new(
            msg.connection_id(),
            msg.endpoint_path().to_owned(),
            method.clone(),
            msg.call_id().cloned(),
            msg.reverse_source(),
        );
        let params = msg.params().to_vec();

        let result = match self.handler_timeout {
            Some(limit) => tokio::time::timeout(limit, handler.handle(&ctx, params))
                .await
                .map_err(|_| {
                    error!(method, "RPC handler timed out after {limit:?}");
                    RpcError::internal(format!("Handler for '{method}' timed out"))
                })?,
            None => handler.handle(&ctx, params).await,
        }?;
        msg.set_result(result)
    }
}

impl Default for DispatchEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode the body (unless a hook supplied the envelope) and validate it.
fn decode(msg: &mut IncomingMessage) -> Result<(), RpcError> {
    let envelope = match msg.envelope() {
        Some(envelope) => envelope.clone(),
        None => {
            let decoded: Value = serde_json::from_str(msg.body()).map_err(RpcError::parse_error)?;
            msg.set_envelope(decoded.clone());
            decoded
        }
    };

    if envelope.is_array() {
        return Err(RpcError::invalid_request("Batched requests are not supported"));
    }
    let Some(request) = envelope.as_object() else {
        return Err(RpcError::invalid_request(format!(
            "Request must be an object, got {}",
            json_type(&envelope)
        )));
    };
    msg.identify(request);

    let method = match request.get("method") {
        Some(Value::String(m)) if !m.is_empty() => m.clone(),
        _ => return Err(RpcError::invalid_request("Request method must be a non-empty string")),
    };
    let params = match request.get("params") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.clone(),
        Some(other) => {
            return Err(RpcError::invalid_params(format!(
                "Request params must be an array, got {}",
                json_type(other)
            )));
        }
    };
    msg.set_call(method, params)
}

/// `{id, result}` or `{id, error}`; an unknown id is `null`.
fn response_envelope(id: Option<&CallId>, outcome: Option<&Result<Value, RpcError>>) -> Value {
    match outcome {
        Some(Ok(result)) => match id {
            Some(id) => envelope::success_response(id, result.clone()),
            None => json!({ "result": result, "id": null, "jsonrpc": JSONRPC_VERSION }),
        },
        Some(Err(err)) => envelope::error_response(id, err),
        None => envelope::error_response(id, &RpcError::internal("Call finished without an outcome")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::handler_fn;
    use crate::server::plugins::{AuthenticationSkip, AuthorizeAll};
    use async_trait::async_trait;
    use duplex_core::errors::{
        INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND, NOT_AUTHENTICATED, NOT_AUTHORIZED,
        PARSE_ERROR,
    };
    use duplex_core::{ConnectionId, ConnectionIdAllocator};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn conn() -> ConnectionId {
        ConnectionIdAllocator::new().next_id()
    }

    fn ping_endpoint(counter: Arc<AtomicUsize>) -> Arc<Endpoint> {
        Arc::new(
            Endpoint::new("test", "/").with_method(
                "ping",
                handler_fn(move |_ctx, params| {
                    let counter = counter.clone();
                    async move {
                        let _ = counter.fetch_add(1, Ordering::SeqCst);
                        Ok(params.into_iter().next().unwrap_or(Value::Null))
                    }
                }),
            ).with_method("boom", handler_fn(|_, _| async { Err(RpcError::from_message("boom")) })),
        )
    }

    fn open_engine(endpoint: &Arc<Endpoint>) -> DispatchEngine {
        let engine = DispatchEngine::new();
        engine.register_endpoint(endpoint.clone()).unwrap();
        engine.add_plugin(Arc::new(AuthenticationSkip)).unwrap();
        engine.add_plugin(Arc::new(AuthorizeAll)).unwrap();
        engine
    }

    async fn run(engine: &DispatchEngine, endpoint: &Arc<Endpoint>, body: &str) -> (IncomingMessage, Option<Value>) {
        let mut msg = IncomingMessage::new(conn(), "/", body).with_endpoint(Some(endpoint.clone()));
        let reply = engine.process(&mut msg).await;
        (msg, reply.map(|r| serde_json::from_str(&r).unwrap()))
    }

    #[tokio::test]
    async fn ping_returns_first_param() {
        let endpoint = ping_endpoint(Arc::default());
        let engine = open_engine(&endpoint);
        let (msg, reply) = run(
            &engine,
            &endpoint,
            r#"{"method":"ping","params":["hello",false],"id":1,"jsonrpc":"2.0"}"#,
        )
        .await;
        let reply = reply.unwrap();
        assert_eq!(reply["result"], "hello");
        assert_eq!(reply["id"], 1);
        assert!(reply.get("error").is_none());
        assert_eq!(msg.state(), DispatchState::Responded);
    }

    #[tokio::test]
    async fn unknown_method_is_32601() {
        let endpoint = ping_endpoint(Arc::default());
        let engine = open_engine(&endpoint);
        let (_, reply) = run(&engine, &endpoint, r#"{"method":"nope","params":[],"id":"x","jsonrpc":"2.0"}"#).await;
        let reply = reply.unwrap();
        assert_eq!(reply["error"]["code"], METHOD_NOT_FOUND);
        assert!(reply["error"]["message"].as_str().unwrap().starts_with("Method not found"));
        assert_eq!(reply["id"], "x");
    }

    #[tokio::test]
    async fn fails_closed_without_auth_plugins() {
        let calls = Arc::new(AtomicUsize::new(0));
        let endpoint = ping_endpoint(calls.clone());
        let engine = DispatchEngine::new();
        engine.register_endpoint(endpoint.clone()).unwrap();
        let (_, reply) = run(&engine, &endpoint, r#"{"method":"ping","params":[],"id":1}"#).await;
        assert_eq!(reply.unwrap()["error"]["code"], NOT_AUTHENTICATED);

        engine.add_plugin(Arc::new(AuthenticationSkip)).unwrap();
        let (_, reply) = run(&engine, &endpoint, r#"{"method":"ping","params":[],"id":2}"#).await;
        assert_eq!(reply.unwrap()["error"]["code"], NOT_AUTHORIZED);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn notifications_never_answered() {
        let calls = Arc::new(AtomicUsize::new(0));
        let endpoint = ping_endpoint(calls.clone());
        let engine = open_engine(&endpoint);

        let (msg, reply) = run(&engine, &endpoint, r#"{"method":"ping","params":[1]}"#).await;
        assert!(reply.is_none());
        assert_eq!(msg.state(), DispatchState::Succeeded);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let (msg, reply) = run(&engine, &endpoint, r#"{"method":"boom"}"#).await;
        assert!(reply.is_none());
        assert_eq!(msg.state(), DispatchState::Failed);

        let (_, reply) = run(&engine, &endpoint, r#"{"method":"missing"}"#).await;
        assert!(reply.is_none());

        let (_, reply) = run(&engine, &endpoint, r#"{"method":"ping","params":{"a":1}}"#).await;
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn parse_error_answered_with_null_id() {
        let endpoint = ping_endpoint(Arc::default());
        let engine = open_engine(&endpoint);
        let (_, reply) = run(&engine, &endpoint, "{oops").await;
        let reply = reply.unwrap();
        assert_eq!(reply["error"]["code"], PARSE_ERROR);
        assert!(reply["id"].is_null());
    }

    #[tokio::test]
    async fn batch_rejected() {
        let endpoint = ping_endpoint(Arc::default());
        let engine = open_engine(&endpoint);
        let (_, reply) = run(&engine, &endpoint, r#"[{"method":"ping","id":1}]"#).await;
        assert_eq!(reply.unwrap()["error"]["code"], INVALID_REQUEST);
    }

    #[tokio::test]
    async fn params_normalized_or_rejected() {
        let endpoint = ping_endpoint(Arc::default());
        let engine = open_engine(&endpoint);
        let (_, reply) = run(&engine, &endpoint, r#"{"method":"ping","id":1}"#).await;
        assert!(reply.unwrap()["result"].is_null());
        let (_, reply) = run(&engine, &endpoint, r#"{"method":"ping","params":"x","id":2}"#).await;
        assert_eq!(reply.unwrap()["error"]["code"], INVALID_PARAMS);
    }

    #[tokio::test]
    async fn application_error_defaults_to_code_zero() {
        let endpoint = ping_endpoint(Arc::default());
        let engine = open_engine(&endpoint);
        let (_, reply) = run(&engine, &endpoint, r#"{"method":"boom","id":5}"#).await;
        let reply = reply.unwrap();
        assert_eq!(reply["error"]["code"], 0);
        assert_eq!(reply["error"]["message"], "boom");
        assert!(reply.get("result").is_none());
    }

    #[tokio::test]
    async fn presettled_message_skips_execution() {
        let calls = Arc::new(AtomicUsize::new(0));
        let endpoint = ping_endpoint(calls.clone());
        let engine = open_engine(&endpoint);
        let mut msg = IncomingMessage::new(conn(), "/missing/", r#"{"method":"ping","id":3}"#);
        msg.identify(json!({"method": "ping", "id": 3}).as_object().unwrap());
        msg.set_error(RpcError::method_not_found("ping"));
        let reply: Value = serde_json::from_str(&engine.process(&mut msg).await.unwrap()).unwrap();
        assert_eq!(reply["error"]["code"], METHOD_NOT_FOUND);
        assert_eq!(reply["id"], 3);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn endpoint_registration_rules() {
        let engine = DispatchEngine::new();
        let a = ping_endpoint(Arc::default());
        engine.register_endpoint(a.clone()).unwrap();
        engine.register_endpoint(a.clone()).unwrap();
        let b = ping_endpoint(Arc::default());
        assert!(engine.register_endpoint(b).is_err());
        assert!(Arc::ptr_eq(&engine.endpoint("/").unwrap(), &a));
        assert_eq!(engine.endpoint_paths(), vec!["/"]);
        assert!(engine.unregister_endpoint("/").is_some());
        assert!(engine.endpoint("/").is_none());
    }

    struct Claimer;

    #[async_trait]
    impl ServerPlugin for Claimer {
        async fn claim_execution(&self, msg: &mut IncomingMessage) -> Result<(), RpcError> {
            if msg.method() == Some("virtual") {
                msg.claim()?;
                msg.set_result(json!("handled by plugin"))?;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn claim_execution_bypasses_endpoint() {
        let endpoint = ping_endpoint(Arc::default());
        let engine = open_engine(&endpoint);
        engine.add_plugin(Arc::new(Claimer)).unwrap();
        let (_, reply) = run(&engine, &endpoint, r#"{"method":"virtual","id":1}"#).await;
        assert_eq!(reply.unwrap()["result"], "handled by plugin");
    }

    struct Masker;

    #[async_trait]
    impl ServerPlugin for Masker {
        async fn exception_catch(&self, _msg: &mut IncomingMessage) -> Result<(), RpcError> {
            Err(RpcError::application(42, "masked"))
        }
    }

    #[tokio::test]
    async fn exception_catch_replaces_failure() {
        let endpoint = ping_endpoint(Arc::default());
        let engine = open_engine(&endpoint);
        engine.add_plugin(Arc::new(Masker)).unwrap();
        let (_, reply) = run(&engine, &endpoint, r#"{"method":"boom","id":1}"#).await;
        assert_eq!(reply.unwrap()["error"]["code"], 42);
    }

    #[tokio::test(start_paused = true)]
    async fn handler_timeout_is_internal_error() {
        let endpoint = Arc::new(Endpoint::new("slow", "/").with_method(
            "sleep",
            handler_fn(|_, _| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Value::Null)
            }),
        ));
        let engine = DispatchEngine::new().with_handler_timeout(Duration::from_secs(1));
        engine.register_endpoint(endpoint.clone()).unwrap();
        engine.add_plugin(Arc::new(AuthenticationSkip)).unwrap();
        engine.add_plugin(Arc::new(AuthorizeAll)).unwrap();
        let (_, reply) = run(&engine, &endpoint, r#"{"method":"sleep","id":1}"#).await;
        assert_eq!(reply.unwrap()["error"]["code"], duplex_core::errors::INTERNAL_ERROR);
    }
}
