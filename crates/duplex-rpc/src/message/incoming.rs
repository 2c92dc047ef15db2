//! One call received for a local endpoint.

use std::fmt;
use std::sync::Arc;

use duplex_core::{CallId, ConnectionId, RpcError};
use serde_json::{Map, Value};

use crate::client::CallEngine;
use crate::server::Endpoint;

/// Progress of an incoming call through the Dispatch Engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchState {
    /// Not yet processed.
    Unstarted,
    /// Body being decoded and validated.
    Decoding,
    /// Authentication and authorization being checked.
    Authorizing,
    /// Method running.
    Executing,
    /// Settled with a result.
    Succeeded,
    /// Settled with a failure.
    Failed,
    /// Reply encoded. Notifications never get here.
    Responded,
}

/// Gives methods access to a Call Engine aimed back at their caller.
pub trait ReverseClientSource: Send + Sync {
    /// Reverse Call Engine for a connection, created on first use.
    fn reverse_client(&self, connection_id: ConnectionId) -> Result<CallEngine, RpcError>;
}

/// State of one incoming call as it moves through the server pipeline.
///
/// Both the authenticated and the authorized flag start out `false`; a
/// method only runs after plugins have set both.
pub struct IncomingMessage {
    connection_id: ConnectionId,
    endpoint: Option<Arc<Endpoint>>,
    endpoint_path: String,
    body: String,
    envelope: Option<Value>,
    call_id: Option<CallId>,
    notification: bool,
    method: Option<String>,
    params: Vec<Value>,
    authenticated: bool,
    authorized: bool,
    claimed: bool,
    outcome: Option<Result<Value, RpcError>>,
    response_body: Option<String>,
    state: DispatchState,
    reverse: Option<Arc<dyn ReverseClientSource>>,
}

impl IncomingMessage {
    /// Wrap a raw request body received on a connection.
    pub fn new(
        connection_id: ConnectionId,
        endpoint_path: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            connection_id,
            endpoint: None,
            endpoint_path: endpoint_path.into(),
            body: body.into(),
            envelope: None,
            call_id: None,
            notification: false,
            method: None,
            params: Vec::new(),
            authenticated: false,
            authorized: false,
            claimed: false,
            outcome: None,
            response_body: None,
            state: DispatchState::Unstarted,
            reverse: None,
        }
    }

    /// Attach the endpoint the call targets.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: Option<Arc<Endpoint>>) -> Self {
        self.endpoint = endpoint;
        self
    }

    /// Attach the source of reverse Call Engines.
    #[must_use]
    pub fn with_reverse_source(mut self, source: Arc<dyn ReverseClientSource>) -> Self {
        self.reverse = Some(source);
        self
    }

    /// Connection the call arrived on.
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Target endpoint, if one is registered at the connection's path.
    pub fn endpoint(&self) -> Option<&Arc<Endpoint>> {
        self.endpoint.as_ref()
    }

    /// Replace the target endpoint.
    pub fn set_endpoint(&mut self, endpoint: Option<Arc<Endpoint>>) {
        self.endpoint = endpoint;
    }

    /// Endpoint path of the connection.
    pub fn endpoint_path(&self) -> &str {
        &self.endpoint_path
    }

    /// Raw request body.
    pub fn body(&self) -> &str {
        &self.body
    }

    /// Replace the raw body (for transcoding hooks running before decode).
    pub fn set_body(&mut self, body: impl Into<String>) {
        self.body = body.into();
    }

    /// Decoded envelope, once decoded.
    pub fn envelope(&self) -> Option<&Value> {
        self.envelope.as_ref()
    }

    /// Supply the decoded envelope; decoding of the raw body is then skipped.
    pub fn set_envelope(&mut self, envelope: Value) {
        self.envelope = Some(envelope);
    }

    /// Read the correlation id from a request object.
    ///
    /// A request without an `id` member is a notification.
    pub fn identify(&mut self, request: &Map<String, Value>) {
        match request.get("id") {
            Some(id) => {
                self.call_id = CallId::from_value(id);
                self.notification = false;
            }
            None => {
                self.call_id = None;
                self.notification = true;
            }
        }
    }

    /// Correlation id, when known.
    pub fn call_id(&self) -> Option<&CallId> {
        self.call_id.as_ref()
    }

    /// Whether the call is a notification (never answered).
    pub fn is_notification(&self) -> bool {
        self.notification
    }

    /// Method name, once decoded.
    pub fn method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    /// Parameters, once decoded.
    pub fn params(&self) -> &[Value] {
        &self.params
    }

    /// Set the decoded method and parameters.
    pub fn set_call(&mut self, method: impl Into<String>, params: Vec<Value>) -> Result<(), RpcError> {
        let method = method.into();
        if method.is_empty() {
            return Err(RpcError::precondition("Method name must not be empty"));
        }
        self.method = Some(method);
        self.params = params;
        Ok(())
    }

    /// Whether a plugin authenticated the caller.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Mark the caller as authenticated (or not).
    pub fn set_authenticated(&mut self, authenticated: bool) {
        self.authenticated = authenticated;
    }

    /// Whether a plugin authorized the call.
    pub fn is_authorized(&self) -> bool {
        self.authorized
    }

    /// Mark the call as authorized (or not).
    pub fn set_authorized(&mut self, authorized: bool) {
        self.authorized = authorized;
    }

    /// Whether a hook has taken ownership of execution.
    pub fn is_claimed(&self) -> bool {
        self.claimed
    }

    /// Take ownership of execution. Only one claimant is allowed.
    pub fn claim(&mut self) -> Result<(), RpcError> {
        if self.claimed {
            return Err(RpcError::precondition("Execution was already claimed"));
        }
        self.claimed = true;
        Ok(())
    }

    /// Whether the call has a terminal outcome.
    pub fn is_settled(&self) -> bool {
        self.outcome.is_some()
    }

    /// Successful result, if settled that way.
    pub fn result(&self) -> Option<&Value> {
        self.outcome.as_ref().and_then(|o| o.as_ref().ok())
    }

    /// Failure, if settled that way.
    pub fn error(&self) -> Option<&RpcError> {
        self.outcome.as_ref().and_then(|o| o.as_ref().err())
    }

    /// Terminal outcome, if settled.
    pub fn outcome(&self) -> Option<&Result<Value, RpcError>> {
        self.outcome.as_ref()
    }

    /// Settle with a result. A failed call cannot be turned into a success.
    pub fn set_result(&mut self, result: Value) -> Result<(), RpcError> {
        if let Some(Err(existing)) = &self.outcome {
            return Err(RpcError::precondition(format!(
                "Cannot replace failure ({}) with a result",
                existing.message
            )));
        }
        self.outcome = Some(Ok(result));
        Ok(())
    }

    /// Settle with (or replace the current) failure.
    pub fn set_error(&mut self, error: RpcError) {
        self.outcome = Some(Err(error));
    }

    /// Encoded reply, once built.
    pub fn response_body(&self) -> Option<&str> {
        self.response_body.as_deref()
    }

    /// Replace the encoded reply.
    pub fn set_response_body(&mut self, body: impl Into<String>) {
        self.response_body = Some(body.into());
    }

    /// Current dispatch state.
    pub fn state(&self) -> DispatchState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: DispatchState) {
        self.state = state;
    }

    pub(crate) fn reverse_source(&self) -> Option<Arc<dyn ReverseClientSource>> {
        self.reverse.clone()
    }

    /// Call Engine aimed back at the caller over the same channel.
    pub fn reverse_client(&self) -> Result<CallEngine, RpcError> {
        self.reverse
            .as_ref()
            .ok_or_else(|| RpcError::precondition("No reverse channel for this call"))?
            .reverse_client(self.connection_id)
    }
}

impl fmt::Debug for IncomingMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingMessage")
            .field("connection_id", &self.connection_id)
            .field("endpoint_path", &self.endpoint_path)
            .field("call_id", &self.call_id)
            .field("method", &self.method)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duplex_core::ConnectionIdAllocator;
    use serde_json::json;

    fn msg() -> IncomingMessage {
        let conn = ConnectionIdAllocator::new().next_id();
        IncomingMessage::new(conn, "/", r#"{"method":"ping"}"#)
    }

    #[test]
    fn fails_closed_by_default() {
        let m = msg();
        assert!(!m.is_authenticated());
        assert!(!m.is_authorized());
        assert_eq!(m.state(), DispatchState::Unstarted);
    }

    #[test]
    fn identify_notification() {
        let mut m = msg();
        m.identify(json!({"method": "log"}).as_object().unwrap());
        assert!(m.is_notification());
        assert!(m.call_id().is_none());
    }

    #[test]
    fn identify_null_id_is_not_a_notification() {
        let mut m = msg();
        m.identify(json!({"method": "x", "id": null}).as_object().unwrap());
        assert!(!m.is_notification());
        assert!(m.call_id().is_none());
    }

    #[test]
    fn identify_call() {
        let mut m = msg();
        m.identify(json!({"method": "x", "id": "abc"}).as_object().unwrap());
        assert_eq!(m.call_id(), Some(&CallId::String("abc".into())));
    }

    #[test]
    fn failure_cannot_become_success() {
        let mut m = msg();
        m.set_error(RpcError::not_authorized());
        assert!(m.set_result(json!(true)).is_err());
        assert_eq!(m.error().unwrap().code, -2);
    }

    #[test]
    fn claim_only_once() {
        let mut m = msg();
        m.claim().unwrap();
        assert!(m.claim().is_err());
    }

    #[test]
    fn reverse_client_requires_source() {
        assert!(msg().reverse_client().is_err());
    }
}
