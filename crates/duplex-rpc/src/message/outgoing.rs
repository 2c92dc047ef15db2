//! One call issued by a Call Engine.

use duplex_core::envelope::validate_request;
use duplex_core::{CallId, RpcError};
use serde_json::Value;

/// State of one outgoing call as it moves through the client pipeline.
///
/// Created at call time, mutated in place by pipeline hooks, consumed on
/// settlement. Setters validate their input so later stages can rely on
/// the method being a non-empty string and params being a list.
#[derive(Debug)]
pub struct OutgoingMessage {
    method: String,
    params: Vec<Value>,
    call_id: Option<CallId>,
    request_object: Option<Value>,
    request_body: Option<String>,
    response_body: Option<String>,
    response_object: Option<Value>,
    outcome: Option<Result<Value, RpcError>>,
    claimed: bool,
}

impl OutgoingMessage {
    /// Create a message. `call_id == None` makes it a notification.
    pub fn new(
        method: impl Into<String>,
        params: Vec<Value>,
        call_id: Option<CallId>,
    ) -> Result<Self, RpcError> {
        let method = method.into();
        check_method(&method)?;
        Ok(Self {
            method,
            params,
            call_id,
            request_object: None,
            request_body: None,
            response_body: None,
            response_object: None,
            outcome: None,
            claimed: false,
        })
    }

    /// Method name.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Replace the method name.
    pub fn set_method(&mut self, method: impl Into<String>) -> Result<(), RpcError> {
        let method = method.into();
        check_method(&method)?;
        self.method = method;
        Ok(())
    }

    /// Ordered parameters.
    pub fn params(&self) -> &[Value] {
        &self.params
    }

    /// Replace the parameters.
    pub fn set_params(&mut self, params: Vec<Value>) {
        self.params = params;
    }

    /// Replace the parameters from a JSON value, which must be an array.
    pub fn set_params_value(&mut self, params: Value) -> Result<(), RpcError> {
        match params {
            Value::Array(items) => {
                self.params = items;
                Ok(())
            }
            other => Err(RpcError::precondition(format!(
                "Params must be an array, got {}",
                json_type(&other)
            ))),
        }
    }

    /// Correlation id; `None` for notifications.
    pub fn call_id(&self) -> Option<&CallId> {
        self.call_id.as_ref()
    }

    /// Whether no reply is expected.
    pub fn is_notification(&self) -> bool {
        self.call_id.is_none()
    }

    /// Request envelope, once built.
    pub fn request_object(&self) -> Option<&Value> {
        self.request_object.as_ref()
    }

    /// Replace the request envelope. Malformed envelopes are rejected.
    pub fn set_request_object(&mut self, envelope: Value) -> Result<(), RpcError> {
        validate_request(&envelope)?;
        self.request_object = Some(envelope);
        Ok(())
    }

    /// Serialized request, once encoded.
    pub fn request_body(&self) -> Option<&str> {
        self.request_body.as_deref()
    }

    /// Replace the serialized request.
    pub fn set_request_body(&mut self, body: impl Into<String>) {
        self.request_body = Some(body.into());
    }

    /// Raw reply, once received.
    pub fn response_body(&self) -> Option<&str> {
        self.response_body.as_deref()
    }

    /// Store the raw reply.
    pub fn set_response_body(&mut self, body: impl Into<String>) {
        self.response_body = Some(body.into());
    }

    /// Decoded reply, once decoded.
    pub fn response_object(&self) -> Option<&Value> {
        self.response_object.as_ref()
    }

    /// Store the decoded reply.
    pub fn set_response_object(&mut self, envelope: Value) {
        self.response_object = Some(envelope);
    }

    /// Whether a hook has taken ownership of transmission.
    pub fn is_claimed(&self) -> bool {
        self.claimed
    }

    /// Take ownership of transmission. Only one claimant is allowed.
    pub fn claim(&mut self) -> Result<(), RpcError> {
        if self.claimed {
            return Err(RpcError::precondition(format!(
                "Transmission of {} was already claimed",
                self.method
            )));
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

    /// Settle with a result. A failed call cannot be turned into a success.
    pub fn set_result(&mut self, result: Value) -> Result<(), RpcError> {
        if let Some(Err(existing)) = &self.outcome {
            return Err(RpcError::precondition(format!(
                "Cannot replace failure of {} ({}) with a result",
                self.method, existing.message
            )));
        }
        self.outcome = Some(Ok(result));
        Ok(())
    }

    /// Settle with (or replace the current) failure.
    pub fn set_error(&mut self, error: RpcError) {
        self.outcome = Some(Err(error));
    }

    /// Consume the message, yielding its terminal outcome.
    pub fn into_outcome(self) -> Result<Value, RpcError> {
        self.outcome.unwrap_or_else(|| {
            Err(RpcError::internal(format!(
                "Call {} finished without an outcome",
                self.method
            )))
        })
    }
}

fn check_method(method: &str) -> Result<(), RpcError> {
    if method.is_empty() {
        return Err(RpcError::precondition("Method name must not be empty"));
    }
    Ok(())
}

pub(crate) fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duplex_core::ErrorKind;
    use serde_json::json;

    fn msg() -> OutgoingMessage {
        OutgoingMessage::new("ping", vec![json!("hello")], Some(CallId::Number(1))).unwrap()
    }

    #[test]
    fn empty_method_rejected() {
        let err = OutgoingMessage::new("", vec![], None).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
        assert!(msg().set_method("").is_err());
    }

    #[test]
    fn notification_derived_from_missing_id() {
        let n = OutgoingMessage::new("log", vec![], None).unwrap();
        assert!(n.is_notification());
        assert!(!msg().is_notification());
    }

    #[test]
    fn params_value_must_be_array() {
        let mut m = msg();
        assert!(m.set_params_value(json!({"a": 1})).is_err());
        assert_eq!(m.params(), &[json!("hello")]);
        m.set_params_value(json!([1, 2])).unwrap();
        assert_eq!(m.params(), &[json!(1), json!(2)]);
    }

    #[test]
    fn malformed_request_object_rejected() {
        let mut m = msg();
        assert!(m.set_request_object(json!({"params": []})).is_err());
        assert!(m.request_object().is_none());
        m.set_request_object(json!({"method": "ping", "params": [], "id": 1, "jsonrpc": "2.0"}))
            .unwrap();
        assert!(m.request_object().is_some());
    }

    #[test]
    fn claim_only_once() {
        let mut m = msg();
        m.claim().unwrap();
        assert!(m.is_claimed());
        assert_eq!(m.claim().unwrap_err().kind, ErrorKind::Validation);
    }

    #[test]
    fn failure_cannot_become_success() {
        let mut m = msg();
        m.set_error(RpcError::network("gone"));
        let err = m.set_result(json!(1)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
        assert!(m.error().unwrap().is_network());
    }

    #[test]
    fn failure_can_be_replaced() {
        let mut m = msg();
        m.set_error(RpcError::network("gone"));
        m.set_error(RpcError::from_message("wrapped"));
        assert_eq!(m.into_outcome().unwrap_err().message, "wrapped");
    }

    #[test]
    fn result_can_be_replaced() {
        let mut m = msg();
        m.set_result(json!(1)).unwrap();
        m.set_result(json!(2)).unwrap();
        assert_eq!(m.into_outcome().unwrap(), json!(2));
    }

    #[test]
    fn unsettled_outcome_is_internal_error() {
        let err = msg().into_outcome().unwrap_err();
        assert_eq!(err.code, duplex_core::errors::INTERNAL_ERROR);
    }
}
