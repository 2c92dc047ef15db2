//! JSON-RPC 2.0 wire envelopes.
//!
//! Requests: `{"method", "params", "id", "jsonrpc"}` (no `id` for notifications).
//! Success: `{"result", "id", "jsonrpc"}`. Failure: `{"error": {"message", "code"}, "id", "jsonrpc"}`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::errors::RpcError;

/// Protocol version tag carried by every envelope.
pub const JSONRPC_VERSION: &str = "2.0";

/// Correlation id of one call.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CallId {
    /// Numeric id (what this crate allocates).
    Number(i64),
    /// String id (accepted from peers).
    String(String),
}

impl CallId {
    /// Read an id member; `None` for absent, `null`, or non-id values.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(Self::Number),
            Value::String(s) => Some(Self::String(s.clone())),
            _ => None,
        }
    }

    /// JSON form of the id.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Number(n) => Value::from(*n),
            Self::String(s) => Value::String(s.clone()),
        }
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => f.write_str(s),
        }
    }
}

impl From<i64> for CallId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for CallId {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

/// What an inbound frame is, judged from its top-level members.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameKind {
    /// A call (or a batch of calls) for a local endpoint.
    Request,
    /// A reply to a call issued from this side.
    Response,
    /// Neither.
    Malformed,
}

/// Classify a decoded frame.
///
/// Arrays are reported as requests so the dispatcher can reject the batch
/// with a proper error reply.
pub fn classify(frame: &Value) -> FrameKind {
    match frame {
        Value::Object(obj) if obj.contains_key("method") => FrameKind::Request,
        Value::Object(obj) if obj.contains_key("result") || obj.contains_key("error") => {
            FrameKind::Response
        }
        Value::Array(_) => FrameKind::Request,
        _ => FrameKind::Malformed,
    }
}

/// Build a request envelope. A notification (`id == None`) omits `id` entirely.
pub fn request(method: &str, params: &[Value], id: Option<&CallId>) -> Value {
    let mut obj = Map::new();
    let _ = obj.insert("method".into(), Value::String(method.to_owned()));
    let _ = obj.insert("params".into(), Value::Array(params.to_vec()));
    if let Some(id) = id {
        let _ = obj.insert("id".into(), id.to_value());
    }
    let _ = obj.insert("jsonrpc".into(), Value::String(JSONRPC_VERSION.into()));
    Value::Object(obj)
}

/// Build a success response.
pub fn success_response(id: &CallId, result: Value) -> Value {
    json!({
        "result": result,
        "id": id.to_value(),
        "jsonrpc": JSONRPC_VERSION,
    })
}

/// Build an error response. An unknown id is serialized as `null`.
pub fn error_response(id: Option<&CallId>, error: &RpcError) -> Value {
    json!({
        "error": error.to_error_object(),
        "id": id.map_or(Value::Null, CallId::to_value),
        "jsonrpc": JSONRPC_VERSION,
    })
}

/// Check that a value is a well-formed request envelope.
pub fn validate_request(value: &Value) -> Result<(), RpcError> {
    let obj = value
        .as_object()
        .ok_or_else(|| RpcError::precondition("Request envelope must be an object"))?;
    match obj.get("method") {
        Some(Value::String(m)) if !m.is_empty() => {}
        _ => return Err(RpcError::precondition("Request envelope method must be a non-empty string")),
    }
    if let Some(params) = obj.get("params") {
        if !params.is_array() {
            return Err(RpcError::precondition("Request envelope params must be an array"));
        }
    }
    if let Some(id) = obj.get("id") {
        if CallId::from_value(id).is_none() {
            return Err(RpcError::precondition(
                "Request envelope id must be a number or a string; omit it for notifications",
            ));
        }
    }
    Ok(())
}

/// A decoded and validated response envelope.
#[derive(Clone, Debug, PartialEq)]
pub enum ResponseEnvelope {
    /// `{"result": ...}`
    Success {
        /// Echoed call id.
        id: Option<CallId>,
        /// Returned value.
        result: Value,
    },
    /// `{"error": {...}}`
    Failure {
        /// Echoed call id (`None` when the callee could not identify the call).
        id: Option<CallId>,
        /// Reported failure.
        error: RpcError,
    },
}

impl ResponseEnvelope {
    /// Echoed call id.
    pub fn id(&self) -> Option<&CallId> {
        match self {
            Self::Success { id, .. } | Self::Failure { id, .. } => id.as_ref(),
        }
    }
}

/// Validate a decoded response: version tag plus exactly one of `result`/`error`.
pub fn parse_response(value: &Value) -> Result<ResponseEnvelope, RpcError> {
    let obj = value
        .as_object()
        .ok_or_else(|| RpcError::invalid_request("Response envelope must be an object"))?;

    if obj.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
        return Err(RpcError::invalid_request(format!(
            "Response envelope must carry jsonrpc \"{JSONRPC_VERSION}\""
        )));
    }

    let id = obj.get("id").and_then(CallId::from_value);
    match (obj.get("result"), obj.get("error")) {
        (Some(result), None) => Ok(ResponseEnvelope::Success {
            id,
            result: result.clone(),
        }),
        (None, Some(error)) => Ok(ResponseEnvelope::Failure {
            id,
            error: RpcError::from_error_object(error)?,
        }),
        (Some(_), Some(_)) => Err(RpcError::invalid_request(
            "Response envelope must not contain both result and error",
        )),
        (None, None) => Err(RpcError::invalid_request(
            "Response envelope must contain either result or error",
        )),
    }
}
