//! RPC error codes and the error type shared by both call directions.
//!
//! Every failure a caller can observe is an [`RpcError`]: a numeric code, a
//! human-readable message, optional structured data, and an [`ErrorKind`]
//! telling retry logic whether the failure was local, protocol-level,
//! network-level, or raised by the remote method.

use serde_json::{Map, Value, json};

// ── Error code constants ────────────────────────────────────────────

/// Invalid JSON was received.
pub const PARSE_ERROR: i64 = -32700;
/// The JSON sent is not a valid request object.
pub const INVALID_REQUEST: i64 = -32600;
/// The method does not exist on the endpoint.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Invalid method parameters.
pub const INVALID_PARAMS: i64 = -32602;
/// Internal JSON-RPC error.
pub const INTERNAL_ERROR: i64 = -32603;
/// The caller has not been authenticated.
pub const NOT_AUTHENTICATED: i64 = -1;
/// The caller is authenticated but not allowed to call the method.
pub const NOT_AUTHORIZED: i64 = -2;
/// The request was signed for a window that has passed.
pub const REQUEST_EXPIRED: i64 = -3;
/// The channel was refused, closed, or timed out.
pub const NETWORK_ERROR: i64 = -4;
/// Code used when a method fails without choosing one.
pub const APPLICATION_ERROR: i64 = 0;

/// Broad classification of a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Local precondition violation; raised synchronously, never a wire error of its own.
    Validation,
    /// Malformed frame, body, or envelope.
    Protocol,
    /// Refused, closed, or timed-out channel.
    Network,
    /// Raised by the invoked method (or an auth decision on the callee side).
    Application,
}

impl ErrorKind {
    /// Infer the kind of a failure reported by a peer from its code.
    pub fn from_code(code: i64) -> Self {
        match code {
            PARSE_ERROR | INVALID_REQUEST | METHOD_NOT_FOUND | INVALID_PARAMS | INTERNAL_ERROR => {
                Self::Protocol
            }
            NETWORK_ERROR => Self::Network,
            _ => Self::Application,
        }
    }
}

/// RPC failure observed by a caller or produced by a callee.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct RpcError {
    /// Failure classification.
    pub kind: ErrorKind,
    /// Numeric code carried on the wire.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Optional structured details.
    pub data: Option<Value>,
}

impl RpcError {
    /// Create an error with an explicit kind and code.
    #[must_use]
    pub fn new(kind: ErrorKind, code: i64, message: impl Into<String>) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attach structured details.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Body could not be parsed as JSON.
    #[must_use]
    pub fn parse_error(detail: impl std::fmt::Display) -> Self {
        Self::new(ErrorKind::Protocol, PARSE_ERROR, format!("Parse error: {detail}"))
    }

    /// Envelope is not a valid request or response.
    #[must_use]
    pub fn invalid_request(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, INVALID_REQUEST, detail)
    }

    /// Method is not exported by the endpoint.
    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            ErrorKind::Protocol,
            METHOD_NOT_FOUND,
            format!("Method not found: {method}"),
        )
    }

    /// Parameters are of the wrong shape.
    #[must_use]
    pub fn invalid_params(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, INVALID_PARAMS, detail)
    }

    /// Internal failure while processing a call.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, INTERNAL_ERROR, message)
    }

    /// No plugin marked the incoming call as authenticated.
    #[must_use]
    pub fn not_authenticated() -> Self {
        Self::new(ErrorKind::Application, NOT_AUTHENTICATED, "Not authenticated.")
    }

    /// No plugin marked the incoming call as authorized.
    #[must_use]
    pub fn not_authorized() -> Self {
        Self::new(ErrorKind::Application, NOT_AUTHORIZED, "Not authorized.")
    }

    /// Signed request outside its replay window.
    #[must_use]
    pub fn request_expired() -> Self {
        Self::new(ErrorKind::Application, REQUEST_EXPIRED, "Request expired.")
    }

    /// Channel refused, closed, or timed out.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, NETWORK_ERROR, message)
    }

    /// Failure raised by an invoked method.
    #[must_use]
    pub fn application(code: i64, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Application, code, message)
    }

    /// Failure raised by an invoked method that did not pick a code.
    #[must_use]
    pub fn from_message(message: impl Into<String>) -> Self {
        Self::application(APPLICATION_ERROR, message)
    }

    /// Local precondition violation (programming error).
    #[must_use]
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, INTERNAL_ERROR, message)
    }

    /// Whether retrying on a fresh channel may help.
    pub fn is_network(&self) -> bool {
        self.kind == ErrorKind::Network
    }

    /// Wire-format error object: `{"message", "code"[, "data"]}`.
    pub fn to_error_object(&self) -> Value {
        let mut obj = json!({
            "message": self.message,
            "code": self.code,
        });
        if let (Some(data), Some(map)) = (&self.data, obj.as_object_mut()) {
            let _ = map.insert("data".into(), data.clone());
        }
        obj
    }

    /// Rebuild an error from a wire-format error object.
    ///
    /// The object must carry a string `message` and an integer `code`.
    pub fn from_error_object(value: &Value) -> Result<Self, Self> {
        let obj: &Map<String, Value> = value
            .as_object()
            .ok_or_else(|| Self::invalid_request("Response error member must be an object"))?;
        let message = obj
            .get("message")
            .and_then(Value::as_str)
            .ok_or_else(|| Self::invalid_request("Response error.message must be a string"))?;
        let code = obj
            .get("code")
            .and_then(Value::as_i64)
            .ok_or_else(|| Self::invalid_request("Response error.code must be an integer"))?;
        Ok(Self {
            kind: ErrorKind::from_code(code),
            code,
            message: message.to_owned(),
            data: obj.get("data").cloned(),
        })
    }
}
