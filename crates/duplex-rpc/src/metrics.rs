//! Metric names recorded by the engines and the Router.
//!
//! Recording goes through the `metrics` facade; installing an exporter is up
//! to the binary (see `duplex-ws`).

/// Outgoing calls issued (counter, labels: method).
pub const RPC_CALLS_TOTAL: &str = "rpc_calls_total";
/// Outgoing calls that settled with a failure (counter, labels: method, code).
pub const RPC_CALL_FAILURES_TOTAL: &str = "rpc_call_failures_total";
/// Incoming requests processed (counter, labels: method).
pub const RPC_REQUESTS_TOTAL: &str = "rpc_requests_total";
/// Incoming requests that failed (counter, labels: method, code).
pub const RPC_ERRORS_TOTAL: &str = "rpc_errors_total";
/// Incoming request duration seconds (histogram, labels: method).
pub const RPC_REQUEST_DURATION_SECONDS: &str = "rpc_request_duration_seconds";
/// Sessions opened (counter).
pub const SESSIONS_OPENED_TOTAL: &str = "sessions_opened_total";
/// Sessions closed (counter).
pub const SESSIONS_CLOSED_TOTAL: &str = "sessions_closed_total";
/// Open sessions (gauge).
pub const SESSIONS_ACTIVE: &str = "sessions_active";
/// Frames rejected as protocol violations (counter, labels: reason).
pub const PROTOCOL_VIOLATIONS_TOTAL: &str = "protocol_violations_total";
/// Pending calls settled by bulk rejection (counter).
pub const PENDING_REJECTED_TOTAL: &str = "pending_rejected_total";
