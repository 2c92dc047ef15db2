//! # duplex-core
//!
//! Foundation types for the duplex bidirectional RPC framework:
//!
//! - [`envelope`]: JSON-RPC 2.0 request/response envelopes and frame classification
//! - [`errors`]: the [`RpcError`] type and reserved error codes
//! - [`ids`]: call-id and connection-id allocation
//! - [`endpoint_path`]: endpoint path normalization
//! - [`logging`]: `tracing` subscriber setup
//!
//! Correlation and routing logic in the other crates only depends on the
//! decoded [`serde_json::Value`] form of an envelope, never on the text codec.

#![deny(unsafe_code)]

pub mod endpoint_path;
pub mod envelope;
pub mod errors;
pub mod ids;
pub mod logging;

pub use endpoint_path::normalize_endpoint_path;
pub use envelope::{CallId, FrameKind, JSONRPC_VERSION, ResponseEnvelope};
pub use errors::{ErrorKind, RpcError};
pub use ids::{CallIdAllocator, ConnectionId, ConnectionIdAllocator};
