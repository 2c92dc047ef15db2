//! `/health` endpoint.

use serde::Serialize;
use std::time::Instant;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `"ok"`, or `"draining"` once shutdown has begun.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Open WebSocket connections.
    pub connections: usize,
    /// Router sessions, including ones not backed by this listener.
    pub active_sessions: usize,
    /// Registered endpoint paths.
    pub endpoints: Vec<String>,
}

/// Build a health response from live counters.
pub fn health_check(
    start_time: Instant,
    draining: bool,
    connections: usize,
    sessions: usize,
    endpoints: Vec<String>,
) -> HealthResponse {
    HealthResponse {
        status: if draining { "draining" } else { "ok" }.into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        active_sessions: sessions,
        endpoints,
    }
}
