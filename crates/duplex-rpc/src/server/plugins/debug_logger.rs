//! Logs every incoming call and its reply.

use async_trait::async_trait;
use duplex_core::RpcError;
use tracing::debug;

use crate::message::IncomingMessage;
use crate::server::ServerPlugin;

/// Emits a `debug!` event per decoded call, per failure, and per reply.
#[derive(Debug, Default)]
pub struct DebugLogger;

#[async_trait]
impl ServerPlugin for DebugLogger {
    async fn after_decode(&self, msg: &mut IncomingMessage) -> Result<(), RpcError> {
        debug!(
            conn = %msg.connection_id(),
            path = msg.endpoint_path(),
            method = msg.method().unwrap_or_default(),
            id = ?msg.call_id(),
            "incoming call"
        );
        Ok(())
    }

    async fn exception_catch(&self, msg: &mut IncomingMessage) -> Result<(), RpcError> {
        if let Some(err) = msg.error() {
            debug!(
                conn = %msg.connection_id(),
                method = msg.method().unwrap_or_default(),
                code = err.code,
                error = %err,
                "incoming call failed"
            );
        }
        Ok(())
    }

    async fn after_encode(&self, msg: &mut IncomingMessage) -> Result<(), RpcError> {
        debug!(
            conn = %msg.connection_id(),
            body = msg.response_body().unwrap_or_default(),
            "sending reply"
        );
        Ok(())
    }
}
