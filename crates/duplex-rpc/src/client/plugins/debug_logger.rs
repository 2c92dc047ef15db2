//! Logs every outgoing call and its outcome.

use async_trait::async_trait;
use duplex_core::RpcError;
use tracing::debug;

use crate::client::ClientPlugin;
use crate::message::OutgoingMessage;

/// Emits a `debug!` event per request, per reply, and per failure.
#[derive(Debug, Default)]
pub struct DebugLogger;

#[async_trait]
impl ClientPlugin for DebugLogger {
    async fn after_encode(&self, msg: &mut OutgoingMessage) -> Result<(), RpcError> {
        debug!(
            method = msg.method(),
            id = ?msg.call_id(),
            body = msg.request_body().unwrap_or_default(),
            "sending request"
        );
        Ok(())
    }

    async fn after_decode(&self, msg: &mut OutgoingMessage) -> Result<(), RpcError> {
        debug!(
            method = msg.method(),
            id = ?msg.call_id(),
            response = ?msg.response_object(),
            "received reply"
        );
        Ok(())
    }

    async fn exception_catch(&self, msg: &mut OutgoingMessage) -> Result<(), RpcError> {
        if let Some(err) = msg.error() {
            debug!(method = msg.method(), code = err.code, error = %err, "call failed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duplex_core::CallId;

    #[tokio::test]
    async fn never_alters_the_message() {
        let mut msg = OutgoingMessage::new("ping", vec![], Some(CallId::Number(1))).unwrap();
        msg.set_error(RpcError::network("down"));
        DebugLogger.after_encode(&mut msg).await.unwrap();
        DebugLogger.exception_catch(&mut msg).await.unwrap();
        assert!(msg.error().unwrap().is_network());
        assert!(!msg.is_claimed());
    }
}
