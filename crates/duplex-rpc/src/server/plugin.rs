//! Server pipeline hooks.

use async_trait::async_trait;
use duplex_core::RpcError;

use crate::message::IncomingMessage;

/// Hooks a Dispatch Engine runs for every incoming call, in registration order.
///
/// Every hook defaults to a no-op. Authentication and authorization plugins
/// set the message flags in [`ServerPlugin::after_decode`].
#[async_trait]
pub trait ServerPlugin: Send + Sync {
    /// Observe or transcode the raw body before it is decoded.
    async fn before_decode(&self, _msg: &mut IncomingMessage) -> Result<(), RpcError> {
        Ok(())
    }

    /// Observe the decoded call; annotate authentication and authorization.
    async fn after_decode(&self, _msg: &mut IncomingMessage) -> Result<(), RpcError> {
        Ok(())
    }

    /// Take ownership of execution by calling [`IncomingMessage::claim`].
    ///
    /// A claimant must settle the message. The first claimant stops the search.
    async fn claim_execution(&self, _msg: &mut IncomingMessage) -> Result<(), RpcError> {
        Ok(())
    }

    /// Observe or replace a successful result.
    async fn result(&self, _msg: &mut IncomingMessage) -> Result<(), RpcError> {
        Ok(())
    }

    /// Observe a failure. Returning `Err` replaces it. Runs in reverse order.
    async fn exception_catch(&self, _msg: &mut IncomingMessage) -> Result<(), RpcError> {
        Ok(())
    }

    /// Observe or replace the encoded reply. Never runs for notifications.
    async fn after_encode(&self, _msg: &mut IncomingMessage) -> Result<(), RpcError> {
        Ok(())
    }
}
