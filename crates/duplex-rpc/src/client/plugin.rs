//! Client pipeline hooks.

use async_trait::async_trait;
use duplex_core::RpcError;

use crate::message::OutgoingMessage;

/// Hooks a Call Engine runs for every call, in registration order.
///
/// Every hook defaults to a no-op, so plugins only override what they need.
/// A hook returning `Err` fails the call; the error then flows through the
/// `exception_catch` hooks like any other failure.
#[async_trait]
pub trait ClientPlugin: Send + Sync {
    /// Mutate the request envelope before it is serialized.
    async fn before_encode(&self, _msg: &mut OutgoingMessage) -> Result<(), RpcError> {
        Ok(())
    }

    /// Observe or replace the serialized request.
    async fn after_encode(&self, _msg: &mut OutgoingMessage) -> Result<(), RpcError> {
        Ok(())
    }

    /// Take ownership of transmission by calling [`OutgoingMessage::claim`].
    ///
    /// The first hook that claims stops the search. A claimant either stores
    /// the raw reply or settles the message itself.
    async fn claim_transmission(&self, _msg: &mut OutgoingMessage) -> Result<(), RpcError> {
        Ok(())
    }

    /// Observe or replace the raw reply before it is decoded.
    async fn before_decode(&self, _msg: &mut OutgoingMessage) -> Result<(), RpcError> {
        Ok(())
    }

    /// Observe the decoded reply; may settle the call early.
    async fn after_decode(&self, _msg: &mut OutgoingMessage) -> Result<(), RpcError> {
        Ok(())
    }

    /// Observe a failure. Returning `Err` replaces the failure.
    ///
    /// Runs in reverse registration order.
    async fn exception_catch(&self, _msg: &mut OutgoingMessage) -> Result<(), RpcError> {
        Ok(())
    }
}
