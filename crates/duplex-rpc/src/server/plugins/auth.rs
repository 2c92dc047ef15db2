//! Trivial authentication and authorization decisions.
//!
//! Incoming calls fail closed; a server that wants open access registers
//! both of these. Real deployments replace them with plugins that inspect
//! the connection or the envelope.

use async_trait::async_trait;
use duplex_core::RpcError;

use crate::message::IncomingMessage;
use crate::server::ServerPlugin;

/// Marks every call as authenticated.
#[derive(Debug, Default)]
pub struct AuthenticationSkip;

#[async_trait]
impl ServerPlugin for AuthenticationSkip {
    async fn after_decode(&self, msg: &mut IncomingMessage) -> Result<(), RpcError> {
        msg.set_authenticated(true);
        Ok(())
    }
}

/// Marks every call as authorized.
#[derive(Debug, Default)]
pub struct AuthorizeAll;

#[async_trait]
impl ServerPlugin for AuthorizeAll {
    async fn after_decode(&self, msg: &mut IncomingMessage) -> Result<(), RpcError> {
        msg.set_authorized(true);
        Ok(())
    }
}
