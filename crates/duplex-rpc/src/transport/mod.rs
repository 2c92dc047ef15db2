//! Transport plugin contract.
//!
//! A transport plugin is the [`ClientPlugin`] that binds a Call Engine to one
//! physical channel. It owns the pending-call table: it claims transmission,
//! registers the call id before sending, and suspends until the matching
//! reply arrives through [`TransportPlugin::deliver_response`] or the channel
//! dies and [`TransportPlugin::reject_all`] settles everything.

pub mod channel;
pub mod pending;

use async_trait::async_trait;
use duplex_core::{CallId, RpcError};
use serde_json::Value;

use crate::channel::Channel;
use crate::client::ClientPlugin;
use crate::message::OutgoingMessage;

pub use channel::ChannelTransport;
pub use pending::PendingCalls;

/// Binds a Call Engine to a channel.
#[async_trait]
pub trait TransportPlugin: ClientPlugin {
    /// Route a reply frame to the pending call with the same id.
    ///
    /// A reply that matches nothing is a protocol violation: the channel is
    /// closed and the error returned.
    async fn deliver_response(&self, body: String, envelope: &Value) -> Result<(), RpcError>;

    /// Settle every pending call with `reason`. Returns how many were settled.
    fn reject_all(&self, reason: &RpcError) -> usize;

    /// Calls awaiting a reply.
    fn pending_count(&self) -> usize;
}

/// Call id echoed by a reply envelope.
pub fn response_call_id(envelope: &Value) -> Option<CallId> {
    envelope.get("id").and_then(CallId::from_value)
}

/// Hand a reply to its pending call, or report the mismatch.
pub fn route_response(pending: &PendingCalls, body: String, envelope: &Value) -> Result<(), RpcError> {
    let Some(id) = response_call_id(envelope) else {
        return Err(RpcError::invalid_request("Response carries no usable id"));
    };
    if pending.resolve(&id, body) {
        Ok(())
    } else {
        Err(RpcError::invalid_request(format!(
            "No pending call matches response id {id}"
        )))
    }
}

/// Send a claimed message and, unless it is a notification, wait for its reply.
///
/// The id is registered before the first suspension point so a fast reply
/// always finds its entry. A failed send rolls the registration back.
pub async fn transmit(
    msg: &mut OutgoingMessage,
    pending: &PendingCalls,
    channel: &dyn Channel,
) -> Result<(), RpcError> {
    let body = msg
        .request_body()
        .ok_or_else(|| RpcError::precondition("Request body missing at transmission"))?
        .to_owned();

    let Some(id) = msg.call_id().cloned() else {
        return channel.send(body).await;
    };

    let reply = pending.register(id.clone(), msg.method())?;
    if let Err(err) = channel.send(body).await {
        let _ = pending.remove(&id);
        return Err(err);
    }

    let body = reply
        .await
        .map_err(|_| RpcError::network("Transport dropped before a reply arrived"))??;
    msg.set_response_body(body);
    Ok(())
}
