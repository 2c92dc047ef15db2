//! Transport plugin over an already-open channel.

use std::sync::Arc;

use async_trait::async_trait;
use duplex_core::RpcError;
use serde_json::Value;
use tracing::warn;

use crate::channel::Channel;
use crate::client::ClientPlugin;
use crate::message::OutgoingMessage;
use crate::transport::{PendingCalls, TransportPlugin, route_response, transmit};

/// Binds a Call Engine to one channel it does not own the lifecycle of.
///
/// Reverse Call Engines use this: the Router opened the channel and closes
/// it, and calls [`TransportPlugin::reject_all`] when it does.
pub struct ChannelTransport {
    channel: Arc<dyn Channel>,
    pending: PendingCalls,
}

impl ChannelTransport {
    /// Wrap a channel.
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        Self {
            channel,
            pending: PendingCalls::new(),
        }
    }

    /// Underlying channel.
    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }
}

#[async_trait]
impl ClientPlugin for ChannelTransport {
    async fn claim_transmission(&self, msg: &mut OutgoingMessage) -> Result<(), RpcError> {
        msg.claim()?;
        if !self.channel.is_open() {
            return Err(RpcError::network(format!(
                "Channel {} is closed",
                self.channel.id()
            )));
        }
        transmit(msg, &self.pending, self.channel.as_ref()).await
    }
}

#[async_trait]
impl TransportPlugin for ChannelTransport {
    async fn deliver_response(&self, body: String, envelope: &Value) -> Result<(), RpcError> {
        if let Err(err) = route_response(&self.pending, body, envelope) {
            warn!(channel = %self.channel.id(), error = %err, "protocol violation, closing channel");
            self.channel.close(&err.message).await;
            return Err(err);
        }
        Ok(())
    }

    fn reject_all(&self, reason: &RpcError) -> usize {
        self.pending.reject_all(reason)
    }

    fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
