//! Per-connection session state.

use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use duplex_core::ConnectionId;
use parking_lot::RwLock;

use crate::channel::Channel;
use crate::client::CallEngine;
use crate::transport::TransportPlugin;

/// Call Engine aimed back at the peer, plus the transport it sends through.
#[derive(Clone)]
pub struct ReverseClient {
    /// The engine handed to methods and external code.
    pub engine: CallEngine,
    /// The engine's transport; replies on the channel are delivered here.
    pub transport: Arc<dyn TransportPlugin>,
}

/// One routed channel.
pub struct Session {
    id: ConnectionId,
    channel: Arc<dyn Channel>,
    endpoint_path: RwLock<String>,
    reverse: OnceLock<ReverseClient>,
    opened_at: Instant,
}

impl Session {
    pub(crate) fn new(id: ConnectionId, channel: Arc<dyn Channel>, endpoint_path: String) -> Self {
        Self {
            id,
            channel,
            endpoint_path: RwLock::new(endpoint_path),
            reverse: OnceLock::new(),
            opened_at: Instant::now(),
        }
    }

    /// Connection id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Channel handle.
    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    /// Endpoint path requests on this connection are routed to.
    pub fn endpoint_path(&self) -> String {
        self.endpoint_path.read().clone()
    }

    pub(crate) fn set_endpoint_path(&self, path: String) {
        *self.endpoint_path.write() = path;
    }

    /// Reverse client, if one has been created.
    pub fn reverse(&self) -> Option<&ReverseClient> {
        self.reverse.get()
    }

    pub(crate) fn reverse_or_init(&self, init: impl FnOnce() -> ReverseClient) -> &ReverseClient {
        self.reverse.get_or_init(init)
    }

    /// Time since the session was opened.
    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }
}
