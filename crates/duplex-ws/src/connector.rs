//! Opening fresh channels for the reconnecting transport.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use duplex_core::RpcError;
use duplex_rpc::{Channel, ChannelEvents};
use tokio_tungstenite::connect_async;
use tracing::debug;

use crate::channel::WsChannel;
use crate::keepalive::spawn_keep_alive;

/// Opens a new channel on demand.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a channel. Resolves once it is ready to carry frames.
    async fn connect(&self) -> Result<(Arc<dyn Channel>, ChannelEvents), RpcError>;
}

/// [`Connector`] dialing a WebSocket URL.
pub struct WsConnector {
    url: String,
    keep_alive: Option<Duration>,
}

impl WsConnector {
    /// Dial `url` (for example `ws://127.0.0.1:9000/admin`).
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            keep_alive: None,
        }
    }

    /// Probe every opened channel with the given keep-alive period.
    #[must_use]
    pub fn with_keep_alive(mut self, period: Option<Duration>) -> Self {
        self.keep_alive = period;
        self
    }

    /// Target URL.
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<(Arc<dyn Channel>, ChannelEvents), RpcError> {
        let (socket, response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| RpcError::network(format!("WebSocket connect to {} failed: {e}", self.url)))?;
        debug!(url = %self.url, status = %response.status(), "websocket connected");

        let id = format!("ws_{}", uuid::Uuid::now_v7());
        let (channel, events) = WsChannel::spawn(socket, id);
        if let Some(period) = self.keep_alive {
            let _ = spawn_keep_alive(channel.clone(), period);
        }
        let channel: Arc<dyn Channel> = channel;
        Ok((channel, events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn refused_connection_is_network_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let connector = WsConnector::new(format!("ws://{addr}/"));
        let err = connector.connect().await.err().unwrap();
        assert!(err.is_network());
        assert!(err.message.contains(connector.url()));
    }

    #[test]
    fn keep_alive_is_optional() {
        let connector = WsConnector::new("ws://localhost:1/").with_keep_alive(Some(Duration::from_secs(5)));
        assert_eq!(connector.keep_alive, Some(Duration::from_secs(5)));
    }
}
