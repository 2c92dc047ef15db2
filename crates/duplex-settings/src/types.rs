//! Settings types with compiled defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DuplexSettings {
    /// Call-side (reconnecting transport) settings.
    pub client: ClientSettings,
    /// Listener settings.
    pub server: ServerSettings,
    /// Log output settings.
    pub logging: LoggingSettings,
}

impl DuplexSettings {
    /// Reject values that parse but cannot work (zero timeouts, no slots).
    pub fn validate(&self) -> Result<()> {
        fn positive(field: &'static str, value: u64) -> Result<()> {
            if value == 0 {
                return Err(SettingsError::OutOfRange {
                    field,
                    value: value.to_string(),
                    expected: ">= 1",
                });
            }
            Ok(())
        }

        positive("client.readyTimeoutMs", self.client.ready_timeout_ms)?;
        if let Some(ms) = self.client.keep_alive_ms {
            positive("client.keepAliveMs", ms)?;
        }
        if self.server.max_connections == 0 {
            return Err(SettingsError::OutOfRange {
                field: "server.maxConnections",
                value: "0".into(),
                expected: ">= 1",
            });
        }
        if self.server.max_message_size < MIN_MESSAGE_SIZE {
            return Err(SettingsError::OutOfRange {
                field: "server.maxMessageSize",
                value: self.server.max_message_size.to_string(),
                expected: ">= 1024",
            });
        }
        if let Some(ms) = self.server.keep_alive_ms {
            positive("server.keepAliveMs", ms)?;
        }
        if let Some(ms) = self.server.handler_timeout_ms {
            positive("server.handlerTimeoutMs", ms)?;
        }
        Ok(())
    }
}

/// Smallest accepted `maxMessageSize`.
const MIN_MESSAGE_SIZE: usize = 1024;

/// Settings for the reconnecting client transport.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSettings {
    /// Open a fresh channel when a call finds the current one closed.
    pub auto_reconnect: bool,
    /// How long a call waits for the channel to open.
    pub ready_timeout_ms: u64,
    /// Delay before retrying after a failed connection attempt.
    pub reconnect_delay_ms: u64,
    /// Keep-alive period; `None` disables probing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_alive_ms: Option<u64>,
}

impl ClientSettings {
    /// Ready timeout as a [`Duration`].
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    /// Reconnect delay as a [`Duration`].
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Keep-alive period as a [`Duration`].
    pub fn keep_alive(&self) -> Option<Duration> {
        self.keep_alive_ms.map(Duration::from_millis)
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            ready_timeout_ms: 10_000,
            reconnect_delay_ms: 1_000,
            keep_alive_ms: None,
        }
    }
}

/// Settings for the WebSocket listener.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` = auto-assign).
    pub port: u16,
    /// Maximum concurrently open channels.
    pub max_connections: usize,
    /// Maximum inbound message size in bytes.
    pub max_message_size: usize,
    /// Keep-alive period applied to accepted channels; `None` disables probing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_alive_ms: Option<u64>,
    /// Methods running longer than this fail with an internal error;
    /// `None` lets them run indefinitely.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handler_timeout_ms: Option<u64>,
    /// Grace period for in-flight work on shutdown.
    pub shutdown_timeout_ms: u64,
}

impl ServerSettings {
    /// Keep-alive period as a [`Duration`].
    pub fn keep_alive(&self) -> Option<Duration> {
        self.keep_alive_ms.map(Duration::from_millis)
    }

    /// Handler timeout as a [`Duration`].
    pub fn handler_timeout(&self) -> Option<Duration> {
        self.handler_timeout_ms.map(Duration::from_millis)
    }

    /// Shutdown grace period as a [`Duration`].
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_connections: 256,
            max_message_size: 16 * 1024 * 1024, // 16 MB
            keep_alive_ms: None,
            handler_timeout_ms: None,
            shutdown_timeout_ms: 30_000,
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Minimum level when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "warn".into(),
            json: false,
        }
    }
}
