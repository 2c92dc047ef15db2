//! # duplex-ws
//!
//! WebSocket binding for duplex RPC.
//!
//! - [`channel`]: [`WsChannel`], a duplex text channel over a client or
//!   server WebSocket
//! - [`keepalive`]: ping probing plus the receive-side watchdog
//! - [`connector`]: opening fresh client channels
//! - [`reconnecting`]: [`ReconnectingTransport`], the transport plugin that
//!   reopens its channel on demand
//! - [`server`]: [`DuplexServer`], the axum listener feeding a Router
//! - [`health`], [`metrics`], [`shutdown`]: listener plumbing

#![deny(unsafe_code)]

pub mod channel;
pub mod connector;
pub mod health;
pub mod keepalive;
pub mod metrics;
pub mod reconnecting;
pub mod server;
pub mod shutdown;

pub use channel::{WsChannel, WsMessage};
pub use connector::{Connector, WsConnector};
pub use keepalive::{KEEP_ALIVE_TIMEOUT, KeepAliveResult, spawn_keep_alive};
pub use reconnecting::{ReadyState, ReconnectHook, ReconnectingTransport};
pub use server::DuplexServer;
pub use shutdown::{ShutdownCoordinator, ShutdownReport};
