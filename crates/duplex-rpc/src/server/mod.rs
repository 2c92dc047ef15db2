//! Server role: endpoints, the Dispatch Engine and its plugins.

pub mod endpoint;
pub mod engine;
pub mod plugin;
pub mod plugins;

pub use endpoint::{CallContext, Endpoint, FnHandler, MethodHandler, handler_fn};
pub use engine::DispatchEngine;
pub use plugin::ServerPlugin;
