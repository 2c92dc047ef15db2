//! Client role: the Call Engine and its plugins.

pub mod engine;
pub mod plugin;
pub mod plugins;

pub use engine::{CallEngine, WeakCallEngine};
pub use plugin::ClientPlugin;
