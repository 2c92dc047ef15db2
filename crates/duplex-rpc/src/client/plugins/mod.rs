//! Bundled client plugins.

pub mod debug_logger;

pub use debug_logger::DebugLogger;
