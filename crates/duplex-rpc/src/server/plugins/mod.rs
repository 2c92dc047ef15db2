//! Bundled server plugins.

pub mod auth;
pub mod debug_logger;

pub use auth::{AuthenticationSkip, AuthorizeAll};
pub use debug_logger::DebugLogger;
