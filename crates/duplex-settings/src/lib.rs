//! # duplex-settings
//!
//! Configuration for duplex clients and servers, loaded from three layers
//! (in priority order):
//! 1. **Compiled defaults**: [`DuplexSettings::default()`]
//! 2. **Settings file**: `$DUPLEX_SETTINGS` or `~/.duplex/settings.json`
//! 3. **Environment variables**: `DUPLEX_*` overrides (highest priority)
//!
//! Settings are plain values handed to the transports and servers that need
//! them; there is no process-global instance.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
