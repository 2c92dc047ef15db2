//! Settings error types.

use std::path::PathBuf;

use thiserror::Error;

/// Why a settings file could not be turned into [`DuplexSettings`].
///
/// [`DuplexSettings`]: crate::DuplexSettings
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The file exists but could not be read.
    #[error("cannot read {}: {source}", path.display())]
    Read {
        /// Settings file.
        path: PathBuf,
        /// Underlying I/O failure.
        source: std::io::Error,
    },
    /// The file is not JSON.
    #[error("{} is not valid JSON: {source}", path.display())]
    Syntax {
        /// Settings file.
        path: PathBuf,
        /// Parser failure.
        source: serde_json::Error,
    },
    /// The merged values do not fit the settings schema (wrong types).
    #[error("{} does not match the settings schema: {source}", path.display())]
    Schema {
        /// Settings file.
        path: PathBuf,
        /// Deserialization failure.
        source: serde_json::Error,
    },
    /// A value parsed but is unusable.
    #[error("{field} = {value} is out of range ({expected})")]
    OutOfRange {
        /// camelCase path of the offending field, e.g. `server.maxConnections`.
        field: &'static str,
        /// Offending value.
        value: String,
        /// Accepted range.
        expected: &'static str,
    },
}

/// Result type for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;
