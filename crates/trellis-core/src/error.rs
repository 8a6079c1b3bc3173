//! # Error Types
//!
//! Configuration errors raised while reading the process environment.
//! All errors use `thiserror` for derive-based `Display` and `Error`.

use thiserror::Error;

/// Error while reading or validating configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable was present but its value could not be used.
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },

    /// A capability is enabled but a required connection parameter is absent.
    #[error("{capability} is enabled but {key} is not set")]
    Missing { capability: String, key: String },
}
