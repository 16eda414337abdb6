//! Configuration errors

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("Cannot write {path}: {reason}")]
    Write { path: String, reason: String },

    /// TOML that does not match the config schema
    #[error("Malformed config: {0}")]
    Malformed(String),

    #[error("Cannot serialize config: {0}")]
    Serialize(String),

    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("Relay url {url} rejected: {reason}")]
    InvalidRelayUrl { url: String, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}
