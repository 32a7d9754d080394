//! Error types for Tollgate.

use thiserror::Error;

use crate::ratelimit::Algorithm;
use crate::store::Capability;

/// Errors raised while validating limiter configuration.
///
/// These are only ever produced at construction time, never from `check`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Duration string was empty or absent
    #[error("Duration string is required")]
    Missing,

    /// Duration string did not match `<integer><unit>`
    #[error("Invalid duration format: \"{0}\". Expected format: \"60s\", \"5m\", \"1h\", or \"1d\"")]
    InvalidFormat(String),

    /// Duration unit outside of s, m, h, d
    #[error("Unsupported time unit: \"{0}\"")]
    UnsupportedUnit(String),

    /// A numeric parameter was out of range
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: String,
    },
}

/// Errors raised by a counter store during a check.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The key holds a value of a different kind
    #[error("Key {key} holds a value of the wrong type")]
    WrongType { key: String },

    /// `incr` was applied to a value that is not an integer
    #[error("Value at key {key} is not an integer")]
    NotAnInteger { key: String },

    /// Persisted state could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Compare-and-swap kept losing to concurrent writers
    #[error("Gave up updating {key} after {attempts} conflicting writes")]
    Contention { key: String, attempts: usize },

    /// Any other failure reported by the backend
    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The bound store lacks a capability the algorithm needs
    #[error("{algorithm} requires the {capability} store capability")]
    Capability {
        algorithm: Algorithm,
        capability: Capability,
    },

    /// Counter store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file parse errors
    #[error("Failed to parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;

/// Result type alias for counter store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
