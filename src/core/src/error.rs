use std::path::PathBuf;

use thiserror::Error;

/// Strata error types
#[derive(Error, Debug)]
pub enum StrataError {
    /// A layer tar path that cannot be read
    #[error("Invalid layer source {path}: {message}")]
    InvalidLayerSource { path: PathBuf, message: String },

    /// Empty or otherwise unusable config key
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Image reference that cannot be parsed
    #[error("Invalid reference: {0}")]
    InvalidReference(String),

    /// Base image could not be pulled or fetched
    #[error("Base image resolution failed: {reference} - {message}")]
    BaseResolutionFailed { reference: String, message: String },

    /// Registry refused a blob or manifest write
    #[error("Push rejected: {reference} - {message}")]
    PushRejected { reference: String, message: String },

    /// Local container engine reported an error
    #[error("Daemon operation failed ({step}): {message}")]
    DaemonOperationFailed { step: &'static str, message: String },

    /// Computed digest disagrees with the one reported by a backend
    #[error("Digest mismatch for {subject}: expected {expected}, got {actual}")]
    DigestMismatch {
        subject: String,
        expected: String,
        actual: String,
    },

    /// Container registry transport error
    #[error("Registry error: {registry} - {message}")]
    RegistryError { registry: String, message: String },

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for StrataError {
    fn from(err: serde_json::Error) -> Self {
        StrataError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for StrataError {
    fn from(err: serde_yaml::Error) -> Self {
        StrataError::SerializationError(err.to_string())
    }
}

impl StrataError {
    /// Shorthand for a daemon failure at the given step.
    pub fn daemon(step: &'static str, message: impl Into<String>) -> Self {
        StrataError::DaemonOperationFailed {
            step,
            message: message.into(),
        }
    }
}

/// Result type alias for strata operations
pub type Result<T> = std::result::Result<T, StrataError>;
