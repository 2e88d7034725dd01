//! Error types for the Closet engine.

use thiserror::Error;

/// Errors raised by engine operations that are not absorbed into a result
/// object (retry, batch and session sync report their failures inline).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("invalid pattern: {0}")]
    InvalidPattern(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
