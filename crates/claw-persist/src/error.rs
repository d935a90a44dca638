//! Error types for the persistence port.

use thiserror::Error;

/// Errors raised by [`crate::KeyValueStore`] implementations.
#[derive(Debug, Error)]
pub enum PersistError {
    /// Key contains characters that cannot map to a storage location.
    #[error("invalid storage key: {0}")]
    InvalidKey(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored value could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
