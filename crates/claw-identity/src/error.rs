//! Error types for identity and signing.

use thiserror::Error;

/// Errors from key handling and signing.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// Text could not be decoded as base64.
    #[error("invalid base64 encoding: {0}")]
    InvalidBase64(String),

    /// Decoded key material has the wrong length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Required length in bytes.
        expected: usize,
        /// Length that was supplied.
        actual: usize,
    },

    /// Storage port failure.
    #[error("storage error: {0}")]
    Storage(#[from] claw_persist::PersistError),
}
