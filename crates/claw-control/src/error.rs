//! Error types for the gateway control client.

use serde_json::Value;
use thiserror::Error;

/// Errors surfaced to callers of the gateway client.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// No transport is open, so the request was never sent.
    #[error("gateway not connected")]
    NotConnected,

    /// The transport closed before a reply arrived.
    #[error("gateway closed ({code}): {reason}")]
    Closed {
        /// WebSocket close code.
        code: u16,
        /// Close reason.
        reason: String,
    },

    /// The client was stopped while the request was outstanding.
    #[error("gateway client stopped")]
    Stopped,

    /// The request completion was dropped without a result.
    #[error("connection lost before reply")]
    ConnectionLost,

    /// The gateway answered with `ok: false`.
    #[error("{message}")]
    Rejected {
        /// Server message, or a generic fallback.
        message: String,
        /// Machine-readable error code, if provided.
        code: Option<String>,
        /// Additional error details, if provided.
        details: Option<Value>,
    },

    /// A frame or payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Device identity or signing failure.
    #[error("device identity error: {0}")]
    Identity(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl GatewayError {
    /// Server error code for [`GatewayError::Rejected`].
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Rejected { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<claw_identity::IdentityError> for GatewayError {
    fn from(e: claw_identity::IdentityError) -> Self {
        Self::Identity(e.to_string())
    }
}
