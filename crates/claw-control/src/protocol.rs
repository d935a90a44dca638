//! Gateway wire protocol.
//!
//! Every frame is a JSON text message tagged by `type`: `req` from the
//! client, `res` and `event` from the gateway.

use claw_identity::DeviceProof;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GatewayError;

/// Protocol revision spoken by this client.
pub const PROTOCOL_VERSION: u32 = 3;

/// Method name of the handshake request.
pub const CONNECT_METHOD: &str = "connect";

/// Event carrying the server's challenge nonce.
pub const CHALLENGE_EVENT: &str = "connect.challenge";

/// Close code sent when the gateway rejects the handshake.
pub const CONNECT_FAILED_CLOSE_CODE: u16 = 4008;

const REQUEST_FAILED: &str = "request failed";

/// A frame in either direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum GatewayFrame {
    /// Client request.
    Req(RequestFrame),
    /// Reply to a request.
    Res(ResponseFrame),
    /// Server-pushed event.
    Event(EventFrame),
}

impl GatewayFrame {
    /// Parse an inbound text frame. Anything malformed yields `None`.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }

    /// Serialize to JSON text.
    pub fn to_json(&self) -> Result<String, GatewayError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// `{type:"req", id, method, params}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    /// Correlation id.
    pub id: String,
    /// RPC method.
    pub method: String,
    /// Method parameters.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

/// `{type:"res", id, ok, payload?, error?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    /// Correlation id of the request being answered.
    pub id: String,
    /// Whether the call succeeded.
    pub ok: bool,
    /// Result payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Error detail when `ok` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

impl ResponseFrame {
    /// Convert into the caller-facing result.
    pub fn into_result(self) -> Result<Value, GatewayError> {
        if self.ok {
            return Ok(self.payload.unwrap_or(Value::Null));
        }
        let error = self.error.unwrap_or_default();
        let message = error
            .message
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| REQUEST_FAILED.to_string());
        let code = error.code.map(|c| match c {
            Value::String(s) => s,
            other => other.to_string(),
        });
        Err(GatewayError::Rejected {
            message,
            code,
            details: error.details,
        })
    }
}

/// Error body of a failed response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorShape {
    /// Error code; usually a string, tolerated as any JSON value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<Value>,
    /// Human-readable message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Extra detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// `{type:"event", event, payload, seq?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFrame {
    /// Event name.
    pub event: String,
    /// Event body.
    #[serde(default)]
    pub payload: Value,
    /// Per-connection sequence number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    /// Opaque state version marker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_version: Option<Value>,
}

/// Client descriptor inside the connect params.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    /// Client id.
    pub id: String,
    /// Human-readable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Client version.
    pub version: String,
    /// Host platform.
    pub platform: String,
    /// Client mode.
    pub mode: String,
    /// Per-process instance id.
    pub instance_id: String,
}

/// Credentials block of the connect params.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectAuth {
    /// Bearer token: a cached device token or an explicit gateway token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Shared password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl ConnectAuth {
    /// Whether neither credential is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.token.is_none() && self.password.is_none()
    }
}

/// Parameters of the `connect` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    /// Lowest protocol revision accepted.
    pub min_protocol: u32,
    /// Highest protocol revision accepted.
    pub max_protocol: u32,
    /// Client descriptor.
    pub client: ClientInfo,
    /// Requested role.
    pub role: String,
    /// Requested scopes.
    pub scopes: Vec<String>,
    /// Signed device proof.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceProof>,
    /// Client capabilities.
    pub caps: Vec<String>,
    /// Credentials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<ConnectAuth>,
    /// User agent string.
    pub user_agent: String,
    /// Locale tag.
    pub locale: String,
}

/// Payload of the `connect.challenge` event.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChallengePayload {
    /// One-time nonce to fold into the device signature.
    #[serde(default)]
    pub nonce: Option<String>,
}

impl ChallengePayload {
    /// Extract a non-empty nonce from an event payload.
    #[must_use]
    pub fn nonce_from(payload: &Value) -> Option<String> {
        serde_json::from_value::<Self>(payload.clone())
            .ok()
            .and_then(|p| p.nonce)
            .filter(|n| !n.is_empty())
    }
}

/// Device token issued in the hello payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloAuth {
    /// New device token.
    pub device_token: String,
    /// Role it was issued for.
    #[serde(default)]
    pub role: Option<String>,
    /// Granted scopes.
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl HelloAuth {
    /// Extract the `auth` block from a hello payload, if present and valid.
    #[must_use]
    pub fn from_hello(hello: &Value) -> Option<Self> {
        let auth = hello.get("auth")?;
        serde_json::from_value::<Self>(auth.clone())
            .ok()
            .filter(|a| !a.device_token.is_empty())
    }
}
