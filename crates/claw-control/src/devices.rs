//! Device pairing and token administration.
//!
//! Thin typed wrappers over the gateway's `device.*` methods. Rotating or
//! revoking the token of the local device also updates the local token
//! cache so the next handshake uses the right credential.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::client::GatewayClient;
use crate::error::GatewayError;

/// A device waiting for operator approval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingPairing {
    /// Id to approve or reject.
    pub request_id: String,
    /// Device asking to pair.
    pub device_id: String,
    /// Device public key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    /// Name the device reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Platform the device reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    /// Requested role.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Requested scopes.
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Remote address the request came from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_ip: Option<String>,
    /// When the request was made, ms since epoch.
    #[serde(default)]
    pub ts: u64,
}

/// A device that has been approved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairedDevice {
    /// Device id.
    pub device_id: String,
    /// Name the device reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Platform the device reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    /// Roles the device may take.
    #[serde(default)]
    pub roles: Vec<String>,
    /// Scopes granted to the device.
    #[serde(default)]
    pub scopes: Vec<String>,
    /// When the device was approved, ms since epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at_ms: Option<u64>,
}

/// Result of `device.pair.list`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingList {
    /// Requests awaiting a decision.
    #[serde(default)]
    pub pending: Vec<PendingPairing>,
    /// Approved devices.
    #[serde(default)]
    pub paired: Vec<PairedDevice>,
}

/// Result of `device.token.rotate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotatedToken {
    /// Device the token belongs to.
    pub device_id: String,
    /// Role the token is bound to.
    pub role: String,
    /// New token.
    pub token: String,
    /// Scopes granted with the token.
    #[serde(default)]
    pub scopes: Vec<String>,
    /// When the token was issued, ms since epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotated_at_ms: Option<u64>,
}

/// Result of `device.token.revoke`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevokedToken {
    /// Device the token belonged to.
    pub device_id: String,
    /// Role it was bound to.
    pub role: String,
    /// When it was revoked, ms since epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at_ms: Option<u64>,
}

impl GatewayClient {
    /// List pending and approved devices.
    pub async fn list_pairings(&self) -> Result<PairingList, GatewayError> {
        self.request_as("device.pair.list", json!({})).await
    }

    /// Approve a pending pairing request.
    pub async fn approve_pairing(&self, request_id: &str) -> Result<serde_json::Value, GatewayError> {
        let result = self
            .request("device.pair.approve", json!({ "requestId": request_id }))
            .await?;
        info!(request_id, "pairing approved");
        Ok(result)
    }

    /// Reject a pending pairing request.
    pub async fn reject_pairing(&self, request_id: &str) -> Result<serde_json::Value, GatewayError> {
        let result = self
            .request("device.pair.reject", json!({ "requestId": request_id }))
            .await?;
        info!(request_id, "pairing rejected");
        Ok(result)
    }

    /// Issue a new token for `device_id` and `role`. When `device_id` is
    /// this client's own device the new token replaces the cached one.
    pub async fn rotate_token(
        &self,
        device_id: &str,
        role: &str,
        scopes: &[String],
    ) -> Result<RotatedToken, GatewayError> {
        let mut params = json!({ "deviceId": device_id, "role": role });
        if !scopes.is_empty() {
            params["scopes"] = json!(scopes);
        }
        let rotated: RotatedToken = self.request_as("device.token.rotate", params).await?;

        if self.is_local_device(&rotated.device_id) {
            match self
                .tokens()
                .set(&rotated.device_id, &rotated.role, &rotated.token, &rotated.scopes)
            {
                Ok(_) => debug!(role = %rotated.role, "cached rotated device token"),
                Err(e) => warn!(error = %e, "failed to cache rotated device token"),
            }
        }
        info!(device_id = %rotated.device_id, role = %rotated.role, "device token rotated");
        Ok(rotated)
    }

    /// Revoke the token of `device_id` for `role`. When `device_id` is this
    /// client's own device the cached token is dropped too.
    pub async fn revoke_token(&self, device_id: &str, role: &str) -> Result<RevokedToken, GatewayError> {
        let revoked: RevokedToken = self
            .request_as(
                "device.token.revoke",
                json!({ "deviceId": device_id, "role": role }),
            )
            .await?;

        if self.is_local_device(&revoked.device_id) {
            if let Err(e) = self.tokens().clear(&revoked.device_id, &revoked.role) {
                warn!(error = %e, "failed to clear revoked device token");
            }
        }
        info!(device_id = %revoked.device_id, role = %revoked.role, "device token revoked");
        Ok(revoked)
    }

    fn is_local_device(&self, device_id: &str) -> bool {
        self.options().device_auth && self.identity().ensure_identity().device_id == device_id
    }
}
