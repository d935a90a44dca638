//! Canonical connect payload and its signature.

use ed25519_dalek::Signer;
use serde::{Deserialize, Serialize};

use crate::encoding::base64url_encode;
use crate::{DeviceIdentity, IdentityError};

/// Fields covered by the device signature on a connect request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAuthPayload {
    /// Device id of the signing identity.
    pub device_id: String,
    /// Client id from the connect descriptor.
    pub client_id: String,
    /// Client mode from the connect descriptor.
    pub client_mode: String,
    /// Requested role.
    pub role: String,
    /// Requested scopes, in request order.
    pub scopes: Vec<String>,
    /// Signing time in milliseconds since the Unix epoch.
    pub signed_at_ms: u64,
    /// Bearer token sent in the `auth` block, if any.
    pub token: Option<String>,
    /// Server-issued challenge nonce, if one was received.
    pub nonce: Option<String>,
}

impl DeviceAuthPayload {
    /// `v2` when a nonce is folded in, `v1` otherwise.
    #[must_use]
    pub fn version(&self) -> &'static str {
        if self.nonce.is_some() { "v2" } else { "v1" }
    }

    /// Pipe-delimited string that is actually signed.
    #[must_use]
    pub fn build_signing_string(&self) -> String {
        let scopes = self.scopes.join(",");
        let signed_at = self.signed_at_ms.to_string();
        let mut parts: Vec<&str> = vec![
            self.version(),
            &self.device_id,
            &self.client_id,
            &self.client_mode,
            &self.role,
            &scopes,
            &signed_at,
            self.token.as_deref().unwrap_or(""),
        ];
        if let Some(nonce) = &self.nonce {
            parts.push(nonce);
        }
        parts.join("|")
    }
}

/// The `device` block of a connect request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceProof {
    /// Device id.
    pub id: String,
    /// Base64url public key.
    pub public_key: String,
    /// Base64url signature over the signing string.
    pub signature: String,
    /// Signing time in milliseconds.
    pub signed_at: u64,
    /// Challenge nonce included in the signature, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

/// Sign `payload` with a base64url private key seed.
pub fn sign(private_key: &str, payload: &str) -> Result<String, IdentityError> {
    let key = ed25519_dalek::SigningKey::from_bytes(&crate::encoding::decode_key32(private_key)?);
    Ok(base64url_encode(&key.sign(payload.as_bytes()).to_bytes()))
}

/// Sign a connect payload with `identity` and package the result.
pub fn sign_device(
    identity: &DeviceIdentity,
    payload: &DeviceAuthPayload,
) -> Result<DeviceProof, IdentityError> {
    let signature = sign(&identity.private_key, &payload.build_signing_string())?;
    Ok(DeviceProof {
        id: identity.device_id.clone(),
        public_key: identity.public_key.clone(),
        signature,
        signed_at: payload.signed_at_ms,
        nonce: payload.nonce.clone(),
    })
}
