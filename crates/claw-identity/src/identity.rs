//! Per-installation device identity.

use std::sync::Arc;

use claw_persist::{KeyValueStore, load_json, save_json};
use ed25519_dalek::{Signature, SigningKey, Verifier, VerifyingKey};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::encoding::{base64url_decode, base64url_encode, decode_key32};
use crate::{IdentityError, now_ms};

/// Storage key of the persisted identity record.
pub const IDENTITY_KEY: &str = "device-identity";

const IDENTITY_VERSION: u32 = 1;

/// An Ed25519 keypair plus the id derived from its public key.
///
/// Keys are held in their base64url text form, which is also what goes on
/// the wire.
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Hex SHA-256 of the raw public key.
    pub device_id: String,
    /// Raw 32-byte public key, base64url.
    pub public_key: String,
    /// Raw 32-byte private key seed, base64url.
    pub private_key: String,
}

impl std::fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("device_id", &self.device_id)
            .field("public_key", &self.public_key)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

impl DeviceIdentity {
    /// Generate a fresh identity from OS randomness.
    #[must_use]
    pub fn generate() -> Self {
        Self::from_signing_key(&SigningKey::generate(&mut OsRng))
    }

    /// Build an identity from an existing signing key.
    #[must_use]
    pub fn from_signing_key(key: &SigningKey) -> Self {
        let public = key.verifying_key();
        Self {
            device_id: device_id_for(public.as_bytes()),
            public_key: base64url_encode(public.as_bytes()),
            private_key: base64url_encode(&key.to_bytes()),
        }
    }

    /// Decode the private key.
    pub fn signing_key(&self) -> Result<SigningKey, IdentityError> {
        Ok(SigningKey::from_bytes(&decode_key32(&self.private_key)?))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredIdentity {
    version: u32,
    device_id: String,
    public_key: String,
    private_key: String,
    created_at_ms: u64,
}

fn device_id_for(public_key: &[u8]) -> String {
    hex::encode(Sha256::digest(public_key))
}

/// Derive the device id for a base64url-encoded public key.
pub fn derive_device_id(public_key: &str) -> Result<String, IdentityError> {
    let raw = base64url_decode(public_key)?;
    Ok(device_id_for(&raw))
}

/// Check a base64url signature over `payload` against a base64url public key.
#[must_use]
pub fn verify_signature(public_key: &str, payload: &str, signature: &str) -> bool {
    let Ok(key_bytes) = decode_key32(public_key) else {
        return false;
    };
    let Ok(sig_raw) = base64url_decode(signature) else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; 64]>::try_from(sig_raw.as_slice()) else {
        return false;
    };
    let Ok(key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    key.verify(payload.as_bytes(), &Signature::from_bytes(&sig_bytes))
        .is_ok()
}

/// Loads, creates, and repairs the persisted device identity.
pub struct DeviceIdentityManager {
    store: Arc<dyn KeyValueStore>,
}

impl DeviceIdentityManager {
    /// Create a manager over the given storage port.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Return the persisted identity, creating it on first use.
    ///
    /// Never fails: unreadable or corrupt records are replaced with a new
    /// identity, and a record whose device id no longer matches its public
    /// key is rewritten with the corrected id while keeping its keys.
    pub fn ensure_identity(&self) -> DeviceIdentity {
        match self.load_existing() {
            Some(identity) => identity,
            None => self.create(),
        }
    }

    fn load_existing(&self) -> Option<DeviceIdentity> {
        let stored: StoredIdentity = match load_json(self.store.as_ref(), IDENTITY_KEY) {
            Ok(Some(stored)) => stored,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "device identity unreadable, regenerating");
                return None;
            }
        };

        if stored.version != IDENTITY_VERSION {
            warn!(version = stored.version, "unknown device identity version, regenerating");
            return None;
        }

        let Some(key) = Self::validate_keys(&stored) else {
            warn!("stored device identity has invalid key material, regenerating");
            return None;
        };

        let identity = DeviceIdentity::from_signing_key(&key);
        if identity.device_id != stored.device_id {
            info!(
                stored = %stored.device_id,
                derived = %identity.device_id,
                "repairing device id"
            );
            let repaired = StoredIdentity {
                device_id: identity.device_id.clone(),
                ..stored
            };
            if let Err(e) = save_json(self.store.as_ref(), IDENTITY_KEY, &repaired) {
                warn!(error = %e, "failed to persist repaired device identity");
            }
        }
        Some(identity)
    }

    /// Decode the stored private key and check it matches the stored
    /// public key.
    fn validate_keys(stored: &StoredIdentity) -> Option<SigningKey> {
        let seed = decode_key32(&stored.private_key).ok()?;
        let public = decode_key32(&stored.public_key).ok()?;
        let key = SigningKey::from_bytes(&seed);
        (key.verifying_key().as_bytes() == &public).then_some(key)
    }

    fn create(&self) -> DeviceIdentity {
        let identity = DeviceIdentity::generate();
        let stored = StoredIdentity {
            version: IDENTITY_VERSION,
            device_id: identity.device_id.clone(),
            public_key: identity.public_key.clone(),
            private_key: identity.private_key.clone(),
            created_at_ms: now_ms(),
        };
        match save_json(self.store.as_ref(), IDENTITY_KEY, &stored) {
            Ok(()) => debug!(device_id = %identity.device_id, "created device identity"),
            Err(e) => warn!(error = %e, "failed to persist device identity"),
        }
        identity
    }
}
