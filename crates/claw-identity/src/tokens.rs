//! Cache of gateway-issued device tokens.
//!
//! One envelope holds every role's token for a single device id. Writing a
//! token for a different device replaces the whole envelope, so tokens of a
//! superseded identity are never kept around.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use claw_persist::{KeyValueStore, load_json, save_json};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{IdentityError, now_ms};

/// Storage key of the token envelope.
pub const TOKENS_KEY: &str = "device-auth";

const ENVELOPE_VERSION: u32 = 1;

/// A role-scoped bearer token bound to one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceToken {
    /// Opaque token value.
    pub token: String,
    /// Role the token authenticates.
    pub role: String,
    /// Granted scopes, sorted and de-duplicated.
    pub scopes: BTreeSet<String>,
    /// Last write time in milliseconds.
    pub updated_at_ms: u64,
}

/// Persisted unit holding all tokens of one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenEnvelope {
    /// Format version.
    pub version: u32,
    /// Device the tokens belong to.
    pub device_id: String,
    /// Tokens keyed by role.
    pub tokens: BTreeMap<String, DeviceToken>,
}

impl TokenEnvelope {
    fn empty(device_id: &str) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            device_id: device_id.to_string(),
            tokens: BTreeMap::new(),
        }
    }
}

fn normalize_scopes<I, S>(scopes: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    scopes
        .into_iter()
        .map(|s| s.as_ref().trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Device token cache over the shared storage port.
#[derive(Clone)]
pub struct DeviceTokenStore {
    store: Arc<dyn KeyValueStore>,
}

impl DeviceTokenStore {
    /// Create a token store over the given storage port.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Read the envelope. Missing, corrupt, or unknown-version envelopes
    /// read as `None`.
    pub fn envelope(&self) -> Option<TokenEnvelope> {
        match load_json::<TokenEnvelope>(self.store.as_ref(), TOKENS_KEY) {
            Ok(Some(env)) if env.version == ENVELOPE_VERSION => Some(env),
            Ok(Some(env)) => {
                debug!(version = env.version, "ignoring token envelope with unknown version");
                None
            }
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "device token envelope unreadable");
                None
            }
        }
    }

    /// Cached token for `(device_id, role)`.
    pub fn get(&self, device_id: &str, role: &str) -> Option<DeviceToken> {
        let env = self.envelope()?;
        if env.device_id != device_id {
            return None;
        }
        env.tokens.get(role.trim()).cloned()
    }

    /// Store a token for `(device_id, role)`, replacing any previous one.
    pub fn set<I, S>(
        &self,
        device_id: &str,
        role: &str,
        token: &str,
        scopes: I,
    ) -> Result<DeviceToken, IdentityError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let role = role.trim();
        let mut env = match self.envelope() {
            Some(env) if env.device_id == device_id => env,
            Some(env) => {
                debug!(
                    previous = %env.device_id,
                    current = %device_id,
                    "discarding tokens of superseded device"
                );
                TokenEnvelope::empty(device_id)
            }
            None => TokenEnvelope::empty(device_id),
        };

        let entry = DeviceToken {
            token: token.to_string(),
            role: role.to_string(),
            scopes: normalize_scopes(scopes),
            updated_at_ms: now_ms(),
        };
        env.tokens.insert(role.to_string(), entry.clone());
        save_json(self.store.as_ref(), TOKENS_KEY, &env)?;
        Ok(entry)
    }

    /// Remove the token for `(device_id, role)`. Other roles are left
    /// alone, and an envelope of another device is not touched.
    pub fn clear(&self, device_id: &str, role: &str) -> Result<(), IdentityError> {
        let Some(mut env) = self.envelope() else {
            return Ok(());
        };
        if env.device_id != device_id {
            return Ok(());
        }
        if env.tokens.remove(role.trim()).is_none() {
            return Ok(());
        }
        save_json(self.store.as_ref(), TOKENS_KEY, &env)?;
        Ok(())
    }
}
