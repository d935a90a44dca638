//! Device identity for gateway control clients.
//!
//! A control client authenticates to the gateway with three pieces of
//! local state:
//!
//! - a per-installation Ed25519 keypair and the device id derived from it
//!   ([`DeviceIdentityManager`]),
//! - a signature over a canonical connect payload ([`DeviceAuthPayload`]),
//! - role-scoped device tokens issued by the gateway ([`DeviceTokenStore`]).
//!
//! All persisted state goes through [`claw_persist::KeyValueStore`], so every
//! client on a host shares the same identity and token cache.

#![forbid(unsafe_code)]

pub mod encoding;
pub mod error;
mod identity;
mod signer;
mod tokens;

pub use error::IdentityError;
pub use identity::{
    DeviceIdentity, DeviceIdentityManager, IDENTITY_KEY, derive_device_id, verify_signature,
};
pub use signer::{DeviceAuthPayload, DeviceProof, sign, sign_device};
pub use tokens::{DeviceToken, DeviceTokenStore, TOKENS_KEY, TokenEnvelope};

/// Current wall-clock time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}
