//! Text encoding for key material and signatures.
//!
//! Everything that leaves the process (persisted records, the `device`
//! block of a connect request) uses URL-safe base64 without padding.

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD};

use crate::IdentityError;

/// Encode bytes as unpadded base64url.
#[must_use]
pub fn base64url_encode(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Decode base64url text. Padded and standard-alphabet input is accepted
/// as well, since older records may have been written that way.
pub fn base64url_decode(input: &str) -> Result<Vec<u8>, IdentityError> {
    let input = input.trim();
    URL_SAFE_NO_PAD
        .decode(input)
        .or_else(|_| URL_SAFE.decode(input))
        .or_else(|_| STANDARD.decode(input))
        .map_err(|e| IdentityError::InvalidBase64(e.to_string()))
}

/// Decode a fixed-size key.
pub fn decode_key32(input: &str) -> Result<[u8; 32], IdentityError> {
    let raw = base64url_decode(input)?;
    <[u8; 32]>::try_from(raw.as_slice()).map_err(|_| IdentityError::InvalidKeyLength {
        expected: 32,
        actual: raw.len(),
    })
}
