//! Persistence port for control-client state.
//!
//! Device identity and cached device tokens are process-wide records that
//! every client instance on a host shares. They are written through the
//! [`KeyValueStore`] trait so the domain logic never touches the filesystem
//! directly and can be tested against [`MemoryStore`].

#![forbid(unsafe_code)]

mod error;
mod file;
mod memory;

pub use error::PersistError;
pub use file::FileStore;
pub use memory::MemoryStore;

use serde::Serialize;
use serde::de::DeserializeOwned;

/// A string-keyed store of string values.
///
/// Implementations must be safe to share between client instances.
pub trait KeyValueStore: Send + Sync {
    /// Read the value stored under `key`, if any.
    fn get(&self, key: &str) -> Result<Option<String>, PersistError>;

    /// Store `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: &str) -> Result<(), PersistError>;

    /// Remove `key`. Removing a missing key is not an error.
    fn delete(&self, key: &str) -> Result<(), PersistError>;
}

/// Read and decode a JSON record.
///
/// Returns `Ok(None)` when the key is absent.
pub fn load_json<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> Result<Option<T>, PersistError> {
    match store.get(key)? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Encode `value` as JSON and store it under `key`.
pub fn save_json<T: Serialize>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> Result<(), PersistError> {
    let raw = serde_json::to_string_pretty(value)?;
    store.set(key, &raw)
}
