//! Key-value store trait definition.

use crate::error::{StorageError, StorageResult};

/// Maximum key length accepted by every store.
const MAX_KEY_LEN: usize = 200;

/// A durable key-value store used by the sync engine.
///
/// Stores are **opaque byte stores**. The engine owns the format of every
/// value (JSON records) and the naming of every key (`"{namespace}.{name}"`).
///
/// # Invariants
///
/// - `get` returns exactly the bytes of the last successful `set` for the key
/// - `set` replaces the whole value; partial writes are never observable
/// - `remove` of a missing key succeeds
/// - Stores must be `Send + Sync` so services can share one instance
///
/// # Implementors
///
/// - [`super::InMemoryStore`] - For testing
/// - [`super::FileStore`] - For persistent storage
pub trait KeyValueStore: Send + Sync {
    /// Reads the value stored under `key`.
    ///
    /// Returns `Ok(None)` if nothing is stored under the key.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid or an I/O error occurs.
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid or the write fails.
    fn set(&self, key: &str, value: &[u8]) -> StorageResult<()>;

    /// Removes the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid or the removal fails.
    fn remove(&self, key: &str) -> StorageResult<()>;

    /// Returns true if a value is stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    fn contains(&self, key: &str) -> StorageResult<bool> {
        Ok(self.get(key)?.is_some())
    }
}

/// Checks that `key` is usable by every store implementation.
///
/// Keys are non-empty, at most 200 bytes, and restricted to ASCII
/// alphanumerics plus `.`, `_` and `-` so they map directly to file names.
///
/// # Errors
///
/// Returns [`StorageError::InvalidKey`] describing the first violation.
pub fn validate_key(key: &str) -> StorageResult<()> {
    let reason = if key.is_empty() {
        Some("key is empty")
    } else if key.len() > MAX_KEY_LEN {
        Some("key is longer than 200 bytes")
    } else if key.starts_with('.') {
        Some("key must not start with '.'")
    } else if !key
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
    {
        Some("key contains characters outside [A-Za-z0-9._-]")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(StorageError::InvalidKey {
            key: key.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}
