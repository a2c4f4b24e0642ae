//! Store key layout and JSON load/save helpers.
//!
//! Every record set is stored as one JSON document under
//! `"{namespace}.{suffix}"`.

use crate::error::EngineResult;
use quillsync_storage::KeyValueStore;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Pending deltas.
pub const DELTAS: &str = "deltas";
/// Active durable queue items.
pub const QUEUE: &str = "queue";
/// Failed durable queue items.
pub const FAILED: &str = "failed";
/// Device id.
pub const DEVICE_ID: &str = "device_id";
/// Last acknowledged sync time.
pub const LAST_SYNC: &str = "last_sync";
/// Active optimistic operations.
pub const OPERATIONS: &str = "operations";
/// Failed optimistic operations.
pub const FAILED_OPERATIONS: &str = "failed_operations";
/// Entity id to remote id map.
pub const REMOTE_IDS: &str = "remote_ids";

/// Returns the full store key for `suffix` under `namespace`.
pub fn scoped(namespace: &str, suffix: &str) -> String {
    format!("{}.{}", namespace, suffix)
}

/// Loads and decodes a JSON document. Missing keys yield `None`.
///
/// # Errors
///
/// Returns an error if the store fails or the document is malformed.
pub fn load<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> EngineResult<Option<T>> {
    match store.get(key)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Encodes and writes a JSON document.
///
/// # Errors
///
/// Returns an error if encoding or the store write fails.
pub fn save<T: Serialize + ?Sized>(store: &dyn KeyValueStore, key: &str, value: &T) -> EngineResult<()> {
    let bytes = serde_json::to_vec(value)?;
    store.set(key, &bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use quillsync_storage::{InMemoryStore, KeyValueStore};

    #[test]
    fn load_missing_is_none() {
        let store = InMemoryStore::new();
        let loaded: Option<Vec<String>> = load(&store, "ns.queue").unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn save_then_load() {
        let store = InMemoryStore::new();
        let key = scoped("ns", QUEUE);
        assert_eq!(key, "ns.queue");

        save(&store, &key, &vec!["a".to_string(), "b".to_string()]).unwrap();
        let loaded: Option<Vec<String>> = load(&store, &key).unwrap();
        assert_eq!(loaded, Some(vec!["a".to_string(), "b".to_string()]));
    }

    #[test]
    fn malformed_document_is_an_error() {
        let store = InMemoryStore::new();
        store.set("ns.deltas", b"not json").unwrap();
        assert!(load::<Vec<String>>(&store, "ns.deltas").is_err());
    }
}
