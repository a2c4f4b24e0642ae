//! File-based key-value store for persistent storage.
//!
//! Layout of a store directory:
//!
//! ```text
//! <store_dir>/
//! ├─ LOCK                      # Advisory lock for single-owner access
//! ├─ quillsync.deltas.kv       # One file per key
//! └─ quillsync.queue.kv
//! ```

use crate::error::{StorageError, StorageResult};
use crate::store::{validate_key, KeyValueStore};
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

const LOCK_FILE: &str = "LOCK";
const VALUE_EXT: &str = "kv";
const TEMP_EXT: &str = "kv.tmp";

/// A file-based key-value store.
///
/// Every key is stored in its own file. Writes go to a temporary file that
/// is synced and then renamed over the old value, so a crash leaves either
/// the previous or the new value in place.
///
/// # Thread Safety
///
/// The store holds an exclusive advisory lock on its directory for its
/// whole lifetime. Writes within the process are serialized internally.
///
/// # Example
///
/// ```no_run
/// use quillsync_storage::{FileStore, KeyValueStore};
/// use std::path::Path;
///
/// let store = FileStore::open(Path::new("sync-state")).unwrap();
/// store.set("quillsync.last_sync", b"\"2024-01-01T00:00:00Z\"").unwrap();
/// ```
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
    _lock_file: File,
}

impl FileStore {
    /// Opens or creates a store directory and takes its lock.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The path exists but is not a directory
    /// - Another process holds the lock (returns [`StorageError::Locked`])
    /// - I/O errors occur
    pub fn open(path: &Path) -> StorageResult<Self> {
        if !path.exists() {
            fs::create_dir_all(path)?;
        }

        if !path.is_dir() {
            return Err(StorageError::Io(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!("store path is not a directory: {}", path.display()),
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked(path.display().to_string()));
        }

        debug!(path = %path.display(), "opened file store");

        Ok(Self {
            path: path.to_path_buf(),
            write_lock: Mutex::new(()),
            _lock_file: lock_file,
        })
    }

    /// Returns the store directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lists the keys currently stored, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    pub fn keys(&self) -> StorageResult<Vec<String>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(key) = name.strip_suffix(&format!(".{}", VALUE_EXT)) {
                keys.push(key.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn value_path(&self, key: &str) -> PathBuf {
        self.path.join(format!("{}.{}", key, VALUE_EXT))
    }

    fn temp_path(&self, key: &str) -> PathBuf {
        self.path.join(format!("{}.{}", key, TEMP_EXT))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        validate_key(key)?;
        match fs::read(self.value_path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        validate_key(key)?;
        let _guard = self.write_lock.lock();

        let temp = self.temp_path(key);
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp)?;
            file.write_all(value)?;
            file.sync_all()?;
        }
        fs::rename(&temp, self.value_path(key))?;

        debug!(key, bytes = value.len(), "value written");
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        validate_key(key)?;
        let _guard = self.write_lock.lock();
        match fs::remove_file(self.value_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_create_new() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store");

        let store = FileStore::open(&path).unwrap();
        assert!(path.join(LOCK_FILE).exists());
        assert!(store.keys().unwrap().is_empty());
    }

    #[test]
    fn file_set_and_get() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        store.set("ns.deltas", b"[]").unwrap();
        assert_eq!(store.get("ns.deltas").unwrap(), Some(b"[]".to_vec()));
        assert_eq!(store.get("ns.queue").unwrap(), None);
    }

    #[test]
    fn file_overwrite_leaves_no_temp_file() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        store.set("ns.queue", b"first").unwrap();
        store.set("ns.queue", b"second").unwrap();

        assert_eq!(store.get("ns.queue").unwrap(), Some(b"second".to_vec()));
        assert!(!dir.path().join("ns.queue.kv.tmp").exists());
        assert_eq!(store.keys().unwrap(), vec!["ns.queue".to_string()]);
    }

    #[test]
    fn file_remove() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        store.set("ns.failed", b"[1]").unwrap();
        store.remove("ns.failed").unwrap();
        assert_eq!(store.get("ns.failed").unwrap(), None);

        // Removing again is fine
        store.remove("ns.failed").unwrap();
    }

    #[test]
    fn file_persists_across_reopen() {
        let dir = tempdir().unwrap();

        {
            let store = FileStore::open(dir.path()).unwrap();
            store.set("ns.device_id", b"abc").unwrap();
        }

        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.get("ns.device_id").unwrap(), Some(b"abc".to_vec()));
    }

    #[test]
    fn file_second_open_is_locked() {
        let dir = tempdir().unwrap();
        let _first = FileStore::open(dir.path()).unwrap();

        let second = FileStore::open(dir.path());
        assert!(matches!(second, Err(StorageError::Locked(_))));
    }

    #[test]
    fn file_rejects_path_traversal_key() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        assert!(matches!(
            store.set("../outside", b"x"),
            Err(StorageError::InvalidKey { .. })
        ));
    }
}
