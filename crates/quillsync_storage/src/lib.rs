//! # QuillSync Storage
//!
//! Key-value persistence boundary for the QuillSync engine.
//!
//! The engine persists its pending deltas, queue items, device identifier
//! and last-sync timestamp through this crate. Stores are **opaque byte
//! stores** keyed by namespaced strings - they do not interpret the values
//! they hold.
//!
//! ## Design Principles
//!
//! - A store offers exactly three operations: `get`, `set`, `remove`
//! - No multi-key transactions are assumed or provided
//! - Must be `Send + Sync` so one store can be shared by every service
//! - Each value is written whole; a reader never observes a torn value
//!
//! ## Available Stores
//!
//! - [`InMemoryStore`] - For testing and ephemeral sessions
//! - [`FileStore`] - One file per key inside a locked directory
//!
//! ## Example
//!
//! ```rust
//! use quillsync_storage::{InMemoryStore, KeyValueStore};
//!
//! let store = InMemoryStore::new();
//! store.set("quillsync.device_id", b"device-1").unwrap();
//! assert_eq!(store.get("quillsync.device_id").unwrap(), Some(b"device-1".to_vec()));
//! store.remove("quillsync.device_id").unwrap();
//! assert_eq!(store.get("quillsync.device_id").unwrap(), None);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod file;
mod memory;
mod store;

pub use error::{StorageError, StorageResult};
pub use file::FileStore;
pub use memory::InMemoryStore;
pub use store::{validate_key, KeyValueStore};
