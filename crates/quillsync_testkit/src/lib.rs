//! # QuillSync Testkit
//!
//! Test utilities for QuillSync.
//!
//! This crate provides:
//! - An in-memory, recording [`RemoteStore`](quillsync_engine::RemoteStore)
//!   with scripted failures
//! - Scripted and seeded-flaky queue executors
//! - Temporary file stores that can be reopened to simulate restarts
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use quillsync_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn syncs_after_reconnect() {
//!     let remote = InMemoryRemote::shared();
//!     remote.fail_next(RemoteError::transient("offline"));
//!     // ... wire an engine against `remote`
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use fixtures::*;
pub use generators::*;
