//! # QuillSync Protocol
//!
//! Data types shared by every QuillSync component.
//!
//! This crate provides:
//! - [`Payload`], a closed tagged union of per-entity field sets
//! - [`Delta`], the minimal record of one pending local change
//! - [`ChangeKind::coalesce`], the rule for folding two changes to one entity
//! - Deterministic checksums over canonical JSON
//! - [`ConflictResolution`] strategies and [`SyncPayload`] bundles
//!
//! This is a pure data crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change;
mod checksum;
mod conflict;
mod delta;
mod entity;
mod error;
mod messages;

pub use change::{ChangeKind, Coalesced};
pub use checksum::{canonical_json, checksum, checksum_value};
pub use conflict::{ApplyOutcome, Conflict, ConflictResolution, ConflictStrategy, MergeFn, Resolved};
pub use delta::Delta;
pub use entity::{ElementFields, EntityId, EntityKind, Payload, ProjectFields, TemplateFields};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::SyncPayload;
