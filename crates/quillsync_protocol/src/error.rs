//! Error types for the protocol crate.

use crate::entity::EntityKind;
use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while building or combining protocol values.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Two payloads for different entity types were combined.
    #[error("payload kind mismatch: expected {expected}, found {found}")]
    KindMismatch {
        /// Kind of the payload being merged into.
        expected: EntityKind,
        /// Kind of the incoming payload.
        found: EntityKind,
    },

    /// A write lacks its partition or ownership field.
    #[error("{entity_type} write is missing required field `{field}`")]
    MissingField {
        /// Entity type of the rejected write.
        entity_type: EntityKind,
        /// Name of the missing field.
        field: &'static str,
    },

    /// JSON serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
