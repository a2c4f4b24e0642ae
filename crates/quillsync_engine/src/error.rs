//! Error types for the sync engine.

use quillsync_protocol::{EntityKind, ProtocolError};
use quillsync_storage::StorageError;
use std::time::Duration;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors returned by the tracker and the queues.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Key-value persistence failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Payloads could not be combined.
    #[error("protocol error: {0}")]
    Protocol(ProtocolError),

    /// Persisted state could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A create lacks its partition or ownership field.
    #[error("{entity_type} create is missing required field `{field}`")]
    MissingField {
        /// Entity type of the rejected write.
        entity_type: EntityKind,
        /// Name of the missing field.
        field: &'static str,
    },

    /// A request is malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// An item or operation id is unknown.
    #[error("not found: {0}")]
    NotFound(String),

    /// The remote store rejected a call.
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),
}

impl From<ProtocolError> for EngineError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::MissingField { entity_type, field } => {
                EngineError::MissingField { entity_type, field }
            }
            ProtocolError::Serialization(e) => EngineError::Serialization(e),
            other => EngineError::Protocol(other),
        }
    }
}

impl EngineError {
    /// Returns true if the failed call may succeed when retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Remote(e) => e.is_retryable(),
            EngineError::Storage(StorageError::Io(_)) => true,
            _ => false,
        }
    }
}

/// Errors returned by a [`RemoteStore`](crate::RemoteStore) or
/// [`QueueExecutor`](crate::QueueExecutor).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Network failure or server hiccup.
    #[error("transient remote failure: {0}")]
    Transient(String),

    /// The remote rejected the request and will keep rejecting it.
    #[error("remote rejected request: {0}")]
    Permanent(String),

    /// The call did not finish in time.
    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),

    /// The target record does not exist.
    #[error("{collection}/{entity_id} not found")]
    NotFound {
        /// Remote collection.
        collection: String,
        /// Correlation id.
        entity_id: String,
    },
}

impl RemoteError {
    /// Creates a transient error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    /// Creates a permanent error.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Transient(_) | RemoteError::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(RemoteError::transient("connection reset").is_retryable());
        assert!(RemoteError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!RemoteError::permanent("schema violation").is_retryable());
        assert!(!RemoteError::NotFound {
            collection: "projects".into(),
            entity_id: "p-1".into()
        }
        .is_retryable());

        assert!(EngineError::from(RemoteError::transient("x")).is_retryable());
        assert!(!EngineError::NotFound("q-1".into()).is_retryable());
    }

    #[test]
    fn missing_field_maps_through() {
        let err = EngineError::from(ProtocolError::MissingField {
            entity_type: EntityKind::Element,
            field: "project_id",
        });
        assert!(matches!(
            err,
            EngineError::MissingField {
                entity_type: EntityKind::Element,
                field: "project_id"
            }
        ));
        assert_eq!(
            err.to_string(),
            "element create is missing required field `project_id`"
        );
    }
}
