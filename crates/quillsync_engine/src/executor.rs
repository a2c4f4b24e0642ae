//! Remote execution seams.
//!
//! [`RemoteStore`] is the narrow CRUD interface to the system of record.
//! [`QueueExecutor`] runs one durable queue item; [`RemoteQueueExecutor`]
//! adapts a `RemoteStore` into one.

use crate::error::RemoteError;
use crate::queue::QueueItem;
use async_trait::async_trait;
use quillsync_protocol::{ChangeKind, EntityId, EntityKind, Payload};
use std::sync::Arc;
use tracing::debug;

/// Identifies a record on the remote by its client-assigned id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationKey {
    /// Client-assigned entity id.
    pub entity_id: EntityId,
    /// Partition key for project-scoped entities.
    pub project_id: Option<String>,
}

impl CorrelationKey {
    /// Builds the key for an entity. Root entities carry no partition key.
    pub fn new(entity_type: EntityKind, entity_id: EntityId, project_id: Option<String>) -> Self {
        Self {
            entity_id,
            project_id: if entity_type.is_root() { None } else { project_id },
        }
    }
}

/// A record as stored remotely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRecord {
    /// Remote-generated id.
    pub remote_id: String,
    /// Client-assigned id the record was written with.
    pub entity_id: EntityId,
}

/// CRUD access to the remote system of record.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Inserts a record carrying `key.entity_id` as its correlation key.
    async fn insert(
        &self,
        collection: &str,
        key: &CorrelationKey,
        data: &Payload,
    ) -> Result<RemoteRecord, RemoteError>;

    /// Updates the record matching `key`.
    async fn update(
        &self,
        collection: &str,
        key: &CorrelationKey,
        data: &Payload,
    ) -> Result<RemoteRecord, RemoteError>;

    /// Deletes the record matching `key`.
    async fn delete(&self, collection: &str, key: &CorrelationKey) -> Result<(), RemoteError>;
}

/// Executes one durable queue item.
#[async_trait]
pub trait QueueExecutor: Send + Sync {
    /// Performs the item's remote side effect.
    async fn execute(&self, item: &QueueItem) -> Result<(), RemoteError>;
}

/// Runs queue items against a [`RemoteStore`].
pub struct RemoteQueueExecutor<R: ?Sized> {
    remote: Arc<R>,
}

impl<R: RemoteStore + ?Sized> RemoteQueueExecutor<R> {
    /// Wraps a remote store.
    pub fn new(remote: Arc<R>) -> Self {
        Self { remote }
    }
}

fn require_payload<'a>(item: &'a QueueItem) -> Result<&'a Payload, RemoteError> {
    item.payload
        .as_ref()
        .ok_or_else(|| RemoteError::permanent(format!("{} {} has no payload", item.action, item.id)))
}

#[async_trait]
impl<R: RemoteStore + ?Sized> QueueExecutor for RemoteQueueExecutor<R> {
    async fn execute(&self, item: &QueueItem) -> Result<(), RemoteError> {
        let collection = item.entity_type.collection();
        let scope = item.project_id.clone().or_else(|| {
            item.payload
                .as_ref()
                .and_then(Payload::partition_value)
                .map(String::from)
        });
        let key = CorrelationKey::new(item.entity_type, item.entity_id.clone(), scope);

        match item.action {
            ChangeKind::Create => {
                let payload = require_payload(item)?;
                payload
                    .validate_for_create(item.project_id.as_deref())
                    .map_err(|e| RemoteError::permanent(e.to_string()))?;
                let record = self.remote.insert(collection, &key, payload).await?;
                debug!(item_id = %item.id, remote_id = %record.remote_id, "remote insert");
            }
            ChangeKind::Update => {
                let payload = require_payload(item)?;
                self.remote.update(collection, &key, payload).await?;
            }
            ChangeKind::Delete => match self.remote.delete(collection, &key).await {
                Ok(()) | Err(RemoteError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            },
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_keys_drop_partition() {
        let key = CorrelationKey::new(EntityKind::Project, "p-1".into(), Some("x".into()));
        assert!(key.project_id.is_none());

        let key = CorrelationKey::new(EntityKind::Template, "t-1".into(), Some("p-1".into()));
        assert_eq!(key.project_id.as_deref(), Some("p-1"));
    }
}
