//! Read-only view of the sync state persisted in a store directory.

use chrono::{DateTime, Utc};
use quillsync_engine::persist::{
    self, DELTAS, DEVICE_ID, FAILED, FAILED_OPERATIONS, LAST_SYNC, OPERATIONS, QUEUE, REMOTE_IDS,
};
use quillsync_engine::{QueueItem, SyncOperation};
use quillsync_protocol::{Delta, EntityId};
use quillsync_storage::FileStore;
use std::collections::BTreeMap;
use std::path::Path;

/// Everything a client persisted under one namespace.
#[derive(Debug, Default)]
pub struct Snapshot {
    /// Every key in the store, including other namespaces.
    pub keys: Vec<String>,
    /// Device id, if the tracker ever ran.
    pub device_id: Option<String>,
    /// Time of the last acknowledged sync.
    pub last_sync: Option<DateTime<Utc>>,
    /// Pending deltas in causal order.
    pub deltas: Vec<Delta>,
    /// Active durable queue items.
    pub queue: Vec<QueueItem>,
    /// Failed durable queue items.
    pub failed: Vec<QueueItem>,
    /// Queued optimistic operations.
    pub operations: Vec<SyncOperation>,
    /// Failed optimistic operations.
    pub failed_operations: Vec<SyncOperation>,
    /// Known remote ids by entity id.
    pub remote_ids: BTreeMap<EntityId, String>,
}

/// Opens the store at `path`, refusing to create one.
pub fn open_store(path: &Path) -> Result<FileStore, Box<dyn std::error::Error>> {
    if !path.is_dir() {
        return Err(format!("No store found at {:?}", path).into());
    }
    Ok(FileStore::open(path)?)
}

impl Snapshot {
    /// Loads every record of `namespace` from `store`.
    pub fn load(store: &FileStore, namespace: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let key = |suffix: &str| persist::scoped(namespace, suffix);
        let mut deltas: Vec<Delta> = persist::load(store, &key(DELTAS))?.unwrap_or_default();
        deltas.sort_by_key(Delta::order_key);

        Ok(Self {
            keys: store.keys()?,
            device_id: persist::load(store, &key(DEVICE_ID))?,
            last_sync: persist::load(store, &key(LAST_SYNC))?,
            deltas,
            queue: persist::load(store, &key(QUEUE))?.unwrap_or_default(),
            failed: persist::load(store, &key(FAILED))?.unwrap_or_default(),
            operations: persist::load(store, &key(OPERATIONS))?.unwrap_or_default(),
            failed_operations: persist::load(store, &key(FAILED_OPERATIONS))?.unwrap_or_default(),
            remote_ids: persist::load(store, &key(REMOTE_IDS))?.unwrap_or_default(),
        })
    }
}

/// Writes a store holding one tracked project create and its queue item.
#[cfg(test)]
pub(crate) fn seed_store(dir: &Path) {
    use quillsync_engine::{
        ChangeTracker, EnqueueRequest, OperationQueue, QueueConfig, QueueExecutor, RemoteError,
        TrackerConfig,
    };
    use quillsync_protocol::{Payload, ProjectFields};
    use std::sync::Arc;

    struct Never;

    #[async_trait::async_trait]
    impl QueueExecutor for Never {
        async fn execute(&self, _item: &QueueItem) -> Result<(), RemoteError> {
            Err(RemoteError::permanent("never"))
        }
    }

    let store = Arc::new(FileStore::open(dir).unwrap());
    let payload = Payload::Project(ProjectFields {
        owner_id: Some("user-1".into()),
        title: Some("A".into()),
        ..Default::default()
    });
    let tracker = Arc::new(ChangeTracker::open(store.clone(), TrackerConfig::default()).unwrap());
    let queue = OperationQueue::open(store, Arc::new(Never), QueueConfig::default()).unwrap();
    queue.attach_tracker(tracker);
    queue.enqueue(EnqueueRequest::create("p-1", payload)).unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_what_the_engine_wrote() {
        let dir = tempfile::tempdir().unwrap();
        seed_store(dir.path());

        let store = open_store(dir.path()).unwrap();
        let snapshot = Snapshot::load(&store, "quillsync").unwrap();
        assert!(snapshot.device_id.is_some());
        assert_eq!(snapshot.deltas.len(), 1);
        assert_eq!(snapshot.queue.len(), 1);
        assert!(snapshot.failed.is_empty());
        assert!(snapshot.keys.contains(&"quillsync.deltas".to_string()));
    }

    #[test]
    fn other_namespaces_are_empty() {
        let dir = tempfile::tempdir().unwrap();
        seed_store(dir.path());

        let store = open_store(dir.path()).unwrap();
        let snapshot = Snapshot::load(&store, "other").unwrap();
        assert!(snapshot.device_id.is_none());
        assert!(snapshot.deltas.is_empty());
        assert!(!snapshot.keys.is_empty());
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(open_store(&dir.path().join("absent")).is_err());
    }
}
