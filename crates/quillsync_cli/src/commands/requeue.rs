//! Requeue-failed command implementation.
//!
//! The queues are opened against a detached remote: the durable queue starts
//! offline and no runtime exists to drain the optimistic one, so requeued
//! items wait for the client's next start.

use super::snapshot::{open_store, Snapshot};
use async_trait::async_trait;
use quillsync_engine::{
    CorrelationKey, MemoryLocalState, OperationQueue, OptimisticConfig, OptimisticQueue,
    PersistenceMode, QueueConfig, QueueExecutor, QueueItem, RemoteError, RemoteRecord, RemoteStore,
};
use quillsync_protocol::Payload;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

struct Detached;

impl Detached {
    fn error() -> RemoteError {
        RemoteError::transient("maintenance mode: remote is detached")
    }
}

#[async_trait]
impl QueueExecutor for Detached {
    async fn execute(&self, _item: &QueueItem) -> Result<(), RemoteError> {
        Err(Self::error())
    }
}

#[async_trait]
impl RemoteStore for Detached {
    async fn insert(&self, _: &str, _: &CorrelationKey, _: &Payload) -> Result<RemoteRecord, RemoteError> {
        Err(Self::error())
    }

    async fn update(&self, _: &str, _: &CorrelationKey, _: &Payload) -> Result<RemoteRecord, RemoteError> {
        Err(Self::error())
    }

    async fn delete(&self, _: &str, _: &CorrelationKey) -> Result<(), RemoteError> {
        Err(Self::error())
    }
}

/// Number of records moved back to the active queues.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RequeueResult {
    /// Durable queue items.
    pub items: usize,
    /// Optimistic operations.
    pub operations: usize,
}

/// Runs the requeue-failed command.
pub fn run(
    path: &Path,
    namespace: &str,
    include_operations: bool,
    dry_run: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(open_store(path)?);

    if dry_run {
        let snapshot = Snapshot::load(&store, namespace)?;
        println!("Dry run - no changes made");
        println!("Would requeue {} failed items", snapshot.failed.len());
        if include_operations {
            println!(
                "Would requeue {} failed operations",
                snapshot.failed_operations.len()
            );
        }
        return Ok(());
    }

    let result = requeue(store, namespace, include_operations)?;
    info!(items = result.items, operations = result.operations, "requeued failed records");
    println!("Requeued {} failed items", result.items);
    if include_operations {
        println!("Requeued {} failed operations", result.operations);
    }
    Ok(())
}

fn requeue(
    store: Arc<quillsync_storage::FileStore>,
    namespace: &str,
    include_operations: bool,
) -> Result<RequeueResult, Box<dyn std::error::Error>> {
    let mut result = RequeueResult::default();

    let queue = OperationQueue::open(
        store.clone(),
        Arc::new(Detached),
        QueueConfig::default().with_namespace(namespace),
    )?;
    result.items = queue.retry_failed()?;

    if include_operations {
        let optimistic = OptimisticQueue::open(
            store,
            Arc::new(Detached),
            Arc::new(MemoryLocalState::new()),
            OptimisticConfig::default()
                .with_namespace(namespace)
                .with_persistence(PersistenceMode::Durable),
        )?;
        optimistic.set_online(false);
        result.operations = optimistic.retry_failed()?;
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quillsync_engine::persist::{self, FAILED, QUEUE};

    #[test]
    fn failed_items_move_back_to_active() {
        let dir = tempfile::tempdir().unwrap();
        crate::commands::snapshot::seed_store(dir.path());

        let store = Arc::new(open_store(dir.path()).unwrap());
        let active: Vec<QueueItem> =
            persist::load(store.as_ref(), &persist::scoped("quillsync", QUEUE)).unwrap().unwrap();
        persist::save(store.as_ref(), &persist::scoped("quillsync", FAILED), &active).unwrap();
        persist::save(store.as_ref(), &persist::scoped("quillsync", QUEUE), &Vec::<QueueItem>::new()).unwrap();

        let result = requeue(store.clone(), "quillsync", true).unwrap();
        assert_eq!(result, RequeueResult { items: 1, operations: 0 });

        let snapshot = Snapshot::load(&store, "quillsync").unwrap();
        assert_eq!(snapshot.queue.len(), 1);
        assert!(snapshot.failed.is_empty());
        assert_eq!(snapshot.queue[0].retry.retry_count, 0);
    }

    #[test]
    fn nothing_to_requeue() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(open_store(dir.path()).unwrap());
        assert_eq!(requeue(store, "quillsync", false).unwrap(), RequeueResult::default());
    }
}
