//! Facade wiring every component to one store and one connectivity signal.

use crate::config::EngineConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::error::EngineResult;
use crate::executor::{QueueExecutor, RemoteQueueExecutor, RemoteStore};
use crate::local::LocalApplier;
use crate::optimistic::OptimisticQueue;
use crate::queue::OperationQueue;
use crate::tracker::ChangeTracker;
use quillsync_storage::KeyValueStore;
use std::sync::Arc;
use tracing::info;

/// A change tracker, a durable operation queue and an optimistic queue
/// sharing one store and one connectivity monitor.
///
/// Both queues forward every accepted intent to the tracker. Remote deltas
/// that win reconciliation are applied to the same local state the
/// optimistic queue writes to.
pub struct SyncEngine {
    store: Arc<dyn KeyValueStore>,
    connectivity: ConnectivityMonitor,
    tracker: Arc<ChangeTracker>,
    queue: OperationQueue,
    optimistic: OptimisticQueue,
}

impl SyncEngine {
    /// Opens every component, restoring persisted state. The durable queue
    /// executes items against `remote` through a [`RemoteQueueExecutor`].
    ///
    /// The engine starts offline.
    ///
    /// # Errors
    ///
    /// Returns an error if any component fails to restore its state.
    pub fn open(
        store: Arc<dyn KeyValueStore>,
        remote: Arc<dyn RemoteStore>,
        local: Arc<dyn LocalApplier>,
        config: EngineConfig,
    ) -> EngineResult<Self> {
        let executor: Arc<dyn QueueExecutor> = Arc::new(RemoteQueueExecutor::new(Arc::clone(&remote)));
        Self::open_with_executor(store, executor, remote, local, config)
    }

    /// Like [`open`](Self::open) with a custom durable queue executor.
    ///
    /// # Errors
    ///
    /// Returns an error if any component fails to restore its state.
    pub fn open_with_executor(
        store: Arc<dyn KeyValueStore>,
        executor: Arc<dyn QueueExecutor>,
        remote: Arc<dyn RemoteStore>,
        local: Arc<dyn LocalApplier>,
        config: EngineConfig,
    ) -> EngineResult<Self> {
        let connectivity = ConnectivityMonitor::new(false);

        let tracker = Arc::new(ChangeTracker::open(Arc::clone(&store), config.tracker)?);
        tracker.attach_applier(Arc::clone(&local));

        let queue = OperationQueue::open(Arc::clone(&store), executor, config.queue)?;
        queue.attach_tracker(Arc::clone(&tracker));
        queue.attach_connectivity(&connectivity);

        let optimistic = OptimisticQueue::open(Arc::clone(&store), remote, local, config.optimistic)?;
        optimistic.attach_tracker(Arc::clone(&tracker));
        optimistic.attach_connectivity(&connectivity);

        info!(device_id = tracker.device_id(), "sync engine opened");
        Ok(Self {
            store,
            connectivity,
            tracker,
            queue,
            optimistic,
        })
    }

    /// Returns the change tracker.
    pub fn tracker(&self) -> &Arc<ChangeTracker> {
        &self.tracker
    }

    /// Returns the durable operation queue.
    pub fn queue(&self) -> &OperationQueue {
        &self.queue
    }

    /// Returns the optimistic queue.
    pub fn optimistic(&self) -> &OptimisticQueue {
        &self.optimistic
    }

    /// Returns the connectivity monitor.
    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    /// Returns the shared store.
    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    /// Publishes a connectivity change to every component.
    ///
    /// The queues also see the change synchronously, so a drain started
    /// right after this call observes the new state.
    pub fn set_online(&self, online: bool) {
        self.connectivity.set_online(online);
        self.queue.set_online(online);
        self.optimistic.set_online(online);
    }

    /// Returns the current connectivity.
    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("online", &self.is_online())
            .field("tracker", &self.tracker)
            .field("queue", &self.queue)
            .field("optimistic", &self.optimistic)
            .finish()
    }
}
