//! Durable operation queue.
//!
//! Wraps mutation intents with retry bookkeeping, priorities and
//! inter-item dependencies, persists itself after every change, and drains
//! in bounded batches whenever the queue is online.
//!
//! ## Item lifecycle
//!
//! ```text
//! enqueue ──► pending ──(deps satisfied, backoff elapsed)──► attempting
//!                ▲                                              │
//!                └──── retry_count < max_retries ◄── failure ◄──┤
//!                                                               │
//!      failed set ◄── retry_count ≥ max_retries or permanent ◄──┤
//!                                                               │
//!                                              removed ◄── success
//! ```
//!
//! A dependency is satisfied once its id is in neither the active nor the
//! failed set. Items for one entity run in enqueue order, and none runs
//! while the entity has an item in the failed set. Draining is
//! single-flight; concurrent calls return at once.

use crate::config::QueueConfig;
use crate::connectivity::{forward_transitions, ConnectivityMonitor};
use crate::drain::{spawn_after, DrainGuard};
use crate::error::{EngineError, EngineResult, RemoteError};
use crate::executor::QueueExecutor;
use crate::intent::{fold_intent, Enqueued, Priority};
use crate::persist::{self, FAILED, QUEUE};
use crate::retry::RetryState;
use crate::tracker::ChangeTracker;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use quillsync_protocol::{ChangeKind, EntityId, EntityKind, Payload, ProtocolError};
use quillsync_storage::KeyValueStore;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// A durable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Item id.
    pub id: String,
    /// Mutation to perform remotely.
    pub action: ChangeKind,
    /// Entity type.
    pub entity_type: EntityKind,
    /// Entity id.
    pub entity_id: EntityId,
    /// Partition key for project-scoped entities.
    #[serde(default)]
    pub project_id: Option<String>,
    /// Payload for creates and updates.
    #[serde(default)]
    pub payload: Option<Payload>,
    /// Retry bookkeeping.
    #[serde(flatten)]
    pub retry: RetryState,
    /// Scheduling priority.
    #[serde(default)]
    pub priority: Priority,
    /// Item ids that must finish first.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Enqueue time.
    pub timestamp: DateTime<Utc>,
    /// Enqueue order tie-breaker.
    #[serde(default)]
    pub sequence: u64,
    #[serde(skip)]
    not_before: Option<Instant>,
}

impl QueueItem {
    fn is_ready(&self, now: Instant) -> bool {
        self.not_before.map_or(true, |t| t <= now)
    }

    fn is_for(&self, entity_type: EntityKind, entity_id: &EntityId) -> bool {
        self.entity_type == entity_type && &self.entity_id == entity_id
    }
}

/// A request to enqueue one mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueRequest {
    /// Mutation kind.
    pub action: ChangeKind,
    /// Entity type.
    pub entity_type: EntityKind,
    /// Entity id.
    pub entity_id: EntityId,
    /// Partition key for project-scoped entities.
    pub project_id: Option<String>,
    /// Payload for creates and updates.
    pub payload: Option<Payload>,
    /// Scheduling priority.
    pub priority: Priority,
    /// Item ids that must finish first.
    pub dependencies: Vec<String>,
}

impl EnqueueRequest {
    /// A create. The entity type is taken from the payload.
    pub fn create(entity_id: impl Into<EntityId>, payload: Payload) -> Self {
        Self {
            action: ChangeKind::Create,
            entity_type: payload.kind(),
            entity_id: entity_id.into(),
            project_id: None,
            payload: Some(payload),
            priority: Priority::Normal,
            dependencies: Vec::new(),
        }
    }

    /// An update carrying the changed fields.
    pub fn update(entity_id: impl Into<EntityId>, payload: Payload) -> Self {
        Self {
            action: ChangeKind::Update,
            ..Self::create(entity_id, payload)
        }
    }

    /// A delete.
    pub fn delete(entity_type: EntityKind, entity_id: impl Into<EntityId>) -> Self {
        Self {
            action: ChangeKind::Delete,
            entity_type,
            entity_id: entity_id.into(),
            project_id: None,
            payload: None,
            priority: Priority::Normal,
            dependencies: Vec::new(),
        }
    }

    /// Sets the partition key. Without one, the payload's partition field
    /// is used.
    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Adds a dependency on another item.
    pub fn with_dependency(mut self, item_id: impl Into<String>) -> Self {
        self.dependencies.push(item_id.into());
        self
    }

    fn validate(&self) -> EngineResult<()> {
        match (&self.action, &self.payload) {
            (ChangeKind::Create | ChangeKind::Update, None) => Err(EngineError::InvalidRequest(
                format!("{} of {} requires a payload", self.action, self.entity_id),
            )),
            (_, Some(payload)) if payload.kind() != self.entity_type => {
                Err(ProtocolError::KindMismatch {
                    expected: self.entity_type,
                    found: payload.kind(),
                }
                .into())
            }
            _ => Ok(()),
        }
    }
}

/// Snapshot published to subscribers after every change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStatus {
    /// Connectivity as seen by the queue.
    pub online: bool,
    /// A drain is running.
    pub processing: bool,
    /// Items in the active set.
    pub active: usize,
    /// Items in the failed set.
    pub failed: usize,
    /// Most recent executor error.
    pub last_error: Option<String>,
}

/// Counters for one drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Executor calls made.
    pub attempted: usize,
    /// Items removed after success.
    pub succeeded: usize,
    /// Items scheduled for another attempt.
    pub retried: usize,
    /// Items moved to the failed set.
    pub failed: usize,
}

#[derive(Default)]
struct QueueState {
    active: Vec<QueueItem>,
    failed: Vec<QueueItem>,
    in_flight: HashSet<String>,
    cancelled: HashSet<String>,
    next_sequence: u64,
    last_error: Option<String>,
}

impl QueueState {
    fn unfinished_ids(&self) -> HashSet<&str> {
        self.active
            .iter()
            .chain(self.failed.iter())
            .map(|i| i.id.as_str())
            .collect()
    }

    fn enqueue(&mut self, mut request: EnqueueRequest, config: &QueueConfig) -> EngineResult<Enqueued> {
        let (entity_type, entity_id) = (request.entity_type, request.entity_id.clone());
        let newest = self.active.iter().rposition(|i| i.is_for(entity_type, &entity_id));

        match newest {
            Some(idx) if self.in_flight.contains(&self.active[idx].id) => {
                let blocker = self.active[idx].id.clone();
                if !request.dependencies.contains(&blocker) {
                    request.dependencies.push(blocker);
                }
            }
            Some(idx) => return Self::fold_into(&mut self.active, idx, request, config),
            // A failed item keeps its entity's place in line; later intents
            // fold into it and wait for retry_failed or clear_item.
            None => {
                let failed = self.failed.iter().rposition(|i| i.is_for(entity_type, &entity_id));
                if let Some(idx) = failed {
                    return Self::fold_into(&mut self.failed, idx, request, config);
                }
            }
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let id = uuid::Uuid::new_v4().to_string();
        self.active.push(QueueItem {
            id: id.clone(),
            action: request.action,
            entity_type: request.entity_type,
            entity_id: request.entity_id,
            project_id: request.project_id,
            payload: request.payload,
            retry: RetryState::new(config.max_retries),
            priority: request.priority,
            dependencies: request.dependencies,
            timestamp: Utc::now(),
            sequence,
            not_before: None,
        });
        Ok(Enqueued::New(id))
    }

    fn fold_into(
        items: &mut Vec<QueueItem>,
        idx: usize,
        request: EnqueueRequest,
        config: &QueueConfig,
    ) -> EngineResult<Enqueued> {
        let item = &mut items[idx];
        let keep = fold_intent(
            &mut item.action,
            &mut item.payload,
            request.action,
            request.payload.as_ref(),
        )?;
        if !keep {
            let removed = items.remove(idx);
            return Ok(Enqueued::Cancelled(removed.id));
        }
        if request.project_id.is_some() {
            item.project_id = request.project_id;
        }
        item.priority = config.priority_weights.max(item.priority, request.priority);
        for dep in request.dependencies {
            if dep != item.id && !item.dependencies.contains(&dep) {
                item.dependencies.push(dep);
            }
        }
        Ok(Enqueued::Merged(item.id.clone()))
    }

    /// An item waits while a dependency is unfinished, while its entity has
    /// a failed or in-flight item, or while an older active item for the
    /// same entity exists.
    fn is_blocked(&self, item: &QueueItem, unfinished: &HashSet<&str>) -> bool {
        let same_entity =
            |other: &QueueItem| other.id != item.id && other.is_for(item.entity_type, &item.entity_id);
        item.dependencies.iter().any(|d| unfinished.contains(d.as_str()))
            || self.failed.iter().any(|o| same_entity(o))
            || self
                .active
                .iter()
                .filter(|o| same_entity(o))
                .any(|o| o.sequence < item.sequence || self.in_flight.contains(&o.id))
    }

    fn next_batch(&self, config: &QueueConfig, now: Instant) -> Vec<QueueItem> {
        let unfinished = self.unfinished_ids();
        let mut eligible: Vec<&QueueItem> = self
            .active
            .iter()
            .filter(|i| !self.in_flight.contains(&i.id))
            .filter(|i| i.is_ready(now))
            .filter(|i| !self.is_blocked(i, &unfinished))
            .collect();
        eligible.sort_by_key(|i| {
            config
                .priority_weights
                .order_key(i.priority, i.timestamp, i.sequence)
        });
        eligible
            .into_iter()
            .take(config.batch_size)
            .cloned()
            .collect()
    }

    /// Delay until the next drain is worth running, if any.
    fn next_wake(&self, config: &QueueConfig, now: Instant) -> Option<Duration> {
        let unfinished = self.unfinished_ids();
        let mut earliest: Option<Duration> = None;
        for item in &self.active {
            if self.in_flight.contains(&item.id) || self.is_blocked(item, &unfinished) {
                continue;
            }
            match item.not_before {
                Some(at) if at > now => {
                    let wait = at - now;
                    earliest = Some(earliest.map_or(wait, |e| e.min(wait)));
                }
                _ => return Some(config.drain_interval),
            }
        }
        earliest
    }
}

struct QueueInner {
    config: QueueConfig,
    store: Arc<dyn KeyValueStore>,
    executor: Arc<dyn QueueExecutor>,
    active_key: String,
    failed_key: String,
    state: Mutex<QueueState>,
    tracker: RwLock<Option<Arc<ChangeTracker>>>,
    draining: AtomicBool,
    online: AtomicBool,
    status_tx: watch::Sender<QueueStatus>,
}

impl QueueInner {
    fn persist(&self, state: &QueueState) -> EngineResult<()> {
        persist::save(self.store.as_ref(), &self.active_key, &state.active)?;
        persist::save(self.store.as_ref(), &self.failed_key, &state.failed)
    }
}

/// Persistent, dependency-aware queue of mutation intents.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct OperationQueue {
    inner: Arc<QueueInner>,
}

impl OperationQueue {
    /// Opens the queue, restoring active and failed items from `store`.
    ///
    /// The queue starts offline; call [`set_online`](Self::set_online) or
    /// [`attach_connectivity`](Self::attach_connectivity).
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails or holds malformed records.
    pub fn open(
        store: Arc<dyn KeyValueStore>,
        executor: Arc<dyn QueueExecutor>,
        config: QueueConfig,
    ) -> EngineResult<Self> {
        let active_key = persist::scoped(&config.namespace, QUEUE);
        let failed_key = persist::scoped(&config.namespace, FAILED);
        let active: Vec<QueueItem> = persist::load(store.as_ref(), &active_key)?.unwrap_or_default();
        let failed: Vec<QueueItem> = persist::load(store.as_ref(), &failed_key)?.unwrap_or_default();
        let next_sequence = active
            .iter()
            .chain(failed.iter())
            .map(|i| i.sequence + 1)
            .max()
            .unwrap_or(0);

        if !active.is_empty() || !failed.is_empty() {
            info!(active = active.len(), failed = failed.len(), "restored operation queue");
        }

        let (status_tx, _) = watch::channel(QueueStatus {
            active: active.len(),
            failed: failed.len(),
            ..Default::default()
        });

        Ok(Self {
            inner: Arc::new(QueueInner {
                config,
                store,
                executor,
                active_key,
                failed_key,
                state: Mutex::new(QueueState {
                    active,
                    failed,
                    next_sequence,
                    ..Default::default()
                }),
                tracker: RwLock::new(None),
                draining: AtomicBool::new(false),
                online: AtomicBool::new(false),
                status_tx,
            }),
        })
    }

    /// Forwards every enqueued intent to `tracker`.
    pub fn attach_tracker(&self, tracker: Arc<ChangeTracker>) {
        *self.inner.tracker.write() = Some(tracker);
    }

    /// Follows `monitor`; an offline to online transition starts a drain.
    pub fn attach_connectivity(&self, monitor: &ConnectivityMonitor) {
        self.set_online(monitor.is_online());
        let weak = Arc::downgrade(&self.inner);
        forward_transitions(monitor, move |online| match weak.upgrade() {
            Some(inner) => {
                OperationQueue { inner }.set_online(online);
                true
            }
            None => false,
        });
    }

    /// Returns the queue configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Returns true if the queue considers itself online.
    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::Acquire)
    }

    /// Sets connectivity. Going online starts a drain.
    pub fn set_online(&self, online: bool) {
        let was = self.inner.online.swap(online, Ordering::AcqRel);
        if was == online {
            return;
        }
        info!(online, "operation queue connectivity changed");
        self.notify();
        if online {
            self.schedule_drain(Duration::ZERO);
        }
    }

    /// Returns the current status.
    pub fn status(&self) -> QueueStatus {
        let state = self.inner.state.lock();
        self.snapshot(&state)
    }

    /// Returns a receiver that sees a fresh status after every change.
    pub fn subscribe(&self) -> watch::Receiver<QueueStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Returns active items in execution order.
    pub fn items(&self) -> Vec<QueueItem> {
        let state = self.inner.state.lock();
        let weights = self.inner.config.priority_weights;
        let mut items = state.active.clone();
        items.sort_by_key(|i| weights.order_key(i.priority, i.timestamp, i.sequence));
        items
    }

    /// Returns items in the failed set.
    pub fn failed_items(&self) -> Vec<QueueItem> {
        self.inner.state.lock().failed.clone()
    }

    /// Returns an active or failed item by id.
    pub fn get(&self, id: &str) -> Option<QueueItem> {
        let state = self.inner.state.lock();
        state
            .active
            .iter()
            .chain(state.failed.iter())
            .find(|i| i.id == id)
            .cloned()
    }

    fn snapshot(&self, state: &QueueState) -> QueueStatus {
        QueueStatus {
            online: self.is_online(),
            processing: self.inner.draining.load(Ordering::Acquire),
            active: state.active.len(),
            failed: state.failed.len(),
            last_error: state.last_error.clone(),
        }
    }

    fn notify(&self) {
        let status = {
            let state = self.inner.state.lock();
            self.snapshot(&state)
        };
        self.inner.status_tx.send_replace(status);
    }

    fn schedule_drain(&self, delay: Duration) {
        let queue = self.clone();
        spawn_after(delay, async move {
            if let Err(err) = queue.process_queue().await {
                error!(error = %err, "operation queue drain failed");
            }
        });
    }

    /// Enqueues an intent.
    ///
    /// An intent for an entity whose newest item is still pending is folded
    /// into that item; one whose newest item is in flight gets a dependency
    /// on it. With no active item, an intent folds into the entity's failed
    /// item, if any, and stays in the failed set with it. The intent is
    /// forwarded to the attached tracker, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the request is malformed or persisting fails.
    pub fn enqueue(&self, request: EnqueueRequest) -> EngineResult<Enqueued> {
        request.validate()?;
        let inner = &self.inner;

        let outcome = {
            let mut state = inner.state.lock();
            let outcome = state.enqueue(request.clone(), &inner.config)?;
            inner.persist(&state)?;
            outcome
        };
        debug!(
            item_id = outcome.id(),
            entity_id = %request.entity_id,
            action = %request.action,
            outcome = ?outcome,
            "enqueued intent"
        );

        self.forward_to_tracker(request)?;
        self.notify();
        if self.is_online() {
            self.schedule_drain(Duration::ZERO);
        }
        Ok(outcome)
    }

    fn forward_to_tracker(&self, request: EnqueueRequest) -> EngineResult<()> {
        let Some(tracker) = self.inner.tracker.read().clone() else {
            return Ok(());
        };
        match (request.action, request.payload) {
            (ChangeKind::Create, Some(payload)) => {
                tracker.track_create(request.entity_id, payload)?;
            }
            (ChangeKind::Update, Some(payload)) => {
                tracker.track_update(request.entity_id, payload.field_names(), None, payload)?;
            }
            (ChangeKind::Delete, _) => {
                tracker.track_delete(request.entity_type, request.entity_id)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Runs one bounded batch of eligible items.
    ///
    /// Does nothing while offline or while another drain is running. When
    /// work remains, another drain is scheduled after `drain_interval` or at
    /// the earliest backoff expiry.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue state cannot be persisted.
    pub async fn process_queue(&self) -> EngineResult<DrainReport> {
        let inner = &self.inner;
        if !self.is_online() {
            debug!("operation queue offline; drain skipped");
            return Ok(DrainReport::default());
        }
        let Some(guard) = DrainGuard::try_acquire(&inner.draining) else {
            debug!("operation queue drain already running");
            return Ok(DrainReport::default());
        };
        self.notify();

        let batch = {
            let mut state = inner.state.lock();
            let batch = state.next_batch(&inner.config, Instant::now());
            for item in &batch {
                state.in_flight.insert(item.id.clone());
            }
            batch
        };
        if !batch.is_empty() {
            info!(batch = batch.len(), "draining operation queue");
        }

        let mut report = DrainReport::default();
        let mut remaining = batch.into_iter();
        while let Some(item) = remaining.next() {
            if !self.is_online() {
                let mut state = inner.state.lock();
                state.in_flight.remove(&item.id);
                for rest in remaining.by_ref() {
                    state.in_flight.remove(&rest.id);
                }
                debug!("went offline mid-drain");
                break;
            }

            report.attempted += 1;
            let timeout = inner.config.execute_timeout;
            let result = match tokio::time::timeout(timeout, inner.executor.execute(&item)).await {
                Ok(result) => result,
                Err(_) => Err(RemoteError::Timeout(timeout)),
            };

            let mut state = inner.state.lock();
            state.in_flight.remove(&item.id);
            if state.cancelled.remove(&item.id) {
                debug!(item_id = %item.id, "result ignored for cleared item");
                continue;
            }
            let Some(idx) = state.active.iter().position(|i| i.id == item.id) else {
                continue;
            };

            match result {
                Ok(()) => {
                    state.active.remove(idx);
                    report.succeeded += 1;
                    debug!(item_id = %item.id, entity_id = %item.entity_id, "item succeeded");
                }
                Err(err) => {
                    let message = err.to_string();
                    state.last_error = Some(message.clone());
                    let entry = &mut state.active[idx];
                    let exhausted = entry.retry.record_failure(message.clone());
                    let retry_count = entry.retry.retry_count;

                    if exhausted || !err.is_retryable() {
                        let moved = state.active.remove(idx);
                        error!(
                            item_id = %moved.id,
                            entity_id = %moved.entity_id,
                            retry_count,
                            error = %message,
                            "item moved to failed set"
                        );
                        state.failed.push(moved);
                        report.failed += 1;
                    } else {
                        let delay = inner.config.backoff().delay(retry_count);
                        entry.not_before = Some(Instant::now() + delay);
                        warn!(
                            item_id = %item.id,
                            entity_id = %item.entity_id,
                            retry_count,
                            delay_ms = delay.as_millis() as u64,
                            error = %message,
                            "item failed; will retry"
                        );
                        report.retried += 1;
                    }
                }
            }
        }

        let wake = {
            let state = inner.state.lock();
            inner.persist(&state)?;
            state.next_wake(&inner.config, Instant::now())
        };
        drop(guard);
        self.notify();

        if let Some(delay) = wake {
            if self.is_online() {
                self.schedule_drain(delay);
            }
        }
        Ok(report)
    }

    /// Moves every failed item back to the active set with a fresh retry
    /// budget and starts a drain. Returns the number of items moved.
    ///
    /// # Errors
    ///
    /// Returns an error if persisting fails.
    pub fn retry_failed(&self) -> EngineResult<usize> {
        let moved = {
            let mut state = self.inner.state.lock();
            let mut failed = std::mem::take(&mut state.failed);
            for item in &mut failed {
                item.retry.reset();
                item.not_before = None;
            }
            let moved = failed.len();
            state.active.append(&mut failed);
            self.inner.persist(&state)?;
            moved
        };
        info!(moved, "requeued failed items");
        self.notify();
        if moved > 0 && self.is_online() {
            self.schedule_drain(Duration::ZERO);
        }
        Ok(moved)
    }

    /// Removes an item from the active or failed set.
    ///
    /// The result of an in-flight attempt for a cleared item is ignored.
    /// Returns false if no such item exists.
    ///
    /// # Errors
    ///
    /// Returns an error if persisting fails.
    pub fn clear_item(&self, id: &str) -> EngineResult<bool> {
        let found = {
            let mut state = self.inner.state.lock();
            let before = state.active.len() + state.failed.len();
            state.active.retain(|i| i.id != id);
            state.failed.retain(|i| i.id != id);
            let found = state.active.len() + state.failed.len() < before;
            if found && state.in_flight.contains(id) {
                state.cancelled.insert(id.to_string());
            }
            if found {
                self.inner.persist(&state)?;
            }
            found
        };
        if found {
            debug!(item_id = id, "cleared item");
            self.notify();
        }
        Ok(found)
    }
}

impl std::fmt::Debug for OperationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationQueue")
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use quillsync_protocol::{ElementFields, ProjectFields};
    use quillsync_storage::InMemoryStore;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<QueueItem>>,
        fail_with: Mutex<Option<RemoteError>>,
    }

    #[async_trait]
    impl QueueExecutor for Recorder {
        async fn execute(&self, item: &QueueItem) -> Result<(), RemoteError> {
            self.calls.lock().push(item.clone());
            match self.fail_with.lock().clone() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
    }

    impl Recorder {
        fn entity_ids(&self) -> Vec<String> {
            self.calls
                .lock()
                .iter()
                .map(|i| i.entity_id.to_string())
                .collect()
        }
    }

    fn project(title: &str) -> Payload {
        Payload::Project(ProjectFields {
            owner_id: Some("user-1".into()),
            title: Some(title.into()),
            ..Default::default()
        })
    }

    fn open(recorder: Arc<Recorder>) -> (Arc<InMemoryStore>, OperationQueue) {
        let store = Arc::new(InMemoryStore::new());
        let config = QueueConfig::default()
            .with_retry_delay(Duration::from_secs(1))
            .with_max_retries(3);
        let queue = OperationQueue::open(store.clone(), recorder, config).unwrap();
        (store, queue)
    }

    #[tokio::test(start_paused = true)]
    async fn offline_enqueue_waits_for_connectivity() {
        let recorder = Arc::new(Recorder::default());
        let (_, queue) = open(recorder.clone());

        queue.enqueue(EnqueueRequest::create("p-1", project("A"))).unwrap();
        assert!(queue.process_queue().await.unwrap() == DrainReport::default());
        assert_eq!(queue.status().active, 1);

        queue.set_online(true);
        let report = queue.process_queue().await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(recorder.entity_ids(), vec!["p-1"]);
        assert_eq!(queue.status().active, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fifo_within_priority() {
        let recorder = Arc::new(Recorder::default());
        let (_, queue) = open(recorder.clone());

        queue
            .enqueue(EnqueueRequest::create("c", project("C")).with_priority(Priority::Low))
            .unwrap();
        queue
            .enqueue(EnqueueRequest::create("a", project("A")).with_priority(Priority::High))
            .unwrap();
        queue
            .enqueue(EnqueueRequest::create("b", project("B")).with_priority(Priority::High))
            .unwrap();

        queue.set_online(true);
        queue.process_queue().await.unwrap();
        assert_eq!(recorder.entity_ids(), vec!["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn dependencies_gate_execution() {
        let recorder = Arc::new(Recorder::default());
        let (_, queue) = open(recorder.clone());

        let parent = queue.enqueue(EnqueueRequest::create("p-1", project("A"))).unwrap();
        let child = EnqueueRequest::create(
            "e-1",
            Payload::Element(ElementFields {
                project_id: Some("p-1".into()),
                name: Some("Aria".into()),
                ..Default::default()
            }),
        )
        .with_priority(Priority::High)
        .with_dependency(parent.id());
        queue.enqueue(child).unwrap();

        queue.set_online(true);
        let first = queue.process_queue().await.unwrap();
        assert_eq!(first.succeeded, 1);
        assert_eq!(recorder.entity_ids(), vec!["p-1"]);

        let second = queue.process_queue().await.unwrap();
        assert_eq!(second.succeeded, 1);
        assert_eq!(recorder.entity_ids(), vec!["p-1", "e-1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_intents_coalesce() {
        let recorder = Arc::new(Recorder::default());
        let (_, queue) = open(recorder.clone());

        let created = queue.enqueue(EnqueueRequest::create("p-1", project("A"))).unwrap();
        let updated = queue.enqueue(EnqueueRequest::update("p-1", project("B"))).unwrap();
        assert_eq!(updated, Enqueued::Merged(created.id().to_string()));

        let items = queue.items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].action, ChangeKind::Create);
        assert_eq!(items[0].payload, Some(project("B")));

        let deleted = queue
            .enqueue(EnqueueRequest::delete(EntityKind::Project, "p-1"))
            .unwrap();
        assert_eq!(deleted, Enqueued::Cancelled(created.id().to_string()));
        assert!(queue.items().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_exhausted() {
        let recorder = Arc::new(Recorder::default());
        *recorder.fail_with.lock() = Some(RemoteError::transient("503"));
        let (_, queue) = open(recorder.clone());

        queue.set_online(true);
        queue.enqueue(EnqueueRequest::create("p-1", project("A"))).unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(recorder.calls.lock().len(), 3);
        let failed = queue.failed_items();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].retry.retry_count, 3);
        assert_eq!(queue.status().last_error.as_deref(), Some("transient remote failure: 503"));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_skip_retries() {
        let recorder = Arc::new(Recorder::default());
        *recorder.fail_with.lock() = Some(RemoteError::permanent("bad owner"));
        let (_, queue) = open(recorder.clone());

        queue.enqueue(EnqueueRequest::create("p-1", project("A"))).unwrap();
        queue.set_online(true);
        let report = queue.process_queue().await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(recorder.calls.lock().len(), 1);
        assert_eq!(queue.failed_items().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_failed_requeues() {
        let recorder = Arc::new(Recorder::default());
        *recorder.fail_with.lock() = Some(RemoteError::permanent("nope"));
        let (_, queue) = open(recorder.clone());

        queue.enqueue(EnqueueRequest::create("p-1", project("A"))).unwrap();
        queue.set_online(true);
        queue.process_queue().await.unwrap();
        assert_eq!(queue.failed_items().len(), 1);

        *recorder.fail_with.lock() = None;
        assert_eq!(queue.retry_failed().unwrap(), 1);
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(queue.failed_items().is_empty());
        assert_eq!(queue.status().active, 0);
        assert_eq!(recorder.calls.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_item_absorbs_later_intents() {
        let recorder = Arc::new(Recorder::default());
        *recorder.fail_with.lock() = Some(RemoteError::permanent("bad owner"));
        let (_, queue) = open(recorder.clone());

        let created = queue.enqueue(EnqueueRequest::create("p-1", project("A"))).unwrap();
        queue.set_online(true);
        queue.process_queue().await.unwrap();
        assert_eq!(queue.failed_items().len(), 1);
        *recorder.fail_with.lock() = None;

        let updated = queue.enqueue(EnqueueRequest::update("p-1", project("B"))).unwrap();
        assert_eq!(updated, Enqueued::Merged(created.id().to_string()));
        assert!(queue.items().is_empty());
        assert_eq!(queue.failed_items()[0].payload, Some(project("B")));

        let deleted = queue
            .enqueue(EnqueueRequest::delete(EntityKind::Project, "p-1"))
            .unwrap();
        assert_eq!(deleted, Enqueued::Cancelled(created.id().to_string()));
        assert!(queue.failed_items().is_empty());

        assert_eq!(queue.retry_failed().unwrap(), 0);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(recorder.entity_ids(), vec!["p-1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn restored_item_waits_for_failed_item_of_same_entity() {
        let store = Arc::new(InMemoryStore::new());
        let item = |action: ChangeKind, title: &str, sequence: u64| QueueItem {
            id: format!("item-{}", sequence),
            action,
            entity_type: EntityKind::Project,
            entity_id: "p-1".into(),
            project_id: None,
            payload: Some(project(title)),
            retry: RetryState::new(3),
            priority: Priority::Normal,
            dependencies: Vec::new(),
            timestamp: Utc::now(),
            sequence,
            not_before: None,
        };
        let mut failed = item(ChangeKind::Create, "A", 0);
        failed.retry.record_failure("bad owner");
        persist::save(store.as_ref(), "quillsync.failed", &vec![failed]).unwrap();
        persist::save(
            store.as_ref(),
            "quillsync.queue",
            &vec![item(ChangeKind::Update, "B", 1)],
        )
        .unwrap();

        let recorder = Arc::new(Recorder::default());
        let queue = OperationQueue::open(store, recorder.clone(), QueueConfig::default()).unwrap();
        queue.set_online(true);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(recorder.calls.lock().is_empty());

        queue.retry_failed().unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        let actions: Vec<ChangeKind> = recorder.calls.lock().iter().map(|i| i.action).collect();
        assert_eq!(actions, vec![ChangeKind::Create, ChangeKind::Update]);
        assert_eq!(queue.status().active, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_item_removes_pending() {
        let recorder = Arc::new(Recorder::default());
        let (_, queue) = open(recorder);

        let id = queue.enqueue(EnqueueRequest::create("p-1", project("A"))).unwrap();
        assert!(queue.clear_item(id.id()).unwrap());
        assert!(!queue.clear_item(id.id()).unwrap());
        assert!(queue.items().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn subscribers_see_status() {
        let recorder = Arc::new(Recorder::default());
        let (_, queue) = open(recorder);
        let mut rx = queue.subscribe();

        queue.enqueue(EnqueueRequest::create("p-1", project("A"))).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().active, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn state_survives_reopen() {
        let recorder = Arc::new(Recorder::default());
        let (store, queue) = open(recorder.clone());
        queue.enqueue(EnqueueRequest::create("p-1", project("A"))).unwrap();
        queue.enqueue(EnqueueRequest::create("p-2", project("B"))).unwrap();
        drop(queue);

        let reopened = OperationQueue::open(store, recorder, QueueConfig::default()).unwrap();
        let items = reopened.items();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].entity_id.as_str(), "p-1");
    }

    #[test]
    fn create_without_payload_is_rejected() {
        let store = Arc::new(InMemoryStore::new());
        let queue =
            OperationQueue::open(store, Arc::new(Recorder::default()), QueueConfig::default()).unwrap();
        let mut request = EnqueueRequest::create("p-1", project("A"));
        request.payload = None;
        assert!(matches!(
            queue.enqueue(request),
            Err(EngineError::InvalidRequest(_))
        ));
    }
}
