//! Optimistic execution queue.
//!
//! The entry point for application mutations: each operation is applied to
//! local state at once, then executed against the [`RemoteStore`] in the
//! background with exponential backoff.
//!
//! Client-assigned entity ids travel with every operation and serve as the
//! correlation key on the remote. Remote-generated ids are recorded for
//! lookup but never needed for correctness.

use crate::config::{OptimisticConfig, PersistenceMode};
use crate::connectivity::{forward_transitions, ConnectivityMonitor};
use crate::drain::{spawn_after, DrainGuard};
use crate::error::{EngineError, EngineResult, RemoteError};
use crate::executor::{CorrelationKey, RemoteStore};
use crate::intent::{fold_intent, Enqueued, Priority};
use crate::local::LocalApplier;
use crate::persist::{self, FAILED_OPERATIONS, OPERATIONS, REMOTE_IDS};
use crate::queue::DrainReport;
use crate::retry::RetryState;
use crate::tracker::ChangeTracker;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use quillsync_protocol::{ChangeKind, EntityId, EntityKind, Payload, ProtocolError};
use quillsync_storage::KeyValueStore;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Lifecycle of a [`SyncOperation`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    /// Waiting to be sent.
    #[default]
    Pending,
    /// Remote call in progress.
    Syncing,
    /// Accepted by the remote.
    Success,
    /// Rejected or out of retries.
    Failed,
}

/// A mutation waiting to reach the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
    /// Operation id.
    pub id: String,
    /// Mutation kind.
    pub op_type: ChangeKind,
    /// Entity type; selects the remote collection.
    pub entity: EntityKind,
    /// Client-assigned entity id.
    pub entity_id: EntityId,
    /// Partition key for project-scoped entities.
    #[serde(default)]
    pub project_id: Option<String>,
    /// Payload for creates and updates.
    #[serde(default)]
    pub data: Option<Payload>,
    /// Remote-generated id, once known.
    #[serde(default)]
    pub remote_id: Option<String>,
    /// Submission time.
    pub timestamp: DateTime<Utc>,
    /// Submission order tie-breaker.
    #[serde(default)]
    pub sequence: u64,
    /// Retry bookkeeping.
    #[serde(flatten)]
    pub retry: RetryState,
    /// Current status.
    #[serde(default)]
    pub status: OperationStatus,
    /// Scheduling priority.
    #[serde(default)]
    pub priority: Priority,
}

/// A request to run one mutation optimistically.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationRequest {
    /// Mutation kind.
    pub op_type: ChangeKind,
    /// Entity type.
    pub entity: EntityKind,
    /// Client-assigned entity id.
    pub entity_id: EntityId,
    /// Partition key for project-scoped entities.
    pub project_id: Option<String>,
    /// Payload for creates and updates.
    pub data: Option<Payload>,
    /// Scheduling priority.
    pub priority: Priority,
}

impl OperationRequest {
    /// A create. The entity type is taken from the payload.
    pub fn create(entity_id: impl Into<EntityId>, data: Payload) -> Self {
        Self {
            op_type: ChangeKind::Create,
            entity: data.kind(),
            entity_id: entity_id.into(),
            project_id: None,
            data: Some(data),
            priority: Priority::Normal,
        }
    }

    /// An update carrying the changed fields.
    pub fn update(entity_id: impl Into<EntityId>, data: Payload) -> Self {
        Self {
            op_type: ChangeKind::Update,
            ..Self::create(entity_id, data)
        }
    }

    /// A delete.
    pub fn delete(entity: EntityKind, entity_id: impl Into<EntityId>) -> Self {
        Self {
            op_type: ChangeKind::Delete,
            entity,
            entity_id: entity_id.into(),
            project_id: None,
            data: None,
            priority: Priority::Normal,
        }
    }

    /// Sets the partition key.
    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    fn validate(&self) -> EngineResult<()> {
        match (&self.op_type, &self.data) {
            (ChangeKind::Create | ChangeKind::Update, None) => {
                return Err(EngineError::InvalidRequest(format!(
                    "{} of {} requires data",
                    self.op_type, self.entity_id
                )))
            }
            (_, Some(data)) if data.kind() != self.entity => {
                return Err(ProtocolError::KindMismatch {
                    expected: self.entity,
                    found: data.kind(),
                }
                .into())
            }
            _ => {}
        }
        if let (ChangeKind::Create, Some(data)) = (&self.op_type, &self.data) {
            data.validate_for_create(self.project_id.as_deref())?;
        }
        Ok(())
    }
}

/// Snapshot published to subscribers after every change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptimisticStatus {
    /// Connectivity as seen by the queue.
    pub online: bool,
    /// A drain is running.
    pub processing: bool,
    /// Operations waiting to be sent.
    pub pending: usize,
    /// Operations being sent.
    pub syncing: usize,
    /// Operations in the failed set.
    pub failed: usize,
    /// Most recent remote error.
    pub last_error: Option<String>,
}

#[derive(Default)]
struct OptimisticState {
    queue: Vec<SyncOperation>,
    failed: Vec<SyncOperation>,
    remote_ids: BTreeMap<EntityId, String>,
    cancelled: HashSet<String>,
    next_sequence: u64,
    last_error: Option<String>,
}

impl OptimisticState {
    /// Oldest pending operation of the heaviest priority whose entity has no
    /// older operation still queued and nothing in the failed set.
    fn next_index(&self, config: &OptimisticConfig) -> Option<usize> {
        self.queue
            .iter()
            .enumerate()
            .filter(|(_, op)| op.status == OperationStatus::Pending)
            .filter(|(_, op)| {
                let same_entity =
                    |other: &SyncOperation| other.entity == op.entity && other.entity_id == op.entity_id;
                !self.failed.iter().any(|other| same_entity(other))
                    && !self
                        .queue
                        .iter()
                        .any(|other| same_entity(other) && other.sequence < op.sequence)
            })
            .min_by_key(|(_, op)| {
                config
                    .priority_weights
                    .order_key(op.priority, op.timestamp, op.sequence)
            })
            .map(|(idx, _)| idx)
    }
}

struct OptimisticInner {
    config: OptimisticConfig,
    store: Arc<dyn KeyValueStore>,
    remote: Arc<dyn RemoteStore>,
    local: Arc<dyn LocalApplier>,
    operations_key: String,
    failed_key: String,
    remote_ids_key: String,
    state: Mutex<OptimisticState>,
    tracker: RwLock<Option<Arc<ChangeTracker>>>,
    draining: AtomicBool,
    online: AtomicBool,
    status_tx: watch::Sender<OptimisticStatus>,
}

impl OptimisticInner {
    fn persist(&self, state: &OptimisticState) -> EngineResult<()> {
        if self.config.persistence != PersistenceMode::Durable {
            return Ok(());
        }
        let store = self.store.as_ref();
        persist::save(store, &self.operations_key, &state.queue)?;
        persist::save(store, &self.failed_key, &state.failed)?;
        persist::save(store, &self.remote_ids_key, &state.remote_ids)
    }
}

/// Applies mutations locally at once and syncs them in the background.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct OptimisticQueue {
    inner: Arc<OptimisticInner>,
}

impl OptimisticQueue {
    /// Opens the queue. In [`PersistenceMode::Durable`] mode, queued and
    /// failed operations are restored and interrupted ones reset to pending.
    ///
    /// The queue starts online; follow a monitor with
    /// [`attach_connectivity`](Self::attach_connectivity).
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails or holds malformed records.
    pub fn open(
        store: Arc<dyn KeyValueStore>,
        remote: Arc<dyn RemoteStore>,
        local: Arc<dyn LocalApplier>,
        config: OptimisticConfig,
    ) -> EngineResult<Self> {
        let operations_key = persist::scoped(&config.namespace, OPERATIONS);
        let failed_key = persist::scoped(&config.namespace, FAILED_OPERATIONS);
        let remote_ids_key = persist::scoped(&config.namespace, REMOTE_IDS);

        let mut state = OptimisticState::default();
        if config.persistence == PersistenceMode::Durable {
            state.queue = persist::load(store.as_ref(), &operations_key)?.unwrap_or_default();
            state.failed = persist::load(store.as_ref(), &failed_key)?.unwrap_or_default();
            state.remote_ids = persist::load(store.as_ref(), &remote_ids_key)?.unwrap_or_default();
            for op in &mut state.queue {
                if op.status == OperationStatus::Syncing {
                    op.status = OperationStatus::Pending;
                }
            }
            state.next_sequence = state
                .queue
                .iter()
                .chain(state.failed.iter())
                .map(|op| op.sequence + 1)
                .max()
                .unwrap_or(0);
            if !state.queue.is_empty() || !state.failed.is_empty() {
                info!(
                    queued = state.queue.len(),
                    failed = state.failed.len(),
                    "restored optimistic operations"
                );
            }
        }

        let (status_tx, _) = watch::channel(OptimisticStatus {
            online: true,
            pending: state.queue.len(),
            failed: state.failed.len(),
            ..Default::default()
        });

        Ok(Self {
            inner: Arc::new(OptimisticInner {
                config,
                store,
                remote,
                local,
                operations_key,
                failed_key,
                remote_ids_key,
                state: Mutex::new(state),
                tracker: RwLock::new(None),
                draining: AtomicBool::new(false),
                online: AtomicBool::new(true),
                status_tx,
            }),
        })
    }

    /// Records every accepted operation in `tracker`.
    pub fn attach_tracker(&self, tracker: Arc<ChangeTracker>) {
        *self.inner.tracker.write() = Some(tracker);
    }

    /// Follows `monitor`; an offline to online transition starts a drain.
    pub fn attach_connectivity(&self, monitor: &ConnectivityMonitor) {
        self.set_online(monitor.is_online());
        let weak = Arc::downgrade(&self.inner);
        forward_transitions(monitor, move |online| match weak.upgrade() {
            Some(inner) => {
                OptimisticQueue { inner }.set_online(online);
                true
            }
            None => false,
        });
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
        info!(online, "optimistic queue connectivity changed");
        self.notify();
        if online {
            self.schedule_drain();
        }
    }

    /// Returns the current status.
    pub fn status(&self) -> OptimisticStatus {
        let state = self.inner.state.lock();
        self.snapshot(&state)
    }

    /// Returns a receiver that sees a fresh status after every change.
    pub fn subscribe(&self) -> watch::Receiver<OptimisticStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Returns queued operations in submission order.
    pub fn operations(&self) -> Vec<SyncOperation> {
        self.inner.state.lock().queue.clone()
    }

    /// Returns operations in the failed set.
    pub fn failed_operations(&self) -> Vec<SyncOperation> {
        self.inner.state.lock().failed.clone()
    }

    /// Returns the remote id recorded for an entity.
    pub fn remote_id_for(&self, entity_id: &EntityId) -> Option<String> {
        self.inner.state.lock().remote_ids.get(entity_id).cloned()
    }

    fn snapshot(&self, state: &OptimisticState) -> OptimisticStatus {
        let count = |status| state.queue.iter().filter(|op| op.status == status).count();
        OptimisticStatus {
            online: self.is_online(),
            processing: self.inner.draining.load(Ordering::Acquire),
            pending: count(OperationStatus::Pending),
            syncing: count(OperationStatus::Syncing),
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

    fn schedule_drain(&self) {
        let queue = self.clone();
        spawn_after(Duration::ZERO, async move {
            if let Err(err) = queue.process_queue().await {
                error!(error = %err, "optimistic queue drain failed");
            }
        });
    }

    /// Applies a mutation locally and queues it for the remote.
    ///
    /// A pending operation on the same entity absorbs the new one; a create
    /// followed by a delete cancels both. With nothing queued for the entity,
    /// its failed operation absorbs the new one and stays failed until
    /// [`retry_failed`](Self::retry_failed) or
    /// [`cancel_operation`](Self::cancel_operation).
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::MissingField`] for a create without its
    /// partition field, or an error from the local applier or the store.
    pub fn add_operation(&self, request: OperationRequest) -> EngineResult<Enqueued> {
        request.validate()?;
        let inner = &self.inner;
        inner.local.apply(
            request.op_type,
            request.entity,
            &request.entity_id,
            request.data.as_ref(),
        )?;

        let outcome = {
            let mut state = inner.state.lock();
            let outcome = Self::enqueue(&mut state, request.clone(), &inner.config)?;
            inner.persist(&state)?;
            outcome
        };
        debug!(
            op_id = outcome.id(),
            entity_id = %request.entity_id,
            op_type = %request.op_type,
            outcome = ?outcome,
            "added operation"
        );

        self.forward_to_tracker(request)?;
        self.notify();
        if self.is_online() {
            self.schedule_drain();
        }
        Ok(outcome)
    }

    fn enqueue(
        state: &mut OptimisticState,
        request: OperationRequest,
        config: &OptimisticConfig,
    ) -> EngineResult<Enqueued> {
        let same_entity =
            |op: &SyncOperation| op.entity == request.entity && op.entity_id == request.entity_id;

        // Syncing operations keep their successor separate. A failed one
        // absorbs later intents so its entity stays in order.
        let newest = state.queue.iter().rposition(same_entity);
        let newest_failed = state.failed.iter().rposition(same_entity);
        let target = match (newest, newest_failed) {
            (Some(idx), _) if state.queue[idx].status == OperationStatus::Pending => {
                Some((&mut state.queue, idx))
            }
            (Some(_), _) => None,
            (None, Some(idx)) => Some((&mut state.failed, idx)),
            (None, None) => None,
        };

        if let Some((ops, idx)) = target {
            let op = &mut ops[idx];
            let keep =
                fold_intent(&mut op.op_type, &mut op.data, request.op_type, request.data.as_ref())?;
            if !keep {
                let removed = ops.remove(idx);
                return Ok(Enqueued::Cancelled(removed.id));
            }
            if request.project_id.is_some() {
                op.project_id = request.project_id;
            }
            op.priority = config.priority_weights.max(op.priority, request.priority);
            return Ok(Enqueued::Merged(op.id.clone()));
        }

        let sequence = state.next_sequence;
        state.next_sequence += 1;
        let id = uuid::Uuid::new_v4().to_string();
        state.queue.push(SyncOperation {
            id: id.clone(),
            op_type: request.op_type,
            entity: request.entity,
            entity_id: request.entity_id,
            project_id: request.project_id,
            data: request.data,
            remote_id: None,
            timestamp: Utc::now(),
            sequence,
            retry: RetryState::new(config.max_retries),
            status: OperationStatus::Pending,
            priority: request.priority,
        });
        Ok(Enqueued::New(id))
    }

    fn forward_to_tracker(&self, request: OperationRequest) -> EngineResult<()> {
        let Some(tracker) = self.inner.tracker.read().clone() else {
            return Ok(());
        };
        match (request.op_type, request.data) {
            (ChangeKind::Create, Some(data)) => {
                tracker.track_create(request.entity_id, data)?;
            }
            (ChangeKind::Update, Some(data)) => {
                tracker.track_update(request.entity_id, data.field_names(), None, data)?;
            }
            (ChangeKind::Delete, _) => {
                tracker.track_delete(request.entity, request.entity_id)?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn execute(&self, op: &SyncOperation) -> Result<Option<String>, RemoteError> {
        let remote = &self.inner.remote;
        let collection = op.entity.collection();
        let scope = op.project_id.clone().or_else(|| {
            op.data
                .as_ref()
                .and_then(Payload::partition_value)
                .map(String::from)
        });
        let key = CorrelationKey::new(op.entity, op.entity_id.clone(), scope);
        let data = op.data.as_ref();

        match (op.op_type, data) {
            (ChangeKind::Create, Some(data)) => {
                Ok(Some(remote.insert(collection, &key, data).await?.remote_id))
            }
            (ChangeKind::Update, Some(data)) => {
                Ok(Some(remote.update(collection, &key, data).await?.remote_id))
            }
            (ChangeKind::Delete, _) => match remote.delete(collection, &key).await {
                Ok(()) | Err(RemoteError::NotFound { .. }) => Ok(None),
                Err(e) => Err(e),
            },
            (kind, None) => Err(RemoteError::permanent(format!("{} {} has no data", kind, op.id))),
        }
    }

    /// Sends pending operations one at a time until none is left.
    ///
    /// A retryable failure puts the operation back to pending and sleeps
    /// `backoff(retry_count)` before continuing. Once retries are exhausted,
    /// or on a permanent failure, the operation moves to the failed set.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue state cannot be persisted.
    pub async fn process_queue(&self) -> EngineResult<DrainReport> {
        let inner = &self.inner;
        let mut report = DrainReport::default();
        if !self.is_online() {
            return Ok(report);
        }
        let Some(guard) = DrainGuard::try_acquire(&inner.draining) else {
            debug!("optimistic drain already running");
            return Ok(report);
        };

        loop {
            if !self.is_online() {
                debug!("optimistic queue went offline; pausing");
                break;
            }
            let next = {
                let mut state = inner.state.lock();
                match state.next_index(&inner.config) {
                    Some(idx) => {
                        state.queue[idx].status = OperationStatus::Syncing;
                        Some(state.queue[idx].clone())
                    }
                    None => None,
                }
            };
            let Some(op) = next else { break };
            self.notify();

            report.attempted += 1;
            let timeout = inner.config.execute_timeout;
            let result = match tokio::time::timeout(timeout, self.execute(&op)).await {
                Ok(result) => result,
                Err(_) => Err(RemoteError::Timeout(timeout)),
            };

            let backoff = {
                let mut state = inner.state.lock();
                if state.cancelled.remove(&op.id) {
                    debug!(op_id = %op.id, "result ignored for cancelled operation");
                    None
                } else if let Some(idx) = state.queue.iter().position(|o| o.id == op.id) {
                    let backoff = self.settle(&mut state, idx, result, &mut report);
                    inner.persist(&state)?;
                    backoff
                } else {
                    None
                }
            };
            self.notify();

            if let Some(delay) = backoff {
                tokio::time::sleep(delay).await;
            }
        }

        drop(guard);
        self.notify();
        Ok(report)
    }

    /// Records the outcome of one attempt. Returns the backoff to sleep.
    fn settle(
        &self,
        state: &mut OptimisticState,
        idx: usize,
        result: Result<Option<String>, RemoteError>,
        report: &mut DrainReport,
    ) -> Option<Duration> {
        match result {
            Ok(remote_id) => {
                let op = state.queue.remove(idx);
                match (op.op_type, remote_id) {
                    (ChangeKind::Delete, _) => {
                        state.remote_ids.remove(&op.entity_id);
                    }
                    (_, Some(remote_id)) => {
                        state.remote_ids.insert(op.entity_id.clone(), remote_id);
                    }
                    _ => {}
                }
                report.succeeded += 1;
                debug!(op_id = %op.id, entity_id = %op.entity_id, "operation synced");
                None
            }
            Err(err) => {
                let message = err.to_string();
                state.last_error = Some(message.clone());
                let op = &mut state.queue[idx];
                op.status = OperationStatus::Failed;
                let exhausted = op.retry.record_failure(message.clone());
                let retry_count = op.retry.retry_count;

                if exhausted || !err.is_retryable() {
                    let failed = state.queue.remove(idx);
                    error!(
                        op_id = %failed.id,
                        entity_id = %failed.entity_id,
                        retry_count,
                        error = %message,
                        "operation failed permanently"
                    );
                    state.failed.push(failed);
                    report.failed += 1;
                    None
                } else {
                    op.status = OperationStatus::Pending;
                    let delay = self.inner.config.backoff.delay(retry_count);
                    warn!(
                        op_id = %op.id,
                        entity_id = %op.entity_id,
                        retry_count,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "operation failed; backing off"
                    );
                    report.retried += 1;
                    Some(delay)
                }
            }
        }
    }

    /// Moves every failed operation back to pending with a fresh retry
    /// budget and resumes processing. Returns the number moved.
    ///
    /// # Errors
    ///
    /// Returns an error if persisting fails.
    pub fn retry_failed(&self) -> EngineResult<usize> {
        let moved = {
            let mut state = self.inner.state.lock();
            let mut failed = std::mem::take(&mut state.failed);
            for op in &mut failed {
                op.retry.reset();
                op.status = OperationStatus::Pending;
            }
            let moved = failed.len();
            state.queue.append(&mut failed);
            state.queue.sort_by_key(|op| op.sequence);
            self.inner.persist(&state)?;
            moved
        };
        info!(moved, "requeued failed operations");
        self.notify();
        if moved > 0 && self.is_online() {
            self.schedule_drain();
        }
        Ok(moved)
    }

    /// Removes a queued or failed operation. The result of an in-flight
    /// attempt for it is ignored. Returns false if no such operation exists.
    ///
    /// # Errors
    ///
    /// Returns an error if persisting fails.
    pub fn cancel_operation(&self, id: &str) -> EngineResult<bool> {
        let found = {
            let mut state = self.inner.state.lock();
            let syncing = state
                .queue
                .iter()
                .any(|op| op.id == id && op.status == OperationStatus::Syncing);
            let before = state.queue.len() + state.failed.len();
            state.queue.retain(|op| op.id != id);
            state.failed.retain(|op| op.id != id);
            let found = state.queue.len() + state.failed.len() < before;
            if syncing {
                state.cancelled.insert(id.to_string());
            }
            if found {
                self.inner.persist(&state)?;
            }
            found
        };
        if found {
            debug!(op_id = id, "cancelled operation");
            self.notify();
        }
        Ok(found)
    }
}

impl std::fmt::Debug for OptimisticQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimisticQueue")
            .field("status", &self.status())
            .finish()
    }
}
