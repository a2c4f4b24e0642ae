//! Change tracker.
//!
//! Records every local mutation as a minimal [`Delta`], keeps at most one
//! pending delta per entity, and reconciles incoming remote deltas.
//!
//! ## Invariants
//!
//! - At most one pending delta exists per `(entity_type, entity_id)`
//! - A create followed by a delete of a never-synced entity leaves nothing
//! - [`ChangeTracker::pending_changes`] is ordered by timestamp, then sequence
//! - Every mutation is persisted before the call returns

use crate::config::TrackerConfig;
use crate::error::EngineResult;
use crate::local::LocalApplier;
use crate::persist::{self, DELTAS, DEVICE_ID, LAST_SYNC};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use quillsync_protocol::{
    ApplyOutcome, ChangeKind, Conflict, ConflictResolution, Delta, EntityId, EntityKind, Payload,
    Resolved, SyncPayload,
};
use quillsync_storage::KeyValueStore;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

type EntityKey = (EntityKind, EntityId);

struct TrackerState {
    pending: BTreeMap<EntityKey, Delta>,
    last_sync: Option<DateTime<Utc>>,
    next_sequence: u64,
}

impl TrackerState {
    fn next_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }

    fn ordered(&self) -> Vec<Delta> {
        let mut deltas: Vec<Delta> = self.pending.values().cloned().collect();
        deltas.sort_by_key(Delta::order_key);
        deltas
    }
}

/// Records local mutations as deltas and reconciles remote ones.
pub struct ChangeTracker {
    store: Arc<dyn KeyValueStore>,
    deltas_key: String,
    last_sync_key: String,
    device_id: String,
    state: Mutex<TrackerState>,
    applier: RwLock<Option<Arc<dyn LocalApplier>>>,
}

impl ChangeTracker {
    /// Opens the tracker, restoring pending deltas, the device id and the
    /// last sync time from `store`. A device id is generated on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails or holds malformed records.
    pub fn open(store: Arc<dyn KeyValueStore>, config: TrackerConfig) -> EngineResult<Self> {
        let ns = &config.namespace;
        let deltas_key = persist::scoped(ns, DELTAS);
        let last_sync_key = persist::scoped(ns, LAST_SYNC);
        let device_key = persist::scoped(ns, DEVICE_ID);

        let device_id = match persist::load::<String>(store.as_ref(), &device_key)? {
            Some(id) => id,
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                persist::save(store.as_ref(), &device_key, &id)?;
                info!(device_id = %id, "generated device id");
                id
            }
        };

        let deltas: Vec<Delta> = persist::load(store.as_ref(), &deltas_key)?.unwrap_or_default();
        let last_sync = persist::load(store.as_ref(), &last_sync_key)?;
        let next_sequence = deltas.iter().map(|d| d.sequence + 1).max().unwrap_or(0);
        let pending: BTreeMap<EntityKey, Delta> =
            deltas.into_iter().map(|d| (d.key(), d)).collect();

        if !pending.is_empty() {
            info!(pending = pending.len(), "restored pending deltas");
        }

        Ok(Self {
            store,
            deltas_key,
            last_sync_key,
            device_id,
            state: Mutex::new(TrackerState {
                pending,
                last_sync,
                next_sequence,
            }),
            applier: RwLock::new(None),
        })
    }

    /// Routes applied remote deltas into `applier`.
    pub fn attach_applier(&self, applier: Arc<dyn LocalApplier>) {
        *self.applier.write() = Some(applier);
    }

    /// Returns the device id.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Returns the time of the last acknowledged sync.
    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.state.lock().last_sync
    }

    /// Returns the number of pending deltas.
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Returns the pending delta for an entity.
    pub fn pending_for(&self, entity_type: EntityKind, entity_id: &EntityId) -> Option<Delta> {
        self.state
            .lock()
            .pending
            .get(&(entity_type, entity_id.clone()))
            .cloned()
    }

    fn persist(&self, state: &TrackerState) -> EngineResult<()> {
        persist::save(self.store.as_ref(), &self.deltas_key, &state.ordered())
    }

    /// Records a local create and returns the resulting pending delta.
    ///
    /// A pending delete for the same entity is replaced by an update carrying
    /// the new value. A pending create or update absorbs the payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be merged or persisted.
    pub fn track_create(&self, entity_id: EntityId, payload: Payload) -> EngineResult<Option<Delta>> {
        let mut state = self.state.lock();
        let key = (payload.kind(), entity_id.clone());

        let delta = match state.pending.get(&key).cloned() {
            Some(existing) if existing.change == ChangeKind::Delete => {
                let sequence = state.next_sequence();
                let fields = payload.field_names();
                Delta::update(entity_id, fields, existing.old_value, payload, sequence)?
            }
            Some(mut existing) => {
                let fields = if existing.change == ChangeKind::Update {
                    payload.field_names()
                } else {
                    BTreeSet::new()
                };
                existing.absorb(&payload, &fields)?;
                existing
            }
            None => {
                let sequence = state.next_sequence();
                Delta::create(entity_id, payload, sequence)?
            }
        };

        debug!(delta_id = %delta.id, change = %delta.change, "tracked create");
        state.pending.insert(key, delta.clone());
        self.persist(&state)?;
        Ok(Some(delta))
    }

    /// Records a local update and returns the resulting pending delta.
    ///
    /// A pending create absorbs the new value and stays a create. A pending
    /// update unions `fields` and absorbs the new value. Either way a name in
    /// `fields` that `new_value` leaves unset clears that field. A pending
    /// delete is replaced by a fresh update.
    ///
    /// # Errors
    ///
    /// Returns an error if the values belong to different entity types or
    /// cannot be persisted.
    pub fn track_update(
        &self,
        entity_id: EntityId,
        fields: BTreeSet<String>,
        old_value: Option<Payload>,
        new_value: Payload,
    ) -> EngineResult<Option<Delta>> {
        let mut state = self.state.lock();
        let key = (new_value.kind(), entity_id.clone());

        let delta = match state.pending.get(&key).cloned() {
            Some(mut existing) if existing.change != ChangeKind::Delete => {
                existing.absorb(&new_value, &fields)?;
                existing
            }
            _ => {
                let sequence = state.next_sequence();
                Delta::update(entity_id, fields, old_value, new_value, sequence)?
            }
        };

        debug!(delta_id = %delta.id, change = %delta.change, "tracked update");
        state.pending.insert(key, delta.clone());
        self.persist(&state)?;
        Ok(Some(delta))
    }

    /// Records a local delete and returns the resulting pending delta.
    ///
    /// Returns `None` when the delete cancels a pending create.
    ///
    /// # Errors
    ///
    /// Returns an error if the change cannot be persisted.
    pub fn track_delete(&self, entity_type: EntityKind, entity_id: EntityId) -> EngineResult<Option<Delta>> {
        let mut state = self.state.lock();
        let key = (entity_type, entity_id.clone());

        let delta = match state.pending.get(&key).cloned() {
            Some(existing) if existing.change == ChangeKind::Create => {
                state.pending.remove(&key);
                debug!(entity_id = %entity_id, "create cancelled by delete");
                self.persist(&state)?;
                return Ok(None);
            }
            Some(existing) if existing.change == ChangeKind::Delete => existing,
            Some(existing) => {
                let sequence = state.next_sequence();
                Delta::delete(entity_type, entity_id, existing.new_value, sequence)?
            }
            None => {
                let sequence = state.next_sequence();
                Delta::delete(entity_type, entity_id, None, sequence)?
            }
        };

        debug!(delta_id = %delta.id, "tracked delete");
        state.pending.insert(key, delta.clone());
        self.persist(&state)?;
        Ok(Some(delta))
    }

    /// Returns every pending delta in causal order.
    pub fn pending_changes(&self) -> Vec<Delta> {
        self.state.lock().ordered()
    }

    /// Bundles pending deltas for upload.
    pub fn build_sync_payload(&self) -> SyncPayload {
        let state = self.state.lock();
        SyncPayload::new(self.device_id.clone(), state.last_sync, state.ordered())
    }

    /// Applies remote deltas, resolving collisions with pending local deltas.
    ///
    /// Deltas without a local counterpart are applied directly. Applied
    /// deltas reach the attached [`LocalApplier`], if any, before the
    /// tracker state changes: if the applier rejects a delta, no pending
    /// delta is dropped or replaced and the call can be repeated. The
    /// applier runs with the tracker locked and must not call back into it.
    ///
    /// # Errors
    ///
    /// Returns an error if a merge fails, the applier rejects a delta, or
    /// persisting fails.
    pub fn apply_remote_changes(
        &self,
        remote: &[Delta],
        resolution: &ConflictResolution,
    ) -> EngineResult<ApplyOutcome> {
        let mut outcome = ApplyOutcome::default();
        let mut state = self.state.lock();
        let mut pending = state.pending.clone();

        for incoming in remote {
            let key = incoming.key();
            let Some(local) = pending.get(&key).cloned() else {
                outcome.applied.push(incoming.clone());
                continue;
            };

            match resolution.resolve(&local, incoming)? {
                Resolved::KeepLocal => outcome.resolved += 1,
                Resolved::AcceptRemote => {
                    pending.remove(&key);
                    outcome.applied.push(incoming.clone());
                    outcome.resolved += 1;
                }
                Resolved::Merged(merged) => {
                    outcome.applied.push(merged.clone());
                    pending.insert(key, merged);
                    outcome.resolved += 1;
                }
                Resolved::Deferred => {
                    outcome.conflicts.push(Conflict::new(local, incoming.clone()));
                }
            }
        }

        let applier = self.applier.read().clone();
        if let Some(applier) = applier {
            for delta in &outcome.applied {
                applier.apply_delta(delta)?;
            }
        }

        if pending != state.pending {
            state.pending = pending;
            self.persist(&state)?;
        }
        drop(state);

        info!(
            applied = outcome.applied.len(),
            resolved = outcome.resolved,
            conflicts = outcome.conflicts.len(),
            strategy = ?resolution.strategy,
            "applied remote changes"
        );
        Ok(outcome)
    }

    /// Drops acknowledged deltas and advances the last sync time.
    ///
    /// Returns the number of deltas removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the new state cannot be persisted.
    pub fn clear_synced_changes(&self, ids: &[String]) -> EngineResult<usize> {
        let ids: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let mut state = self.state.lock();
        let before = state.pending.len();
        state.pending.retain(|_, d| !ids.contains(d.id.as_str()));
        let removed = before - state.pending.len();

        let now = Utc::now();
        state.last_sync = Some(now);
        self.persist(&state)?;
        persist::save(self.store.as_ref(), &self.last_sync_key, &now)?;

        info!(removed, remaining = state.pending.len(), "cleared synced changes");
        Ok(removed)
    }
}

impl std::fmt::Debug for ChangeTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeTracker")
            .field("device_id", &self.device_id)
            .field("pending", &self.pending_count())
            .finish()
    }
}
