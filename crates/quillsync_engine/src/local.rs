//! Local state that mutations are applied to.

use crate::error::EngineResult;
use parking_lot::RwLock;
use quillsync_protocol::{ChangeKind, Delta, EntityId, EntityKind, Payload};
use std::collections::{BTreeMap, BTreeSet};

/// Applies mutations to the application's local state.
///
/// The optimistic queue calls this before any remote work is attempted, and
/// the tracker calls it for remote deltas that win a conflict.
pub trait LocalApplier: Send + Sync {
    /// Applies one mutation. `payload` is `None` for deletes.
    ///
    /// # Errors
    ///
    /// Returns an error if the local state rejects the mutation.
    fn apply(
        &self,
        change: ChangeKind,
        entity_type: EntityKind,
        entity_id: &EntityId,
        payload: Option<&Payload>,
    ) -> EngineResult<()>;

    /// Applies a delta.
    ///
    /// # Errors
    ///
    /// Returns an error if the local state rejects the mutation.
    fn apply_delta(&self, delta: &Delta) -> EngineResult<()> {
        self.apply(
            delta.change,
            delta.entity_type,
            &delta.entity_id,
            delta.new_value.as_ref(),
        )
    }
}

/// In-memory local state, useful for tests and headless tools.
#[derive(Debug, Default)]
pub struct MemoryLocalState {
    entities: RwLock<BTreeMap<(EntityKind, EntityId), Payload>>,
    applied: RwLock<Vec<(ChangeKind, EntityKind, EntityId)>>,
}

impl MemoryLocalState {
    /// Creates an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current value of an entity.
    pub fn get(&self, entity_type: EntityKind, entity_id: &EntityId) -> Option<Payload> {
        self.entities
            .read()
            .get(&(entity_type, entity_id.clone()))
            .cloned()
    }

    /// Returns the number of live entities.
    pub fn len(&self) -> usize {
        self.entities.read().len()
    }

    /// Returns true if no entity is live.
    pub fn is_empty(&self) -> bool {
        self.entities.read().is_empty()
    }

    /// Returns every mutation applied so far, in order.
    pub fn applied(&self) -> Vec<(ChangeKind, EntityKind, EntityId)> {
        self.applied.read().clone()
    }
}

impl MemoryLocalState {
    fn write(
        &self,
        change: ChangeKind,
        entity_type: EntityKind,
        entity_id: &EntityId,
        payload: Option<&Payload>,
        cleared: &BTreeSet<String>,
    ) -> EngineResult<()> {
        let key = (entity_type, entity_id.clone());
        {
            let mut entities = self.entities.write();
            match (change, payload) {
                (ChangeKind::Delete, _) => {
                    entities.remove(&key);
                }
                (ChangeKind::Create, Some(value)) => {
                    entities.insert(key.clone(), value.clone());
                }
                (ChangeKind::Update, Some(patch)) => match entities.get_mut(&key) {
                    Some(current) => current.overlay_changed(patch, cleared)?,
                    None => {
                        entities.insert(key.clone(), patch.clone());
                    }
                },
                (_, None) => {}
            }
        }
        self.applied.write().push((change, key.0, key.1));
        Ok(())
    }
}

impl LocalApplier for MemoryLocalState {
    fn apply(
        &self,
        change: ChangeKind,
        entity_type: EntityKind,
        entity_id: &EntityId,
        payload: Option<&Payload>,
    ) -> EngineResult<()> {
        self.write(change, entity_type, entity_id, payload, &BTreeSet::new())
    }

    /// Like [`apply`](Self::apply), but an update also clears the fields its
    /// delta names and leaves unset.
    fn apply_delta(&self, delta: &Delta) -> EngineResult<()> {
        self.write(
            delta.change,
            delta.entity_type,
            &delta.entity_id,
            delta.new_value.as_ref(),
            &delta.fields,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quillsync_protocol::ProjectFields;

    fn project(title: Option<&str>, genre: Option<&str>) -> Payload {
        Payload::Project(ProjectFields {
            title: title.map(String::from),
            genre: genre.map(String::from),
            ..Default::default()
        })
    }

    #[test]
    fn create_update_delete() {
        let state = MemoryLocalState::new();
        let id = EntityId::from("p-1");

        state
            .apply(ChangeKind::Create, EntityKind::Project, &id, Some(&project(Some("A"), Some("noir"))))
            .unwrap();
        state
            .apply(ChangeKind::Update, EntityKind::Project, &id, Some(&project(Some("B"), None)))
            .unwrap();
        assert_eq!(
            state.get(EntityKind::Project, &id),
            Some(project(Some("B"), Some("noir")))
        );

        state
            .apply(ChangeKind::Delete, EntityKind::Project, &id, None)
            .unwrap();
        assert!(state.is_empty());
        assert_eq!(state.applied().len(), 3);
    }

    #[test]
    fn apply_delta_uses_new_value() {
        let state = MemoryLocalState::new();
        let delta = Delta::create("p-9".into(), project(Some("Z"), None), 1).unwrap();
        state.apply_delta(&delta).unwrap();
        assert_eq!(state.len(), 1);
    }
}
