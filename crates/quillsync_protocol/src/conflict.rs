//! Conflict detection and resolution.

use crate::change::ChangeKind;
use crate::delta::Delta;
use crate::entity::{EntityId, EntityKind, Payload};
use crate::error::ProtocolResult;
use std::fmt;
use std::sync::Arc;

/// Custom merge function: `(local, remote) -> merged`.
pub type MergeFn = Arc<dyn Fn(&Payload, &Payload) -> Payload + Send + Sync>;

/// Strategy for resolving a remote delta that collides with a pending local one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictStrategy {
    /// Local pending change wins; the remote delta is discarded.
    Local,
    /// Remote delta wins; the local pending change is dropped.
    Remote,
    /// Values are merged field by field.
    Merge,
    /// Nothing is applied; the conflict is reported to the caller.
    Manual,
}

/// A conflict strategy plus an optional custom merge function.
#[derive(Clone)]
pub struct ConflictResolution {
    /// Strategy to apply.
    pub strategy: ConflictStrategy,
    /// Custom resolver used by [`ConflictStrategy::Merge`].
    pub resolver: Option<MergeFn>,
}

impl fmt::Debug for ConflictResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConflictResolution")
            .field("strategy", &self.strategy)
            .field("resolver", &self.resolver.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl Default for ConflictResolution {
    fn default() -> Self {
        Self::merge()
    }
}

/// Outcome of resolving one conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    /// Keep the local pending delta, ignore the remote one.
    KeepLocal,
    /// Drop the local pending delta and apply the remote one.
    AcceptRemote,
    /// Replace the local pending delta with this merged delta and apply it.
    Merged(Delta),
    /// Leave both untouched and report the conflict.
    Deferred,
}

impl ConflictResolution {
    /// Local wins.
    pub fn local() -> Self {
        Self {
            strategy: ConflictStrategy::Local,
            resolver: None,
        }
    }

    /// Remote wins.
    pub fn remote() -> Self {
        Self {
            strategy: ConflictStrategy::Remote,
            resolver: None,
        }
    }

    /// Shallow merge, remote wins per field.
    pub fn merge() -> Self {
        Self {
            strategy: ConflictStrategy::Merge,
            resolver: None,
        }
    }

    /// Merge with a custom resolver.
    pub fn merge_with<F>(resolver: F) -> Self
    where
        F: Fn(&Payload, &Payload) -> Payload + Send + Sync + 'static,
    {
        Self {
            strategy: ConflictStrategy::Merge,
            resolver: Some(Arc::new(resolver)),
        }
    }

    /// Report conflicts without applying anything.
    pub fn manual() -> Self {
        Self {
            strategy: ConflictStrategy::Manual,
            resolver: None,
        }
    }

    /// Resolves `remote` against the pending `local` delta for the same entity.
    ///
    /// For [`ConflictStrategy::Merge`], a remote delete wins and a local delete
    /// is kept. Otherwise the merged value is the custom resolver's result, or
    /// the local value with the remote value overlaid and the remote's
    /// cleared fields unset (see [`Payload::overlay_changed`]). The merged
    /// delta keeps the local change kind, timestamp and sequence, and unions
    /// both field sets.
    ///
    /// # Errors
    ///
    /// Returns an error if the two values belong to different entity types.
    pub fn resolve(&self, local: &Delta, remote: &Delta) -> ProtocolResult<Resolved> {
        match self.strategy {
            ConflictStrategy::Local => Ok(Resolved::KeepLocal),
            ConflictStrategy::Remote => Ok(Resolved::AcceptRemote),
            ConflictStrategy::Manual => Ok(Resolved::Deferred),
            ConflictStrategy::Merge => self.merge_deltas(local, remote),
        }
    }

    fn merge_deltas(&self, local: &Delta, remote: &Delta) -> ProtocolResult<Resolved> {
        if remote.change == ChangeKind::Delete {
            return Ok(Resolved::AcceptRemote);
        }
        if local.change == ChangeKind::Delete {
            return Ok(Resolved::KeepLocal);
        }

        let merged_value = match (&local.new_value, &remote.new_value) {
            (Some(l), Some(r)) => match &self.resolver {
                Some(resolver) => resolver(l, r),
                None => {
                    let mut merged = l.clone();
                    merged.overlay_changed(r, &remote.fields)?;
                    merged
                }
            },
            (Some(l), None) => l.clone(),
            (None, Some(r)) => r.clone(),
            (None, None) => return Ok(Resolved::KeepLocal),
        };

        let mut merged = local.clone();
        merged.fields.extend(remote.fields.iter().cloned());
        merged.new_value = Some(merged_value);
        merged.refresh_checksum()?;
        Ok(Resolved::Merged(merged))
    }
}

/// A remote delta that collided with a pending local delta.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    /// Entity type.
    pub entity_type: EntityKind,
    /// Entity id.
    pub entity_id: EntityId,
    /// Pending local delta.
    pub local: Delta,
    /// Incoming remote delta.
    pub remote: Delta,
}

impl Conflict {
    /// Creates a conflict record.
    pub fn new(local: Delta, remote: Delta) -> Self {
        Self {
            entity_type: local.entity_type,
            entity_id: local.entity_id.clone(),
            local,
            remote,
        }
    }

    /// Returns true if either side deletes the entity.
    pub fn involves_delete(&self) -> bool {
        self.local.change == ChangeKind::Delete || self.remote.change == ChangeKind::Delete
    }
}

/// Result of applying a batch of remote deltas.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyOutcome {
    /// Deltas applied to local state, in application order.
    pub applied: Vec<Delta>,
    /// Unresolved conflicts (manual strategy).
    pub conflicts: Vec<Conflict>,
    /// Number of conflicts resolved automatically.
    pub resolved: usize,
}

impl ApplyOutcome {
    /// Returns true if no conflict is waiting for manual resolution.
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::ProjectFields;

    fn project(title: Option<&str>, genre: Option<&str>) -> Payload {
        Payload::Project(ProjectFields {
            title: title.map(String::from),
            genre: genre.map(String::from),
            ..Default::default()
        })
    }

    fn update(value: Payload, fields: &[&str]) -> Delta {
        Delta::update(
            "p-1".into(),
            fields.iter().map(|s| s.to_string()).collect(),
            None,
            value,
            1,
        )
        .unwrap()
    }

    #[test]
    fn local_remote_and_manual_strategies() {
        let local = update(project(Some("L"), None), &["title"]);
        let remote = update(project(Some("R"), None), &["title"]);

        assert_eq!(
            ConflictResolution::local().resolve(&local, &remote).unwrap(),
            Resolved::KeepLocal
        );
        assert_eq!(
            ConflictResolution::remote().resolve(&local, &remote).unwrap(),
            Resolved::AcceptRemote
        );
        assert_eq!(
            ConflictResolution::manual().resolve(&local, &remote).unwrap(),
            Resolved::Deferred
        );
    }

    #[test]
    fn default_merge_overlays_remote_per_field() {
        let local = update(project(Some("L"), Some("horror")), &["title", "genre"]);
        let remote = update(project(Some("R"), None), &["title"]);

        let Resolved::Merged(merged) = ConflictResolution::merge().resolve(&local, &remote).unwrap()
        else {
            panic!("expected merge");
        };
        assert_eq!(merged.new_value, Some(project(Some("R"), Some("horror"))));
        assert_eq!(merged.change, ChangeKind::Update);
        assert_eq!(merged.timestamp, local.timestamp);
        assert!(merged.verify_checksum());
    }

    #[test]
    fn default_merge_applies_remote_clears() {
        let local = update(project(Some("L"), Some("horror")), &["title", "genre"]);
        let remote = update(project(None, None), &["genre"]);

        let Resolved::Merged(merged) = ConflictResolution::merge().resolve(&local, &remote).unwrap()
        else {
            panic!("expected merge");
        };
        assert_eq!(merged.new_value, Some(project(Some("L"), None)));
        assert!(merged.verify_checksum());
    }

    #[test]
    fn custom_resolver_is_used() {
        let local = update(project(Some("L"), None), &["title"]);
        let remote = update(project(Some("R"), None), &["title"]);
        let keep_local_title = ConflictResolution::merge_with(|l, _| l.clone());

        let Resolved::Merged(merged) = keep_local_title.resolve(&local, &remote).unwrap() else {
            panic!("expected merge");
        };
        assert_eq!(merged.new_value, Some(project(Some("L"), None)));
    }

    #[test]
    fn merge_with_deletes() {
        let local = update(project(Some("L"), None), &["title"]);
        let remote_delete = Delta::delete(EntityKind::Project, "p-1".into(), None, 2).unwrap();
        assert_eq!(
            ConflictResolution::merge().resolve(&local, &remote_delete).unwrap(),
            Resolved::AcceptRemote
        );

        let local_delete = Delta::delete(EntityKind::Project, "p-1".into(), None, 3).unwrap();
        assert_eq!(
            ConflictResolution::merge().resolve(&local_delete, &local).unwrap(),
            Resolved::KeepLocal
        );
        assert!(Conflict::new(local_delete, local).involves_delete());
    }

    #[test]
    fn debug_hides_resolver() {
        let resolution = ConflictResolution::merge_with(|l, _| l.clone());
        assert!(format!("{:?}", resolution).contains("<fn>"));
    }
}
