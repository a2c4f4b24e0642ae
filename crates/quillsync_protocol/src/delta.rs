//! Pending local changes.

use crate::change::ChangeKind;
use crate::checksum::checksum;
use crate::entity::{EntityId, EntityKind, Payload};
use crate::error::{ProtocolError, ProtocolResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A minimal, merge-aware record of one logical change to one entity.
///
/// # Fields
///
/// - `id`: `"{entity_type}_{entity_id}_{change}_{unix_millis}"`
/// - `fields`: names of changed fields (updates only)
/// - `old_value` / `new_value`: snapshots for conflict comparison
/// - `checksum`: checksum of `new_value`
/// - `timestamp` / `sequence`: causal order of the change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    /// Unique delta id.
    pub id: String,
    /// Entity type.
    pub entity_type: EntityKind,
    /// Entity id.
    pub entity_id: EntityId,
    /// Change kind.
    pub change: ChangeKind,
    /// Changed field names (update only).
    #[serde(default)]
    pub fields: BTreeSet<String>,
    /// Value before the change, if known.
    #[serde(default)]
    pub old_value: Option<Payload>,
    /// Value after the change; `None` for deletes.
    #[serde(default)]
    pub new_value: Option<Payload>,
    /// Checksum of `new_value`.
    pub checksum: u64,
    /// Local wall-clock time of the change.
    pub timestamp: DateTime<Utc>,
    /// Tie-breaker for equal timestamps.
    #[serde(default)]
    pub sequence: u64,
}

impl Delta {
    fn build(
        entity_type: EntityKind,
        entity_id: EntityId,
        change: ChangeKind,
        fields: BTreeSet<String>,
        old_value: Option<Payload>,
        new_value: Option<Payload>,
        sequence: u64,
    ) -> ProtocolResult<Self> {
        let timestamp = Utc::now();
        let id = format!(
            "{}_{}_{}_{}",
            entity_type,
            entity_id,
            change,
            timestamp.timestamp_millis()
        );
        let checksum = checksum(&new_value)?;
        Ok(Self {
            id,
            entity_type,
            entity_id,
            change,
            fields,
            old_value,
            new_value,
            checksum,
            timestamp,
            sequence,
        })
    }

    /// Creates a `create` delta. The entity type is taken from the payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn create(entity_id: EntityId, payload: Payload, sequence: u64) -> ProtocolResult<Self> {
        Self::build(
            payload.kind(),
            entity_id,
            ChangeKind::Create,
            BTreeSet::new(),
            None,
            Some(payload),
            sequence,
        )
    }

    /// Creates an `update` delta.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::KindMismatch`] if `old_value` and `new_value`
    /// belong to different entity types.
    pub fn update(
        entity_id: EntityId,
        fields: BTreeSet<String>,
        old_value: Option<Payload>,
        new_value: Payload,
        sequence: u64,
    ) -> ProtocolResult<Self> {
        if let Some(old) = &old_value {
            if old.kind() != new_value.kind() {
                return Err(ProtocolError::KindMismatch {
                    expected: old.kind(),
                    found: new_value.kind(),
                });
            }
        }
        Self::build(
            new_value.kind(),
            entity_id,
            ChangeKind::Update,
            fields,
            old_value,
            Some(new_value),
            sequence,
        )
    }

    /// Creates a `delete` delta.
    ///
    /// # Errors
    ///
    /// Returns an error if the checksum cannot be computed.
    pub fn delete(
        entity_type: EntityKind,
        entity_id: EntityId,
        old_value: Option<Payload>,
        sequence: u64,
    ) -> ProtocolResult<Self> {
        Self::build(
            entity_type,
            entity_id,
            ChangeKind::Delete,
            BTreeSet::new(),
            old_value,
            None,
            sequence,
        )
    }

    /// Returns the `(entity_type, entity_id)` key this delta is tracked under.
    pub fn key(&self) -> (EntityKind, EntityId) {
        (self.entity_type, self.entity_id.clone())
    }

    /// Recomputes `checksum` from `new_value`.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be serialized.
    pub fn refresh_checksum(&mut self) -> ProtocolResult<()> {
        self.checksum = checksum(&self.new_value)?;
        Ok(())
    }

    /// Returns true if `checksum` matches `new_value`.
    pub fn verify_checksum(&self) -> bool {
        checksum(&self.new_value)
            .map(|c| c == self.checksum)
            .unwrap_or(false)
    }

    /// Overlays `payload` onto `new_value` and refreshes the checksum. Names
    /// in `fields` that `payload` leaves unset are cleared. An update also
    /// unions `fields` into its own; a create keeps an empty set. A missing
    /// `new_value` is replaced outright.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::KindMismatch`] for a payload of another kind.
    pub fn absorb(&mut self, payload: &Payload, fields: &BTreeSet<String>) -> ProtocolResult<()> {
        if payload.kind() != self.entity_type {
            return Err(ProtocolError::KindMismatch {
                expected: self.entity_type,
                found: payload.kind(),
            });
        }
        match &mut self.new_value {
            Some(value) => value.overlay_changed(payload, fields)?,
            None => self.new_value = Some(payload.clone()),
        }
        if self.change == ChangeKind::Update {
            self.fields.extend(fields.iter().cloned());
        }
        self.refresh_checksum()
    }

    /// Causal ordering key: timestamp first, then sequence.
    pub fn order_key(&self) -> (DateTime<Utc>, u64) {
        (self.timestamp, self.sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{ElementFields, ProjectFields};

    fn titled(title: &str) -> Payload {
        Payload::Project(ProjectFields {
            title: Some(title.into()),
            ..Default::default()
        })
    }

    #[test]
    fn create_delta_has_checksum_and_id() {
        let delta = Delta::create("p-1".into(), titled("Dune"), 7).unwrap();
        assert_eq!(delta.entity_type, EntityKind::Project);
        assert_eq!(delta.change, ChangeKind::Create);
        assert!(delta.id.starts_with("project_p-1_create_"));
        assert_eq!(delta.sequence, 7);
        assert!(delta.verify_checksum());
    }

    #[test]
    fn delete_delta_has_no_value() {
        let delta = Delta::delete(EntityKind::Element, "e-1".into(), None, 1).unwrap();
        assert!(delta.new_value.is_none());
        assert!(delta.verify_checksum());
    }

    #[test]
    fn update_rejects_mixed_kinds() {
        let old = Payload::Element(ElementFields::default());
        let result = Delta::update("x".into(), BTreeSet::new(), Some(old), titled("A"), 1);
        assert!(matches!(result, Err(ProtocolError::KindMismatch { .. })));
    }

    #[test]
    fn absorb_overlays_and_refreshes_checksum() {
        let mut delta = Delta::create("p-1".into(), titled("Draft"), 1).unwrap();
        let before = delta.checksum;

        let fields: BTreeSet<String> = ["title".to_string()].into();
        delta.absorb(&titled("Final"), &fields).unwrap();

        assert_eq!(delta.new_value, Some(titled("Final")));
        assert!(delta.fields.is_empty());
        assert_ne!(delta.checksum, before);
        assert!(delta.verify_checksum());
    }

    #[test]
    fn absorbed_update_clears_named_fields_it_leaves_unset() {
        let genre = |g: Option<&str>| {
            Payload::Project(ProjectFields {
                genre: g.map(String::from),
                ..Default::default()
            })
        };
        let fields: BTreeSet<String> = ["genre".to_string()].into();
        let mut delta =
            Delta::update("p-1".into(), fields.clone(), None, genre(Some("noir")), 1).unwrap();

        delta.absorb(&genre(None), &fields).unwrap();

        assert_eq!(delta.new_value, Some(genre(None)));
        assert_eq!(delta.fields, fields);
        assert!(delta.verify_checksum());
    }

    #[test]
    fn tampered_delta_fails_verification() {
        let mut delta = Delta::create("p-1".into(), titled("Draft"), 1).unwrap();
        delta.new_value = Some(titled("Tampered"));
        assert!(!delta.verify_checksum());
    }

    #[test]
    fn json_round_trip_keeps_iso_timestamp() {
        let delta = Delta::create("p-1".into(), titled("Dune"), 3).unwrap();
        let json = serde_json::to_value(&delta).unwrap();
        assert!(json["timestamp"].as_str().unwrap().contains('T'));

        let back: Delta = serde_json::from_value(json).unwrap();
        assert_eq!(back, delta);
    }
}
