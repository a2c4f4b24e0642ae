//! Priorities, ordering and coalescing shared by both queues.

use crate::error::EngineResult;
use chrono::{DateTime, Utc};
use quillsync_protocol::{ChangeKind, Coalesced, Payload};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::fmt;

/// Scheduling priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Runs before everything else.
    High,
    /// Default.
    #[default]
    Normal,
    /// Runs last.
    Low,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        })
    }
}

/// Numeric weight per priority; higher runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityWeights {
    /// Weight of [`Priority::High`].
    pub high: u8,
    /// Weight of [`Priority::Normal`].
    pub normal: u8,
    /// Weight of [`Priority::Low`].
    pub low: u8,
}

impl PriorityWeights {
    /// Returns the weight of `priority`.
    pub fn weight(&self, priority: Priority) -> u8 {
        match priority {
            Priority::High => self.high,
            Priority::Normal => self.normal,
            Priority::Low => self.low,
        }
    }

    /// Sort key: heavier first, then oldest, then lowest sequence.
    pub(crate) fn order_key(
        &self,
        priority: Priority,
        timestamp: DateTime<Utc>,
        sequence: u64,
    ) -> (Reverse<u8>, DateTime<Utc>, u64) {
        (Reverse(self.weight(priority)), timestamp, sequence)
    }

    /// Returns whichever priority weighs more.
    pub(crate) fn max(&self, a: Priority, b: Priority) -> Priority {
        if self.weight(b) > self.weight(a) {
            b
        } else {
            a
        }
    }
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            high: 3,
            normal: 2,
            low: 1,
        }
    }
}

/// What happened to an enqueued intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Enqueued {
    /// A new record was appended.
    New(String),
    /// The intent was folded into a pending record with this id.
    Merged(String),
    /// The intent cancelled the pending record with this id.
    Cancelled(String),
}

impl Enqueued {
    /// Returns the id of the record involved.
    pub fn id(&self) -> &str {
        match self {
            Enqueued::New(id) | Enqueued::Merged(id) | Enqueued::Cancelled(id) => id,
        }
    }
}

/// Folds an incoming intent into a pending record's action and payload.
///
/// Returns false when the two cancel out and the pending record must be
/// dropped.
pub(crate) fn fold_intent(
    action: &mut ChangeKind,
    payload: &mut Option<Payload>,
    incoming: ChangeKind,
    incoming_payload: Option<&Payload>,
) -> EngineResult<bool> {
    match ChangeKind::coalesce(*action, incoming) {
        Coalesced::Cancel => return Ok(false),
        Coalesced::Merge(kind) => {
            *action = kind;
            if let Some(patch) = incoming_payload {
                match payload {
                    Some(current) => current.overlay(patch)?,
                    None => *payload = Some(patch.clone()),
                }
            }
        }
        Coalesced::Replace(kind) => {
            *action = kind;
            *payload = incoming_payload.cloned();
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quillsync_protocol::ElementFields;

    fn named(name: &str) -> Payload {
        Payload::Element(ElementFields {
            name: Some(name.into()),
            ..Default::default()
        })
    }

    #[test]
    fn default_weights_order_priorities() {
        let weights = PriorityWeights::default();
        let now = Utc::now();
        let high = weights.order_key(Priority::High, now, 2);
        let low = weights.order_key(Priority::Low, now - chrono::Duration::seconds(5), 0);
        assert!(high < low);
        assert_eq!(weights.max(Priority::Low, Priority::High), Priority::High);
    }

    #[test]
    fn create_then_update_stays_create() {
        let mut action = ChangeKind::Create;
        let mut payload = Some(Payload::Element(ElementFields {
            project_id: Some("p-1".into()),
            name: Some("Aria".into()),
            ..Default::default()
        }));
        assert!(fold_intent(&mut action, &mut payload, ChangeKind::Update, Some(&named("Arya"))).unwrap());
        assert_eq!(action, ChangeKind::Create);
        let Some(Payload::Element(fields)) = payload else {
            panic!("payload dropped");
        };
        assert_eq!(fields.name.as_deref(), Some("Arya"));
        assert_eq!(fields.project_id.as_deref(), Some("p-1"));
    }

    #[test]
    fn create_then_delete_cancels() {
        let mut action = ChangeKind::Create;
        let mut payload = Some(named("Aria"));
        assert!(!fold_intent(&mut action, &mut payload, ChangeKind::Delete, None).unwrap());
    }

    #[test]
    fn update_then_delete_replaces_payload() {
        let mut action = ChangeKind::Update;
        let mut payload = Some(named("Aria"));
        assert!(fold_intent(&mut action, &mut payload, ChangeKind::Delete, None).unwrap());
        assert_eq!(action, ChangeKind::Delete);
        assert!(payload.is_none());
    }

    #[test]
    fn priority_serde_names() {
        assert_eq!(serde_json::to_string(&Priority::High).unwrap(), "\"high\"");
        assert_eq!(Priority::default(), Priority::Normal);
    }
}
