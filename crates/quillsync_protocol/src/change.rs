//! Change kinds and the coalescing rule shared by the tracker and queues.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of a local mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// Entity was created locally.
    Create,
    /// Entity was updated locally.
    Update,
    /// Entity was deleted locally.
    Delete,
}

/// Outcome of folding an incoming change into a pending one for the same entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coalesced {
    /// Keep the pending record, overlay the incoming payload, and set its kind.
    Merge(ChangeKind),
    /// Replace the pending record's payload with the incoming one and set its kind.
    Replace(ChangeKind),
    /// Both changes cancel out; drop the pending record.
    Cancel,
}

impl ChangeKind {
    /// Returns the lowercase name used in delta ids and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Create => "create",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }

    /// Folds `incoming` into a pending change of kind `pending`.
    ///
    /// | pending | incoming | result |
    /// |---------|----------|--------|
    /// | create  | create/update | merge, stays create |
    /// | create  | delete   | cancel (never reached the remote) |
    /// | update  | create/update | merge, stays update |
    /// | update  | delete   | replace with delete |
    /// | delete  | create/update | replace with update |
    /// | delete  | delete   | merge, stays delete |
    pub fn coalesce(pending: ChangeKind, incoming: ChangeKind) -> Coalesced {
        match (pending, incoming) {
            (ChangeKind::Create, ChangeKind::Delete) => Coalesced::Cancel,
            (ChangeKind::Create, _) => Coalesced::Merge(ChangeKind::Create),
            (ChangeKind::Update, ChangeKind::Delete) => Coalesced::Replace(ChangeKind::Delete),
            (ChangeKind::Update, _) => Coalesced::Merge(ChangeKind::Update),
            (ChangeKind::Delete, ChangeKind::Delete) => Coalesced::Merge(ChangeKind::Delete),
            (ChangeKind::Delete, _) => Coalesced::Replace(ChangeKind::Update),
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_absorbs_updates() {
        assert_eq!(
            ChangeKind::coalesce(ChangeKind::Create, ChangeKind::Update),
            Coalesced::Merge(ChangeKind::Create)
        );
    }

    #[test]
    fn create_then_delete_cancels() {
        assert_eq!(
            ChangeKind::coalesce(ChangeKind::Create, ChangeKind::Delete),
            Coalesced::Cancel
        );
    }

    #[test]
    fn update_then_delete_becomes_delete() {
        assert_eq!(
            ChangeKind::coalesce(ChangeKind::Update, ChangeKind::Delete),
            Coalesced::Replace(ChangeKind::Delete)
        );
    }

    #[test]
    fn delete_then_write_becomes_update() {
        assert_eq!(
            ChangeKind::coalesce(ChangeKind::Delete, ChangeKind::Create),
            Coalesced::Replace(ChangeKind::Update)
        );
        assert_eq!(
            ChangeKind::coalesce(ChangeKind::Delete, ChangeKind::Update),
            Coalesced::Replace(ChangeKind::Update)
        );
    }

    #[test]
    fn serde_names() {
        assert_eq!(serde_json::to_string(&ChangeKind::Delete).unwrap(), "\"delete\"");
    }
}
