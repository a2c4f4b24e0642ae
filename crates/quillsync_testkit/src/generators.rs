//! Property-based test generators using proptest.
//!
//! Payload strategies only produce fields the engine can overlay, so any
//! two payloads of the same kind can be merged.

use proptest::prelude::*;
use quillsync_engine::Priority;
use quillsync_protocol::{ElementFields, EntityId, EntityKind, Payload, ProjectFields, TemplateFields};

fn text() -> impl Strategy<Value = String> {
    prop::string::string_regex("[A-Za-z][A-Za-z0-9 ]{0,15}").expect("Invalid regex")
}

fn opt_text() -> impl Strategy<Value = Option<String>> {
    prop::option::of(text())
}

/// Strategy for generating client-assigned entity ids.
pub fn entity_id_strategy() -> impl Strategy<Value = EntityId> {
    prop::string::string_regex("[a-z]{1,8}-[0-9]{1,4}")
        .expect("Invalid regex")
        .prop_map(EntityId::from)
}

/// Strategy for generating entity kinds.
pub fn entity_kind_strategy() -> impl Strategy<Value = EntityKind> {
    prop::sample::select(EntityKind::ALL.to_vec())
}

/// Strategy for generating queue priorities.
pub fn priority_strategy() -> impl Strategy<Value = Priority> {
    prop_oneof![Just(Priority::High), Just(Priority::Normal), Just(Priority::Low)]
}

/// Strategy for generating project payloads.
pub fn project_strategy() -> impl Strategy<Value = Payload> {
    (opt_text(), opt_text(), opt_text(), opt_text(), opt_text()).prop_map(
        |(owner_id, title, description, genre, status)| {
            Payload::Project(ProjectFields {
                owner_id,
                title,
                description,
                genre,
                status,
            })
        },
    )
}

/// Strategy for generating world element payloads.
pub fn element_strategy() -> impl Strategy<Value = Payload> {
    (
        opt_text(),
        opt_text(),
        opt_text(),
        opt_text(),
        prop::option::of(prop::collection::vec(text(), 0..4)),
    )
        .prop_map(|(project_id, name, category, description, tags)| {
            Payload::Element(ElementFields {
                project_id,
                name,
                category,
                description,
                tags,
            })
        })
}

/// Strategy for generating template payloads.
pub fn template_strategy() -> impl Strategy<Value = Payload> {
    (opt_text(), opt_text(), opt_text(), opt_text()).prop_map(|(project_id, name, category, body)| {
        Payload::Template(TemplateFields {
            project_id,
            name,
            category,
            body,
        })
    })
}

/// Strategy for generating payloads of one kind.
pub fn payload_of_kind(kind: EntityKind) -> BoxedStrategy<Payload> {
    match kind {
        EntityKind::Project => project_strategy().boxed(),
        EntityKind::Element => element_strategy().boxed(),
        EntityKind::Template => template_strategy().boxed(),
    }
}

/// Strategy for generating payloads of any kind.
pub fn payload_strategy() -> impl Strategy<Value = Payload> {
    prop_oneof![project_strategy(), element_strategy(), template_strategy()]
}

/// Strategy for generating two payloads of the same kind.
pub fn payload_pair_strategy() -> impl Strategy<Value = (Payload, Payload)> {
    entity_kind_strategy().prop_flat_map(|kind| (payload_of_kind(kind), payload_of_kind(kind)))
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn pairs_share_a_kind((a, b) in payload_pair_strategy()) {
            prop_assert_eq!(a.kind(), b.kind());
        }

        #[test]
        fn payload_overlay_is_idempotent(p in payload_strategy()) {
            let twice = p.overlaid(&p).unwrap();
            prop_assert_eq!(twice, p);
        }
    }
}
