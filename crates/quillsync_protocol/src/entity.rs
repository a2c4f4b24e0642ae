//! Entity kinds, identifiers and typed payloads.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// The closed set of entity types the engine synchronizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// A writing project. Root entity, partitioned by owner.
    Project,
    /// A world element (character, location, item) inside a project.
    Element,
    /// A reusable template inside a project.
    Template,
}

impl EntityKind {
    /// All entity kinds.
    pub const ALL: [EntityKind; 3] = [EntityKind::Project, EntityKind::Element, EntityKind::Template];

    /// Returns the lowercase name used in delta ids and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Project => "project",
            EntityKind::Element => "element",
            EntityKind::Template => "template",
        }
    }

    /// Returns the remote collection (table) this kind is stored in.
    pub fn collection(&self) -> &'static str {
        match self {
            EntityKind::Project => "projects",
            EntityKind::Element => "world_elements",
            EntityKind::Template => "templates",
        }
    }

    /// Returns true for entities that are not scoped by a project.
    pub fn is_root(&self) -> bool {
        matches!(self, EntityKind::Project)
    }

    /// Returns the partition/ownership field a create must carry.
    pub fn partition_field(&self) -> &'static str {
        match self {
            EntityKind::Project => "owner_id",
            EntityKind::Element | EntityKind::Template => "project_id",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "project" => Ok(EntityKind::Project),
            "element" => Ok(EntityKind::Element),
            "template" => Ok(EntityKind::Template),
            other => Err(format!("unknown entity type: {}", other)),
        }
    }
}

/// Client-assigned entity identifier.
///
/// The id is generated on the client before the first write and never
/// changes, so it can serve as the correlation key against the remote store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Generates a fresh random id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

fn overlay_field<T: Clone>(dst: &mut Option<T>, src: &Option<T>) {
    if src.is_some() {
        dst.clone_from(src);
    }
}

fn push_set(names: &mut BTreeSet<String>, name: &str, present: bool) {
    if present {
        names.insert(name.to_string());
    }
}

/// Fields of a project. Every field is optional so the struct can carry a
/// full snapshot or a partial patch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectFields {
    /// Owning user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    /// Project title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Genre label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genre: Option<String>,
    /// Workflow status (draft, active, archived).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl ProjectFields {
    fn overlay(&mut self, other: &Self) {
        overlay_field(&mut self.owner_id, &other.owner_id);
        overlay_field(&mut self.title, &other.title);
        overlay_field(&mut self.description, &other.description);
        overlay_field(&mut self.genre, &other.genre);
        overlay_field(&mut self.status, &other.status);
    }

    fn clear(&mut self, name: &str) -> bool {
        match name {
            "owner_id" => self.owner_id = None,
            "title" => self.title = None,
            "description" => self.description = None,
            "genre" => self.genre = None,
            "status" => self.status = None,
            _ => return false,
        }
        true
    }

    fn field_names(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        push_set(&mut names, "owner_id", self.owner_id.is_some());
        push_set(&mut names, "title", self.title.is_some());
        push_set(&mut names, "description", self.description.is_some());
        push_set(&mut names, "genre", self.genre.is_some());
        push_set(&mut names, "status", self.status.is_some());
        names
    }
}

/// Fields of a world element.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementFields {
    /// Project the element belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Category (character, location, item, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Tags, replaced as a whole on overlay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

impl ElementFields {
    fn overlay(&mut self, other: &Self) {
        overlay_field(&mut self.project_id, &other.project_id);
        overlay_field(&mut self.name, &other.name);
        overlay_field(&mut self.category, &other.category);
        overlay_field(&mut self.description, &other.description);
        overlay_field(&mut self.tags, &other.tags);
    }

    fn clear(&mut self, name: &str) -> bool {
        match name {
            "project_id" => self.project_id = None,
            "name" => self.name = None,
            "category" => self.category = None,
            "description" => self.description = None,
            "tags" => self.tags = None,
            _ => return false,
        }
        true
    }

    fn field_names(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        push_set(&mut names, "project_id", self.project_id.is_some());
        push_set(&mut names, "name", self.name.is_some());
        push_set(&mut names, "category", self.category.is_some());
        push_set(&mut names, "description", self.description.is_some());
        push_set(&mut names, "tags", self.tags.is_some());
        names
    }
}

/// Fields of a template.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateFields {
    /// Project the template belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    /// Template name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Element category the template produces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Template body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl TemplateFields {
    fn overlay(&mut self, other: &Self) {
        overlay_field(&mut self.project_id, &other.project_id);
        overlay_field(&mut self.name, &other.name);
        overlay_field(&mut self.category, &other.category);
        overlay_field(&mut self.body, &other.body);
    }

    fn clear(&mut self, name: &str) -> bool {
        match name {
            "project_id" => self.project_id = None,
            "name" => self.name = None,
            "category" => self.category = None,
            "body" => self.body = None,
            _ => return false,
        }
        true
    }

    fn field_names(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        push_set(&mut names, "project_id", self.project_id.is_some());
        push_set(&mut names, "name", self.name.is_some());
        push_set(&mut names, "category", self.category.is_some());
        push_set(&mut names, "body", self.body.is_some());
        names
    }
}

/// A mutation payload, tagged by entity type.
///
/// # Example
///
/// ```
/// use quillsync_protocol::{Payload, ProjectFields};
///
/// let mut base = Payload::Project(ProjectFields {
///     title: Some("Draft".into()),
///     genre: Some("fantasy".into()),
///     ..Default::default()
/// });
/// let patch = Payload::Project(ProjectFields {
///     title: Some("Final".into()),
///     ..Default::default()
/// });
///
/// base.overlay(&patch).unwrap();
/// let Payload::Project(fields) = &base else { unreachable!() };
/// assert_eq!(fields.title.as_deref(), Some("Final"));
/// assert_eq!(fields.genre.as_deref(), Some("fantasy"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "entity_type", content = "fields", rename_all = "snake_case")]
pub enum Payload {
    /// Project fields.
    Project(ProjectFields),
    /// World element fields.
    Element(ElementFields),
    /// Template fields.
    Template(TemplateFields),
}

impl Payload {
    /// Returns the entity kind this payload belongs to.
    pub fn kind(&self) -> EntityKind {
        match self {
            Payload::Project(_) => EntityKind::Project,
            Payload::Element(_) => EntityKind::Element,
            Payload::Template(_) => EntityKind::Template,
        }
    }

    /// Overlays every field present in `other` onto `self`.
    ///
    /// Fields absent from `other` are left untouched; on overlap `other` wins.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::KindMismatch`] if the payloads belong to
    /// different entity types.
    pub fn overlay(&mut self, other: &Payload) -> ProtocolResult<()> {
        match (self, other) {
            (Payload::Project(a), Payload::Project(b)) => a.overlay(b),
            (Payload::Element(a), Payload::Element(b)) => a.overlay(b),
            (Payload::Template(a), Payload::Template(b)) => a.overlay(b),
            (this, other) => {
                return Err(ProtocolError::KindMismatch {
                    expected: this.kind(),
                    found: other.kind(),
                })
            }
        }
        Ok(())
    }

    /// Overlays `other` like [`overlay`](Self::overlay), then clears every
    /// field named in `changed` that `other` leaves unset.
    ///
    /// Patches cannot carry an explicit null; the changed-field set marks
    /// which unset fields were cleared. Unknown names are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::KindMismatch`] for payloads of different kinds.
    pub fn overlay_changed(
        &mut self,
        other: &Payload,
        changed: &BTreeSet<String>,
    ) -> ProtocolResult<()> {
        self.overlay(other)?;
        let present = other.field_names();
        for name in changed.difference(&present) {
            self.clear_field(name);
        }
        Ok(())
    }

    /// Unsets the field called `name`. Returns false if this kind has no
    /// such field.
    pub fn clear_field(&mut self, name: &str) -> bool {
        match self {
            Payload::Project(f) => f.clear(name),
            Payload::Element(f) => f.clear(name),
            Payload::Template(f) => f.clear(name),
        }
    }

    /// Returns a copy of `self` with `other` overlaid.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::KindMismatch`] for payloads of different kinds.
    pub fn overlaid(&self, other: &Payload) -> ProtocolResult<Payload> {
        let mut merged = self.clone();
        merged.overlay(other)?;
        Ok(merged)
    }

    /// Returns the names of the fields present in this payload.
    pub fn field_names(&self) -> BTreeSet<String> {
        match self {
            Payload::Project(f) => f.field_names(),
            Payload::Element(f) => f.field_names(),
            Payload::Template(f) => f.field_names(),
        }
    }

    /// Returns the value of the partition/ownership field, if present.
    pub fn partition_value(&self) -> Option<&str> {
        match self {
            Payload::Project(f) => f.owner_id.as_deref(),
            Payload::Element(f) => f.project_id.as_deref(),
            Payload::Template(f) => f.project_id.as_deref(),
        }
    }

    /// Checks that a create carries its partition/ownership field.
    ///
    /// `scope` is an out-of-band project id (for example the partition key of
    /// a sync operation); it satisfies the check for project-scoped kinds.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::MissingField`] naming the absent field.
    pub fn validate_for_create(&self, scope: Option<&str>) -> ProtocolResult<()> {
        let kind = self.kind();
        let present = |v: Option<&str>| v.map(|s| !s.trim().is_empty()).unwrap_or(false);

        let ok = if kind.is_root() {
            present(self.partition_value())
        } else {
            present(self.partition_value()) || present(scope)
        };

        if ok {
            Ok(())
        } else {
            Err(ProtocolError::MissingField {
                entity_type: kind,
                field: kind.partition_field(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project(title: Option<&str>, genre: Option<&str>) -> Payload {
        Payload::Project(ProjectFields {
            title: title.map(String::from),
            genre: genre.map(String::from),
            ..Default::default()
        })
    }

    #[test]
    fn kind_names_and_collections() {
        assert_eq!(EntityKind::Project.as_str(), "project");
        assert_eq!(EntityKind::Element.collection(), "world_elements");
        assert_eq!("template".parse::<EntityKind>(), Ok(EntityKind::Template));
        assert!("chapter".parse::<EntityKind>().is_err());
        assert!(EntityKind::Project.is_root());
        assert!(!EntityKind::Element.is_root());
    }

    #[test]
    fn overlay_keeps_untouched_fields() {
        let mut base = project(Some("A"), Some("horror"));
        base.overlay(&project(Some("B"), None)).unwrap();
        assert_eq!(base, project(Some("B"), Some("horror")));
    }

    #[test]
    fn changed_fields_missing_from_patch_are_cleared() {
        let mut base = project(Some("A"), Some("horror"));
        let changed: BTreeSet<String> = ["genre".to_string(), "title".to_string()].into();
        base.overlay_changed(&project(Some("B"), None), &changed).unwrap();
        assert_eq!(base, project(Some("B"), None));

        let mut base = project(Some("A"), Some("horror"));
        base.overlay_changed(&project(None, None), &BTreeSet::new()).unwrap();
        assert_eq!(base, project(Some("A"), Some("horror")));
    }

    #[test]
    fn clear_field_rejects_unknown_names() {
        let mut element = Payload::Element(ElementFields {
            tags: Some(vec!["hero".into()]),
            ..Default::default()
        });
        assert!(element.clear_field("tags"));
        assert!(!element.clear_field("genre"));
        assert!(element.field_names().is_empty());
    }

    #[test]
    fn overlay_rejects_other_kind() {
        let mut base = project(Some("A"), None);
        let element = Payload::Element(ElementFields::default());
        let err = base.overlay(&element).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::KindMismatch {
                expected: EntityKind::Project,
                found: EntityKind::Element
            }
        ));
    }

    #[test]
    fn field_names_lists_present_fields() {
        let names = project(Some("A"), Some("sci-fi")).field_names();
        assert_eq!(
            names.into_iter().collect::<Vec<_>>(),
            vec!["genre".to_string(), "title".to_string()]
        );
    }

    #[test]
    fn validate_project_requires_owner() {
        let missing = project(Some("A"), None);
        assert!(matches!(
            missing.validate_for_create(None),
            Err(ProtocolError::MissingField { field: "owner_id", .. })
        ));

        let owned = Payload::Project(ProjectFields {
            owner_id: Some("user-1".into()),
            ..Default::default()
        });
        assert!(owned.validate_for_create(None).is_ok());
    }

    #[test]
    fn validate_element_accepts_scope() {
        let element = Payload::Element(ElementFields {
            name: Some("Aria".into()),
            ..Default::default()
        });
        assert!(element.validate_for_create(None).is_err());
        assert!(element.validate_for_create(Some("  ")).is_err());
        assert!(element.validate_for_create(Some("project-1")).is_ok());
    }

    #[test]
    fn payload_serializes_tagged() {
        let json = serde_json::to_value(project(Some("A"), None)).unwrap();
        assert_eq!(json["entity_type"], "project");
        assert_eq!(json["fields"]["title"], "A");
        assert!(json["fields"].get("genre").is_none());
    }
}
