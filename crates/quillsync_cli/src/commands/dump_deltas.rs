//! Dump deltas command implementation.

use super::snapshot::{open_store, Snapshot};
use quillsync_protocol::{Delta, EntityKind};
use std::path::Path;

/// Runs the dump-deltas command.
pub fn run(
    path: &Path,
    namespace: &str,
    limit: Option<usize>,
    entity: Option<&str>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let entity = entity.map(str::parse::<EntityKind>).transpose()?;
    let store = open_store(path)?;
    let snapshot = Snapshot::load(&store, namespace)?;
    let deltas = select(snapshot.deltas, entity, limit);

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&deltas)?);
        }
        _ => {
            print_text_output(&deltas);
        }
    }

    Ok(())
}

fn select(deltas: Vec<Delta>, entity: Option<EntityKind>, limit: Option<usize>) -> Vec<Delta> {
    deltas
        .into_iter()
        .filter(|d| entity.map_or(true, |kind| d.entity_type == kind))
        .take(limit.unwrap_or(usize::MAX))
        .collect()
}

fn print_text_output(deltas: &[Delta]) {
    println!(
        "{:>6}  {:<28}  {:<8}  {:<10}  {:<24}  FIELDS",
        "SEQ", "TIMESTAMP", "CHANGE", "ENTITY", "ID"
    );
    println!("{}", "-".repeat(96));

    for delta in deltas {
        let fields = if delta.fields.is_empty() {
            "-".to_string()
        } else {
            delta.fields.iter().cloned().collect::<Vec<_>>().join(",")
        };
        println!(
            "{:>6}  {:<28}  {:<8}  {:<10}  {:<24}  {}",
            delta.sequence,
            delta.timestamp.to_rfc3339(),
            delta.change,
            delta.entity_type,
            delta.entity_id,
            fields
        );
    }

    println!();
    println!("Total: {} deltas", deltas.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use quillsync_protocol::{ElementFields, Payload, ProjectFields};

    fn deltas() -> Vec<Delta> {
        let project = Payload::Project(ProjectFields {
            title: Some("A".into()),
            ..Default::default()
        });
        let element = Payload::Element(ElementFields {
            name: Some("Aria".into()),
            ..Default::default()
        });
        vec![
            Delta::create("p-1".into(), project.clone(), 0).unwrap(),
            Delta::create("e-1".into(), element, 1).unwrap(),
            Delta::create("p-2".into(), project, 2).unwrap(),
        ]
    }

    #[test]
    fn filters_by_entity_type() {
        let selected = select(deltas(), Some(EntityKind::Project), None);
        let ids: Vec<&str> = selected.iter().map(|d| d.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["p-1", "p-2"]);
    }

    #[test]
    fn limit_keeps_causal_prefix() {
        let selected = select(deltas(), None, Some(2));
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[1].entity_id.as_str(), "e-1");
    }
}
