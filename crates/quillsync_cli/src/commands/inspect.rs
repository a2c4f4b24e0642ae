//! Inspect command implementation.

use super::snapshot::{open_store, Snapshot};
use quillsync_engine::OperationStatus;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Store inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Store path.
    pub path: String,
    /// Key namespace.
    pub namespace: String,
    /// Number of keys in the store.
    pub key_count: usize,
    /// Device id.
    pub device_id: Option<String>,
    /// Last acknowledged sync (RFC 3339).
    pub last_sync: Option<String>,
    /// Pending delta statistics.
    pub deltas: DeltaStats,
    /// Durable queue statistics.
    pub queue: QueueStats,
    /// Optimistic operation statistics.
    pub operations: OperationStats,
}

/// Pending delta counts.
#[derive(Debug, Default, Serialize)]
pub struct DeltaStats {
    /// Total pending deltas.
    pub total: usize,
    /// Counts by change kind.
    pub by_change: BTreeMap<String, usize>,
    /// Counts by entity type.
    pub by_entity: BTreeMap<String, usize>,
}

/// Durable queue counts.
#[derive(Debug, Default, Serialize)]
pub struct QueueStats {
    /// Active items.
    pub active: usize,
    /// Failed items.
    pub failed: usize,
    /// Active items waiting on a retry.
    pub retrying: usize,
    /// Active items with unfinished dependencies.
    pub blocked: usize,
}

/// Optimistic operation counts.
#[derive(Debug, Default, Serialize)]
pub struct OperationStats {
    /// Queued operations.
    pub queued: usize,
    /// Operations that were mid-flight when the client stopped.
    pub interrupted: usize,
    /// Failed operations.
    pub failed: usize,
    /// Entities with a known remote id.
    pub remote_ids: usize,
}

/// Runs the inspect command.
pub fn run(path: &Path, namespace: &str, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(path)?;
    let snapshot = Snapshot::load(&store, namespace)?;
    let result = summarize(path, namespace, &snapshot);

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

fn summarize(path: &Path, namespace: &str, snapshot: &Snapshot) -> InspectResult {
    let mut deltas = DeltaStats {
        total: snapshot.deltas.len(),
        ..Default::default()
    };
    for delta in &snapshot.deltas {
        *deltas.by_change.entry(delta.change.as_str().to_string()).or_default() += 1;
        *deltas.by_entity.entry(delta.entity_type.as_str().to_string()).or_default() += 1;
    }

    let unfinished: Vec<&str> = snapshot
        .queue
        .iter()
        .chain(snapshot.failed.iter())
        .map(|i| i.id.as_str())
        .collect();
    let queue = QueueStats {
        active: snapshot.queue.len(),
        failed: snapshot.failed.len(),
        retrying: snapshot
            .queue
            .iter()
            .filter(|i| i.retry.retry_count > 0)
            .count(),
        blocked: snapshot
            .queue
            .iter()
            .filter(|i| i.dependencies.iter().any(|d| unfinished.contains(&d.as_str())))
            .count(),
    };

    let operations = OperationStats {
        queued: snapshot.operations.len(),
        interrupted: snapshot
            .operations
            .iter()
            .filter(|op| op.status == OperationStatus::Syncing)
            .count(),
        failed: snapshot.failed_operations.len(),
        remote_ids: snapshot.remote_ids.len(),
    };

    InspectResult {
        path: path.display().to_string(),
        namespace: namespace.to_string(),
        key_count: snapshot.keys.len(),
        device_id: snapshot.device_id.clone(),
        last_sync: snapshot.last_sync.map(|t| t.to_rfc3339()),
        deltas,
        queue,
        operations,
    }
}

fn print_text_output(result: &InspectResult) {
    println!("QuillSync Store: {}", result.path);
    println!("Namespace: {}", result.namespace);
    println!("==========================================");
    println!();
    println!("Keys:            {}", result.key_count);
    println!(
        "Device ID:       {}",
        result.device_id.as_deref().unwrap_or("(none)")
    );
    println!(
        "Last Sync:       {}",
        result.last_sync.as_deref().unwrap_or("never")
    );
    println!();
    println!("Pending Deltas:  {}", result.deltas.total);
    for (change, count) in &result.deltas.by_change {
        println!("  {:<14} {}", change, count);
    }
    for (entity, count) in &result.deltas.by_entity {
        println!("  {:<14} {}", entity, count);
    }
    println!();
    println!("Operation Queue:");
    println!("  Active:        {}", result.queue.active);
    println!("  Retrying:      {}", result.queue.retrying);
    println!("  Blocked:       {}", result.queue.blocked);
    println!("  Failed:        {}", result.queue.failed);
    println!();
    println!("Optimistic Operations:");
    println!("  Queued:        {}", result.operations.queued);
    println!("  Interrupted:   {}", result.operations.interrupted);
    println!("  Failed:        {}", result.operations.failed);
    println!("  Remote IDs:    {}", result.operations.remote_ids);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::snapshot::seed_store;

    #[test]
    fn summarizes_seeded_store() {
        let dir = tempfile::tempdir().unwrap();
        seed_store(dir.path());

        let store = open_store(dir.path()).unwrap();
        let snapshot = Snapshot::load(&store, "quillsync").unwrap();
        let result = summarize(dir.path(), "quillsync", &snapshot);

        assert_eq!(result.deltas.total, 1);
        assert_eq!(result.deltas.by_change.get("create"), Some(&1));
        assert_eq!(result.deltas.by_entity.get("project"), Some(&1));
        assert_eq!(result.queue.active, 1);
        assert_eq!(result.queue.blocked, 0);
        assert_eq!(result.operations.queued, 0);
        assert!(result.last_sync.is_none());
    }

    #[test]
    fn json_output_is_serializable() {
        let dir = tempfile::tempdir().unwrap();
        seed_store(dir.path());

        let store = open_store(dir.path()).unwrap();
        let snapshot = Snapshot::load(&store, "quillsync").unwrap();
        let json = serde_json::to_value(summarize(dir.path(), "quillsync", &snapshot)).unwrap();
        assert_eq!(json["queue"]["active"], 1);
        assert_eq!(json["namespace"], "quillsync");
    }
}
