//! Verify command implementation.

use super::snapshot::{open_store, Snapshot};
use quillsync_protocol::{ChangeKind, SyncPayload};
use std::collections::HashSet;
use std::path::Path;

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Number of records checked.
    pub records_checked: usize,
    /// Number of valid records.
    pub valid_records: usize,
    /// List of errors found.
    pub errors: Vec<String>,
}

impl VerifyResult {
    fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    fn check(&mut self, ok: bool, error: impl FnOnce() -> String) {
        self.records_checked += 1;
        if ok {
            self.valid_records += 1;
        } else {
            self.errors.push(error());
        }
    }
}

/// Runs the verify command.
pub fn run(path: &Path, namespace: &str) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying store at {:?} (namespace {})", path, namespace);
    println!();

    let store = open_store(path)?;
    let snapshot = Snapshot::load(&store, namespace)?;

    println!("Checking deltas...");
    let delta_result = verify_deltas(&snapshot);
    print_result("Deltas", &delta_result);

    println!("Checking queue...");
    let queue_result = verify_queue(&snapshot);
    print_result("Queue", &queue_result);

    println!();
    if delta_result.is_ok() && queue_result.is_ok() {
        println!("✓ Store verification passed");
        Ok(())
    } else {
        println!("✗ Store verification failed");
        Err("Verification failed".into())
    }
}

fn verify_deltas(snapshot: &Snapshot) -> VerifyResult {
    let mut result = VerifyResult::default();
    let mut seen = HashSet::new();

    for delta in &snapshot.deltas {
        result.check(delta.verify_checksum(), || {
            format!("delta {}: checksum mismatch", delta.id)
        });
        result.check(seen.insert(delta.key()), || {
            format!(
                "delta {}: second pending delta for {} {}",
                delta.id, delta.entity_type, delta.entity_id
            )
        });
        let shape_ok = match delta.change {
            ChangeKind::Delete => delta.new_value.is_none(),
            ChangeKind::Create | ChangeKind::Update => delta
                .new_value
                .as_ref()
                .map_or(false, |v| v.kind() == delta.entity_type),
        };
        result.check(shape_ok, || {
            format!("delta {}: value does not match {} {}", delta.id, delta.change, delta.entity_type)
        });
    }

    let device_id = snapshot.device_id.clone().unwrap_or_default();
    let payload = SyncPayload::new(device_id, snapshot.last_sync, snapshot.deltas.clone());
    result.check(payload.verify(), || "upload bundle fails verification".to_string());
    result
}

fn verify_queue(snapshot: &Snapshot) -> VerifyResult {
    let mut result = VerifyResult::default();
    let mut ids = HashSet::new();
    for item in snapshot.queue.iter().chain(snapshot.failed.iter()) {
        result.check(ids.insert(item.id.as_str()), || format!("item {}: duplicate id", item.id));
        result.check(!item.dependencies.contains(&item.id), || {
            format!("item {}: depends on itself", item.id)
        });
    }
    result
}

fn print_result(name: &str, result: &VerifyResult) {
    println!("  {} checks: {}", name, result.records_checked);
    println!("  {} passed: {}", name, result.valid_records);

    if !result.errors.is_empty() {
        println!("  Errors:");
        for error in result.errors.iter().take(10) {
            println!("    - {}", error);
        }
        if result.errors.len() > 10 {
            println!("    ... and {} more", result.errors.len() - 10);
        }
    }
}
