//! Outgoing sync bundles.

use crate::delta::Delta;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Pending deltas bundled for upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncPayload {
    /// Device that produced the deltas.
    pub device_id: String,
    /// Time of the last acknowledged sync, if any.
    pub last_sync: Option<DateTime<Utc>>,
    /// Pending deltas in causal order.
    pub deltas: Vec<Delta>,
    /// Wrapping sum of the delta checksums.
    pub checksum: u64,
}

impl SyncPayload {
    /// Bundles `deltas` and computes the payload checksum.
    pub fn new(device_id: String, last_sync: Option<DateTime<Utc>>, deltas: Vec<Delta>) -> Self {
        let checksum = Self::sum(&deltas);
        Self {
            device_id,
            last_sync,
            deltas,
            checksum,
        }
    }

    fn sum(deltas: &[Delta]) -> u64 {
        deltas
            .iter()
            .fold(0u64, |acc, d| acc.wrapping_add(d.checksum))
    }

    /// Returns true if the bundle checksum and every delta checksum are intact.
    pub fn verify(&self) -> bool {
        self.checksum == Self::sum(&self.deltas) && self.deltas.iter().all(Delta::verify_checksum)
    }

    /// Returns true if there is nothing to upload.
    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    /// Returns the number of deltas.
    pub fn len(&self) -> usize {
        self.deltas.len()
    }
}
