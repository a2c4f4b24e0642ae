//! Test doubles and store fixtures.
//!
//! Every double here is a stand-in for a real remote; none of them belongs
//! in production wiring.

use async_trait::async_trait;
use parking_lot::Mutex;
use quillsync_engine::{CorrelationKey, QueueExecutor, QueueItem, RemoteError, RemoteRecord, RemoteStore};
use quillsync_protocol::{EntityId, Payload};
use quillsync_storage::FileStore;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Kind of remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOp {
    /// `insert`.
    Insert,
    /// `update`.
    Update,
    /// `delete`.
    Delete,
}

/// One call observed by [`InMemoryRemote`].
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCall {
    /// Call kind.
    pub op: RemoteOp,
    /// Target collection.
    pub collection: String,
    /// Correlation key.
    pub key: CorrelationKey,
    /// Payload sent, if any.
    pub data: Option<Payload>,
}

#[derive(Debug, Clone)]
struct Row {
    remote_id: String,
    data: Payload,
}

/// A recording, in-memory [`RemoteStore`] with scripted failures.
///
/// Inserting an existing correlation key returns the existing record, so a
/// replayed create is harmless.
#[derive(Debug, Default)]
pub struct InMemoryRemote {
    rows: Mutex<BTreeMap<(String, EntityId), Row>>,
    calls: Mutex<Vec<RemoteCall>>,
    failures: Mutex<VecDeque<RemoteError>>,
    latency: Mutex<Option<Duration>>,
    next_id: AtomicU64,
}

impl InMemoryRemote {
    /// Creates an empty remote.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty remote behind an `Arc`.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Makes the next call fail with `error`.
    pub fn fail_next(&self, error: RemoteError) {
        self.failures.lock().push_back(error);
    }

    /// Makes the next `n` calls fail with `error`.
    pub fn fail_next_n(&self, error: RemoteError, n: usize) {
        let mut failures = self.failures.lock();
        for _ in 0..n {
            failures.push_back(error.clone());
        }
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    /// Returns every call made so far.
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.calls.lock().clone()
    }

    /// Returns the calls of one kind.
    pub fn calls_of(&self, op: RemoteOp) -> Vec<RemoteCall> {
        self.calls.lock().iter().filter(|c| c.op == op).cloned().collect()
    }

    /// Returns the stored value of a record.
    pub fn record(&self, collection: &str, entity_id: &EntityId) -> Option<Payload> {
        self.rows
            .lock()
            .get(&(collection.to_string(), entity_id.clone()))
            .map(|row| row.data.clone())
    }

    /// Returns the number of stored records.
    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }

    async fn begin(
        &self,
        op: RemoteOp,
        collection: &str,
        key: &CorrelationKey,
        data: Option<&Payload>,
    ) -> Result<(), RemoteError> {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.calls.lock().push(RemoteCall {
            op,
            collection: collection.to_string(),
            key: key.clone(),
            data: data.cloned(),
        });
        match self.failures.lock().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn not_found(collection: &str, key: &CorrelationKey) -> RemoteError {
        RemoteError::NotFound {
            collection: collection.to_string(),
            entity_id: key.entity_id.to_string(),
        }
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemote {
    async fn insert(
        &self,
        collection: &str,
        key: &CorrelationKey,
        data: &Payload,
    ) -> Result<RemoteRecord, RemoteError> {
        self.begin(RemoteOp::Insert, collection, key, Some(data)).await?;
        let mut rows = self.rows.lock();
        let row = rows
            .entry((collection.to_string(), key.entity_id.clone()))
            .or_insert_with(|| Row {
                remote_id: format!("remote-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1),
                data: data.clone(),
            });
        Ok(RemoteRecord {
            remote_id: row.remote_id.clone(),
            entity_id: key.entity_id.clone(),
        })
    }

    async fn update(
        &self,
        collection: &str,
        key: &CorrelationKey,
        data: &Payload,
    ) -> Result<RemoteRecord, RemoteError> {
        self.begin(RemoteOp::Update, collection, key, Some(data)).await?;
        let mut rows = self.rows.lock();
        let row = rows
            .get_mut(&(collection.to_string(), key.entity_id.clone()))
            .ok_or_else(|| Self::not_found(collection, key))?;
        row.data
            .overlay(data)
            .map_err(|e| RemoteError::permanent(e.to_string()))?;
        Ok(RemoteRecord {
            remote_id: row.remote_id.clone(),
            entity_id: key.entity_id.clone(),
        })
    }

    async fn delete(&self, collection: &str, key: &CorrelationKey) -> Result<(), RemoteError> {
        self.begin(RemoteOp::Delete, collection, key, None).await?;
        self.rows
            .lock()
            .remove(&(collection.to_string(), key.entity_id.clone()))
            .map(|_| ())
            .ok_or_else(|| Self::not_found(collection, key))
    }
}

/// A [`QueueExecutor`] that replays a fixed script of outcomes.
///
/// Once the script runs out every call succeeds.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    script: Mutex<VecDeque<Result<(), RemoteError>>>,
    executed: Mutex<Vec<QueueItem>>,
}

impl ScriptedExecutor {
    /// Creates an executor that always succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an executor that replays `script`.
    pub fn with_script<I>(script: I) -> Self
    where
        I: IntoIterator<Item = Result<(), RemoteError>>,
    {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            executed: Mutex::new(Vec::new()),
        }
    }

    /// Appends an outcome to the script.
    pub fn push(&self, outcome: Result<(), RemoteError>) {
        self.script.lock().push_back(outcome);
    }

    /// Returns every item executed so far, in call order.
    pub fn executed(&self) -> Vec<QueueItem> {
        self.executed.lock().clone()
    }

    /// Returns the entity ids executed so far, in call order.
    pub fn executed_entities(&self) -> Vec<String> {
        self.executed
            .lock()
            .iter()
            .map(|item| item.entity_id.to_string())
            .collect()
    }
}

#[async_trait]
impl QueueExecutor for ScriptedExecutor {
    async fn execute(&self, item: &QueueItem) -> Result<(), RemoteError> {
        self.executed.lock().push(item.clone());
        self.script.lock().pop_front().unwrap_or(Ok(()))
    }
}

/// A [`QueueExecutor`] that fails transiently at a fixed rate.
///
/// Outcomes come from a seeded RNG, so a given seed always produces the
/// same sequence.
#[derive(Debug)]
pub struct FlakyExecutor {
    rng: Mutex<StdRng>,
    failure_rate: f64,
    attempts: AtomicU64,
    successes: AtomicU64,
}

impl FlakyExecutor {
    /// Creates an executor failing with probability `failure_rate`.
    pub fn new(seed: u64, failure_rate: f64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            failure_rate: failure_rate.clamp(0.0, 1.0),
            attempts: AtomicU64::new(0),
            successes: AtomicU64::new(0),
        }
    }

    /// Returns the number of calls made.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Returns the number of successful calls.
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueueExecutor for FlakyExecutor {
    async fn execute(&self, item: &QueueItem) -> Result<(), RemoteError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let fails = self.rng.lock().gen_bool(self.failure_rate);
        if fails {
            Err(RemoteError::transient(format!("flaky failure for {}", item.id)))
        } else {
            self.successes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}

/// A [`FileStore`] in a temporary directory.
pub struct TempStore {
    /// The store.
    pub store: Arc<FileStore>,
    dir: TempDir,
}

impl TempStore {
    /// Opens a store in a fresh temporary directory.
    pub fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let store = Arc::new(FileStore::open(dir.path()).expect("Failed to open file store"));
        Self { store, dir }
    }

    /// Drops the current store handle and opens the directory again.
    ///
    /// Every other clone of [`TempStore::store`] must be dropped first, or
    /// the directory lock is still held.
    pub fn reopen(self) -> Self {
        let Self { store, dir } = self;
        drop(store);
        let store = Arc::new(FileStore::open(dir.path()).expect("Failed to reopen file store"));
        Self { store, dir }
    }
}

impl Default for TempStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quillsync_protocol::{EntityKind, ProjectFields};

    fn key(id: &str) -> CorrelationKey {
        CorrelationKey::new(EntityKind::Project, id.into(), None)
    }

    fn titled(title: &str) -> Payload {
        Payload::Project(ProjectFields {
            title: Some(title.into()),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn remote_insert_is_idempotent_per_key() {
        let remote = InMemoryRemote::new();
        let first = remote.insert("projects", &key("p-1"), &titled("A")).await.unwrap();
        let again = remote.insert("projects", &key("p-1"), &titled("A")).await.unwrap();

        assert_eq!(first.remote_id, again.remote_id);
        assert_eq!(remote.len(), 1);
        assert_eq!(remote.calls_of(RemoteOp::Insert).len(), 2);
    }

    #[tokio::test]
    async fn remote_update_and_delete() {
        let remote = InMemoryRemote::new();
        assert!(matches!(
            remote.update("projects", &key("p-1"), &titled("B")).await,
            Err(RemoteError::NotFound { .. })
        ));

        remote.insert("projects", &key("p-1"), &titled("A")).await.unwrap();
        remote.update("projects", &key("p-1"), &titled("B")).await.unwrap();
        assert_eq!(remote.record("projects", &"p-1".into()), Some(titled("B")));

        remote.delete("projects", &key("p-1")).await.unwrap();
        assert!(remote.is_empty());
    }

    #[tokio::test]
    async fn scripted_failures_come_first() {
        let remote = InMemoryRemote::new();
        remote.fail_next(RemoteError::transient("down"));
        assert!(remote.insert("projects", &key("p-1"), &titled("A")).await.is_err());
        assert!(remote.insert("projects", &key("p-1"), &titled("A")).await.is_ok());
    }

    #[test]
    fn flaky_executor_is_deterministic() {
        let run = |seed| {
            let exec = FlakyExecutor::new(seed, 0.5);
            let mut rng = exec.rng.lock();
            (0..16).map(|_| rng.gen_bool(0.5)).collect::<Vec<_>>()
        };
        assert_eq!(run(7), run(7));
    }

    #[test]
    fn temp_store_reopens() {
        use quillsync_storage::KeyValueStore;

        let temp = TempStore::new();
        temp.store.set("ns.key", b"value").unwrap();
        let temp = temp.reopen();
        assert_eq!(temp.store.get("ns.key").unwrap(), Some(b"value".to_vec()));
    }
}
