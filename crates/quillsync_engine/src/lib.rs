//! # QuillSync Engine
//!
//! Offline-first delta synchronization for QuillSync clients.
//!
//! This crate provides:
//! - [`ChangeTracker`]: minimal per-entity deltas, checksums, sync payloads
//!   and conflict resolution against remote deltas
//! - [`OperationQueue`]: a persistent, dependency-aware queue drained in
//!   bounded batches with linear backoff
//! - [`OptimisticQueue`]: applies mutations locally at once and syncs them
//!   in the background with exponential backoff
//! - [`SyncEngine`]: wires all three to one store and one connectivity signal
//!
//! ## Architecture
//!
//! ```text
//! application ──► OptimisticQueue ──► RemoteStore
//!                      │
//!                      ▼
//!   OperationQueue ──► ChangeTracker ◄── remote deltas
//!        │
//!        ▼
//!   QueueExecutor
//! ```
//!
//! ## Key Invariants
//!
//! - At most one pending delta or pending queue record per entity
//! - Client-assigned ids are the correlation key on the remote
//! - Draining is single-flight per queue
//! - Everything the tracker and the durable queue hold survives restart
//!
//! ## Example
//!
//! ```rust,no_run
//! use quillsync_engine::{EngineConfig, MemoryLocalState, OperationRequest, RemoteStore, SyncEngine};
//! use quillsync_protocol::{Payload, ProjectFields};
//! use quillsync_storage::InMemoryStore;
//! use std::sync::Arc;
//!
//! # async fn run(remote: Arc<dyn RemoteStore>) -> Result<(), Box<dyn std::error::Error>> {
//! let engine = SyncEngine::open(
//!     Arc::new(InMemoryStore::new()),
//!     remote,
//!     Arc::new(MemoryLocalState::new()),
//!     EngineConfig::default(),
//! )?;
//!
//! engine.optimistic().add_operation(OperationRequest::create(
//!     "project-1",
//!     Payload::Project(ProjectFields {
//!         owner_id: Some("user-1".into()),
//!         title: Some("The Long Winter".into()),
//!         ..Default::default()
//!     }),
//! ))?;
//!
//! engine.set_online(true);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod connectivity;
mod drain;
mod engine;
mod error;
mod executor;
mod intent;
mod local;
mod optimistic;
pub mod persist;
mod queue;
mod retry;
mod tracker;

pub use config::{
    EngineConfig, OptimisticConfig, PersistenceMode, QueueConfig, TrackerConfig, DEFAULT_NAMESPACE,
};
pub use connectivity::ConnectivityMonitor;
pub use engine::SyncEngine;
pub use error::{EngineError, EngineResult, RemoteError};
pub use executor::{CorrelationKey, QueueExecutor, RemoteQueueExecutor, RemoteRecord, RemoteStore};
pub use intent::{Enqueued, Priority, PriorityWeights};
pub use local::{LocalApplier, MemoryLocalState};
pub use optimistic::{
    OperationRequest, OperationStatus, OptimisticQueue, OptimisticStatus, SyncOperation,
};
pub use queue::{DrainReport, EnqueueRequest, OperationQueue, QueueItem, QueueStatus};
pub use retry::{BackoffPolicy, RetryState};
pub use tracker::ChangeTracker;
