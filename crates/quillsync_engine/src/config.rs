//! Configuration for the tracker and the queues.

use crate::intent::PriorityWeights;
use crate::retry::BackoffPolicy;
use std::time::Duration;

/// Default key namespace.
pub const DEFAULT_NAMESPACE: &str = "quillsync";

/// Configuration for the [`ChangeTracker`](crate::ChangeTracker).
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Store key namespace.
    pub namespace: String,
}

impl TrackerConfig {
    /// Sets the key namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
        }
    }
}

/// Configuration for the [`OperationQueue`](crate::OperationQueue).
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Store key namespace.
    pub namespace: String,
    /// Maximum items attempted per drain.
    pub batch_size: usize,
    /// Attempts before an item moves to the failed set.
    pub max_retries: u32,
    /// Linear backoff step.
    pub retry_delay: Duration,
    /// Pause between drains while work remains.
    pub drain_interval: Duration,
    /// Upper bound on a single executor call.
    pub execute_timeout: Duration,
    /// Priority weights.
    pub priority_weights: PriorityWeights,
}

impl QueueConfig {
    /// Sets the key namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Sets the batch size. Zero is treated as one.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Sets the maximum number of attempts.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the linear backoff step.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Sets the pause between drains.
    pub fn with_drain_interval(mut self, interval: Duration) -> Self {
        self.drain_interval = interval;
        self
    }

    /// Sets the per-call timeout.
    pub fn with_execute_timeout(mut self, timeout: Duration) -> Self {
        self.execute_timeout = timeout;
        self
    }

    /// Sets the priority weights.
    pub fn with_priority_weights(mut self, weights: PriorityWeights) -> Self {
        self.priority_weights = weights;
        self
    }

    /// Backoff policy derived from `retry_delay`.
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::linear(self.retry_delay)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            batch_size: 10,
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            drain_interval: Duration::from_millis(100),
            execute_timeout: Duration::from_secs(30),
            priority_weights: PriorityWeights::default(),
        }
    }
}

/// Whether the optimistic queue survives restarts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PersistenceMode {
    /// Operations live only in memory.
    #[default]
    InMemory,
    /// Operations are written to the key-value store after every change.
    Durable,
}

/// Configuration for the [`OptimisticQueue`](crate::OptimisticQueue).
#[derive(Debug, Clone)]
pub struct OptimisticConfig {
    /// Store key namespace.
    pub namespace: String,
    /// Attempts before an operation moves to the failed set.
    pub max_retries: u32,
    /// Backoff between attempts.
    pub backoff: BackoffPolicy,
    /// Upper bound on a single remote call.
    pub execute_timeout: Duration,
    /// Persistence mode.
    pub persistence: PersistenceMode,
    /// Priority weights.
    pub priority_weights: PriorityWeights,
}

impl OptimisticConfig {
    /// Sets the key namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Sets the maximum number of attempts.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the backoff policy.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the per-call timeout.
    pub fn with_execute_timeout(mut self, timeout: Duration) -> Self {
        self.execute_timeout = timeout;
        self
    }

    /// Sets the persistence mode.
    pub fn with_persistence(mut self, persistence: PersistenceMode) -> Self {
        self.persistence = persistence;
        self
    }
}

impl Default for OptimisticConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            max_retries: 3,
            backoff: BackoffPolicy::exponential(Duration::from_secs(1)),
            execute_timeout: Duration::from_secs(30),
            persistence: PersistenceMode::InMemory,
            priority_weights: PriorityWeights::default(),
        }
    }
}

/// Configuration for the [`SyncEngine`](crate::SyncEngine) facade.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Tracker configuration.
    pub tracker: TrackerConfig,
    /// Durable queue configuration.
    pub queue: QueueConfig,
    /// Optimistic queue configuration.
    pub optimistic: OptimisticConfig,
}

impl EngineConfig {
    /// Sets the key namespace on every component.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        self.tracker.namespace.clone_from(&namespace);
        self.queue.namespace.clone_from(&namespace);
        self.optimistic.namespace = namespace;
        self
    }

    /// Sets the durable queue configuration.
    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    /// Sets the optimistic queue configuration.
    pub fn with_optimistic(mut self, optimistic: OptimisticConfig) -> Self {
        self.optimistic = optimistic;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_config_builder() {
        let config = QueueConfig::default()
            .with_batch_size(0)
            .with_max_retries(5)
            .with_retry_delay(Duration::from_millis(250))
            .with_execute_timeout(Duration::from_secs(2));

        assert_eq!(config.batch_size, 1);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.backoff().delay(2), Duration::from_millis(500));
        assert_eq!(config.execute_timeout, Duration::from_secs(2));
    }

    #[test]
    fn engine_namespace_propagates() {
        let config = EngineConfig::default().with_namespace("alice");
        assert_eq!(config.tracker.namespace, "alice");
        assert_eq!(config.queue.namespace, "alice");
        assert_eq!(config.optimistic.namespace, "alice");
    }

    #[test]
    fn defaults() {
        let config = OptimisticConfig::default();
        assert_eq!(config.persistence, PersistenceMode::InMemory);
        assert_eq!(config.backoff.delay(1), Duration::from_secs(2));
        assert_eq!(QueueConfig::default().priority_weights.high, 3);
    }
}
