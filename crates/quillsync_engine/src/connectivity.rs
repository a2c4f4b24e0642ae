//! Online/offline signal shared by every queue.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Publishes connectivity transitions to any number of observers.
///
/// Cloning yields another handle to the same signal.
#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    tx: Arc<watch::Sender<bool>>,
}

impl ConnectivityMonitor {
    /// Creates a monitor with the given initial state.
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    /// Publishes a new state. Returns true if the state changed.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            debug!(online, "connectivity changed");
        }
        changed
    }

    /// Returns the current state.
    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Returns a receiver that observes every transition.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(false)
    }
}

/// Spawns a task that forwards every transition to `on_change`.
///
/// The task ends when every monitor handle is dropped or `on_change`
/// returns false. Outside a tokio runtime nothing is spawned.
pub(crate) fn forward_transitions<F>(monitor: &ConnectivityMonitor, on_change: F)
where
    F: Fn(bool) -> bool + Send + 'static,
{
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        warn!("no tokio runtime; connectivity transitions will not be observed");
        return;
    };
    let mut rx = monitor.subscribe();
    handle.spawn(async move {
        while rx.changed().await.is_ok() {
            let online = *rx.borrow_and_update();
            if !on_change(online) {
                break;
            }
        }
    });
}
