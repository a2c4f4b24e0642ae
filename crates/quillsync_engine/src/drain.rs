//! Single-flight draining and background scheduling.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

/// Clears the busy flag when dropped.
pub(crate) struct DrainGuard<'a>(&'a AtomicBool);

impl<'a> DrainGuard<'a> {
    /// Claims the flag. Returns `None` if a drain is already running.
    pub(crate) fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        if flag.swap(true, Ordering::AcqRel) {
            None
        } else {
            Some(Self(flag))
        }
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Spawns `task` on the current runtime after `delay`.
///
/// Outside a tokio runtime the task is dropped; the next explicit drain
/// picks the work up.
pub(crate) fn spawn_after<F>(delay: Duration, task: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                task.await;
            });
        }
        Err(_) => debug!("no tokio runtime; drain not scheduled"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_is_single_flight() {
        let flag = AtomicBool::new(false);
        let guard = DrainGuard::try_acquire(&flag);
        assert!(guard.is_some());
        assert!(DrainGuard::try_acquire(&flag).is_none());
        drop(guard);
        assert!(DrainGuard::try_acquire(&flag).is_some());
    }
}
