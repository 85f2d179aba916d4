//! Tracking of forwarding-endpoint tasks
//!
//! Every negotiated forwarding endpoint runs as a background task keyed by
//! its port, so the endpoint server can abort them all on close.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Default)]
pub struct TaskTracker {
    tasks: Mutex<HashMap<u16, JoinHandle<()>>>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<u16, JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register the task serving `port`, aborting any previous one
    pub fn register(&self, port: u16, handle: JoinHandle<()>) {
        let mut tasks = self.tasks();
        tasks.retain(|_, h| !h.is_finished());
        if let Some(old_handle) = tasks.insert(port, handle) {
            old_handle.abort();
        }
    }

    /// Abort every tracked task
    pub fn abort_all(&self) {
        for (port, handle) in self.tasks().drain() {
            debug!(port = port, "Aborting forwarding endpoint task");
            handle.abort();
        }
    }

    /// Number of tasks still running
    pub fn active(&self) -> usize {
        self.tasks().values().filter(|h| !h.is_finished()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sleeper() -> JoinHandle<()> {
        tokio::spawn(async { tokio::time::sleep(Duration::from_secs(10)).await })
    }

    #[tokio::test]
    async fn test_register_tracks_running_task() {
        let tracker = TaskTracker::new();

        tracker.register(51000, sleeper());
        tracker.register(51001, sleeper());
        assert_eq!(tracker.active(), 2);
    }

    #[tokio::test]
    async fn test_abort_all_after_poisoned_lock() {
        let tracker = std::sync::Arc::new(TaskTracker::new());
        let first = sleeper();
        let first_abort = first.abort_handle();
        tracker.register(51000, first);

        let poisoner = tracker.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.tasks.lock().unwrap();
            panic!("poison the task map");
        })
        .join();
        assert!(tracker.tasks.is_poisoned());

        tracker.register(51001, sleeper());
        tracker.abort_all();
        assert_eq!(tracker.active(), 0);

        for _ in 0..50 {
            if first_abort.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(first_abort.is_finished());
    }

    #[tokio::test]
    async fn test_replacing_task_aborts_old() {
        let tracker = TaskTracker::new();

        let first = sleeper();
        let first_abort = first.abort_handle();
        tracker.register(51000, first);
        tracker.register(51000, sleeper());

        assert_eq!(tracker.tasks().len(), 1);
        for _ in 0..50 {
            if first_abort.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(first_abort.is_finished());
    }

    #[tokio::test]
    async fn test_abort_all() {
        let tracker = TaskTracker::new();
        tracker.register(1, sleeper());
        tracker.register(2, sleeper());

        tracker.abort_all();
        assert_eq!(tracker.active(), 0);
    }
}
