//! Shutdown Coordination
//!
//! One cancellation signal per owner (a session or a single link) plus the
//! set of tasks it spawned, so that closing can wait until every task has
//! actually returned.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Cancellation signal and task registry.
#[derive(Clone)]
pub struct ShutdownController {
    /// Flips to `true` exactly once
    signal: Arc<watch::Sender<bool>>,
    /// Tasks spawned under this controller
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl ShutdownController {
    /// Create a new controller.
    pub fn new() -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            signal: Arc::new(signal),
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Raise the cancellation signal. Returns false if it was already raised.
    pub fn shutdown(&self) -> bool {
        self.signal.send_if_modified(|raised| {
            if *raised {
                false
            } else {
                *raised = true;
                true
            }
        })
    }

    /// Check if the signal has been raised.
    pub fn is_shutdown(&self) -> bool {
        *self.signal.borrow()
    }

    /// Resolves once the signal is raised (immediately if it already was).
    pub async fn cancelled(&self) {
        let mut rx = self.signal.subscribe();
        // The sender lives in `self`, so the wait cannot fail.
        let _ = rx.wait_for(|raised| *raised).await;
    }

    /// Spawn a task tracked by this controller.
    ///
    /// After shutdown the future is dropped without running.
    pub fn spawn<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_shutdown() {
            return false;
        }
        let mut tasks = self.tasks.lock();
        tasks.retain(|handle| !handle.is_finished());
        tasks.push(tokio::spawn(task));
        true
    }

    /// Number of tracked tasks that have not finished yet.
    pub fn active_tasks(&self) -> usize {
        self.tasks.lock().iter().filter(|h| !h.is_finished()).count()
    }

    /// Wait for every tracked task to return, aborting stragglers after `timeout`.
    ///
    /// Returns true if all tasks finished on their own.
    pub async fn join_all(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut clean = true;

        loop {
            let handles: Vec<_> = std::mem::take(&mut *self.tasks.lock());
            if handles.is_empty() {
                return clean;
            }

            for mut handle in handles {
                if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                    tracing::warn!("task did not stop before shutdown deadline, aborting");
                    handle.abort();
                    let _ = handle.await;
                    clean = false;
                }
            }
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}
