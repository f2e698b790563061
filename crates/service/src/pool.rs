use std::future::Future;

use parking_lot::Mutex;
use tokio::{sync::watch, task::JoinSet};

/// A group of tasks with graceful, ordered shutdown.
///
/// A master peer runs two of these: the worker group carrying per-message
/// processing and the small boss group carrying the accept loops, torn down
/// in that order. Long-running tasks subscribe to [`Pool::closing`] and bail
/// out when it flips.
pub struct Pool {
    tasks: Mutex<JoinSet<()>>,
    closing: watch::Sender<bool>,
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}

impl Pool {
    pub fn new() -> Self {
        let (closing, _) = watch::channel(false);
        Self {
            tasks: Mutex::new(JoinSet::new()),
            closing,
        }
    }

    pub fn closing(&self) -> watch::Receiver<bool> {
        self.closing.subscribe()
    }

    pub fn is_closing(&self) -> bool {
        *self.closing.borrow()
    }

    /// Spawn onto the group. After shutdown started the task is dropped
    /// without running.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_closing() {
            return;
        }

        self.tasks.lock().spawn(future);
    }

    /// Signal the group and wait until every task has terminated.
    /// Idempotent.
    pub async fn shutdown(&self) {
        let _ = self.closing.send(true);

        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        while tasks.join_next().await.is_some() {}
    }
}
