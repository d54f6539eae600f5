//! # Task Supervisor
//!
//! Central shutdown coordinator for every background loop of the engine.
//! Each loop is spawned through the supervisor, receives a cancellation token
//! derived from the root token, and is tracked until it returns. Shutdown
//! cancels the root token and waits, with a bound, for every tracked task to
//! acknowledge.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

#[derive(Clone, Default)]
pub struct Supervisor {
    root: CancellationToken,
    tracker: TaskTracker,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token cancelled when the whole engine shuts down.
    pub fn token(&self) -> CancellationToken {
        self.root.clone()
    }

    /// A token that can be cancelled on its own and is also cancelled by shutdown.
    pub fn child_token(&self) -> CancellationToken {
        self.root.child_token()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.root.is_cancelled()
    }

    /// Spawns a tracked task.
    pub fn spawn<F>(&self, name: &'static str, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tracing::debug!(task = name, "spawning supervised task");
        self.tracker.spawn(async move {
            task.await;
            tracing::debug!(task = name, "supervised task finished");
        })
    }

    pub fn active_tasks(&self) -> usize {
        self.tracker.len()
    }

    /// Cancels every task and waits up to `limit` for them to finish.
    /// Returns false if some tasks were still running when the limit expired.
    pub async fn shutdown(&self, limit: Duration) -> bool {
        self.root.cancel();
        self.tracker.close();
        match tokio::time::timeout(limit, self.tracker.wait()).await {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!(
                    remaining = self.tracker.len(),
                    "supervised tasks did not stop within {:?}",
                    limit
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn shutdown_waits_for_every_task() {
        let sup = Supervisor::new();
        let stopped = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let token = sup.child_token();
            let stopped = Arc::clone(&stopped);
            sup.spawn("loop", async move {
                token.cancelled().await;
                stopped.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert!(sup.shutdown(Duration::from_secs(1)).await);
        assert_eq!(stopped.load(Ordering::SeqCst), 3);
        assert_eq!(sup.active_tasks(), 0);
    }

    #[tokio::test]
    async fn child_cancellation_is_isolated() {
        let sup = Supervisor::new();
        let a = sup.child_token();
        let b = sup.child_token();
        a.cancel();
        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());
        assert!(!sup.is_shutting_down());
    }
}
