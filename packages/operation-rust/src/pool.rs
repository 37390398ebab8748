//! Execution substrate seam.
//!
//! Customer code, ticket transmission and deadline timers all run as tasks
//! submitted to a [`Pool`]. The pool is injected into every operation so
//! tests and embedders can choose where that work runs.

use futures_util::future::BoxFuture;
use tokio::runtime::Handle;

/// A unit of work submitted to a [`Pool`].
pub type Task = BoxFuture<'static, ()>;

/// Schedules tasks to run asynchronously.
///
/// No ordering is guaranteed between distinct submissions. Operations only
/// submit while holding no lock of their own.
pub trait Pool: Send + Sync + 'static {
    /// Schedules `task` to run.
    fn submit(&self, task: Task);
}

/// [`Pool`] backed by a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioPool {
    handle: Handle,
}

impl TokioPool {
    /// Creates a pool that spawns onto the given runtime.
    #[must_use]
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Creates a pool that spawns onto the runtime this call is made from.
    ///
    /// # Panics
    ///
    /// Panics if called outside the context of a tokio runtime.
    #[must_use]
    pub fn current() -> Self {
        Self::new(Handle::current())
    }
}

impl Pool for TokioPool {
    fn submit(&self, task: Task) {
        // Detached: tasks report their results through the operation.
        drop(self.handle.spawn(task));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::oneshot;

    use super::*;

    #[tokio::test]
    async fn submitted_task_runs() {
        let pool = TokioPool::current();
        let (tx, rx) = oneshot::channel();
        pool.submit(Box::pin(async move {
            let _ = tx.send(7);
        }));
        assert_eq!(rx.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn usable_as_trait_object() {
        let pool: Arc<dyn Pool> = Arc::new(TokioPool::current());
        let (tx, rx) = oneshot::channel();
        pool.submit(Box::pin(async move {
            let _ = tx.send("ran");
        }));
        assert_eq!(rx.await.unwrap(), "ran");
    }
}
