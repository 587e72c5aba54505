use crate::runtime::TaskManager;
use crate::task::TaskHandle;
use crate::time::{Wait, YieldNow};
use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

/// Handed to the callable passed to
/// [`AsyncScheduler::launch`](crate::runtime::AsyncScheduler::launch). Gives
/// the task access to the scheduler that runs it.
#[derive(Clone)]
pub struct AsyncContext {
    manager: TaskManager,
}

impl AsyncContext {
    pub(crate) fn new(manager: TaskManager) -> Self {
        Self { manager }
    }

    /// Suspends until `duration` from now passed and a scheduler `poll`
    /// observed it.
    pub fn wait(&self, duration: Duration) -> Wait {
        self.wait_until(Instant::now() + duration)
    }

    /// Suspends until `deadline` passed and a scheduler `poll` observed it.
    pub fn wait_until(&self, deadline: Instant) -> Wait {
        self.manager.wait_until(deadline)
    }

    /// Yields back to the pool once. The task is resubmitted through
    /// `enqueue` and polled again later.
    pub fn yield_now(&self) -> YieldNow {
        YieldNow::new()
    }

    /// Launches a nested task. See
    /// [`AsyncScheduler::launch`](crate::runtime::AsyncScheduler::launch).
    ///
    /// # Panics
    ///
    /// If the calling thread's chunk cannot host the task.
    #[track_caller]
    pub fn launch<F, Fut>(&self, f: F) -> TaskHandle<Fut::Output>
    where
        F: FnOnce(AsyncContext) -> Fut,
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        match self.manager.launch(f) {
            Ok(handle) => handle,
            Err(e) => panic!("failed to allocate task: {e}"),
        }
    }

    /// Launches a nested task from a future.
    ///
    /// # Panics
    ///
    /// If the calling thread's chunk cannot host the task.
    #[track_caller]
    pub fn spawn<Fut>(&self, future: Fut) -> TaskHandle<Fut::Output>
    where
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        match self.manager.spawn(future) {
            Ok(handle) => handle,
            Err(e) => panic!("failed to allocate task: {e}"),
        }
    }
}

impl fmt::Debug for AsyncContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncContext").finish_non_exhaustive()
    }
}
