#![allow(unsafe_op_in_unsafe_fn)]

use crate::alloc::{AllocError, ThreadAllocator};
use crate::runtime::{AsyncContext, AwaitableManager, Schedule, SchedulerConfig, ThreadPool};
use crate::task::{self, FrameAlloc, Id, Notified, TaskFault, TaskHandle, TaskState};
use crate::time::Wait;
use anyhow::Result;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

#[cfg(test)]
use crate::utils::tracker::{Call, Tracker};

/// Owns everything tasks call back into: the pool that resumes them, the
/// allocator hosting their control blocks and the awaitable manager holding
/// their waits.
///
/// Every task keeps a clone as its scheduler, so the manager lives until
/// the last control block is torn down.
#[derive(Clone)]
pub(crate) struct TaskManager {
    shared: Arc<Shared>,
}

struct Shared {
    cfg: SchedulerConfig,

    pool: ThreadPool,

    allocator: ThreadAllocator,

    awaitables: Arc<AwaitableManager>,

    /// Tasks launched and not yet torn down.
    alive: AtomicUsize,

    #[cfg(test)]
    tracker: Tracker,
}

impl TaskManager {
    pub(crate) fn new(cfg: SchedulerConfig) -> Result<Self> {
        let pool = ThreadPool::new(&cfg)?;
        let allocator = ThreadAllocator::new(cfg.chunk_capacity, cfg.max_block_size);

        Ok(Self {
            shared: Arc::new(Shared {
                cfg,
                pool,
                allocator,
                awaitables: Arc::new(AwaitableManager::new()),
                alive: AtomicUsize::new(0),
                #[cfg(test)]
                tracker: Tracker::new(),
            }),
        })
    }

    pub(crate) fn config(&self) -> &SchedulerConfig {
        &self.shared.cfg
    }

    pub(crate) fn pool(&self) -> &ThreadPool {
        &self.shared.pool
    }

    pub(crate) fn awaitables(&self) -> &Arc<AwaitableManager> {
        &self.shared.awaitables
    }

    pub(crate) fn num_alive(&self) -> usize {
        self.shared.alive.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn tracker(&self) -> &Tracker {
        &self.shared.tracker
    }

    /// Invokes `f` with a context bound to this manager and launches the
    /// future it returns.
    pub(crate) fn launch<F, Fut>(&self, f: F) -> Result<TaskHandle<Fut::Output>, AllocError>
    where
        F: FnOnce(AsyncContext) -> Fut,
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        let future = f(AsyncContext::new(self.clone()));
        self.spawn(future)
    }

    /// Moves `future` into a control block allocated on the calling
    /// thread's chunk and submits its first poll to the pool.
    pub(crate) fn spawn<Fut>(&self, future: Fut) -> Result<TaskHandle<Fut::Output>, AllocError>
    where
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        let id = Id::next();
        let (notified, handle) = task::new_task(future, self.clone(), id)?;

        self.shared.alive.fetch_add(1, Ordering::AcqRel);
        tracing::trace!(task.id = %id, "launched task");

        #[cfg(test)]
        self.shared.tracker.record(Call::Launch { id });

        self.resume(notified);
        Ok(handle)
    }

    /// A wait on this manager's awaitables, elapsed once a `poll` observes
    /// `deadline`.
    pub(crate) fn wait_until(&self, deadline: Instant) -> Wait {
        Wait::new(Arc::clone(&self.shared.awaitables), deadline)
    }

    /// Stops the pool and drops every pending wait. Tasks suspended on a
    /// wait lose their last waker and, once their handle is gone, are torn
    /// down.
    pub(crate) fn shutdown(&self) -> Result<()> {
        let res = self.shared.pool.shutdown();

        let cleared = self.shared.awaitables.clear();
        if cleared > 0 {
            tracing::debug!(cleared, "dropped pending waits on shutdown");
        }

        res
    }
}

impl Schedule for TaskManager {
    fn resume(&self, task: Notified<Self>) {
        #[cfg(test)]
        self.shared.tracker.record(Call::Resume { id: task.id() });

        self.shared.pool.enqueue(Box::new(move || task.run()));
    }

    fn allocator(&self) -> &ThreadAllocator {
        &self.shared.allocator
    }

    unsafe fn destroy_task(&self, id: Id, frame: FrameAlloc) {
        frame.drop_in_place();
        self.shared
            .allocator
            .deallocate_layout(frame.ptr(), frame.layout());

        tracing::trace!(task.id = %id, size = frame.layout().size(), "destroyed task");

        #[cfg(test)]
        self.shared.tracker.record(Call::Destroy { id });

        self.shared.alive.fetch_sub(1, Ordering::AcqRel);
    }

    fn set_task_completed(&self, id: Id, state: TaskState) {
        tracing::trace!(
            task.id = %id,
            handle_dropped = state.contains(TaskState::HANDLE_DROPPED),
            "task completed"
        );
    }

    fn unhandled_fault(&self, fault: &TaskFault) {
        tracing::warn!(task.id = %fault.id(), message = fault.message(), "task panicked");

        #[cfg(test)]
        self.shared.tracker.record(Call::Fault {
            id: fault.id(),
            message: fault.message().to_owned(),
        });
    }
}

impl fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskManager")
            .field("alive", &self.num_alive())
            .field("pool", &self.shared.pool)
            .field("awaitables", &self.shared.awaitables)
            .finish()
    }
}
