use crate::alloc::ThreadAllocator;
use crate::task::{FrameAlloc, Id, Notified, TaskFault, TaskState};

// Public API
mod builder;
pub use builder::Builder;
pub(crate) use builder::SchedulerConfig;

mod scheduler;
pub use scheduler::{AsyncScheduler, PollStats};

mod context;
pub use context::AsyncContext;

pub mod pool;
pub use pool::ThreadPool;

// Exports
mod awaitable;
pub(crate) use awaitable::{AwaitableManager, WaitSlot};

mod manager;
pub(crate) use manager::TaskManager;

mod ticker;
use ticker::{Ticker, TickerData, TickerEvents};

#[cfg(test)]
mod tests;

/// Scheduler trait, the seam between task control blocks and whoever runs
/// them.
pub(crate) trait Schedule: Clone + Send + Sync + Sized + 'static {
    /// Hands a notified task over to be polled. Must not poll it
    /// synchronously: every resumption goes through the pool.
    fn resume(&self, task: Notified<Self>);

    /// Allocator hosting the control blocks of this scheduler's tasks.
    fn allocator(&self) -> &ThreadAllocator;

    /// Single teardown path of a control block: drops it in place and gives
    /// its memory back to the allocator.
    ///
    /// # Safety
    ///
    /// `frame` must describe a control block whose last reference was just
    /// released, and must be passed here exactly once.
    unsafe fn destroy_task(&self, id: Id, frame: FrameAlloc);

    /// The task reached its terminal state. `state` is the snapshot taken by
    /// the completion, with `HANDLE_DROPPED` set when nobody will collect
    /// the result. The control block may already be gone when this runs.
    fn set_task_completed(&self, _id: Id, _state: TaskState) {
        // By default, do nothing.
    }

    /// Polling the task resulted in a panic, which is stored as the task's
    /// result.
    fn unhandled_fault(&self, _fault: &TaskFault) {
        // By default, do nothing.
    }
}
