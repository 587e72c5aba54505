//! Task control blocks and the handles that observe them.
//!
//! A task is one allocation holding a header (state word and vtable), the
//! scheduler back-reference, the future or its result, and a trailer with the
//! continuation waker and the allocation metadata. Every reference to it
//! (the handle, queued `Notified`s, wakers) holds a count in the state word.
//! Whoever drops the count to zero hands the block to the scheduler's
//! `destroy_task`, the only path that frees it.
//!
//! Rules for the continuation field, in the order the state word enforces
//! them:
//!
//! 1. While `WAITED_ON` is unset and the task is not complete, only the
//!    handle may write the field.
//! 2. Setting `WAITED_ON` publishes the waker to the completion path, after
//!    which the handle must unset it again before replacing the waker.
//! 3. Once `COMPLETE` and `WAITED_ON` are both set, only the completion path
//!    reads the field. It wakes the continuation and then clears `WAITED_ON`.
//! 4. Whoever clears `WAITED_ON` last with `HANDLE_DROPPED` set drops the
//!    waker.

use crate::alloc::AllocError;
use crate::runtime::Schedule;
use std::future::Future;

mod error;
pub(crate) use self::error::panic_payload_as_str;
pub use self::error::TaskFault;

mod handle;
pub use self::handle::TaskHandle;

pub mod id;
pub use self::id::{Id, id, try_id};

mod harness;

mod header;
pub(crate) use self::header::Header;

mod layout;
pub(crate) use self::layout::FrameAlloc;

mod raw;
pub(crate) use self::raw::RawTask;

mod state;
pub use self::state::TaskState;

#[allow(clippy::module_inception)]
mod task;
pub(crate) use self::task::{Notified, Task};

mod trailer;

mod waker;

#[cfg(test)]
mod tests;

/// Result of a task, as read from its handle.
pub type Result<T> = std::result::Result<T, TaskFault>;

/// Allocates a new task from the scheduler's allocator. Two references are
/// created: the `Notified` the caller must hand to the scheduler, and the
/// handle.
pub(crate) fn new_task<T, S>(
    task: T,
    scheduler: S,
    id: Id,
) -> std::result::Result<(Notified<S>, TaskHandle<T::Output>), AllocError>
where
    S: Schedule,
    T: Future + Send + 'static,
    T::Output: Send + 'static,
{
    let raw = RawTask::new::<T, S>(task, scheduler, id)?;
    let notified = Notified::new(Task::new(raw));
    let handle = TaskHandle::new(raw);

    Ok((notified, handle))
}
