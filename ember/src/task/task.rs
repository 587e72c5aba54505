use crate::task::{Header, Id, RawTask};
use std::fmt;
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ptr::NonNull;

/// Owns one reference on a control block and releases it on drop.
#[repr(transparent)]
pub(crate) struct Task<S: 'static> {
    raw: RawTask,
    _scheduler: PhantomData<S>,
}

// Control blocks only hand out `Send` data across threads.
unsafe impl<S> Send for Task<S> {}
unsafe impl<S> Sync for Task<S> {}

impl<S: 'static> Task<S> {
    pub(super) fn new(raw: RawTask) -> Task<S> {
        Task {
            raw,
            _scheduler: PhantomData,
        }
    }

    /// # Safety
    ///
    /// `ptr` must be a live control block and the caller must own one of
    /// its references.
    pub(super) unsafe fn from_raw(ptr: NonNull<Header>) -> Task<S> {
        unsafe { Task::new(RawTask::from_raw(ptr)) }
    }

    pub(crate) fn id(&self) -> Id {
        self.raw.id()
    }
}

impl<S: 'static> Drop for Task<S> {
    fn drop(&mut self) {
        self.raw.drop_reference();
    }
}

impl<S> fmt::Debug for Task<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Task").field(&self.raw.header_ptr()).finish()
    }
}

/// A scheduled poll. Whoever receives it runs it once, or drops it to
/// discard the poll, which is how queued work goes away at shutdown.
#[repr(transparent)]
pub(crate) struct Notified<S: 'static>(Task<S>);

impl<S: 'static> Notified<S> {
    pub(super) fn new(task: Task<S>) -> Notified<S> {
        Notified(task)
    }

    /// Polls the task once, handing the reference over to the poll.
    pub(crate) fn run(self) {
        let this = ManuallyDrop::new(self);
        this.0.raw.poll();
    }

    pub(crate) fn id(&self) -> Id {
        self.0.id()
    }
}

impl<S> fmt::Debug for Notified<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Notified").field(&self.0.raw.header_ptr()).finish()
    }
}
