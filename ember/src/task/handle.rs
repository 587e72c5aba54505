use crate::task::{Id, RawTask, Result, TaskState};
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::{RefUnwindSafe, UnwindSafe};
use std::pin::Pin;
use std::task::{Context, Poll, Waker};

/// Owning handle to a launched task.
///
/// The task starts running as soon as it is launched, whether or not the
/// handle is ever looked at. Dropping the handle detaches the task: it runs
/// to completion and its result is dropped.
///
/// The result can be taken exactly once, either from synchronous code with
/// [`get`](Self::get) / [`try_get`](Self::try_get) once [`ready`](Self::ready)
/// reports true, or by awaiting the handle from inside another task. A task
/// that panicked yields a [`TaskFault`](crate::task::TaskFault) instead of a
/// value.
///
/// ```no_run
/// use ember::runtime::Builder;
///
/// # fn main() -> anyhow::Result<()> {
/// let scheduler = Builder::new().try_build()?;
/// let mut handle = scheduler.spawn(async { 5 + 3 });
///
/// while !handle.ready() {
///     scheduler.poll();
/// }
///
/// assert_eq!(handle.get()?, 8);
/// # Ok(())
/// # }
/// ```
pub struct TaskHandle<T> {
    raw: RawTask,
    id: Id,
    retrieved: bool,
    _p: PhantomData<T>,
}

unsafe impl<T: Send> Send for TaskHandle<T> {}
unsafe impl<T: Send> Sync for TaskHandle<T> {}

impl<T> UnwindSafe for TaskHandle<T> {}
impl<T> RefUnwindSafe for TaskHandle<T> {}

impl<T> TaskHandle<T> {
    pub(super) fn new(raw: RawTask) -> TaskHandle<T> {
        TaskHandle {
            raw,
            id: raw.id(),
            retrieved: false,
            _p: PhantomData,
        }
    }

    /// Returns the [`Id`] of the task.
    pub fn id(&self) -> Id {
        self.id
    }

    /// True once the task completed, including after its result was taken.
    pub fn ready(&self) -> bool {
        self.retrieved || self.raw.state().load().is_complete()
    }

    /// Current lifecycle flags of the task.
    ///
    /// After the result was taken the handle no longer references the task,
    /// and reports `COMPLETED | HANDLE_DROPPED`.
    pub fn state(&self) -> TaskState {
        if self.retrieved {
            return TaskState::COMPLETED | TaskState::HANDLE_DROPPED;
        }

        self.raw.state().load().task_state()
    }

    /// Takes the result of a completed task.
    ///
    /// # Panics
    ///
    /// If the task has not completed yet, or if the result was already
    /// taken.
    #[track_caller]
    pub fn get(&mut self) -> Result<T> {
        assert!(!self.retrieved, "task {} result already retrieved", self.id);
        assert!(self.ready(), "task {} is not complete", self.id);

        match self.read_output(futures::task::noop_waker_ref()) {
            Poll::Ready(res) => res,
            Poll::Pending => unreachable!("completed task {} has no output", self.id),
        }
    }

    /// Takes the result if the task completed, `None` otherwise.
    ///
    /// # Panics
    ///
    /// If the result was already taken.
    #[track_caller]
    pub fn try_get(&mut self) -> Option<Result<T>> {
        assert!(!self.retrieved, "task {} result already retrieved", self.id);

        if !self.ready() {
            return None;
        }

        match self.read_output(futures::task::noop_waker_ref()) {
            Poll::Ready(res) => Some(res),
            Poll::Pending => None,
        }
    }

    /// Reads the output through the vtable, registering `waker` as the
    /// continuation if the task is still pending.
    fn read_output(&mut self, waker: &Waker) -> Poll<Result<T>> {
        let mut ret = Poll::Pending;

        // Safety: `T` is the output type of the task's future.
        unsafe {
            self.raw
                .try_read_output(&mut ret as *mut _ as *mut (), waker);
        }

        if ret.is_ready() {
            self.release();
        }

        ret
    }

    /// Gives the handle's reference back. The control block may be torn
    /// down before this returns.
    fn release(&mut self) {
        self.retrieved = true;

        if self.raw.state().drop_handle_fast().is_ok() {
            return;
        }

        self.raw.drop_handle_slow();
    }
}

impl<T> Unpin for TaskHandle<T> {}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T>;

    #[track_caller]
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        assert!(!this.retrieved, "task {} result already retrieved", this.id);

        this.read_output(cx.waker())
    }
}

impl<T> Drop for TaskHandle<T> {
    fn drop(&mut self) {
        if !self.retrieved {
            self.release();
        }
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("retrieved", &self.retrieved)
            .finish()
    }
}
