#![allow(unsafe_op_in_unsafe_fn)]

use crate::runtime::Schedule;
use crate::task::layout::{Core, TaskLayout};
use crate::task::raw::output_ready_or_register;
use crate::task::state::{State, TransitionToIdle, TransitionToRunning};
use crate::task::trailer::Trailer;
use crate::task::waker::PollWaker;
use crate::task::{Header, Notified, Task, TaskFault};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::task::{Context, Poll, Waker};

/// Typed view over a control block. The vtable entries cast the erased
/// header back to this and run the operation with full type information.
pub(super) struct Harness<T: Future, S: 'static> {
    cell: NonNull<TaskLayout<T, S>>,
}

/// What a poll leaves for its caller to do with the reference it held.
enum PollOutcome {
    /// Suspended, the reference was released.
    Idle,
    /// Woken while running. Two references are owed: one for the resubmit
    /// and one released after it.
    Resubmit,
    /// The output is stored. The reference goes to `complete`.
    Completed,
    /// The last reference is gone.
    Teardown,
}

impl<T, S> Harness<T, S>
where
    T: Future,
    S: 'static,
{
    pub(super) unsafe fn from_raw(ptr: NonNull<Header>) -> Harness<T, S> {
        Harness { cell: ptr.cast() }
    }

    fn cell(&self) -> &TaskLayout<T, S> {
        // Safety: a harness only exists while its caller holds a reference.
        unsafe { self.cell.as_ref() }
    }

    fn state(&self) -> &State {
        &self.cell().header.state
    }

    fn trailer(&self) -> &Trailer {
        &self.cell().trailer
    }

    fn core(&self) -> &Core<T, S> {
        &self.cell().core
    }
}

impl<T: Future, S: Schedule> Harness<T, S> {
    pub(super) fn drop_reference(self) {
        if self.state().ref_dec() {
            self.dealloc();
        }
    }

    /// Hands the control block to its scheduler for teardown. Called once,
    /// by whoever released the last reference.
    pub(super) fn dealloc(self) {
        let core = self.core();
        let (id, frame) = (core.id, self.trailer().frame);

        // The teardown drops the scheduler stored in the block, this clone
        // outlives it.
        let scheduler = core.scheduler.clone();
        unsafe { scheduler.destroy_task(id, frame) };
    }

    /// Runs one poll of the future, consuming the caller's reference.
    pub(super) fn poll(self) {
        match self.run_poll() {
            PollOutcome::Idle => {}
            PollOutcome::Resubmit => {
                // Safety: `run_poll` left us an extra reference for it.
                let task = unsafe { Task::from_raw(self.cell.cast()) };
                self.core().scheduler.resume(Notified::new(task));
                self.drop_reference();
            }
            PollOutcome::Completed => self.complete(),
            PollOutcome::Teardown => self.dealloc(),
        }
    }

    fn run_poll(&self) -> PollOutcome {
        match self.state().transition_to_running() {
            TransitionToRunning::Success => {}
            TransitionToRunning::Failed => return PollOutcome::Idle,
            TransitionToRunning::Dealloc => return PollOutcome::Teardown,
        }

        let ptr = self.cell.cast::<Header>();
        let waker = PollWaker::new(&ptr);

        if poll_future(self.core(), Context::from_waker(&waker)).is_ready() {
            return PollOutcome::Completed;
        }

        match self.state().transition_to_idle() {
            TransitionToIdle::Ok => PollOutcome::Idle,
            TransitionToIdle::OkNotified => PollOutcome::Resubmit,
            TransitionToIdle::OkDealloc => PollOutcome::Teardown,
        }
    }

    /// Moves the output into `dst` if the task completed, otherwise leaves
    /// `waker` to be woken on completion.
    pub(super) fn try_read_output(self, dst: &mut Poll<super::Result<T::Output>>, waker: &Waker) {
        if output_ready_or_register(&self.cell().header, self.trailer(), waker) {
            *dst = Poll::Ready(self.core().take_output());
        }
    }

    pub(super) fn drop_handle_slow(self) {
        // Publishing HANDLE_DROPPED first tells a concurrent completion the
        // output is no longer wanted.
        let transition = self.state().transition_to_handle_dropped();

        if transition.drop_output {
            // A panicking destructor in an unread output is nobody's fault.
            _ = panic::catch_unwind(AssertUnwindSafe(|| self.core().drop_future_or_output()));
        }

        if transition.drop_continuation {
            // Safety: WAITED_ON is unset, so the field is ours.
            unsafe { self.trailer().set_continuation(None) };
        }

        self.drop_reference();
    }

    /// Publishes completion and notifies whoever awaits the handle. Runs
    /// with RUNNING set.
    fn complete(self) {
        let snapshot = self.state().transition_to_complete();

        _ = panic::catch_unwind(AssertUnwindSafe(|| {
            if snapshot.is_handle_dropped() {
                self.core().drop_future_or_output();
                return;
            }

            if !snapshot.is_waited_on() {
                return;
            }

            // Safety: COMPLETE and WAITED_ON are both set, the field is
            // readable.
            unsafe { self.trailer().wake_continuation() };

            // The handle may have left while we were waking.
            let after = self.state().unset_waited_on_after_complete();
            if after.is_handle_dropped() {
                unsafe { self.trailer().set_continuation(None) };
            }
        }));

        let id = self.core().id;
        let scheduler = self.core().scheduler.clone();

        if self.state().transition_to_terminal(1) {
            self.dealloc();
        }

        scheduler.set_task_completed(id, snapshot.task_state());
    }
}

/// Drops the future if its poll unwinds, so a panicking task never leaves a
/// half-polled future behind.
struct DropOnUnwind<'a, T: Future, S: Schedule>(&'a Core<T, S>);

impl<T: Future, S: Schedule> Drop for DropOnUnwind<'_, T, S> {
    fn drop(&mut self) {
        self.0.drop_future_or_output();
    }
}

/// Polls the future. On completion or panic the result is stored in the
/// core and `Ready` is returned.
fn poll_future<T: Future, S: Schedule>(core: &Core<T, S>, cx: Context<'_>) -> Poll<()> {
    let polled = panic::catch_unwind(AssertUnwindSafe(|| {
        let guard = DropOnUnwind(core);
        let res = guard.0.poll(cx);
        std::mem::forget(guard);
        res
    }));

    let output = match polled {
        Ok(Poll::Pending) => return Poll::Pending,
        Ok(Poll::Ready(value)) => Ok(value),
        Err(payload) => {
            let fault = TaskFault::panic(core.id, payload);
            core.scheduler.unhandled_fault(&fault);
            Err(fault)
        }
    };

    // The stage is `Consumed` here, storing runs no destructor.
    core.store_output(output);
    Poll::Ready(())
}
