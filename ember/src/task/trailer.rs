#![allow(unsafe_op_in_unsafe_fn)]

use crate::task::layout::FrameAlloc;
use std::cell::UnsafeCell;
use std::task::Waker;

/// Data only touched when the task is created, completes, or is torn down.
/// Placed after the future so it stays out of the way of polling.
pub(super) struct Trailer {
    /// Waker of the task awaiting this one. Access is arbitrated by the
    /// `WAITED_ON` bit, see the module docs.
    continuation: UnsafeCell<Option<Waker>>,

    /// Allocation holding this control block.
    pub(super) frame: FrameAlloc,
}

impl Trailer {
    pub(super) fn new(frame: FrameAlloc) -> Self {
        Trailer {
            continuation: UnsafeCell::new(None),
            frame,
        }
    }

    /// # Safety
    ///
    /// The caller must have exclusive access to the continuation.
    #[allow(clippy::mut_from_ref)]
    unsafe fn continuation(&self) -> &mut Option<Waker> {
        &mut *self.continuation.get()
    }

    /// Replaces the continuation, dropping the previous one.
    pub(super) unsafe fn set_continuation(&self, waker: Option<Waker>) {
        *self.continuation() = waker;
    }

    /// True if the stored continuation would wake the same task as `waker`.
    pub(super) unsafe fn will_wake(&self, waker: &Waker) -> bool {
        self.continuation()
            .as_ref()
            .is_some_and(|current| current.will_wake(waker))
    }

    /// Resumes the awaiting task. Its waker submits it to the pool, so the
    /// continuation never runs on this stack.
    ///
    /// # Panics
    ///
    /// If `WAITED_ON` was set without a continuation stored.
    pub(super) unsafe fn wake_continuation(&self) {
        match self.continuation() {
            Some(waker) => waker.wake_by_ref(),
            None => panic!("task waited on without a continuation"),
        }
    }
}
