#![allow(unsafe_op_in_unsafe_fn)]

use crate::alloc::AllocError;
use crate::runtime::Schedule;
use crate::task::layout::{TaskLayout, Vtable};
use crate::task::state::{State, TransitionToNotifiedByRef, TransitionToNotifiedByVal};
use crate::task::trailer::Trailer;
use crate::task::{Header, Id};
use std::future::Future;
use std::ptr::NonNull;
use std::task::Waker;

/// Type-erased pointer to a control block. Copying it does not take a
/// reference: the owner decides which reference a `RawTask` stands for.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RawTask {
    ptr: NonNull<Header>,
}

impl RawTask {
    pub(super) fn new<T, S>(task: T, scheduler: S, id: Id) -> Result<RawTask, AllocError>
    where
        T: Future + 'static,
        S: Schedule,
    {
        let ptr = TaskLayout::<T, S>::allocate(task, scheduler, id)?;
        Ok(RawTask { ptr })
    }

    pub(super) unsafe fn from_raw(ptr: NonNull<Header>) -> RawTask {
        RawTask { ptr }
    }

    pub(super) fn header_ptr(&self) -> NonNull<Header> {
        self.ptr
    }

    fn header(&self) -> &Header {
        unsafe { self.ptr.as_ref() }
    }

    pub(super) fn state(&self) -> &State {
        &self.header().state
    }

    pub(super) fn id(&self) -> Id {
        unsafe { Header::get_id(self.ptr) }
    }

    fn vtable(&self) -> &'static Vtable {
        self.header().vtable
    }

    /// Polls the future. The caller hands over the reference of the
    /// `Notified` it ran.
    pub(super) fn poll(self) {
        unsafe { (self.vtable().poll)(self.ptr) }
    }

    /// Submits the task to its scheduler, handing over one reference.
    pub(super) fn schedule(self) {
        unsafe { (self.vtable().schedule)(self.ptr) }
    }

    /// Tears the task down. The reference count must have reached zero.
    pub(super) fn dealloc(self) {
        unsafe { (self.vtable().dealloc)(self.ptr) }
    }

    /// # Safety
    ///
    /// `dst` must point to a `Poll<Result<T::Output>>` where `T` is the
    /// future the task was created with.
    pub(super) unsafe fn try_read_output(self, dst: *mut (), waker: &Waker) {
        (self.vtable().try_read_output)(self.ptr, dst, waker)
    }

    pub(super) fn drop_handle_slow(self) {
        unsafe { (self.vtable().drop_handle_slow)(self.ptr) }
    }

    pub(super) fn drop_reference(self) {
        if self.state().ref_dec() {
            self.dealloc();
        }
    }

    /// Notifies the task, consuming the caller's reference.
    pub(super) fn wake_by_val(&self) {
        match self.state().transition_to_notified_by_val() {
            TransitionToNotifiedByVal::Submit => {
                // The transition added the reference the new `Notified`
                // takes. Ours is released once the scheduler has it.
                self.schedule();
                self.drop_reference();
            }
            TransitionToNotifiedByVal::Dealloc => self.dealloc(),
            TransitionToNotifiedByVal::DoNothing => {}
        }
    }

    /// Notifies the task, keeping the caller's reference.
    pub(super) fn wake_by_ref(&self) {
        if let TransitionToNotifiedByRef::Submit = self.state().transition_to_notified_by_ref() {
            self.schedule();
        }
    }
}

/// Returns true if the output can be read. Otherwise registers `waker` as
/// the continuation, unless it is already the registered one, and returns
/// false.
pub(super) fn output_ready_or_register(header: &Header, trailer: &Trailer, waker: &Waker) -> bool {
    let snapshot = header.state.load();
    debug_assert!(!snapshot.is_handle_dropped());

    if snapshot.is_complete() {
        return true;
    }

    if snapshot.is_waited_on() {
        if unsafe { trailer.will_wake(waker) } {
            return false;
        }

        // Taking the field back fails if the task completed meanwhile.
        if header.state.unset_waited_on().is_err() {
            return true;
        }
    }

    // Safety: WAITED_ON is unset, the handle owns the field.
    unsafe { trailer.set_continuation(Some(waker.clone())) };

    match header.state.set_waited_on() {
        Ok(_) => false,
        Err(snapshot) => {
            assert!(snapshot.is_complete());

            // Still ours since publishing failed.
            unsafe { trailer.set_continuation(None) };
            true
        }
    }
}
