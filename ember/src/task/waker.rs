#![allow(unsafe_op_in_unsafe_fn)]

use crate::task::{Header, RawTask};
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ops;
use std::ptr::NonNull;
use std::task::{RawWaker, RawWakerVTable, Waker};

/// Waker lent to the future for the duration of one poll.
///
/// It shares the vtable of owned task wakers so `Waker::will_wake` holds
/// between them, but owns no reference of its own and is therefore never
/// dropped. Cloning it takes a reference.
pub(super) struct PollWaker<'a> {
    waker: ManuallyDrop<Waker>,
    _task: PhantomData<&'a Header>,
}

impl<'a> PollWaker<'a> {
    pub(super) fn new(header: &'a NonNull<Header>) -> Self {
        // Safety: the vtable functions uphold the `RawWaker` contract as
        // long as every owned waker holds a reference.
        let waker = unsafe { Waker::from_raw(raw_waker(*header)) };

        Self {
            waker: ManuallyDrop::new(waker),
            _task: PhantomData,
        }
    }
}

impl ops::Deref for PollWaker<'_> {
    type Target = Waker;

    fn deref(&self) -> &Waker {
        &self.waker
    }
}

static TASK_WAKER_VTABLE: RawWakerVTable =
    RawWakerVTable::new(retain, wake_by_val, wake_by_ref, release);

fn raw_waker(header: NonNull<Header>) -> RawWaker {
    RawWaker::new(header.as_ptr().cast_const().cast(), &TASK_WAKER_VTABLE)
}

unsafe fn task(data: *const ()) -> RawTask {
    RawTask::from_raw(NonNull::new_unchecked(data.cast_mut().cast()))
}

unsafe fn retain(data: *const ()) -> RawWaker {
    let raw = task(data);
    raw.state().ref_inc();
    raw_waker(raw.header_ptr())
}

unsafe fn wake_by_val(data: *const ()) {
    task(data).wake_by_val();
}

unsafe fn wake_by_ref(data: *const ()) {
    task(data).wake_by_ref();
}

unsafe fn release(data: *const ()) {
    task(data).drop_reference();
}
