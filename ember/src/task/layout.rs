#![allow(unsafe_op_in_unsafe_fn)]

use crate::alloc::AllocError;
use crate::runtime::Schedule;
use crate::task::harness::Harness;
use crate::task::id::TaskIdGuard;
use crate::task::state::State;
use crate::task::trailer::Trailer;
use crate::task::{Header, Id, Notified, Task};
use std::alloc::Layout;
use std::cell::UnsafeCell;
use std::fmt;
use std::future::Future;
use std::mem::{self, offset_of};
use std::pin::Pin;
use std::ptr::{self, NonNull};
use std::task::{Context, Poll, Waker};

/// The task control block, one block from the scheduler's
/// [`ThreadAllocator`](crate::alloc::ThreadAllocator).
///
/// `header` is the first field so that a pointer to the block is also a
/// pointer to its `Header`. The other fields are found through the offsets
/// recorded in the vtable.
#[repr(C)]
pub(super) struct TaskLayout<T: Future, S> {
    pub(super) header: Header,
    pub(super) core: Core<T, S>,
    pub(super) trailer: Trailer,
}

impl<T: Future, S: Schedule> TaskLayout<T, S> {
    /// Moves a new control block into memory taken from the calling
    /// thread's chunk.
    pub(super) fn allocate(future: T, scheduler: S, id: Id) -> Result<NonNull<Header>, AllocError> {
        let layout = Layout::new::<Self>();
        let ptr = scheduler.allocator().allocate_layout(layout)?;

        let frame = FrameAlloc {
            ptr,
            layout,
            drop_glue: drop_frame::<T, S>,
        };

        let cell = TaskLayout {
            header: Header::new(State::new(), vtable::<T, S>()),
            core: Core {
                scheduler,
                id,
                stage: UnsafeCell::new(Stage::Running(future)),
            },
            trailer: Trailer::new(frame),
        };

        // Safety: blocks are aligned to their power-of-two size, which is at
        // least `layout.size()` and so at least `layout.align()`.
        unsafe { ptr.cast::<Self>().write(cell) };

        let header = ptr.cast::<Header>();
        debug_assert!(unsafe { offsets_match::<T, S>(header) });

        Ok(header)
    }
}

unsafe fn offsets_match<T: Future, S>(header: NonNull<Header>) -> bool {
    let cell = header.cast::<TaskLayout<T, S>>().as_ref();

    ptr::eq(Header::get_trailer(header).as_ptr(), &cell.trailer)
        && ptr::eq(Header::get_scheduler::<S>(header).as_ptr(), &cell.core.scheduler)
        && ptr::eq(Header::get_id_ptr(header).as_ptr(), &cell.core.id)
}

/// Where a control block lives, how big it is, and how to drop it without
/// knowing its type.
#[derive(Clone, Copy)]
pub(crate) struct FrameAlloc {
    ptr: NonNull<u8>,
    layout: Layout,
    drop_glue: unsafe fn(NonNull<u8>),
}

impl FrameAlloc {
    pub(crate) fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    pub(crate) fn layout(&self) -> Layout {
        self.layout
    }

    /// Drops the control block in place. The memory stays allocated.
    ///
    /// # Safety
    ///
    /// Must be called exactly once, after the last reference to the task is
    /// gone.
    pub(crate) unsafe fn drop_in_place(&self) {
        (self.drop_glue)(self.ptr)
    }
}

impl fmt::Debug for FrameAlloc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameAlloc")
            .field("ptr", &self.ptr)
            .field("size", &self.layout.size())
            .field("align", &self.layout.align())
            .finish()
    }
}

unsafe fn drop_frame<T: Future, S>(ptr: NonNull<u8>) {
    ptr::drop_in_place(ptr.cast::<TaskLayout<T, S>>().as_ptr());
}

pub(super) struct Core<T: Future, S> {
    pub(super) scheduler: S,
    pub(super) id: Id,

    /// Only touched by whoever holds RUNNING, or by the handle once
    /// COMPLETE is published.
    stage: UnsafeCell<Stage<T>>,
}

/// The future, then its result, then nothing once the result was taken or
/// dropped.
enum Stage<T: Future> {
    Running(T),
    Finished(super::Result<T::Output>),
    Consumed,
}

impl<T: Future, S: 'static> Core<T, S> {
    /// Polls the future, dropping it once it returns `Ready`.
    ///
    /// The caller holds RUNNING. The future never moves since control
    /// blocks are not moved once written.
    pub(super) fn poll(&self, mut cx: Context<'_>) -> Poll<T::Output> {
        // Safety: RUNNING grants exclusive access to the stage.
        let stage = unsafe { &mut *self.stage.get() };
        let Stage::Running(future) = stage else {
            unreachable!("polled a task that is not running");
        };

        let res = {
            let _guard = TaskIdGuard::enter(self.id);
            unsafe { Pin::new_unchecked(future) }.poll(&mut cx)
        };

        if res.is_ready() {
            self.drop_future_or_output();
        }

        res
    }

    pub(super) fn drop_future_or_output(&self) {
        self.set_stage(Stage::Consumed);
    }

    pub(super) fn store_output(&self, output: super::Result<T::Output>) {
        self.set_stage(Stage::Finished(output));
    }

    #[track_caller]
    pub(super) fn take_output(&self) -> super::Result<T::Output> {
        // Safety: only called by the handle after COMPLETE was observed.
        let stage = unsafe { &mut *self.stage.get() };

        match mem::replace(stage, Stage::Consumed) {
            Stage::Finished(output) => output,
            _ => panic!("task result already retrieved"),
        }
    }

    /// Destructors of the future or output run with the task id set.
    fn set_stage(&self, stage: Stage<T>) {
        let _guard = TaskIdGuard::enter(self.id);
        unsafe { *self.stage.get() = stage };
    }
}

/// Type-erased operations of a control block, plus the offsets needed to
/// reach its fields from the header.
pub(crate) struct Vtable {
    pub(super) poll: unsafe fn(NonNull<Header>),
    pub(super) schedule: unsafe fn(NonNull<Header>),
    pub(super) dealloc: unsafe fn(NonNull<Header>),
    pub(super) try_read_output: unsafe fn(NonNull<Header>, *mut (), &Waker),
    pub(super) drop_handle_slow: unsafe fn(NonNull<Header>),

    pub(super) trailer_offset: usize,
    pub(super) scheduler_offset: usize,
    pub(super) id_offset: usize,
}

pub(super) fn vtable<T: Future, S: Schedule>() -> &'static Vtable {
    &Vtable {
        poll: poll::<T, S>,
        schedule: schedule::<S>,
        dealloc: dealloc::<T, S>,
        try_read_output: try_read_output::<T, S>,
        drop_handle_slow: drop_handle_slow::<T, S>,
        trailer_offset: Offsets::<T, S>::TRAILER,
        scheduler_offset: Offsets::<T, S>::SCHEDULER,
        id_offset: Offsets::<T, S>::ID,
    }
}

// Associated consts keep the vtable above a promotable constant.
struct Offsets<T, S>(T, S);

impl<T: Future, S: Schedule> Offsets<T, S> {
    const TRAILER: usize = offset_of!(TaskLayout<T, S>, trailer);
    const SCHEDULER: usize = offset_of!(TaskLayout<T, S>, core.scheduler);
    const ID: usize = offset_of!(TaskLayout<T, S>, core.id);
}

unsafe fn poll<T: Future, S: Schedule>(ptr: NonNull<Header>) {
    Harness::<T, S>::from_raw(ptr).poll();
}

unsafe fn schedule<S: Schedule>(ptr: NonNull<Header>) {
    let task = Notified::new(Task::from_raw(ptr));
    Header::get_scheduler::<S>(ptr).as_ref().resume(task);
}

unsafe fn dealloc<T: Future, S: Schedule>(ptr: NonNull<Header>) {
    Harness::<T, S>::from_raw(ptr).dealloc();
}

unsafe fn try_read_output<T: Future, S: Schedule>(ptr: NonNull<Header>, dst: *mut (), waker: &Waker) {
    let dst = &mut *dst.cast::<Poll<super::Result<T::Output>>>();
    Harness::<T, S>::from_raw(ptr).try_read_output(dst, waker);
}

unsafe fn drop_handle_slow<T: Future, S: Schedule>(ptr: NonNull<Header>) {
    Harness::<T, S>::from_raw(ptr).drop_handle_slow();
}
