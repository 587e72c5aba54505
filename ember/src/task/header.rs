#![allow(unsafe_op_in_unsafe_fn)]

use crate::task::Id;
use crate::task::layout::Vtable;
use crate::task::state::State;
use crate::task::trailer::Trailer;
use std::ptr::NonNull;

/// First field of every control block, and what type-erased references
/// (`RawTask`, wakers) point at. Holds only what each poll and wake needs:
/// the state word and the vtable, 16 bytes in total.
///
/// Every other field is reached through an offset stored in the vtable.
#[repr(C)]
pub(crate) struct Header {
    pub(super) state: State,
    pub(super) vtable: &'static Vtable,
}

impl Header {
    pub(super) fn new(state: State, vtable: &'static Vtable) -> Header {
        Header { state, vtable }
    }

    /// # Safety
    ///
    /// `offset` must come from `me`'s own vtable and `U` must be the type of
    /// the field found there.
    unsafe fn field<U>(me: NonNull<Header>, offset: usize) -> NonNull<U> {
        me.byte_add(offset).cast::<U>()
    }

    pub(super) unsafe fn get_trailer(me: NonNull<Header>) -> NonNull<Trailer> {
        Self::field(me, me.as_ref().vtable.trailer_offset)
    }

    /// `S` must be the scheduler type the task was created with.
    pub(super) unsafe fn get_scheduler<S>(me: NonNull<Header>) -> NonNull<S> {
        Self::field(me, me.as_ref().vtable.scheduler_offset)
    }

    pub(super) unsafe fn get_id_ptr(me: NonNull<Header>) -> NonNull<Id> {
        Self::field(me, me.as_ref().vtable.id_offset)
    }

    pub(super) unsafe fn get_id(me: NonNull<Header>) -> Id {
        *Self::get_id_ptr(me).as_ref()
    }
}
