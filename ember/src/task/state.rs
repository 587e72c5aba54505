use bitflags::bitflags;
use std::fmt;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};

bitflags! {
    /// Public view of a task's lifecycle, as reported by
    /// [`TaskHandle::state`](crate::task::TaskHandle::state).
    ///
    /// Exactly one of `PENDING` and `COMPLETED` is set. `HANDLE_DROPPED` and
    /// `WAITED_ON` are orthogonal markers driven by the handle side.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TaskState: u8 {
        /// The task body has not finished yet.
        const PENDING = 1;

        /// The task body finished, its result (or fault) is stored.
        const COMPLETED = 1 << 1;

        /// The handle gave up its interest, by being dropped or by retrieving
        /// the result.
        const HANDLE_DROPPED = 1 << 2;

        /// Another task awaits this one and will be resumed on completion.
        const WAITED_ON = 1 << 3;
    }
}

/// Atomic state word shared by every reference to a task.
///
/// Low bits hold the lifecycle and markers, the remaining bits count
/// references. The control block is torn down by whoever drops the count to
/// zero, which is how completion and handle drop agree on a single teardown
/// regardless of the order they arrive in.
pub(super) struct State {
    val: AtomicUsize,
}

/// Current state value.
#[derive(Copy, Clone)]
pub(super) struct Snapshot(usize);

type UpdateResult = Result<Snapshot, Snapshot>;

/// The task is being polled.
const RUNNING: usize = 0b0_0001;

/// The task body returned or faulted. Never unset once set.
const COMPLETE: usize = 0b0_0010;

const LIFECYCLE_MASK: usize = RUNNING | COMPLETE;

/// A `Notified` for this task exists, or will be created after the current
/// poll.
const NOTIFIED: usize = 0b0_0100;

/// The handle no longer holds interest in the result.
const HANDLE_DROPPED: usize = 0b0_1000;

/// A continuation waker is stored in the trailer. While set and the task is
/// not complete, only the handle side may touch it.
const WAITED_ON: usize = 0b1_0000;

const STATE_MASK: usize = LIFECYCLE_MASK | NOTIFIED | HANDLE_DROPPED | WAITED_ON;

const REF_COUNT_MASK: usize = !STATE_MASK;

const REF_COUNT_SHIFT: usize = REF_COUNT_MASK.count_zeros() as usize;

const REF_ONE: usize = 1 << REF_COUNT_SHIFT;

/// One reference for the initial `Notified`, one for the handle.
const INITIAL_STATE: usize = (REF_ONE * 2) | NOTIFIED;

#[must_use]
pub(super) enum TransitionToRunning {
    Success,
    Failed,
    Dealloc,
}

#[must_use]
pub(super) enum TransitionToIdle {
    Ok,
    OkNotified,
    OkDealloc,
}

#[must_use]
pub(super) enum TransitionToNotifiedByVal {
    DoNothing,
    Submit,
    Dealloc,
}

#[must_use]
pub(super) enum TransitionToNotifiedByRef {
    DoNothing,
    Submit,
}

#[must_use]
pub(super) struct TransitionToHandleDropped {
    pub(super) drop_continuation: bool,
    pub(super) drop_output: bool,
}

impl State {
    pub(super) fn new() -> State {
        State {
            val: AtomicUsize::new(INITIAL_STATE),
        }
    }

    pub(super) fn load(&self) -> Snapshot {
        Snapshot(self.val.load(Acquire))
    }

    /// Attempts to take the right to poll the future. Consumes the reference
    /// of the `Notified` being run when it fails.
    pub(super) fn transition_to_running(&self) -> TransitionToRunning {
        self.fetch_update_action(|mut next| {
            assert!(next.is_notified());

            let action = if !next.is_idle() {
                next.ref_dec();
                if next.ref_count() == 0 {
                    TransitionToRunning::Dealloc
                } else {
                    TransitionToRunning::Failed
                }
            } else {
                next.set_running();
                next.unset_notified();
                TransitionToRunning::Success
            };

            (action, Some(next))
        })
    }

    /// Gives up the right to poll after the future returned `Pending`.
    ///
    /// If the task was woken during the poll, a reference is created for the
    /// new `Notified` the caller must submit. Otherwise the polling reference
    /// is released.
    pub(super) fn transition_to_idle(&self) -> TransitionToIdle {
        self.fetch_update_action(|curr| {
            assert!(curr.is_running());

            let mut next = curr;
            next.unset_running();

            let action = if next.is_notified() {
                next.ref_inc();
                TransitionToIdle::OkNotified
            } else {
                next.ref_dec();
                if next.ref_count() == 0 {
                    TransitionToIdle::OkDealloc
                } else {
                    TransitionToIdle::Ok
                }
            };

            (action, Some(next))
        })
    }

    /// `RUNNING -> COMPLETE`, returning the resulting snapshot.
    pub(super) fn transition_to_complete(&self) -> Snapshot {
        const DELTA: usize = RUNNING | COMPLETE;

        let prev = Snapshot(self.val.fetch_xor(DELTA, AcqRel));
        assert!(prev.is_running());
        assert!(!prev.is_complete());

        Snapshot(prev.0 ^ DELTA)
    }

    /// Releases `count` references after completion. Returns true if the
    /// caller must tear the task down.
    pub(super) fn transition_to_terminal(&self, count: usize) -> bool {
        let prev = Snapshot(self.val.fetch_sub(count * REF_ONE, AcqRel));
        assert!(
            prev.ref_count() >= count,
            "current: {}, sub: {}",
            prev.ref_count(),
            count
        );
        prev.ref_count() == count
    }

    /// Wakes the task, consuming the caller's reference.
    pub(super) fn transition_to_notified_by_val(&self) -> TransitionToNotifiedByVal {
        self.fetch_update_action(|mut snapshot| {
            let action = if snapshot.is_running() {
                // The poller will see NOTIFIED and resubmit. Our reference
                // cannot be the last one since the poller holds one.
                snapshot.set_notified();
                snapshot.ref_dec();
                assert!(snapshot.ref_count() > 0);
                TransitionToNotifiedByVal::DoNothing
            } else if snapshot.is_complete() || snapshot.is_notified() {
                snapshot.ref_dec();
                if snapshot.ref_count() == 0 {
                    TransitionToNotifiedByVal::Dealloc
                } else {
                    TransitionToNotifiedByVal::DoNothing
                }
            } else {
                // Idle: the caller's reference moves into the new `Notified`
                // and one more is created so the caller can drop its own after
                // submitting.
                snapshot.set_notified();
                snapshot.ref_inc();
                TransitionToNotifiedByVal::Submit
            };

            (action, Some(snapshot))
        })
    }

    /// Wakes the task without consuming a reference.
    pub(super) fn transition_to_notified_by_ref(&self) -> TransitionToNotifiedByRef {
        self.fetch_update_action(|mut snapshot| {
            if snapshot.is_complete() || snapshot.is_notified() {
                (TransitionToNotifiedByRef::DoNothing, None)
            } else if snapshot.is_running() {
                snapshot.set_notified();
                (TransitionToNotifiedByRef::DoNothing, Some(snapshot))
            } else {
                snapshot.set_notified();
                snapshot.ref_inc();
                (TransitionToNotifiedByRef::Submit, Some(snapshot))
            }
        })
    }

    /// Fast path for dropping a handle that never saw the task run.
    pub(super) fn drop_handle_fast(&self) -> Result<(), ()> {
        self.val
            .compare_exchange_weak(
                INITIAL_STATE,
                (INITIAL_STATE - REF_ONE) | HANDLE_DROPPED,
                Release,
                Relaxed,
            )
            .map(|_| ())
            .map_err(|_| ())
    }

    /// Marks `HANDLE_DROPPED` and tells the caller which of the output and the
    /// continuation waker it now owns and must drop.
    pub(super) fn transition_to_handle_dropped(&self) -> TransitionToHandleDropped {
        self.fetch_update_action(|mut snapshot| {
            assert!(!snapshot.is_handle_dropped());

            let mut transition = TransitionToHandleDropped {
                drop_continuation: false,
                drop_output: false,
            };

            snapshot.set_handle_dropped();

            if snapshot.is_complete() {
                transition.drop_output = true;
            } else {
                // Taking WAITED_ON back gives the handle exclusive access to
                // the waker field.
                snapshot.unset_waited_on();
            }

            // Either we just unset it, or the completion path already did so
            // after waking the continuation.
            if !snapshot.is_waited_on() {
                transition.drop_continuation = true;
            }

            (transition, Some(snapshot))
        })
    }

    /// Publishes a continuation waker the handle just stored. Fails if the
    /// task completed in the meantime.
    pub(super) fn set_waited_on(&self) -> UpdateResult {
        self.fetch_update(|curr| {
            assert!(!curr.is_handle_dropped());
            assert!(!curr.is_waited_on());

            if curr.is_complete() {
                return None;
            }

            let mut next = curr;
            next.set_waited_on();
            Some(next)
        })
    }

    /// Takes back exclusive access to the continuation waker so the handle
    /// can replace it. Fails if the task completed in the meantime.
    pub(super) fn unset_waited_on(&self) -> UpdateResult {
        self.fetch_update(|curr| {
            assert!(!curr.is_handle_dropped());

            if curr.is_complete() {
                return None;
            }

            assert!(curr.is_waited_on());

            let mut next = curr;
            next.unset_waited_on();
            Some(next)
        })
    }

    /// Releases the continuation waker after the completion path woke it.
    pub(super) fn unset_waited_on_after_complete(&self) -> Snapshot {
        let prev = Snapshot(self.val.fetch_and(!WAITED_ON, AcqRel));
        assert!(prev.is_complete());
        assert!(prev.is_waited_on());
        Snapshot(prev.0 & !WAITED_ON)
    }

    pub(super) fn ref_inc(&self) {
        let prev = self.val.fetch_add(REF_ONE, Relaxed);

        // Wrapping the count would free a task that is still referenced.
        if prev > isize::MAX as usize {
            std::process::abort();
        }
    }

    /// Returns true if the caller released the last reference.
    pub(super) fn ref_dec(&self) -> bool {
        let prev = Snapshot(self.val.fetch_sub(REF_ONE, AcqRel));
        assert!(prev.ref_count() >= 1);
        prev.ref_count() == 1
    }

    fn fetch_update_action<F, T>(&self, mut f: F) -> T
    where
        F: FnMut(Snapshot) -> (T, Option<Snapshot>),
    {
        let mut curr = self.load();

        loop {
            let (output, next) = f(curr);
            let next = match next {
                Some(next) => next,
                None => return output,
            };

            match self
                .val
                .compare_exchange(curr.0, next.0, AcqRel, Acquire)
            {
                Ok(_) => return output,
                Err(actual) => curr = Snapshot(actual),
            }
        }
    }

    fn fetch_update<F>(&self, mut f: F) -> UpdateResult
    where
        F: FnMut(Snapshot) -> Option<Snapshot>,
    {
        let mut curr = self.load();

        loop {
            let next = match f(curr) {
                Some(next) => next,
                None => return Err(curr),
            };

            match self
                .val
                .compare_exchange(curr.0, next.0, AcqRel, Acquire)
            {
                Ok(_) => return Ok(next),
                Err(actual) => curr = Snapshot(actual),
            }
        }
    }
}

impl Snapshot {
    pub(super) fn is_idle(self) -> bool {
        self.0 & LIFECYCLE_MASK == 0
    }

    pub(super) fn is_running(self) -> bool {
        self.0 & RUNNING == RUNNING
    }

    fn set_running(&mut self) {
        self.0 |= RUNNING;
    }

    fn unset_running(&mut self) {
        self.0 &= !RUNNING;
    }

    pub(super) fn is_complete(self) -> bool {
        self.0 & COMPLETE == COMPLETE
    }

    pub(super) fn is_notified(self) -> bool {
        self.0 & NOTIFIED == NOTIFIED
    }

    fn set_notified(&mut self) {
        self.0 |= NOTIFIED;
    }

    fn unset_notified(&mut self) {
        self.0 &= !NOTIFIED;
    }

    pub(super) fn is_handle_dropped(self) -> bool {
        self.0 & HANDLE_DROPPED == HANDLE_DROPPED
    }

    fn set_handle_dropped(&mut self) {
        self.0 |= HANDLE_DROPPED;
    }

    pub(super) fn is_waited_on(self) -> bool {
        self.0 & WAITED_ON == WAITED_ON
    }

    fn set_waited_on(&mut self) {
        self.0 |= WAITED_ON;
    }

    fn unset_waited_on(&mut self) {
        self.0 &= !WAITED_ON;
    }

    pub(super) fn ref_count(self) -> usize {
        (self.0 & REF_COUNT_MASK) >> REF_COUNT_SHIFT
    }

    fn ref_inc(&mut self) {
        assert!(self.0 <= isize::MAX as usize);
        self.0 += REF_ONE;
    }

    fn ref_dec(&mut self) {
        assert!(self.ref_count() > 0);
        self.0 -= REF_ONE;
    }

    /// Projects the internal word onto the public flags.
    pub(super) fn task_state(self) -> TaskState {
        let mut state = if self.is_complete() {
            TaskState::COMPLETED
        } else {
            TaskState::PENDING
        };

        state.set(TaskState::HANDLE_DROPPED, self.is_handle_dropped());
        state.set(TaskState::WAITED_ON, self.is_waited_on());
        state
    }
}

impl fmt::Debug for State {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.load().fmt(fmt)
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Snapshot")
            .field("is_running", &self.is_running())
            .field("is_complete", &self.is_complete())
            .field("is_notified", &self.is_notified())
            .field("is_handle_dropped", &self.is_handle_dropped())
            .field("is_waited_on", &self.is_waited_on())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}
