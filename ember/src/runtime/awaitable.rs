use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::Waker;
use std::time::Instant;

/// Shared between a [`Wait`](crate::time::Wait) and its entry in the
/// manager. Firing it marks the wait elapsed and wakes the waiting task.
#[derive(Debug, Default)]
pub(crate) struct WaitSlot {
    fired: AtomicBool,
    waker: Mutex<Option<Waker>>,
}

impl WaitSlot {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Stores the waker to wake on fire. Returns true if the slot fired
    /// already, in which case the waker may never be woken.
    pub(crate) fn register(&self, waker: &Waker) -> bool {
        {
            let mut slot = self.waker.lock();
            match slot.as_ref() {
                Some(current) if current.will_wake(waker) => {}
                _ => *slot = Some(waker.clone()),
            }
        }

        self.is_fired()
    }

    pub(crate) fn clear(&self) {
        // Dropped outside the lock: the last waker of a task tears it down,
        // which drops the `Wait` holding this slot.
        let waker = self.waker.lock().take();
        drop(waker);
    }

    fn fire(&self) {
        self.fired.store(true, Ordering::Release);

        // The task resumes through the scheduler's pool, never here.
        let waker = self.waker.lock().take();
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

struct Entry {
    deadline: Instant,
    seq: u64,

    /// Sweep generation the entry was registered in.
    pass: u64,

    slot: Arc<WaitSlot>,
}

#[derive(Default)]
struct Waits {
    /// Sorted by `(deadline, seq)` descending, the soonest entry at the tail.
    entries: Vec<Entry>,
    next_seq: u64,
    pass: u64,
}

/// Pending timed suspensions, kept in deadline order and swept by
/// [`AsyncScheduler::poll`](crate::runtime::AsyncScheduler::poll).
#[derive(Default)]
pub(crate) struct AwaitableManager {
    waits: Mutex<Waits>,
}

impl AwaitableManager {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers `slot` to fire once `deadline` passed. Equal deadlines fire
    /// in registration order.
    pub(crate) fn insert(&self, deadline: Instant, slot: Arc<WaitSlot>) {
        let mut waits = self.waits.lock();

        let seq = waits.next_seq;
        waits.next_seq += 1;
        let pass = waits.pass;

        // Entries sharing the deadline were registered earlier and must stay
        // closer to the tail.
        let idx = waits.entries.partition_point(|e| e.deadline > deadline);
        waits.entries.insert(
            idx,
            Entry {
                deadline,
                seq,
                pass,
                slot,
            },
        );

        debug_assert!(
            waits
                .entries
                .windows(2)
                .all(|w| (w[0].deadline, w[0].seq) > (w[1].deadline, w[1].seq))
        );
    }

    /// Fires every entry due at `now` in deadline-ascending order, removing
    /// each before firing it. Entries registered while the sweep runs wait
    /// for the next one. Returns the number of entries fired.
    pub(crate) fn resume_due(&self, now: Instant) -> usize {
        let current = {
            let mut waits = self.waits.lock();
            waits.pass += 1;
            waits.pass
        };

        let mut fired = 0;

        loop {
            let entry = {
                let mut waits = self.waits.lock();
                match waits.entries.last() {
                    Some(e) if e.deadline <= now && e.pass < current => waits.entries.pop(),
                    _ => None,
                }
            };

            let Some(entry) = entry else {
                break;
            };

            tracing::trace!(seq = entry.seq, "wait elapsed");
            entry.slot.fire();
            fired += 1;
        }

        fired
    }

    pub(crate) fn len(&self) -> usize {
        self.waits.lock().entries.len()
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.waits.lock().entries.last().map(|e| e.deadline)
    }

    /// Drops every pending entry along with its waker. The waiting tasks are
    /// never resumed.
    pub(crate) fn clear(&self) -> usize {
        let entries = std::mem::take(&mut self.waits.lock().entries);
        let cleared = entries.len();

        for entry in &entries {
            entry.slot.clear();
        }

        cleared
    }
}

impl fmt::Debug for AwaitableManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let waits = self.waits.lock();
        f.debug_struct("AwaitableManager")
            .field("len", &waits.entries.len())
            .field("pass", &waits.pass)
            .field("next_deadline", &waits.entries.last().map(|e| e.deadline))
            .finish()
    }
}
