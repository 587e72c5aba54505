use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, Thread};
use std::time::Duration;

// Parked workers re-check the shutdown flag at this pace in case an unpark
// is missed, which bounds shutdown latency.
const PARK_TIMEOUT: Duration = Duration::from_millis(100);

/// LIFO collection of parked workers. We unpark in LIFO order as the latest
/// parked thread is the one where the CPU cache will be the hottest.
#[derive(Debug, Default)]
pub(in crate::runtime) struct Parker {
    parked: Mutex<Vec<(Thread, Arc<AtomicBool>)>>,
}

impl Parker {
    pub(super) fn new(capacity: usize) -> Self {
        Self {
            parked: Mutex::new(Vec::with_capacity(capacity)),
        }
    }

    /// Parks the current thread until another thread unparks it.
    ///
    /// `should_wake` is checked while holding the list lock, so a submitter
    /// that publishes work and then calls `unpark_one` cannot be missed.
    pub(super) fn park(&self, unpark_flag: &Arc<AtomicBool>, should_wake: impl Fn() -> bool) {
        {
            let mut parked = self.parked.lock();

            if should_wake() {
                return;
            }

            unpark_flag.store(false, Ordering::Release);
            parked.push((thread::current(), Arc::clone(unpark_flag)));
        }

        // Loop to account for spurious wakeups.
        while !unpark_flag.load(Ordering::Acquire) {
            thread::park_timeout(PARK_TIMEOUT);

            if should_wake() {
                self.remove_current();
                return;
            }
        }
    }

    fn remove_current(&self) {
        let me = thread::current().id();
        self.parked.lock().retain(|(thread, _)| thread.id() != me);
    }

    pub(super) fn unpark_one(&self) -> bool {
        if let Some((thread, flag)) = self.parked.lock().pop() {
            flag.store(true, Ordering::Release);
            thread.unpark();
            true
        } else {
            false
        }
    }

    pub(super) fn unpark_all(&self) -> usize {
        let mut parked = self.parked.lock();
        let num_unparked = parked.len();

        for (thread, flag) in parked.drain(..) {
            flag.store(true, Ordering::Release);
            thread.unpark();
        }

        num_unparked
    }

    pub(super) fn num_parked(&self) -> usize {
        self.parked.lock().len()
    }
}
