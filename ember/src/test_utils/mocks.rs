use crate::alloc::ThreadAllocator;
use crate::runtime::Schedule;
use crate::task::{FrameAlloc, Id, Notified, TaskFault, TaskHandle};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Wake, Waker};

/// Single-threaded scheduler keeping notified tasks in a queue until the
/// test runs them.
#[derive(Clone)]
pub(crate) struct DummyScheduler(Arc<DummyInner>);

struct DummyInner {
    allocator: ThreadAllocator,
    queue: Mutex<VecDeque<Notified<DummyScheduler>>>,
    destroyed: Mutex<Vec<Id>>,
    faults: Mutex<Vec<String>>,
}

impl DummyScheduler {
    pub(crate) fn new() -> Self {
        Self(Arc::new(DummyInner {
            allocator: ThreadAllocator::new(64 * 1024, 4 * 1024),
            queue: Mutex::new(VecDeque::new()),
            destroyed: Mutex::new(Vec::new()),
            faults: Mutex::new(Vec::new()),
        }))
    }

    pub(crate) fn spawn<F>(&self, future: F) -> TaskHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let (notified, handle) = crate::task::new_task(future, self.clone(), Id::next())
            .expect("dummy allocator exhausted");
        self.resume(notified);
        handle
    }

    /// Runs queued tasks until the queue is empty. Returns how many polls
    /// happened.
    pub(crate) fn run_pending(&self) -> usize {
        let mut polls = 0;

        loop {
            let Some(task) = self.0.queue.lock().pop_front() else {
                break polls;
            };

            task.run();
            polls += 1;
        }
    }

    pub(crate) fn num_queued(&self) -> usize {
        self.0.queue.lock().len()
    }

    /// Drops every queued task without running it.
    pub(crate) fn drop_queued(&self) {
        let queued = std::mem::take(&mut *self.0.queue.lock());
        drop(queued);
    }

    pub(crate) fn destroyed(&self) -> Vec<Id> {
        self.0.destroyed.lock().clone()
    }

    pub(crate) fn faults(&self) -> Vec<String> {
        self.0.faults.lock().clone()
    }
}

impl Schedule for DummyScheduler {
    fn resume(&self, task: Notified<Self>) {
        self.0.queue.lock().push_back(task);
    }

    fn allocator(&self) -> &ThreadAllocator {
        &self.0.allocator
    }

    unsafe fn destroy_task(&self, id: Id, frame: FrameAlloc) {
        unsafe { frame.drop_in_place() };
        unsafe { self.0.allocator.deallocate_layout(frame.ptr(), frame.layout()) };
        self.0.destroyed.lock().push(id);
    }

    fn unhandled_fault(&self, fault: &TaskFault) {
        self.0.faults.lock().push(fault.message().to_owned());
    }
}

/// Counts wakes. Each live waker clone holds one strong count.
#[derive(Debug, Default)]
pub(crate) struct WakerData {
    wake_count: AtomicUsize,
}

impl WakerData {
    pub(crate) fn get_count(&self) -> usize {
        self.wake_count.load(Ordering::Relaxed)
    }
}

impl Wake for WakerData {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.wake_count.fetch_add(1, Ordering::Relaxed);
    }
}

pub(crate) fn mock_waker() -> (Waker, Arc<WakerData>) {
    let data = Arc::new(WakerData::default());
    (Waker::from(Arc::clone(&data)), data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_waker_counts() {
        let (waker1, waker_data) = mock_waker();
        waker1.wake_by_ref();
        assert_eq!(waker_data.get_count(), 1);

        let waker2 = waker1.clone();
        assert_eq!(Arc::strong_count(&waker_data), 3);

        waker2.wake();
        assert_eq!(waker_data.get_count(), 2);
        assert_eq!(Arc::strong_count(&waker_data), 2);

        drop(waker1);
        assert_eq!(waker_data.get_count(), 2);
        assert_eq!(Arc::strong_count(&waker_data), 1);
    }

    #[test]
    fn test_dummy_scheduler_runs_and_tears_down() {
        let scheduler = DummyScheduler::new();
        let mut handle = scheduler.spawn(async { 7 });

        assert_eq!(scheduler.num_queued(), 1);
        assert_eq!(scheduler.run_pending(), 1);

        assert_eq!(handle.get().ok(), Some(7));
        assert_eq!(scheduler.destroyed(), vec![handle.id()]);
        assert_eq!(scheduler.allocator().stats().live, 0);
    }
}
