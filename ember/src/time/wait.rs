use crate::runtime::{AwaitableManager, WaitSlot};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

/// Suspends the awaiting task until a deadline passed.
///
/// The first poll registers the wait with the scheduler's awaitable
/// manager. It completes once [`AsyncScheduler::poll`] observed the deadline,
/// which means a wait is only as precise as the rate at which the scheduler
/// is polled. The task is resumed through the scheduler's pool.
///
/// Created by [`AsyncContext::wait`] and [`AsyncContext::wait_until`].
///
/// [`AsyncScheduler::poll`]: crate::runtime::AsyncScheduler::poll
/// [`AsyncContext::wait`]: crate::runtime::AsyncContext::wait
/// [`AsyncContext::wait_until`]: crate::runtime::AsyncContext::wait_until
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Wait {
    deadline: Instant,
    manager: Arc<AwaitableManager>,
    state: State,
}

enum State {
    Unregistered,
    Registered(Arc<WaitSlot>),
    Done,
}

impl Wait {
    pub(crate) fn new(manager: Arc<AwaitableManager>, deadline: Instant) -> Self {
        Self {
            deadline,
            manager,
            state: State::Unregistered,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// True once the scheduler fired this wait.
    pub fn elapsed(&self) -> bool {
        match &self.state {
            State::Unregistered => false,
            State::Registered(slot) => slot.is_fired(),
            State::Done => true,
        }
    }
}

impl Future for Wait {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let fired = match &self.state {
            State::Unregistered => {
                let slot = Arc::new(WaitSlot::new());
                slot.register(cx.waker());
                self.manager.insert(self.deadline, Arc::clone(&slot));
                self.state = State::Registered(slot);
                false
            }
            State::Registered(slot) => slot.register(cx.waker()),
            State::Done => true,
        };

        if fired {
            if let State::Registered(slot) = &self.state {
                slot.clear();
            }
            self.state = State::Done;
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

impl Drop for Wait {
    fn drop(&mut self) {
        // The entry stays in the manager and fires into an empty slot.
        if let State::Registered(slot) = &self.state {
            slot.clear();
        }
    }
}

impl fmt::Debug for Wait {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wait")
            .field("deadline", &self.deadline)
            .field("elapsed", &self.elapsed())
            .finish()
    }
}
