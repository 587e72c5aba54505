use std::pin::Pin;
use std::task::{Context, Poll};

/// Suspends the current task once, putting it back at the end of the pool's
/// queue.
#[derive(Debug, Default, Clone, Copy)]
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct YieldNow {
    yielded: bool,
}

impl YieldNow {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }

        // Wakes while RUNNING, so the task is resubmitted once this poll
        // returns.
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}
