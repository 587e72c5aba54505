use crate::alloc::{AllocError, AllocStats, ThreadAllocator};
use crate::runtime::{
    AsyncContext, Schedule, SchedulerConfig, TaskManager, Ticker, TickerData, TickerEvents,
};
use crate::task::TaskHandle;
use anyhow::Result;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

/// Entry point of the crate: launches tasks and advances their waits.
///
/// Tasks run on the scheduler's thread pool. The owner is expected to call
/// [`poll`](Self::poll) once per external tick (a frame, a loop iteration):
/// waits only complete on a poll, and memory freed across threads is only
/// reclaimed there.
///
/// ```no_run
/// use ember::runtime::AsyncScheduler;
/// use std::time::Duration;
///
/// # fn main() -> anyhow::Result<()> {
/// let scheduler = AsyncScheduler::new()?;
///
/// let mut handle = scheduler.launch(|ctx| async move {
///     ctx.wait(Duration::from_millis(50)).await;
///     42
/// });
///
/// while !handle.ready() {
///     scheduler.poll();
///     std::thread::sleep(Duration::from_millis(5));
/// }
///
/// assert_eq!(handle.get()?, 42);
/// # Ok(())
/// # }
/// ```
pub struct AsyncScheduler {
    manager: TaskManager,

    /// Held for the whole of a `poll`, which serialises concurrent polls.
    ticker: Mutex<(Ticker, PollPolicy)>,
}

/// What a single [`AsyncScheduler::poll`] did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollStats {
    /// Number of polls so far, this one included.
    pub tick: u64,

    /// Waits that elapsed and had their task resubmitted.
    pub resumed: usize,

    /// Blocks freed across threads and made reusable by this poll.
    pub reclaimed: usize,

    /// Jobs run on the caller by an inline pool.
    pub ran_inline: usize,
}

impl AsyncScheduler {
    /// Creates a scheduler with the default configuration.
    pub fn new() -> Result<Self> {
        crate::runtime::Builder::new().try_build()
    }

    pub(crate) fn try_new(cfg: SchedulerConfig) -> Result<Self> {
        let policy = PollPolicy::new(&cfg, Instant::now());
        let manager = TaskManager::new(cfg)?;

        tracing::debug!(
            workers = manager.pool().num_threads(),
            inline = manager.pool().is_inline(),
            reclaim_interval = ?manager.config().reclaim_interval,
            "started scheduler"
        );

        Ok(Self {
            manager,
            ticker: Mutex::new((Ticker::default(), policy)),
        })
    }

    /// Invokes `f` with an [`AsyncContext`] and runs the future it returns
    /// as a new task. The task's first poll is submitted to the pool right
    /// away.
    ///
    /// The task lives in memory taken from the calling thread's chunk.
    ///
    /// # Panics
    ///
    /// If the chunk cannot host the task. Use
    /// [`try_launch`](Self::try_launch) to handle that case.
    #[track_caller]
    pub fn launch<F, Fut>(&self, f: F) -> TaskHandle<Fut::Output>
    where
        F: FnOnce(AsyncContext) -> Fut,
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        match self.try_launch(f) {
            Ok(handle) => handle,
            Err(e) => panic!("failed to allocate task: {e}"),
        }
    }

    /// Fallible variant of [`launch`](Self::launch).
    pub fn try_launch<F, Fut>(&self, f: F) -> Result<TaskHandle<Fut::Output>, AllocError>
    where
        F: FnOnce(AsyncContext) -> Fut,
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        self.manager.launch(f)
    }

    /// Runs `future` as a new task, for futures that need no context.
    ///
    /// # Panics
    ///
    /// If the calling thread's chunk cannot host the task.
    #[track_caller]
    pub fn spawn<Fut>(&self, future: Fut) -> TaskHandle<Fut::Output>
    where
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        match self.manager.spawn(future) {
            Ok(handle) => handle,
            Err(e) => panic!("failed to allocate task: {e}"),
        }
    }

    /// Advances the scheduler by one tick:
    ///
    /// 1. Runs an allocator reclamation pass if the reclaim interval elapsed
    ///    since the last one.
    /// 2. Resumes every wait whose deadline passed, soonest first. A task
    ///    that registers a new wait while being resumed is swept on the next
    ///    poll.
    /// 3. In inline mode, runs the jobs queued so far on the calling thread.
    ///
    /// Polls from several threads run one after the other. Calling `poll`
    /// from a task the same scheduler runs inline deadlocks.
    pub fn poll(&self) -> PollStats {
        let mut guard = self.ticker.lock();
        let (ticker, policy) = &mut *guard;

        let now = Instant::now();
        let (tick, events) = ticker.advance(&now, policy);

        let mut stats = PollStats {
            tick,
            ..PollStats::default()
        };

        if events.contains(TickerEvents::RECLAIM_MEMORY) {
            stats.reclaimed = self.manager.allocator().deallocate_pending();
        }

        if events.contains(TickerEvents::RESUME_WAITS) {
            stats.resumed = self.manager.awaitables().resume_due(now);
        }

        if events.contains(TickerEvents::RUN_INLINE) {
            stats.ran_inline = self.manager.pool().run_inline();
        }

        tracing::trace!(
            tick,
            resumed = stats.resumed,
            reclaimed = stats.reclaimed,
            ran_inline = stats.ran_inline,
            "poll"
        );

        stats
    }

    /// Stops the pool and drops every pending wait. Jobs not yet run are
    /// dropped and tasks suspended on a wait are never resumed.
    ///
    /// Also runs on drop. Calling it more than once is harmless.
    pub fn shutdown(&self) -> Result<()> {
        self.manager.shutdown()
    }

    pub fn allocator(&self) -> &ThreadAllocator {
        self.manager.allocator()
    }

    pub fn stats(&self) -> AllocStats {
        self.allocator().stats()
    }

    /// Number of waits not yet resumed.
    pub fn pending_waits(&self) -> usize {
        self.manager.awaitables().len()
    }

    /// Soonest deadline among the pending waits. Lets the owner sleep until
    /// the next poll can make progress.
    pub fn next_wait_deadline(&self) -> Option<Instant> {
        self.manager.awaitables().next_deadline()
    }

    /// Number of tasks launched and not yet torn down.
    pub fn num_tasks(&self) -> usize {
        self.manager.num_alive()
    }

    #[cfg(test)]
    pub(crate) fn config(&self) -> &SchedulerConfig {
        self.manager.config()
    }

    #[cfg(test)]
    pub(crate) fn manager(&self) -> &TaskManager {
        &self.manager
    }
}

impl Drop for AsyncScheduler {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::error!(error = %e, "scheduler shutdown failed");
        }
    }
}

impl fmt::Debug for AsyncScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncScheduler")
            .field("manager", &self.manager)
            .finish()
    }
}

/// Decides which maintenance a poll runs.
#[derive(Debug)]
pub(crate) struct PollPolicy {
    reclaim_interval: Duration,
    last_reclaim: Instant,
    inline: bool,
}

impl PollPolicy {
    pub(crate) fn new(cfg: &SchedulerConfig, now: Instant) -> Self {
        Self {
            reclaim_interval: cfg.reclaim_interval,
            last_reclaim: now,
            inline: cfg.inline,
        }
    }

    fn should_reclaim(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.last_reclaim) < self.reclaim_interval {
            return false;
        }

        self.last_reclaim = now;
        true
    }
}

impl TickerData for PollPolicy {
    type Context = Instant;

    fn update_and_check(&mut self, now: &Self::Context, _tick: u64) -> TickerEvents {
        let mut events = TickerEvents::RESUME_WAITS;

        if self.should_reclaim(*now) {
            events.insert(TickerEvents::RECLAIM_MEMORY);
        }

        if self.inline {
            events.insert(TickerEvents::RUN_INLINE);
        }

        events
    }
}
