use crate::alloc::chunk::MIN_BLOCK_SIZE;
use crate::runtime::AsyncScheduler;
use anyhow::{Result, ensure};
use std::convert::TryFrom;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

/// How often `poll` folds cross-thread frees back into their chunks.
const RECLAIM_INTERVAL: Duration = Duration::from_secs(15);

/// Bytes reserved per thread for task frames.
const CHUNK_CAPACITY: usize = 4 * 1024 * 1024;

/// Largest size class. Frames above it fail to allocate.
const MAX_BLOCK_SIZE: usize = 64 * 1024;

/// Maximum number of stealing attempts.
const MAX_STEAL_RETRIES: usize = 3;

#[derive(Clone)]
pub(crate) struct ThreadNameFn(pub(crate) Arc<dyn Fn() -> String + Send + Sync + 'static>);

fn default_thread_name_fn() -> ThreadNameFn {
    let worker_count = Arc::new(AtomicUsize::new(0));

    ThreadNameFn(Arc::new(move || {
        let id = worker_count.fetch_add(1, Ordering::Relaxed);
        format!("ember-{}", id)
    }))
}

impl fmt::Debug for ThreadNameFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ThreadNameFn").field(&"<function>").finish()
    }
}

/// Configures and creates an [`AsyncScheduler`].
///
/// ```no_run
/// use ember::runtime::Builder;
/// use std::time::Duration;
///
/// # fn main() -> anyhow::Result<()> {
/// let scheduler = Builder::new()
///     .worker_threads(4)
///     .reclaim_interval(Duration::from_secs(5))
///     .try_build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Builder {
    /// Number of pool workers. Defaults to 1 per CPU core.
    worker_threads: Option<usize>,

    /// Run every job on the thread calling `poll` instead of on workers.
    inline: bool,

    /// Name fn used for threads spawned by the pool.
    thread_name: ThreadNameFn,

    /// Stack size used for threads spawned by the pool.
    thread_stack_size: Option<usize>,

    /// How many times an idle worker sweeps the injector and the other
    /// workers' queues before parking.
    max_steal_retries: usize,

    /// Minimum time between two reclamation passes.
    reclaim_interval: Duration,

    /// Size of each thread's chunk.
    chunk_capacity: usize,

    /// Largest allocation a chunk serves.
    max_block_size: usize,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Self {
        Self {
            worker_threads: None,
            inline: false,
            thread_name: default_thread_name_fn(),
            thread_stack_size: None,
            max_steal_retries: MAX_STEAL_RETRIES,
            reclaim_interval: RECLAIM_INTERVAL,
            chunk_capacity: CHUNK_CAPACITY,
            max_block_size: MAX_BLOCK_SIZE,
        }
    }

    /// The number of worker threads of the pool. Ignored in inline mode.
    ///
    /// Defaults to 1 worker per CPU core.
    #[track_caller]
    pub fn worker_threads(mut self, val: usize) -> Self {
        assert!(val > 0, "worker_threads must be greater than 0");
        self.worker_threads = Some(val);
        self
    }

    /// Debug mode: no worker threads are spawned and every job runs
    /// synchronously on the thread calling [`AsyncScheduler::poll`].
    pub fn inline(mut self, val: bool) -> Self {
        self.inline = val;
        self
    }

    /// Sets name of threads spawned by the pool.
    ///
    /// The default name is "ember-{id}", where id is monotonically
    /// increasing.
    pub fn thread_name(mut self, val: impl Into<String>) -> Self {
        let val = val.into();
        self.thread_name = ThreadNameFn(Arc::new(move || val.clone()));
        self
    }

    /// Sets a function used to generate the name of threads spawned by the
    /// pool.
    pub fn thread_name_fn<F>(mut self, f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.thread_name = ThreadNameFn(Arc::new(f));
        self
    }

    /// Sets the stack size (in bytes) for worker threads.
    ///
    /// The actual stack size may be greater than this value if the platform
    /// specifies minimal stack size.
    #[track_caller]
    pub fn thread_stack_size(mut self, val: usize) -> Self {
        assert!(
            val.is_power_of_two(),
            "thread_stack_size must be a power of two"
        );
        self.thread_stack_size = Some(val);
        self
    }

    #[track_caller]
    pub fn max_steal_retries(mut self, val: usize) -> Self {
        assert!(val > 0, "max_steal_retries must be greater than 0");
        self.max_steal_retries = val;
        self
    }

    /// Minimum time between two allocator reclamation passes run by
    /// [`AsyncScheduler::poll`]. Defaults to 15 seconds.
    #[track_caller]
    pub fn reclaim_interval(mut self, val: Duration) -> Self {
        assert!(!val.is_zero(), "reclaim_interval must be greater than 0");
        self.reclaim_interval = val;
        self
    }

    /// Bytes reserved per thread for task frames. Defaults to 4 MiB.
    #[track_caller]
    pub fn chunk_capacity(mut self, val: usize) -> Self {
        assert!(val > 0, "chunk_capacity must be greater than 0");
        self.chunk_capacity = val;
        self
    }

    /// Largest frame a chunk can hold. Defaults to 64 KiB.
    #[track_caller]
    pub fn max_block_size(mut self, val: usize) -> Self {
        assert!(
            val.is_power_of_two(),
            "max_block_size must be a power of two"
        );
        self.max_block_size = val;
        self
    }

    /// Creates the configured [`AsyncScheduler`], spawning the pool's
    /// workers unless running inline.
    pub fn try_build(self) -> Result<AsyncScheduler> {
        let cfg = SchedulerConfig::try_from(self)?;
        AsyncScheduler::try_new(cfg)
    }
}

// Export builder as a SchedulerConfig object consumed by the pool, the
// allocator and the poll policy.
#[derive(Debug, Clone)]
pub(crate) struct SchedulerConfig {
    pub(crate) worker_threads: usize,
    pub(crate) inline: bool,
    pub(crate) thread_name: ThreadNameFn,
    pub(crate) thread_stack_size: Option<usize>,
    pub(crate) max_steal_retries: usize,
    pub(crate) reclaim_interval: Duration,
    pub(crate) chunk_capacity: usize,
    pub(crate) max_block_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            worker_threads: 1,
            inline: false,
            thread_name: default_thread_name_fn(),
            thread_stack_size: None,
            max_steal_retries: MAX_STEAL_RETRIES,
            reclaim_interval: RECLAIM_INTERVAL,
            chunk_capacity: CHUNK_CAPACITY,
            max_block_size: MAX_BLOCK_SIZE,
        }
    }
}

impl SchedulerConfig {
    fn validate(&self) -> Result<()> {
        ensure!(
            self.max_block_size >= MIN_BLOCK_SIZE,
            "max_block_size ({}) must be at least {} bytes",
            self.max_block_size,
            MIN_BLOCK_SIZE
        );

        ensure!(
            self.chunk_capacity >= self.max_block_size,
            "chunk_capacity ({}) must hold at least one block of max_block_size ({})",
            self.chunk_capacity,
            self.max_block_size
        );

        ensure!(
            self.inline || self.worker_threads > 0,
            "worker_threads must be greater than 0"
        );

        Ok(())
    }

    /// Number of threads the pool spawns.
    pub(crate) fn num_threads(&self) -> usize {
        if self.inline { 0 } else { self.worker_threads }
    }
}

impl TryFrom<Builder> for SchedulerConfig {
    type Error = anyhow::Error;

    fn try_from(builder: Builder) -> Result<Self, Self::Error> {
        let worker_threads = match builder.worker_threads {
            Some(n) => n,
            None => thread::available_parallelism()?.get(),
        };

        let cfg = SchedulerConfig {
            worker_threads,
            inline: builder.inline,
            thread_name: builder.thread_name,
            thread_stack_size: builder.thread_stack_size,
            max_steal_retries: builder.max_steal_retries,
            reclaim_interval: builder.reclaim_interval,
            chunk_capacity: builder.chunk_capacity,
            max_block_size: builder.max_block_size,
        };

        cfg.validate()?;

        Ok(cfg)
    }
}
