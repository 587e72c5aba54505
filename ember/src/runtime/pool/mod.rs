//! Work-stealing thread pool running resumptions of tasks.
//!
//! Each worker owns a FIFO queue. Jobs submitted from a worker go to its own
//! queue, jobs submitted from anywhere else go to a shared injector, and idle
//! workers steal from both. In inline mode no thread is spawned and jobs wait
//! for the driver to run them from [`AsyncScheduler::poll`].
//!
//! [`AsyncScheduler::poll`]: crate::runtime::AsyncScheduler::poll

use crate::runtime::SchedulerConfig;
use crate::task::panic_payload_as_str;
use anyhow::{Result, anyhow};
use crossbeam_deque::{Injector, Worker as CbWorker};
use crossbeam_utils::sync::WaitGroup;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::iter;
use std::panic;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

mod park;
use park::Parker;

mod worker;
use worker::Worker;


/// Unit of work accepted by [`ThreadPool::enqueue`].
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// State shared between the pool handle and its workers.
pub(super) struct Inner {
    /// Distinguishes pools when routing submissions made from a worker.
    pub(super) id: usize,

    /// Submissions from threads that are not workers of this pool.
    pub(super) injector: Injector<Job>,

    pub(super) parker: Parker,

    pub(super) shutdown: AtomicBool,

    pub(super) max_steal_retries: usize,

    /// Jobs waiting for `run_inline`, only used in inline mode.
    inline_queue: Option<Mutex<VecDeque<Job>>>,
}

impl Inner {
    pub(super) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

/// Bounded pool of worker threads executing [`Job`]s.
pub struct ThreadPool {
    inner: Arc<Inner>,
    num_threads: usize,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl ThreadPool {
    pub(crate) fn new(cfg: &SchedulerConfig) -> Result<Self> {
        static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(0);

        let num_threads = cfg.num_threads();

        let inner = Arc::new(Inner {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            injector: Injector::new(),
            parker: Parker::new(num_threads),
            shutdown: AtomicBool::new(false),
            max_steal_retries: cfg.max_steal_retries,
            inline_queue: cfg.inline.then(|| Mutex::new(VecDeque::new())),
        });

        let pool = Self {
            inner,
            num_threads,
            handles: Mutex::new(Vec::with_capacity(num_threads)),
        };

        if num_threads > 0 {
            pool.spawn_workers(cfg)?;
        }

        tracing::debug!(
            pool = pool.inner.id,
            workers = num_threads,
            inline = cfg.inline,
            "thread pool started"
        );

        Ok(pool)
    }

    fn spawn_workers(&self, cfg: &SchedulerConfig) -> Result<()> {
        let mut queues = Vec::with_capacity(self.num_threads);
        let mut stealers = Vec::with_capacity(self.num_threads);

        for _ in 0..self.num_threads {
            let w = CbWorker::new_fifo();
            stealers.push(w.stealer());
            queues.push(w);
        }

        // Spawning threads is async, wait for all of them to be running.
        let started = WaitGroup::new();
        let mut handles = self.handles.lock();

        for (i, queue) in queues.into_iter().enumerate() {
            // Give each worker the stealers of all *other* workers.
            let other_stealers = stealers
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, s)| s.clone())
                .collect::<Vec<_>>();

            let worker = Worker::new(i, Arc::clone(&self.inner), other_stealers);

            let mut builder = thread::Builder::new().name((cfg.thread_name.0)());
            if let Some(stack_size) = cfg.thread_stack_size {
                builder = builder.stack_size(stack_size);
            }

            let started = started.clone();
            let spawned = builder.spawn(move || {
                drop(started);
                worker.run(queue);
            });

            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    // Stop the workers already running.
                    self.inner.shutdown.store(true, Ordering::Release);
                    self.inner.parker.unpark_all();
                    handles.drain(..).for_each(|handle| _ = handle.join());

                    return Err(anyhow!("failed to spawn worker thread {i}: {e}"));
                }
            }
        }

        drop(handles);
        started.wait();

        Ok(())
    }

    /// Submits a job. Never runs it on the calling thread.
    ///
    /// From a worker of this pool the job goes to that worker's own queue,
    /// otherwise to the shared injector, which keeps submissions FIFO per
    /// submitting thread. In inline mode the job waits for
    /// [`run_inline`](Self::run_inline). Jobs submitted after shutdown are
    /// dropped.
    pub fn enqueue(&self, job: Job) {
        if self.inner.is_shutdown() {
            tracing::trace!(pool = self.inner.id, "dropping job submitted after shutdown");
            return;
        }

        if let Some(queue) = &self.inner.inline_queue {
            queue.lock().push_back(job);
            return;
        }

        if let Some(job) = worker::try_push_local(self.inner.id, job) {
            self.inner.injector.push(job);
        }

        self.inner.parker.unpark_one();
    }

    /// Runs the jobs queued in inline mode on the calling thread. Jobs
    /// submitted while draining wait for the next call. Returns the number
    /// of jobs run, always 0 for a threaded pool.
    pub fn run_inline(&self) -> usize {
        let Some(queue) = &self.inner.inline_queue else {
            return 0;
        };

        let batch = queue.lock().len();

        iter::repeat_with(|| queue.lock().pop_front())
            .take(batch)
            .map_while(|job| job)
            .map(run_job)
            .count()
    }

    pub fn is_inline(&self) -> bool {
        self.inner.inline_queue.is_some()
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Number of workers currently parked.
    pub fn num_parked(&self) -> usize {
        self.inner.parker.num_parked()
    }

    /// Stops the workers, joins them and drops every job that did not run.
    /// Idempotent.
    pub fn shutdown(&self) -> Result<()> {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.inner.parker.unpark_all();

        let current = thread::current().id();
        let panicked = self
            .handles
            .lock()
            .drain(..)
            .filter(|handle| handle.thread().id() != current)
            .filter_map(|handle| handle.join().err())
            .count();

        let dropped = self.drain();
        tracing::debug!(pool = self.inner.id, dropped, "thread pool stopped");

        if panicked == 0 {
            Ok(())
        } else {
            Err(anyhow!("{} thread(s) panicked", panicked))
        }
    }

    fn drain(&self) -> usize {
        let injected = iter::repeat_with(|| self.inner.injector.steal())
            .take_while(|s| !s.is_empty())
            .filter_map(|s| s.success())
            .count();

        let inline = self
            .inner
            .inline_queue
            .as_ref()
            .map_or(0, |queue| queue.lock().drain(..).count());

        injected + inline
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::error!(error = %e, "error during thread pool shutdown");
        }
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("id", &self.inner.id)
            .field("num_threads", &self.num_threads)
            .field("inline", &self.is_inline())
            .field("shutdown", &self.inner.is_shutdown())
            .finish()
    }
}

/// Runs a job, keeping the calling thread alive if it panics.
pub(super) fn run_job(job: Job) {
    if let Err(payload) = panic::catch_unwind(panic::AssertUnwindSafe(job)) {
        tracing::error!(
            message = panic_payload_as_str(&*payload).unwrap_or("<non-string payload>"),
            "job panicked"
        );
    }
}
