use crate::runtime::pool::{Inner, Job, run_job};
use crossbeam_deque::{Stealer, Worker as CbWorker};
use std::cell::RefCell;
use std::iter;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

/// Queue of the worker running on this thread, tagged with its pool so a
/// job submitted to another pool from here still goes to that pool's
/// injector.
struct LocalQueue {
    pool_id: usize,
    queue: CbWorker<Job>,
}

thread_local! {
    static LOCAL: RefCell<Option<LocalQueue>> = const { RefCell::new(None) };
}

/// Pushes `job` onto the current worker's own queue if this thread is a
/// worker of `pool_id`. Gives the job back otherwise.
pub(super) fn try_push_local(pool_id: usize, job: Job) -> Option<Job> {
    LOCAL.with(|local| match local.borrow().as_ref() {
        Some(local) if local.pool_id == pool_id => {
            local.queue.push(job);
            None
        }
        _ => Some(job),
    })
}

pub(super) struct Worker {
    index: usize,
    pool: Arc<Inner>,
    stealers: Vec<Stealer<Job>>,
    unpark_flag: Arc<AtomicBool>,
}

impl Worker {
    pub(super) fn new(index: usize, pool: Arc<Inner>, mut stealers: Vec<Stealer<Job>>) -> Self {
        // Each worker gets its own search order when stealing, to reduce
        // contention.
        fastrand::shuffle(&mut stealers);

        Self {
            index,
            pool,
            stealers,
            unpark_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(super) fn run(self, queue: CbWorker<Job>) {
        LOCAL.with(|local| {
            *local.borrow_mut() = Some(LocalQueue {
                pool_id: self.pool.id,
                queue,
            });
        });

        tracing::debug!(worker = self.index, "worker started");

        while !self.pool.is_shutdown() {
            if let Some(job) = self.find_job() {
                run_job(job);
                continue;
            }

            self.pool.parker.park(&self.unpark_flag, || {
                !self.pool.injector.is_empty() || self.pool.is_shutdown()
            });
        }

        // Queued jobs are dropped, not run.
        let dropped = LOCAL.with(|local| {
            local.borrow_mut().take().map_or(0, |local| {
                iter::from_fn(|| local.queue.pop()).count()
            })
        });

        tracing::debug!(worker = self.index, dropped, "worker stopped");
    }

    fn find_job(&self) -> Option<Job> {
        LOCAL.with(|local| {
            let local = local.borrow();
            let local = &local.as_ref()?.queue;

            local.pop().or_else(|| {
                iter::repeat_with(|| {
                    self.pool
                        .injector
                        .steal_batch_and_pop(local)
                        .or_else(|| self.stealers.iter().map(|s| s.steal()).collect())
                })
                .take(self.pool.max_steal_retries)
                .find(|s| !s.is_retry())
                .and_then(|s| s.success())
            })
        })
    }
}
