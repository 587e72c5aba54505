use super::scheduler::PollPolicy;
use super::{SchedulerConfig, TickerData, TickerEvents};
use crate::runtime::{AsyncScheduler, Builder};
use crate::task::{TaskHandle, TaskState};
use crate::test_utils::wait_until;
use crate::utils::tracker::{Call, Method};
use anyhow::Result;
use futures::channel::oneshot;
use parking_lot::Mutex;
use rstest::rstest;
use static_assertions::assert_impl_all;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

assert_impl_all!(AsyncScheduler: Send, Sync);
assert_impl_all!(crate::runtime::AsyncContext: Send, Sync, Clone);

const TIMEOUT: Duration = Duration::from_secs(5);

fn inline() -> Result<AsyncScheduler> {
    Builder::new().inline(true).try_build()
}

fn boom() -> u32 {
    panic!("boom")
}

/// Polls until `handle` is ready, sleeping `interval` between polls.
fn poll_until_ready<T>(scheduler: &AsyncScheduler, handle: &TaskHandle<T>, interval: Duration) {
    let start = Instant::now();

    while !handle.ready() {
        assert!(start.elapsed() < TIMEOUT, "task {} never completed", handle.id());
        scheduler.poll();
        thread::sleep(interval);
    }
}

#[test]
fn test_await_task_through_wait_inline() -> Result<()> {
    let scheduler = inline()?;
    let tracker = scheduler.manager().tracker().clone();
    let start = Instant::now();

    let y = scheduler.launch(|ctx| async move {
        ctx.wait(Duration::from_millis(50)).await;
        42
    });
    let y_id = y.id();

    let mut x = scheduler.launch(move |_| async move { y.await.map(|v| v + 1) });
    let x_id = x.id();

    // Both tasks run up to their first suspension.
    let stats = scheduler.poll();
    assert_eq!(stats.ran_inline, 2);
    assert_eq!(scheduler.pending_waits(), 1);
    assert!(scheduler.next_wait_deadline().is_some_and(|d| d > start));
    assert!(x.state().contains(TaskState::PENDING));

    // The poll observing the deadline completes y. x is only submitted, it
    // never runs from inside y's completion.
    loop {
        assert!(start.elapsed() < TIMEOUT);
        let stats = scheduler.poll();
        if stats.resumed == 1 {
            assert_eq!(stats.ran_inline, 1);
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }

    assert!(start.elapsed() >= Duration::from_millis(50));
    assert!(!x.ready());

    let stats = scheduler.poll();
    assert_eq!(stats.ran_inline, 1);
    assert!(x.ready());

    assert_eq!(x.get()??, 43);

    assert_eq!(scheduler.stats().live, 0);
    assert_eq!(scheduler.num_tasks(), 0);
    assert_eq!(tracker.calls_for(&Method::Destroy, x_id), 1);
    assert_eq!(tracker.calls_for(&Method::Destroy, y_id), 1);

    // Initial submission, then the wake from y's completion.
    assert_eq!(tracker.calls_for(&Method::Resume, x_id), 2);
    Ok(())
}

#[test]
fn test_await_task_through_wait_threaded() -> Result<()> {
    let scheduler = Builder::new().worker_threads(2).try_build()?;

    let y = scheduler.launch(|ctx| async move {
        ctx.wait(Duration::from_millis(50)).await;
        42
    });
    let mut x = scheduler.launch(move |_| async move { y.await.map(|v| v + 1) });

    poll_until_ready(&scheduler, &x, Duration::from_millis(1));
    assert_eq!(x.get()??, 43);

    // Completion may still be unwinding on a worker.
    assert!(wait_until(TIMEOUT, || scheduler.num_tasks() == 0));
    assert_eq!(scheduler.stats().live, 0);

    scheduler.shutdown()
}

#[test]
fn test_complete_and_drop_race_tears_down_once() -> Result<()> {
    let scheduler = Builder::new().worker_threads(4).try_build()?;
    let tracker = scheduler.manager().tracker().clone();

    let ids = (0..500u64)
        .map(|i| {
            let handle = scheduler.spawn(async move { i * 2 });
            let id = handle.id();

            if fastrand::bool() {
                thread::yield_now();
            }

            drop(handle);
            id
        })
        .collect::<Vec<_>>();

    assert!(wait_until(TIMEOUT, || scheduler.num_tasks() == 0));
    assert_eq!(tracker.num_calls(&Method::Destroy), ids.len());

    for id in ids {
        assert_eq!(tracker.calls_for(&Method::Destroy, id), 1);
    }

    assert_eq!(scheduler.stats().live, 0);
    scheduler.shutdown()
}

#[rstest]
#[case::distinct(&[30, 10, 20], &[1, 2, 0])]
#[case::ties_keep_registration_order(&[30, 10, 20, 10], &[1, 3, 2, 0])]
fn test_waits_resume_in_deadline_order(
    #[case] offsets: &[u64],
    #[case] expected: &[usize],
) -> Result<()> {
    let scheduler = inline()?;
    let order = Arc::new(Mutex::new(Vec::new()));
    let base = Instant::now();

    let handles = offsets
        .iter()
        .enumerate()
        .map(|(idx, offset)| {
            let order = Arc::clone(&order);
            let deadline = base + Duration::from_millis(*offset);

            scheduler.launch(move |ctx| async move {
                ctx.wait_until(deadline).await;
                order.lock().push(idx);
            })
        })
        .collect::<Vec<_>>();

    // Registers every wait, in launch order.
    assert_eq!(scheduler.poll().ran_inline, offsets.len());
    assert_eq!(scheduler.pending_waits(), offsets.len());

    let last = offsets.iter().max().copied().unwrap_or_default();
    thread::sleep(Duration::from_millis(last + 10));

    let stats = scheduler.poll();
    assert_eq!(stats.resumed, offsets.len());
    assert_eq!(stats.ran_inline, offsets.len());

    assert_eq!(*order.lock(), expected);
    assert!(handles.iter().all(TaskHandle::ready));
    Ok(())
}

#[test]
fn test_each_wait_needs_its_own_poll() -> Result<()> {
    let scheduler = inline()?;

    let mut handle = scheduler.launch(|ctx| async move {
        ctx.wait(Duration::ZERO).await;
        ctx.wait(Duration::ZERO).await;
        7
    });

    // Each poll fires one wait. The next one is registered by the resumed
    // task once the sweep is over.
    assert_eq!(scheduler.poll().resumed, 0);
    assert_eq!(scheduler.poll().resumed, 1);
    assert!(!handle.ready());
    assert_eq!(scheduler.poll().resumed, 1);
    assert!(handle.ready());

    assert_eq!(handle.get()?, 7);
    Ok(())
}

#[test]
fn test_concurrent_polls_run_one_after_the_other() -> Result<()> {
    const TASKS: usize = 8;
    const ROUNDS: usize = 25;

    let scheduler = inline()?;

    let mut handles = (0..TASKS)
        .map(|_| {
            scheduler.launch(|ctx| async move {
                for _ in 0..ROUNDS {
                    ctx.wait(Duration::ZERO).await;
                }
                ROUNDS
            })
        })
        .collect::<Vec<_>>();

    assert_eq!(scheduler.poll().ran_inline, TASKS);

    let polls = Mutex::new(Vec::new());

    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                let start = Instant::now();
                while !handles.iter().all(|h| h.ready()) {
                    assert!(start.elapsed() < TIMEOUT, "tasks never completed");
                    polls.lock().push(scheduler.poll());
                }
            });
        }
    });

    let polls = polls.into_inner();

    // Every wait a poll resumed was run by that same poll.
    for stats in &polls {
        assert_eq!(stats.ran_inline, stats.resumed, "poll {stats:?}");
    }

    let mut ticks = polls.iter().map(|stats| stats.tick).collect::<Vec<_>>();
    ticks.sort_unstable();
    assert_eq!(ticks, (2..2 + polls.len() as u64).collect::<Vec<_>>());

    assert_eq!(polls.iter().map(|stats| stats.resumed).sum::<usize>(), TASKS * ROUNDS);

    for handle in &mut handles {
        assert_eq!(handle.get()?, ROUNDS);
    }
    Ok(())
}

#[test]
fn test_task_id_visible_on_worker() -> Result<()> {
    let scheduler = Builder::new().worker_threads(2).try_build()?;

    let mut handle = scheduler.spawn(async { (crate::task::id(), crate::task::try_id()) });
    poll_until_ready(&scheduler, &handle, Duration::from_millis(1));

    let id = handle.id();
    assert_eq!(handle.get()?, (id, Some(id)));
    assert_eq!(crate::task::try_id(), None);
    Ok(())
}

#[test]
fn test_yield_goes_through_pool() -> Result<()> {
    let scheduler = inline()?;

    let mut handle = scheduler.launch(|ctx| async move {
        for _ in 0..3 {
            ctx.yield_now().await;
        }
        "done"
    });

    for _ in 0..3 {
        assert_eq!(scheduler.poll().ran_inline, 1);
        assert!(!handle.ready());
    }

    assert_eq!(scheduler.poll().ran_inline, 1);
    assert_eq!(handle.get()?, "done");
    Ok(())
}

#[test]
fn test_nested_launch() -> Result<()> {
    let scheduler = inline()?;

    let mut handle = scheduler.launch(|ctx| async move {
        let child = ctx.launch(|_| async { 2 });
        let grandchild = ctx.spawn(async { 3 });
        Ok::<_, anyhow::Error>(child.await? * grandchild.await?)
    });

    poll_until_ready(&scheduler, &handle, Duration::ZERO);
    assert_eq!(handle.get()??, 6);
    assert_eq!(scheduler.num_tasks(), 0);
    Ok(())
}

#[test]
fn test_fault_reaches_handle() -> Result<()> {
    let scheduler = inline()?;
    let tracker = scheduler.manager().tracker().clone();

    let mut handle = scheduler.spawn(async { boom() });
    scheduler.poll();

    let fault = match handle.get() {
        Ok(v) => panic!("expected a fault, got {v}"),
        Err(fault) => fault,
    };

    assert_eq!(fault.message(), "boom");
    assert_eq!(
        tracker.get_calls(&Method::Fault),
        vec![Call::Fault {
            id: handle.id(),
            message: "boom".to_owned(),
        }]
    );

    // The scheduler keeps going.
    let mut next = scheduler.spawn(async { 1 });
    scheduler.poll();
    assert_eq!(next.get()?, 1);
    Ok(())
}

#[test]
#[should_panic(expected = "already retrieved")]
fn test_double_get_panics() {
    let scheduler = inline().unwrap();
    let mut handle = scheduler.spawn(async { 1 });
    scheduler.poll();

    let _ = handle.get();
    let _ = handle.get();
}

#[test]
fn test_cross_thread_frees_reclaimed_on_poll() -> Result<()> {
    let scheduler = Builder::new()
        .worker_threads(1)
        .reclaim_interval(Duration::from_millis(1))
        .try_build()?;

    // Every task is torn down by the worker, away from the thread whose
    // chunk hosts it.
    let started = Arc::new(AtomicUsize::new(0));
    let senders = (0..10)
        .map(|_| {
            let (tx, rx) = oneshot::channel::<()>();
            let started = Arc::clone(&started);

            drop(scheduler.spawn(async move {
                started.fetch_add(1, Ordering::Relaxed);
                rx.await.is_ok()
            }));
            tx
        })
        .collect::<Vec<_>>();

    assert!(wait_until(TIMEOUT, || started.load(Ordering::Relaxed) == 10));

    for tx in senders {
        assert!(tx.send(()).is_ok());
    }

    assert!(wait_until(TIMEOUT, || scheduler.num_tasks() == 0));

    let stats = scheduler.stats();
    assert_eq!(stats.live, 0);
    assert_eq!(stats.pending, 10);

    // The pending lists flip on every pass, the frees land within two.
    let mut reclaimed = 0;
    for _ in 0..2 {
        thread::sleep(Duration::from_millis(2));
        reclaimed += scheduler.poll().reclaimed;
    }

    assert_eq!(reclaimed, 10);
    assert_eq!(scheduler.stats().pending, 0);
    scheduler.shutdown()
}

#[test]
fn test_shutdown_drops_suspended_tasks() -> Result<()> {
    let scheduler = Builder::new().worker_threads(1).try_build()?;

    drop(scheduler.launch(|ctx| async move {
        ctx.wait(Duration::from_secs(60)).await;
    }));

    assert!(wait_until(TIMEOUT, || scheduler.pending_waits() == 1));
    assert_eq!(scheduler.num_tasks(), 1);

    scheduler.shutdown()?;

    assert_eq!(scheduler.pending_waits(), 0);
    assert!(wait_until(TIMEOUT, || scheduler.num_tasks() == 0));
    assert_eq!(scheduler.stats().live, 0);

    // Idempotent.
    scheduler.shutdown()
}

#[test]
fn test_launch_after_shutdown_never_runs() -> Result<()> {
    let scheduler = inline()?;
    scheduler.shutdown()?;

    let handle = scheduler.spawn(async { 1 });
    assert_eq!(scheduler.poll().ran_inline, 0);
    assert_eq!(handle.state(), TaskState::PENDING);

    drop(handle);
    assert_eq!(scheduler.num_tasks(), 0);
    Ok(())
}

#[test]
fn test_try_launch_reports_exhaustion() -> Result<()> {
    let scheduler = Builder::new()
        .inline(true)
        .chunk_capacity(4096)
        .max_block_size(4096)
        .try_build()?;

    let big = [0u8; 8192];
    let res = scheduler.try_launch(move |_| async move { big.len() });
    assert!(res.is_err());

    assert!(scheduler.config().inline);
    assert_eq!(scheduler.num_tasks(), 0);
    Ok(())
}

#[test]
fn test_poll_policy_reclaims_on_interval() {
    let cfg = SchedulerConfig::default();
    let start = Instant::now();
    let mut policy = PollPolicy::new(&cfg, start);

    assert_eq!(policy.update_and_check(&start, 1), TickerEvents::RESUME_WAITS);

    let due = start + cfg.reclaim_interval;
    assert_eq!(
        policy.update_and_check(&due, 2),
        TickerEvents::RESUME_WAITS | TickerEvents::RECLAIM_MEMORY
    );

    let soon_after = due + Duration::from_secs(1);
    assert_eq!(policy.update_and_check(&soon_after, 3), TickerEvents::RESUME_WAITS);
}

#[test]
fn test_poll_policy_inline_runs_jobs() {
    let cfg = SchedulerConfig {
        inline: true,
        ..SchedulerConfig::default()
    };
    let start = Instant::now();
    let mut policy = PollPolicy::new(&cfg, start);

    let events = policy.update_and_check(&start, 1);
    assert!(events.contains(TickerEvents::RUN_INLINE));
    assert!(!events.contains(TickerEvents::RECLAIM_MEMORY));
}
