use crate::runtime::Schedule;
use crate::task::{self, TaskHandle, TaskState};
use crate::test_utils::{DummyScheduler, mock_waker};
use crate::time::YieldNow;
use anyhow::Result;
use futures::channel::oneshot;
use rstest::rstest;
use static_assertions::assert_impl_all;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};

assert_impl_all!(TaskHandle<u32>: Send, Sync, Unpin);

struct DropCounter(Arc<AtomicUsize>);

impl Drop for DropCounter {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}

fn boom() -> u32 {
    panic!("boom")
}

#[test]
fn test_complete_then_get() -> Result<()> {
    let scheduler = DummyScheduler::new();
    let mut handle = scheduler.spawn(async { 1 + 1 });

    assert!(!handle.ready());
    assert_eq!(handle.state(), TaskState::PENDING);

    scheduler.run_pending();

    assert!(handle.ready());
    assert_eq!(handle.state(), TaskState::COMPLETED);
    assert!(scheduler.destroyed().is_empty());

    assert_eq!(handle.get()?, 2);
    assert_eq!(handle.state(), TaskState::COMPLETED | TaskState::HANDLE_DROPPED);
    assert!(handle.ready());

    assert_eq!(scheduler.destroyed(), vec![handle.id()]);
    assert_eq!(scheduler.allocator().stats().live, 0);
    Ok(())
}

#[rstest]
#[case::drop_then_complete(true)]
#[case::complete_then_drop(false)]
fn test_teardown_runs_once(#[case] drop_first: bool) {
    let scheduler = DummyScheduler::new();
    let dropped = Arc::new(AtomicUsize::new(0));

    let output = DropCounter(Arc::clone(&dropped));
    let handle = scheduler.spawn(async move { output });
    let id = handle.id();

    if drop_first {
        drop(handle);
        assert!(scheduler.destroyed().is_empty());
        scheduler.run_pending();
    } else {
        scheduler.run_pending();
        assert!(scheduler.destroyed().is_empty());
        drop(handle);
    }

    assert_eq!(scheduler.destroyed(), vec![id]);
    assert_eq!(dropped.load(Ordering::Relaxed), 1);
    assert_eq!(scheduler.allocator().stats().live, 0);
}

#[test]
fn test_try_get_while_pending() -> Result<()> {
    let scheduler = DummyScheduler::new();
    let (tx, rx) = oneshot::channel::<u32>();

    let mut handle = scheduler.spawn(async move { rx.await.unwrap_or_default() });
    scheduler.run_pending();

    assert!(handle.try_get().is_none());
    assert!(!handle.ready());

    assert!(tx.send(9).is_ok());
    assert_eq!(scheduler.num_queued(), 1);
    scheduler.run_pending();

    assert_eq!(handle.try_get().transpose()?, Some(9));
    Ok(())
}

#[test]
#[should_panic(expected = "is not complete")]
fn test_get_on_pending_task_panics() {
    let scheduler = DummyScheduler::new();
    let mut handle = scheduler.spawn(async { 3 });

    let _ = handle.get();
}

#[test]
#[should_panic(expected = "already retrieved")]
fn test_second_get_panics() {
    let scheduler = DummyScheduler::new();
    let mut handle = scheduler.spawn(async { 3 });
    scheduler.run_pending();

    assert_eq!(handle.get().ok(), Some(3));
    let _ = handle.get();
}

#[test]
fn test_continuation_woken_on_completion() -> Result<()> {
    let scheduler = DummyScheduler::new();
    let (tx, rx) = oneshot::channel::<u32>();

    let mut handle = scheduler.spawn(async move { rx.await.unwrap_or_default() });
    scheduler.run_pending();

    let (waker, data) = mock_waker();
    let mut cx = Context::from_waker(&waker);

    assert!(Pin::new(&mut handle).poll(&mut cx).is_pending());
    assert!(handle.state().contains(TaskState::WAITED_ON));

    // Same waker, nothing to replace.
    assert!(Pin::new(&mut handle).poll(&mut cx).is_pending());

    assert!(tx.send(5).is_ok());
    assert_eq!(data.get_count(), 0);

    scheduler.run_pending();
    assert_eq!(data.get_count(), 1);

    match Pin::new(&mut handle).poll(&mut cx) {
        Poll::Ready(res) => assert_eq!(res?, 5),
        Poll::Pending => panic!("completed task still pending"),
    }

    assert_eq!(scheduler.destroyed(), vec![handle.id()]);

    // The continuation was dropped with the control block.
    drop(waker);
    assert_eq!(Arc::strong_count(&data), 1);
    Ok(())
}

#[test]
fn test_dropped_handle_releases_continuation() {
    let scheduler = DummyScheduler::new();
    let (tx, rx) = oneshot::channel::<u32>();

    let mut handle = scheduler.spawn(async move { rx.await.unwrap_or_default() });
    scheduler.run_pending();

    let (waker, data) = mock_waker();
    let mut cx = Context::from_waker(&waker);
    assert!(Pin::new(&mut handle).poll(&mut cx).is_pending());
    assert_eq!(Arc::strong_count(&data), 3);

    drop(handle);
    assert_eq!(Arc::strong_count(&data), 2);

    assert!(tx.send(1).is_ok());
    scheduler.run_pending();

    assert_eq!(data.get_count(), 0);
    assert_eq!(scheduler.destroyed().len(), 1);
}

#[test]
fn test_await_handle_from_task() -> Result<()> {
    let scheduler = DummyScheduler::new();
    let (tx, rx) = oneshot::channel::<u32>();

    let inner = scheduler.spawn(async move { rx.await.unwrap_or_default() });
    let inner_id = inner.id();
    let mut outer = scheduler.spawn(async move { inner.await.map(|v| v + 1) });

    scheduler.run_pending();
    assert!(!outer.ready());

    assert!(tx.send(41).is_ok());
    scheduler.run_pending();

    assert_eq!(outer.get()??, 42);

    let destroyed = scheduler.destroyed();
    assert_eq!(destroyed.len(), 2);
    assert!(destroyed.contains(&inner_id));
    assert_eq!(scheduler.allocator().stats().live, 0);
    Ok(())
}

#[test]
fn test_panic_stored_as_fault() {
    let scheduler = DummyScheduler::new();
    let mut handle = scheduler.spawn(async { boom() });
    scheduler.run_pending();

    assert!(handle.ready());

    let fault = match handle.get() {
        Ok(v) => panic!("expected a fault, got {v}"),
        Err(fault) => fault,
    };

    assert_eq!(fault.id(), handle.id());
    assert_eq!(fault.message(), "boom");
    assert_eq!(scheduler.faults(), vec!["boom".to_owned()]);
    assert_eq!(scheduler.destroyed(), vec![handle.id()]);
}

#[test]
fn test_current_task_id() -> Result<()> {
    let scheduler = DummyScheduler::new();
    let mut handle = scheduler.spawn(async { task::id() });
    scheduler.run_pending();

    let id = handle.id();
    assert_eq!(handle.get()?, id);
    assert!(task::try_id().is_none());
    Ok(())
}

#[test]
fn test_wake_while_running_resubmits() -> Result<()> {
    let scheduler = DummyScheduler::new();
    let mut handle = scheduler.spawn(YieldNow::new());

    assert_eq!(scheduler.run_pending(), 2);
    handle.get()?;
    Ok(())
}

#[test]
fn test_unpolled_task_torn_down_by_queue_drop() {
    let scheduler = DummyScheduler::new();
    let dropped = Arc::new(AtomicUsize::new(0));

    let counter = DropCounter(Arc::clone(&dropped));
    let handle = scheduler.spawn(async move {
        let _counter = counter;
    });
    let id = handle.id();

    drop(handle);
    assert_eq!(dropped.load(Ordering::Relaxed), 0);

    scheduler.drop_queued();

    assert_eq!(dropped.load(Ordering::Relaxed), 1);
    assert_eq!(scheduler.destroyed(), vec![id]);
    assert_eq!(scheduler.allocator().stats().live, 0);
}
