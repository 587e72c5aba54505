use std::cell::Cell;
use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque identifier of a launched task, unique for the lifetime of the
/// process.
///
/// Ids are handed out in launch order, but nothing should rely on that.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct Id(NonZeroU64);

thread_local! {
    static CURRENT_TASK_ID: Cell<Option<Id>> = const { Cell::new(None) };
}

/// Returns the [`Id`] of the task being polled on this thread.
///
/// # Panics
///
/// When called outside of a task.
#[track_caller]
pub fn id() -> Id {
    try_id().expect("can't get a task id when not inside a task")
}

/// Returns the [`Id`] of the task being polled on this thread, or `None`
/// outside of a task.
pub fn try_id() -> Option<Id> {
    CURRENT_TASK_ID.with(Cell::get)
}

impl Id {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);

        let id = COUNTER.fetch_add(1, Ordering::Relaxed);

        let Some(id) = NonZeroU64::new(id) else {
            Self::exhausted();
        };

        Self(id)
    }

    #[cold]
    fn exhausted() -> ! {
        panic!("failed to generate unique task ID: bitspace exhausted")
    }

    pub fn as_u64(&self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Sets the current task id while a task's future or output is touched, and
/// restores the previous one on drop.
pub(super) struct TaskIdGuard {
    parent: Option<Id>,
}

impl TaskIdGuard {
    pub(super) fn enter(id: Id) -> Self {
        TaskIdGuard {
            parent: CURRENT_TASK_ID.with(|current| current.replace(Some(id))),
        }
    }
}

impl Drop for TaskIdGuard {
    fn drop(&mut self) {
        CURRENT_TASK_ID.with(|current| current.set(self.parent));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_are_unique() {
        let ids = (0..64).map(|_| Id::next()).collect::<HashSet<_>>();
        assert_eq!(ids.len(), 64);
    }

    #[test]
    fn test_guard_nests_and_restores() {
        assert!(try_id().is_none());

        let outer = Id::next();
        let inner = Id::next();

        {
            let _outer = TaskIdGuard::enter(outer);
            assert_eq!(id(), outer);

            {
                let _inner = TaskIdGuard::enter(inner);
                assert_eq!(id(), inner);
            }

            assert_eq!(id(), outer);
        }

        assert!(try_id().is_none());
    }
}
