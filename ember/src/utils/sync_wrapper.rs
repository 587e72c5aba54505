//! A wrapper that is `Sync` because it never hands out shared references to
//! its content.

/// Holds a `Send` value and only exposes it by value or through `&mut self`,
/// which makes it safe to share across threads even when `T: !Sync`.
pub(crate) struct SyncWrapper<T> {
    value: T,
}

// Safety: no `&T` can be obtained from a `&SyncWrapper<T>`.
unsafe impl<T: Send> Sync for SyncWrapper<T> {}

impl<T> SyncWrapper<T> {
    pub(crate) fn new(value: T) -> Self {
        Self { value }
    }

    pub(crate) fn into_inner(self) -> T {
        self.value
    }
}
