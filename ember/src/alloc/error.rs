/// Failures surfaced by [`ThreadAllocator`](super::ThreadAllocator).
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    #[error("chunk exhausted: no room for a {requested} byte block in a {capacity} byte chunk")]
    Exhausted { requested: usize, capacity: usize },

    #[error("allocation of {size} bytes exceeds the largest block size ({max} bytes)")]
    TooLarge { size: usize, max: usize },

    #[error("zero-sized allocations are not served by the chunk allocator")]
    ZeroSized,

    #[error("system allocator refused to reserve a {capacity} byte chunk")]
    OutOfMemory { capacity: usize },
}

impl AllocError {
    /// The request may succeed once cross-thread frees have been reclaimed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AllocError::Exhausted { .. })
    }

    pub fn is_fatal(&self) -> bool {
        !self.is_retryable()
    }
}
