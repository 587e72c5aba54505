//! Frame-driven task scheduling.
//!
//! Work is launched on an [`AsyncScheduler`] as futures that run on a
//! work-stealing pool. The owner of the scheduler calls
//! [`AsyncScheduler::poll`] once per tick to resume elapsed waits and to
//! reclaim memory freed across threads. Each task lives in one block
//! allocated from the launching thread's chunk of a [`ThreadAllocator`] and
//! is observed through a [`TaskHandle`].
//!
//! [`ThreadAllocator`]: alloc::ThreadAllocator

pub mod alloc;

pub mod runtime;
pub use runtime::{AsyncContext, AsyncScheduler, Builder};

pub mod task;
pub use task::TaskHandle;

pub mod time;

mod utils;

#[cfg(test)]
mod test_utils;
