//! Suspension points for tasks: timed waits swept by the scheduler's
//! `poll`, and a plain yield.

pub mod wait;
pub use wait::Wait;

pub mod yield_now;
pub use yield_now::YieldNow;
