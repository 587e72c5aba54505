use std::thread;
use std::time::{Duration, Instant};

pub(crate) mod mocks;
pub(crate) use mocks::{DummyScheduler, mock_waker};

/// Spins until `cond` holds or `timeout` elapsed. Returns the last value of
/// `cond`.
pub(crate) fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();

    while !cond() {
        if start.elapsed() > timeout {
            return cond();
        }
        thread::sleep(Duration::from_millis(1));
    }

    true
}
