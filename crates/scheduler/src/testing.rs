//! Shared helpers for progress-counter and timing-sensitive tests.

use std::fmt::Debug;
use std::time::{Duration, Instant};

const WAIT_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Install a test subscriber so `tracing` output lands in the test log.
pub(crate) fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Poll until `pred` holds, panicking after a bounded wait.
pub(crate) fn wait_until(description: &str, pred: impl Fn() -> bool) {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    while !pred() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", description);
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Poll until `actual()` returns `expected`, panicking after a bounded wait.
pub(crate) fn wait_for_value<T: PartialEq + Debug>(
    description: &str,
    expected: T,
    actual: impl Fn() -> T,
) {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    loop {
        let value = actual();
        if value == expected {
            return;
        }
        if Instant::now() > deadline {
            panic!(
                "timed out waiting for {}: expected {:?}, last saw {:?}",
                description, expected, value
            );
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Time unit for iteration `i` of a non-deterministic test. Grows with the
/// iteration so retries get more slack on loaded machines.
pub(crate) fn time_unit_for_iteration(iteration: u32) -> Duration {
    Duration::from_millis(25 * iteration as u64)
}

/// Re-run a timing-sensitive test body with a growing time unit, failing
/// only after sustained violation. The body returns `false` to request a
/// retry and uses assertions for conditions that must hold regardless of
/// scheduling jitter.
pub(crate) fn run_non_deterministic(name: &str, body: impl Fn(u32) -> bool) {
    const MAX_ATTEMPTS: u32 = 5;
    for iteration in 1..=MAX_ATTEMPTS {
        if body(iteration) {
            return;
        }
        eprintln!(
            "{}: iteration {} hit a timing violation, retrying with a larger time unit",
            name, iteration
        );
    }
    panic!("{}: still failing after {} iterations", name, MAX_ATTEMPTS);
}
