#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))] // This is all test code, no need to test it.

//! Private helpers for tests of the pool target packages.

use std::env;
use std::panic;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, RecvTimeoutError};

/// How long a test may run before [`with_watchdog()`] gives up on it.
///
/// Shard workers and lock waits are much slower under Miri, so it gets more time.
fn watchdog_timeout() -> Duration {
    if cfg!(miri) {
        Duration::from_secs(90)
    } else {
        Duration::from_secs(15)
    }
}

/// Runs `test_fn` on a separate thread and fails the test if it does not finish in time.
///
/// Tests of the pool target wait on shard workers and condition variables, so a bug tends to
/// show up as a hang rather than a failure. The watchdog turns such hangs into a panic.
///
/// When the `MUTATION_TESTING` environment variable is `1`, `test_fn` runs directly on the
/// calling thread, so that the mutation testing tool can detect hanging mutants by itself.
///
/// # Panics
///
/// Panics if `test_fn` does not finish in time, and re-throws any panic raised by `test_fn`.
///
/// # Example
///
/// ```rust
/// use testing::with_watchdog;
///
/// let answer = with_watchdog(|| 6 * 7);
/// assert_eq!(answer, 42);
/// ```
pub fn with_watchdog<F, R>(test_fn: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    if env::var("MUTATION_TESTING").as_deref() == Ok("1") {
        return test_fn();
    }

    let (result_tx, result_rx) = channel::bounded(1);

    let test_thread = thread::Builder::new()
        .name("watched-test".to_string())
        .spawn(move || {
            // The receiver is gone only if the watchdog already gave up.
            drop(result_tx.send(test_fn()));
        })
        .expect("failed to spawn test thread");

    let timeout = watchdog_timeout();

    match result_rx.recv_timeout(timeout) {
        Ok(result) => {
            test_thread
                .join()
                .expect("test thread panicked after delivering its result");
            result
        }
        Err(RecvTimeoutError::Timeout) => {
            panic!("test did not finish within {timeout:?}, it is most likely deadlocked");
        }
        Err(RecvTimeoutError::Disconnected) => match test_thread.join() {
            Ok(()) => panic!("test thread exited without delivering a result"),
            Err(payload) => panic::resume_unwind(payload),
        },
    }
}

/// Polls `condition` until it returns `true` or `timeout` elapses. Returns the last result.
///
/// For state that settles on another thread, such as work queued to shard workers.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now()
        .checked_add(timeout)
        .expect("timeout is small enough to be added to the current time");

    loop {
        if condition() {
            return true;
        }

        if Instant::now() >= deadline {
            return condition();
        }

        thread::sleep(Duration::from_millis(1));
    }
}
