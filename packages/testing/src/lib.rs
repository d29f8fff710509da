#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))] // This is all test code, no need to test it.

//! Private helpers for testing spin_pool.

use std::env;
use std::panic;
use std::sync::{Arc, Barrier, mpsc};
use std::thread;
use std::time::Duration;

/// Runs a test on a separate thread and fails it if it does not finish in time.
///
/// Spin locks that never get released turn into silent hangs rather than failures. This wrapper
/// turns them back into failures: if the test body takes longer than 10 seconds (60 seconds
/// under Miri) the calling thread panics.
///
/// Setting the `MUTATION_TESTING` environment variable to `1` runs the body directly on the
/// calling thread, so that mutation testing can observe a hang as such.
///
/// # Panics
///
/// Panics if the test body times out. Panics from the body are propagated unchanged.
///
/// # Example
///
/// ```rust
/// use testing::with_watchdog;
///
/// let sum = with_watchdog(|| 2 + 2);
/// assert_eq!(sum, 4);
/// ```
pub fn with_watchdog<F, R>(test_fn: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    if env::var("MUTATION_TESTING").as_deref() == Ok("1") {
        return test_fn();
    }

    let timeout = if cfg!(miri) {
        Duration::from_secs(60)
    } else {
        Duration::from_secs(10)
    };

    let (tx, rx) = mpsc::channel();

    let test_thread = thread::spawn(move || {
        // If sending fails, the watchdog already gave up on us.
        drop(tx.send(test_fn()));
    });

    match rx.recv_timeout(timeout) {
        Ok(result) => {
            test_thread
                .join()
                .expect("test thread finished after sending its result");
            result
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            panic!("test did not finish within {timeout:?}, a lock is probably never released");
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => match test_thread.join() {
            Ok(()) => panic!("test thread exited without producing a result"),
            Err(payload) => panic::resume_unwind(payload),
        },
    }
}

/// Runs `work` on `threads` threads at once and collects the results in thread order.
///
/// All threads are released together through a barrier to maximize contention. Each invocation
/// receives the index of its thread.
///
/// # Panics
///
/// Propagates the first panic raised by any of the threads, after all of them have finished.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// use testing::hammer;
///
/// let counter = Arc::new(AtomicUsize::new(0));
///
/// let seen = hammer(4, {
///     let counter = Arc::clone(&counter);
///     move |thread_index| {
///         counter.fetch_add(1, Ordering::Relaxed);
///         thread_index
///     }
/// });
///
/// assert_eq!(seen, [0, 1, 2, 3]);
/// assert_eq!(counter.load(Ordering::Relaxed), 4);
/// ```
pub fn hammer<F, R>(threads: usize, work: F) -> Vec<R>
where
    F: Fn(usize) -> R + Send + Sync + 'static,
    R: Send + 'static,
{
    let work = Arc::new(work);
    let start = Arc::new(Barrier::new(threads));

    let handles = (0..threads)
        .map(|thread_index| {
            let work = Arc::clone(&work);
            let start = Arc::clone(&start);

            thread::spawn(move || {
                start.wait();
                work(thread_index)
            })
        })
        .collect::<Vec<_>>();

    let mut results = Vec::with_capacity(threads);
    let mut first_panic = None;

    for handle in handles {
        match handle.join() {
            Ok(result) => results.push(result),
            Err(payload) => {
                first_panic.get_or_insert(payload);
            }
        }
    }

    if let Some(payload) = first_panic {
        panic::resume_unwind(payload);
    }

    results
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn watchdog_returns_result() {
        assert_eq!(with_watchdog(|| "done"), "done");
    }

    #[test]
    #[should_panic(expected = "inner failure")]
    fn watchdog_propagates_panics() {
        let () = with_watchdog(|| panic!("inner failure"));
    }

    #[test]
    fn hammer_runs_every_thread() {
        let counter = Arc::new(AtomicUsize::new(0));

        let results = hammer(3, {
            let counter = Arc::clone(&counter);
            move |thread_index| {
                counter.fetch_add(1, Ordering::Relaxed);
                thread_index.wrapping_mul(10)
            }
        });

        assert_eq!(results, [0, 10, 20]);
        assert_eq!(counter.load(Ordering::Relaxed), 3);
    }

    #[test]
    #[should_panic(expected = "thread 1 failed")]
    fn hammer_propagates_panics() {
        hammer(2, |thread_index| {
            assert!(thread_index != 1, "thread {thread_index} failed");
        });
    }
}
