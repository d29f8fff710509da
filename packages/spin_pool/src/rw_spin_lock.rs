use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use std::{fmt, hint, thread};

use crate::{Error, Result};

/// Set in the lock state while a writer holds the lock. All other bits count readers.
const WRITER: usize = 1 << (usize::BITS - 1);

/// Reading the clock is much more expensive than a spin iteration, so we only check whether the
/// timeout has elapsed once per this many failed attempts. Must be a power of two.
const CLOCK_CHECK_INTERVAL: u32 = 64;

/// A reader-writer lock that busy-waits instead of parking the thread.
///
/// This is the raw form of the lock, which protects no data of its own. It is meant for
/// structures that need to enter and exit the lock at points that do not map onto a lexical
/// scope. Most code should use [`RwSpinLock`], which wraps data and hands out RAII guards.
///
/// Every blocking entry point takes a timeout and reports failure instead of waiting forever.
/// A timeout of [`Duration::ZERO`] makes a single attempt.
///
/// Writers announce themselves before they start spinning and new readers stand back while any
/// writer is waiting, so a steady stream of readers cannot starve a writer.
///
/// Spinning burns a processor for as long as it lasts. The lock is only appropriate when critical
/// sections last microseconds.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use spin_pool::RawRwSpinLock;
///
/// let lock = RawRwSpinLock::new("example");
///
/// assert!(lock.enter_read(Duration::from_millis(1)));
/// assert!(lock.is_locked());
///
/// // A writer cannot get in while a reader is inside.
/// assert!(!lock.try_enter_exclusive());
///
/// // SAFETY: We entered the read lock above.
/// unsafe { lock.exit_read() };
///
/// assert!(lock.enter_exclusive(Duration::from_millis(1)));
///
/// // SAFETY: We entered the exclusive lock above.
/// unsafe { lock.exit_exclusive() };
/// ```
pub struct RawRwSpinLock {
    name: &'static str,

    /// `WRITER` if exclusively held, otherwise the number of readers inside.
    state: AtomicUsize,

    /// Writers that are currently spinning in `enter_exclusive()`.
    waiting_writers: AtomicUsize,
}

impl RawRwSpinLock {
    /// Creates an unlocked lock. The name is used in diagnostics and errors.
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            state: AtomicUsize::new(0),
            waiting_writers: AtomicUsize::new(0),
        }
    }

    /// The name given to the lock at construction time.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Attempts to enter the lock in shared mode without waiting.
    ///
    /// Fails if a writer holds the lock or is waiting for it.
    #[must_use]
    pub fn try_enter_read(&self) -> bool {
        loop {
            if self.waiting_writers.load(Ordering::Acquire) != 0 {
                return false;
            }

            let state = self.state.load(Ordering::Relaxed);

            if state & WRITER != 0 {
                return false;
            }

            // Cannot overflow into the WRITER bit - that would need 2^63 simultaneous readers.
            let next = state.wrapping_add(1);

            if self
                .state
                .compare_exchange(state, next, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }

            // Another reader got in between our load and our exchange. Try again, the lock is
            // still available to us as long as no writer has appeared.
        }
    }

    /// Enters the lock in shared mode, spinning for at most `timeout`.
    ///
    /// Returns `false` if the lock could not be acquired in time. The caller must treat this as a
    /// recoverable condition.
    #[must_use]
    pub fn enter_read(&self, timeout: Duration) -> bool {
        spin_until(timeout, || self.try_enter_read())
    }

    /// Leaves the lock after a successful shared entry.
    ///
    /// # Safety
    ///
    /// The caller must have entered the lock in shared mode and must not have left it yet.
    pub unsafe fn exit_read(&self) {
        let previous = self.state.fetch_sub(1, Ordering::Release);

        debug_assert!(
            previous != 0 && previous & WRITER == 0,
            "exit_read() on the {} lock without a matching enter_read()",
            self.name
        );
    }

    /// Attempts to enter the lock in exclusive mode without waiting.
    #[must_use]
    pub fn try_enter_exclusive(&self) -> bool {
        self.state
            .compare_exchange(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Enters the lock in exclusive mode, spinning for at most `timeout`.
    ///
    /// While this call is spinning, new readers are turned away so that the readers already
    /// inside can drain.
    ///
    /// Returns `false` if the lock could not be acquired in time. The caller must treat this as a
    /// recoverable condition.
    #[must_use]
    pub fn enter_exclusive(&self, timeout: Duration) -> bool {
        if self.try_enter_exclusive() {
            return true;
        }

        self.waiting_writers.fetch_add(1, Ordering::AcqRel);
        let acquired = spin_until(timeout, || self.try_enter_exclusive());
        self.waiting_writers.fetch_sub(1, Ordering::AcqRel);

        acquired
    }

    /// Enters the lock in exclusive mode, spinning for as long as it takes.
    ///
    /// Only for short bookkeeping that must not be abandoned halfway, such as handing back an
    /// index that would otherwise be lost. Every other caller takes a timeout.
    pub(crate) fn enter_exclusive_unbounded(&self) {
        if self.try_enter_exclusive() {
            return;
        }

        self.waiting_writers.fetch_add(1, Ordering::AcqRel);

        while !self.try_enter_exclusive() {
            hint::spin_loop();
        }

        self.waiting_writers.fetch_sub(1, Ordering::AcqRel);
    }

    /// Leaves the lock after a successful exclusive entry.
    ///
    /// # Safety
    ///
    /// The caller must have entered the lock in exclusive mode and must not have left it yet.
    pub unsafe fn exit_exclusive(&self) {
        let previous = self.state.swap(0, Ordering::Release);

        debug_assert_eq!(
            previous, WRITER,
            "exit_exclusive() on the {} lock without a matching enter_exclusive()",
            self.name
        );
    }

    /// Whether the lock is currently held in any mode by anyone.
    ///
    /// The answer may be outdated by the time the caller looks at it. This is meant for
    /// assertions and diagnostics.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) != 0
    }

    /// Whether the lock is currently held in exclusive mode by anyone.
    #[must_use]
    pub fn is_locked_exclusive(&self) -> bool {
        self.state.load(Ordering::Relaxed) == WRITER
    }

    /// The number of readers currently inside the lock.
    #[must_use]
    pub fn reader_count(&self) -> usize {
        let state = self.state.load(Ordering::Relaxed);

        if state & WRITER == 0 { state } else { 0 }
    }

    /// The number of writers currently spinning while waiting for the lock.
    #[must_use]
    pub fn waiting_writer_count(&self) -> usize {
        self.waiting_writers.load(Ordering::Relaxed)
    }

    pub(crate) fn timeout_error(&self, timeout: Duration) -> Error {
        tracing::trace!(lock = self.name, ?timeout, "spin lock acquisition timed out");

        Error::LockTimeout {
            lock: self.name,
            timeout,
        }
    }
}

impl fmt::Debug for RawRwSpinLock {
    #[cfg_attr(test, mutants::skip)] // Diagnostic output only, no stable format to assert on.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawRwSpinLock")
            .field("name", &self.name)
            .field("is_locked_exclusive", &self.is_locked_exclusive())
            .field("reader_count", &self.reader_count())
            .field("waiting_writers", &self.waiting_writer_count())
            .finish()
    }
}

impl Drop for RawRwSpinLock {
    fn drop(&mut self) {
        let state = *self.state.get_mut();

        if state == 0 {
            return;
        }

        tracing::error!(
            lock = self.name,
            exclusive = state == WRITER,
            readers = state & !WRITER,
            "spin lock dropped while held"
        );

        if !thread::panicking() {
            debug_assert!(false, "the {} lock was dropped while held", self.name);
        }
    }
}

/// Calls `attempt` until it succeeds or `timeout` has elapsed.
fn spin_until(timeout: Duration, mut attempt: impl FnMut() -> bool) -> bool {
    if attempt() {
        return true;
    }

    if timeout.is_zero() {
        return false;
    }

    let started = Instant::now();
    let mut failed_attempts: u32 = 0;

    loop {
        hint::spin_loop();

        if attempt() {
            return true;
        }

        failed_attempts = failed_attempts.wrapping_add(1);

        if failed_attempts & (CLOCK_CHECK_INTERVAL - 1) == 0 && started.elapsed() >= timeout {
            // One last try, so that a lock released right at the deadline is not missed.
            return attempt();
        }
    }
}

/// A reader-writer spin lock protecting a value of type `T`.
///
/// Acquisition always takes a timeout and yields a guard that releases the lock when dropped,
/// on every exit path including unwinding.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use spin_pool::RwSpinLock;
///
/// let lock = RwSpinLock::new(vec![1, 2, 3]);
/// let timeout = Duration::from_millis(1);
///
/// {
///     let mut items = lock.write(timeout).unwrap();
///     items.push(4);
/// }
///
/// let items = lock.read(timeout).unwrap();
/// assert_eq!(*items, [1, 2, 3, 4]);
/// ```
pub struct RwSpinLock<T> {
    raw: RawRwSpinLock,
    data: UnsafeCell<T>,
}

impl<T> RwSpinLock<T> {
    /// Creates an unlocked lock guarding `value`.
    #[must_use]
    pub const fn new(value: T) -> Self {
        Self::named("spin", value)
    }

    /// Creates an unlocked lock guarding `value`, with a name used in diagnostics and errors.
    #[must_use]
    pub const fn named(name: &'static str, value: T) -> Self {
        Self {
            raw: RawRwSpinLock::new(name),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires shared access, spinning for at most `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockTimeout`] if the lock could not be acquired in time.
    pub fn read(&self, timeout: Duration) -> Result<ReadGuard<'_, T>> {
        if self.raw.enter_read(timeout) {
            Ok(ReadGuard { lock: self })
        } else {
            Err(self.raw.timeout_error(timeout))
        }
    }

    /// Acquires exclusive access, spinning for at most `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockTimeout`] if the lock could not be acquired in time.
    pub fn write(&self, timeout: Duration) -> Result<WriteGuard<'_, T>> {
        if self.raw.enter_exclusive(timeout) {
            Ok(WriteGuard { lock: self })
        } else {
            Err(self.raw.timeout_error(timeout))
        }
    }

    /// Acquires exclusive access, spinning for as long as it takes.
    pub(crate) fn write_unbounded(&self) -> WriteGuard<'_, T> {
        self.raw.enter_exclusive_unbounded();
        WriteGuard { lock: self }
    }

    /// Acquires shared access if that is possible without waiting.
    #[must_use]
    pub fn try_read(&self) -> Option<ReadGuard<'_, T>> {
        self.raw
            .try_enter_read()
            .then(|| ReadGuard { lock: self })
    }

    /// Acquires exclusive access if that is possible without waiting.
    #[must_use]
    pub fn try_write(&self) -> Option<WriteGuard<'_, T>> {
        self.raw
            .try_enter_exclusive()
            .then(|| WriteGuard { lock: self })
    }

    /// The raw lock, for callers that enter and exit it manually.
    ///
    /// Combine with [`get_unsynchronized()`][Self::get_unsynchronized] and
    /// [`get_mut_unsynchronized()`][Self::get_mut_unsynchronized] to access the data.
    #[must_use]
    pub fn raw(&self) -> &RawRwSpinLock {
        &self.raw
    }

    /// Returns a shared reference to the data without acquiring the lock.
    ///
    /// # Safety
    ///
    /// The caller must hold the lock (in any mode) for as long as the returned reference exists
    /// and must not hold a conflicting exclusive reference obtained from
    /// [`get_mut_unsynchronized()`][Self::get_mut_unsynchronized].
    #[must_use]
    pub unsafe fn get_unsynchronized(&self) -> &T {
        debug_assert!(
            self.raw.is_locked(),
            "unsynchronized read of data guarded by the {} lock while the lock is not held",
            self.raw.name
        );

        // SAFETY: The caller guarantees that the lock is held, so no exclusive reference to the
        // data can exist elsewhere.
        unsafe { &*self.data.get() }
    }

    /// Returns an exclusive reference to the data without acquiring the lock.
    ///
    /// # Safety
    ///
    /// The caller must hold the lock in exclusive mode for as long as the returned reference
    /// exists and must not create any other reference to the data during that time.
    #[must_use]
    #[allow(clippy::mut_from_ref, reason = "the lock is what makes this exclusive")]
    pub unsafe fn get_mut_unsynchronized(&self) -> &mut T {
        debug_assert!(
            self.raw.is_locked_exclusive(),
            "unsynchronized write of data guarded by the {} lock while the lock is not exclusively held",
            self.raw.name
        );

        // SAFETY: The caller guarantees exclusive ownership of the lock and that no other
        // reference to the data is created while this one exists.
        unsafe { &mut *self.data.get() }
    }

    /// Returns an exclusive reference to the data. No locking is needed because the borrow
    /// checker already guarantees exclusive access.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Consumes the lock and returns the data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: Default> Default for RwSpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> fmt::Debug for RwSpinLock<T> {
    #[cfg_attr(coverage_nightly, coverage(off))] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RwSpinLock")
            .field("raw", &self.raw)
            .finish_non_exhaustive()
    }
}

// SAFETY: The lock owns the data, so moving the lock moves the data. That is fine for any
// `T: Send`.
unsafe impl<T: Send> Send for RwSpinLock<T> {}

// SAFETY: Shared access to the lock hands out `&T` to several threads at once (requires `Sync`)
// and `&mut T` to one thread at a time (requires `Send`).
unsafe impl<T: Send + Sync> Sync for RwSpinLock<T> {}

/// Shared access to the data of a [`RwSpinLock`]. The lock is released when this is dropped.
pub struct ReadGuard<'a, T> {
    lock: &'a RwSpinLock<T>,
}

impl<T> Deref for ReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // SAFETY: We hold the read lock for our entire lifetime.
        unsafe { self.lock.get_unsynchronized() }
    }
}

impl<T> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        // SAFETY: The guard only exists after a successful shared entry.
        unsafe { self.lock.raw.exit_read() };
    }
}

impl<T: fmt::Debug> fmt::Debug for ReadGuard<'_, T> {
    #[cfg_attr(coverage_nightly, coverage(off))] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ReadGuard").field(&**self).finish()
    }
}

/// Exclusive access to the data of a [`RwSpinLock`]. The lock is released when this is dropped.
pub struct WriteGuard<'a, T> {
    lock: &'a RwSpinLock<T>,
}

impl<T> Deref for WriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // SAFETY: We hold the exclusive lock for our entire lifetime.
        unsafe { self.lock.get_unsynchronized() }
    }
}

impl<T> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: We hold the exclusive lock for our entire lifetime and the `&mut self`
        // receiver prevents any other reference from being handed out by this guard.
        unsafe { self.lock.get_mut_unsynchronized() }
    }
}

impl<T> Drop for WriteGuard<'_, T> {
    fn drop(&mut self) {
        // SAFETY: The guard only exists after a successful exclusive entry.
        unsafe { self.lock.raw.exit_exclusive() };
    }
}

impl<T: fmt::Debug> fmt::Debug for WriteGuard<'_, T> {
    #[cfg_attr(coverage_nightly, coverage(off))] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WriteGuard").field(&**self).finish()
    }
}

#[cfg(test)]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::arithmetic_side_effects,
    reason = "test code, be concise"
)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    use static_assertions::{assert_impl_all, assert_not_impl_any};
    use testing::with_watchdog;

    use super::*;

    const SHORT: Duration = Duration::from_millis(5);
    const LONG: Duration = Duration::from_secs(5);

    assert_impl_all!(RawRwSpinLock: Send, Sync);
    assert_impl_all!(RwSpinLock<u32>: Send, Sync);
    assert_impl_all!(RwSpinLock<std::cell::Cell<u32>>: Send);
    assert_not_impl_any!(RwSpinLock<std::cell::Cell<u32>>: Sync);

    #[test]
    fn readers_share_the_lock() {
        let lock = RawRwSpinLock::new("test");

        assert!(lock.enter_read(SHORT));
        assert!(lock.enter_read(SHORT));
        assert_eq!(lock.reader_count(), 2);
        assert!(!lock.is_locked_exclusive());

        unsafe {
            lock.exit_read();
            lock.exit_read();
        }

        assert!(!lock.is_locked());
    }

    #[test]
    fn writer_excludes_everyone() {
        let lock = RawRwSpinLock::new("test");

        assert!(lock.enter_exclusive(SHORT));
        assert!(lock.is_locked_exclusive());
        assert!(!lock.try_enter_read());
        assert!(!lock.try_enter_exclusive());
        assert!(!lock.enter_read(SHORT));
        assert!(!lock.enter_exclusive(SHORT));
        assert_eq!(lock.reader_count(), 0);

        unsafe { lock.exit_exclusive() };

        assert!(lock.try_enter_read());
        unsafe { lock.exit_read() };
    }

    #[test]
    fn zero_timeout_makes_single_attempt() {
        let lock = RwSpinLock::new(5_u32);

        let _reader = lock.read(Duration::ZERO).unwrap();

        let error = lock.write(Duration::ZERO).unwrap_err();
        assert_eq!(
            error,
            Error::LockTimeout {
                lock: "spin",
                timeout: Duration::ZERO
            }
        );

        // The failed writer must not keep announcing itself.
        assert_eq!(lock.raw().waiting_writer_count(), 0);
    }

    #[test]
    fn timeout_error_carries_lock_name() {
        let lock = RwSpinLock::named("widgets", ());

        let _writer = lock.write(SHORT).unwrap();

        match lock.read(SHORT) {
            Err(Error::LockTimeout { lock, timeout }) => {
                assert_eq!(lock, "widgets");
                assert_eq!(timeout, SHORT);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn guards_release_on_drop() {
        let lock = RwSpinLock::new(Vec::<u32>::new());

        {
            let mut writer = lock.write(SHORT).unwrap();
            writer.push(1);
            assert!(lock.raw().is_locked_exclusive());
        }

        assert!(!lock.raw().is_locked());

        {
            let reader = lock.try_read().unwrap();
            assert_eq!(*reader, [1]);
            assert!(lock.try_write().is_none());

            // A failed attempt must leave the lock state alone.
            assert_eq!(lock.raw().reader_count(), 1);
        }

        assert!(lock.try_write().is_some());
    }

    #[test]
    fn guard_releases_on_panic() {
        let lock = Arc::new(RwSpinLock::new(0_u32));

        let result = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                let _writer = lock.write(SHORT).unwrap();
                panic!("simulated failure inside critical section");
            })
            .join()
        };

        assert!(result.is_err());
        assert!(!lock.raw().is_locked());
    }

    #[test]
    fn waiting_writer_blocks_new_readers() {
        with_watchdog(|| {
            let lock = Arc::new(RawRwSpinLock::new("test"));
            assert!(lock.enter_read(SHORT));

            let writer_done = Arc::new(AtomicBool::new(false));

            let writer = {
                let lock = Arc::clone(&lock);
                let writer_done = Arc::clone(&writer_done);

                thread::spawn(move || {
                    assert!(lock.enter_exclusive(LONG));
                    writer_done.store(true, Ordering::SeqCst);
                    unsafe { lock.exit_exclusive() };
                })
            };

            while lock.waiting_writer_count() == 0 {
                hint::spin_loop();
            }

            // The existing reader is still inside but newcomers must wait for the writer.
            assert!(!lock.try_enter_read());
            assert!(!writer_done.load(Ordering::SeqCst));

            unsafe { lock.exit_read() };

            writer.join().unwrap();
            assert!(writer_done.load(Ordering::SeqCst));
            assert!(lock.try_enter_read());
            unsafe { lock.exit_read() };
        });
    }

    #[test]
    fn unbounded_writer_outlasts_any_timeout() {
        with_watchdog(|| {
            let lock = Arc::new(RwSpinLock::new(0_u32));
            let reader = lock.read(SHORT).unwrap();

            let writer = {
                let lock = Arc::clone(&lock);

                thread::spawn(move || {
                    *lock.write_unbounded() += 1;
                })
            };

            while lock.raw().waiting_writer_count() == 0 {
                hint::spin_loop();
            }

            // Hold the reader far longer than a timed writer would have waited.
            thread::sleep(SHORT * 4);
            assert!(!writer.is_finished());

            drop(reader);
            writer.join().unwrap();

            assert_eq!(*lock.read(SHORT).unwrap(), 1);
            assert_eq!(lock.raw().waiting_writer_count(), 0);
        });
    }

    #[test]
    fn concurrent_writers_do_not_lose_updates() {
        with_watchdog(|| {
            const THREADS: usize = 4;
            const ITERATIONS: usize = 1000;

            let lock = Arc::new(RwSpinLock::new(0_usize));

            let handles = (0..THREADS)
                .map(|_| {
                    let lock = Arc::clone(&lock);

                    thread::spawn(move || {
                        for _ in 0..ITERATIONS {
                            *lock.write(LONG).unwrap() += 1;
                            assert!(*lock.read(LONG).unwrap() > 0);
                        }
                    })
                })
                .collect::<Vec<_>>();

            for handle in handles {
                handle.join().unwrap();
            }

            assert_eq!(*lock.read(SHORT).unwrap(), THREADS * ITERATIONS);
        });
    }

    #[test]
    fn unsynchronized_access_with_raw_lock() {
        let lock = RwSpinLock::new(10_u32);

        assert!(lock.raw().enter_exclusive(SHORT));
        unsafe {
            *lock.get_mut_unsynchronized() += 1;
            assert_eq!(*lock.get_unsynchronized(), 11);
            lock.raw().exit_exclusive();
        }

        assert_eq!(lock.into_inner(), 11);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "dropped while held")]
    fn dropping_held_lock_is_detected() {
        let lock = RwSpinLock::named("leaky", 0_u32);

        std::mem::forget(lock.read(SHORT).unwrap());

        drop(lock);
    }
}
