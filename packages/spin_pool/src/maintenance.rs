use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::{ConcurrentBufferPool, Result};

/// What a single maintenance pass did.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub struct MaintenanceReport {
    /// Slots the pass looked at, whether claimed or free.
    pub inspected: usize,

    /// Free buffers that were shrunk back to the baseline capacity.
    pub shrunk: usize,
}

impl ConcurrentBufferPool {
    /// Shrinks idle buffers that have grown well beyond the baseline capacity.
    ///
    /// Each pass inspects a batch of slots, continuing where the previous pass stopped and
    /// wrapping around at the end of the slot table. A slot is only touched if it is free: the
    /// pass holds it in the free list for the duration of the shrink, so a concurrent claimant
    /// simply receives a different slot. Holding a slot does not change the order in which free
    /// slots are handed out. Buffers larger than the baseline capacity times the shrink factor
    /// are moved into an allocation of exactly the baseline capacity.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockTimeout`][crate::Error::LockTimeout] if the pool is too contended.
    /// Slots that were already processed stay processed; the next pass starts after them. No
    /// slot is ever left held.
    pub fn run_maintenance(&self) -> Result<MaintenanceReport> {
        let mut report = MaintenanceReport::default();

        // Only slots that were ever issued can have grown.
        let frontier = self.free_slots().frontier()?;
        let candidates = frontier.min(self.slot_count()?);

        if candidates == 0 {
            return Ok(report);
        }

        let batch_size = self.config().maintenance_batch_size.min(candidates);
        let start = self
            .maintenance_cursor()
            .fetch_add(batch_size, Ordering::Relaxed)
            .checked_rem(candidates)
            .unwrap_or_default();

        for offset in 0..batch_size {
            let index = start
                .wrapping_add(offset)
                .checked_rem(candidates)
                .unwrap_or_default();

            // Cannot overflow, bounded by the batch size.
            report.inspected = report.inspected.wrapping_add(1);

            if !self.free_slots().try_hold(index)? {
                // Claimed by someone, leave it to them.
                continue;
            }

            let shrunk = self.shrink_idle_slot(index);

            // Always release the hold, even if shrinking failed. This cannot fail.
            self.free_slots().unhold(index);

            if shrunk? {
                report.shrunk = report.shrunk.wrapping_add(1);
            }
        }

        Ok(report)
    }

    /// Shrinks the buffer of a free slot that the caller holds.
    fn shrink_idle_slot(&self, index: usize) -> Result<bool> {
        let Some(mut buffer) = self.existing_slot_buffer(index)? else {
            return Ok(false);
        };

        // SAFETY: The slot is free and held, so the free list will not issue it and nobody else
        // can touch the buffer.
        let buffer = unsafe { buffer.as_mut() };

        let baseline = self.config().buffer_capacity;
        let threshold = baseline.saturating_mul(self.config().shrink_factor);
        let previous = buffer.capacity();

        if previous <= threshold {
            return Ok(false);
        }

        // Free buffers are always empty, so the baseline is always large enough.
        let shrunk = buffer.shrink_to(baseline)?;

        if shrunk {
            tracing::debug!(slot = index, previous, baseline, "shrank idle pool buffer");
        }

        Ok(shrunk)
    }
}

/// Runs [`ConcurrentBufferPool::run_maintenance()`] periodically on a background thread.
///
/// The thread is stopped and joined when the worker is dropped.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// use spin_pool::{ConcurrentBufferPool, MaintenanceWorker};
///
/// let pool = Arc::new(ConcurrentBufferPool::new());
/// let worker = MaintenanceWorker::spawn(Arc::clone(&pool), Duration::from_millis(100));
///
/// // ... use the pool ...
///
/// drop(worker);
/// ```
#[derive(Debug)]
pub struct MaintenanceWorker {
    shared: Arc<WorkerShared>,
    thread: Option<JoinHandle<()>>,
}

#[derive(Debug)]
struct WorkerShared {
    stop: AtomicBool,
    passes: AtomicUsize,
}

impl MaintenanceWorker {
    /// Starts a thread that runs a maintenance pass on `pool` every `interval`.
    ///
    /// # Panics
    ///
    /// Panics if the operating system refuses to create the thread.
    #[must_use]
    pub fn spawn(pool: Arc<ConcurrentBufferPool>, interval: Duration) -> Self {
        let shared = Arc::new(WorkerShared {
            stop: AtomicBool::new(false),
            passes: AtomicUsize::new(0),
        });

        let thread = thread::Builder::new()
            .name("spin_pool maintenance".to_string())
            .spawn({
                let shared = Arc::clone(&shared);
                move || run_worker(&pool, &shared, interval)
            })
            .expect("failed to spawn the pool maintenance thread");

        Self {
            shared,
            thread: Some(thread),
        }
    }

    /// The number of maintenance passes completed so far, successful or not.
    #[must_use]
    pub fn passes(&self) -> usize {
        self.shared.passes.load(Ordering::Acquire)
    }
}

fn run_worker(pool: &ConcurrentBufferPool, shared: &WorkerShared, interval: Duration) {
    tracing::debug!(?interval, "pool maintenance worker started");

    while !shared.stop.load(Ordering::Acquire) {
        match pool.run_maintenance() {
            Ok(report) if report.shrunk > 0 => {
                tracing::debug!(
                    inspected = report.inspected,
                    shrunk = report.shrunk,
                    "pool maintenance pass completed"
                );
            }
            Ok(_) => {}
            Err(error) => {
                tracing::trace!(%error, "pool maintenance pass skipped, will retry");
            }
        }

        shared.passes.fetch_add(1, Ordering::Release);

        // Spurious wakeups merely cause an early pass.
        thread::park_timeout(interval);
    }

    tracing::debug!("pool maintenance worker stopped");
}

impl Drop for MaintenanceWorker {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);

        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();

            if thread.join().is_err() && !thread::panicking() {
                tracing::error!("pool maintenance worker panicked");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::indexing_slicing, reason = "test code, be concise")]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_impl_all;
    use testing::with_watchdog;
    use tracing_test::traced_test;

    use super::*;

    assert_impl_all!(MaintenanceWorker: Send, Sync);

    fn pool(slots: usize) -> ConcurrentBufferPool {
        ConcurrentBufferPool::builder()
            .initial_slots(slots)
            .buffer_capacity(16)
            .shrink_factor(2)
            .maintenance_batch_size(4)
            .build()
    }

    /// Claims a buffer, grows it to `bytes` and releases it again.
    fn bloat(pool: &ConcurrentBufferPool, bytes: usize) -> usize {
        let mut claim = pool.claim_buffer::<u8>().unwrap();
        claim.extend_from_slice(&vec![1; bytes]).unwrap();

        let index = claim.index();
        claim.release().unwrap();
        index
    }

    #[test]
    fn empty_pool_has_nothing_to_do() {
        let pool = pool(4);

        assert_eq!(pool.run_maintenance().unwrap(), MaintenanceReport::default());
    }

    #[test]
    #[traced_test]
    fn bloated_free_buffer_is_shrunk() {
        let pool = pool(4);

        let index = bloat(&pool, 256);

        let report = pool.run_maintenance().unwrap();
        assert_eq!(report.inspected, 1);
        assert_eq!(report.shrunk, 1);
        assert!(logs_contain("shrank idle pool buffer"));

        // The slot is free again and back to its baseline.
        let claim = pool.claim_buffer::<u8>().unwrap();
        assert_eq!(claim.index(), index);
        assert_eq!(claim.capacity(), 16);
    }

    #[test]
    fn moderately_grown_buffer_is_kept() {
        let pool = pool(4);

        // 32 bytes is exactly at the threshold of baseline times shrink factor.
        bloat(&pool, 32);

        let report = pool.run_maintenance().unwrap();
        assert_eq!(report.shrunk, 0);

        let claim = pool.claim_buffer::<u8>().unwrap();
        assert_eq!(claim.capacity(), 32);
    }

    #[test]
    fn claimed_buffers_are_not_touched() {
        let pool = pool(4);

        let mut claim = pool.claim_buffer::<u8>().unwrap();
        claim.extend_from_slice(&[7; 256]).unwrap();

        let report = pool.run_maintenance().unwrap();
        assert_eq!(report.inspected, 1);
        assert_eq!(report.shrunk, 0);

        assert_eq!(claim.capacity(), 256);
        assert_eq!(claim.get(255), Some(7));
        assert!(pool.is_claimed(claim.index()).unwrap());
    }

    #[test]
    fn passes_continue_where_the_previous_stopped() {
        let pool = ConcurrentBufferPool::builder()
            .initial_slots(8)
            .buffer_capacity(16)
            .shrink_factor(1)
            .maintenance_batch_size(2)
            .build();

        // Issue four slots, bloat all of them.
        let claims = (0..4)
            .map(|_| {
                let mut claim = pool.claim_buffer::<u8>().unwrap();
                claim.extend_from_slice(&[1; 64]).unwrap();
                claim
            })
            .collect::<Vec<_>>();
        drop(claims);

        assert_eq!(pool.run_maintenance().unwrap().shrunk, 2);
        assert_eq!(pool.run_maintenance().unwrap().shrunk, 2);
        assert_eq!(pool.run_maintenance().unwrap().shrunk, 0);

        // Maintenance does not leave anything taken.
        assert_eq!(pool.free_count().unwrap(), 8);
    }

    #[test]
    fn maintenance_keeps_the_reuse_order() {
        let pool = pool(4);

        let mut claims = (0..4)
            .map(|_| pool.claim_buffer::<u8>().unwrap())
            .collect::<Vec<_>>();

        claims.remove(2).release().unwrap();
        claims.remove(1).release().unwrap();

        let report = pool.run_maintenance().unwrap();
        assert_eq!(report.inspected, 4);

        // Slot 1 was released last, so it is still the first to be handed out.
        assert_eq!(pool.claim_buffer::<u8>().unwrap().index(), 1);
    }

    #[test]
    fn contended_passes_never_strand_a_slot() {
        with_watchdog(|| {
            let pool = ConcurrentBufferPool::builder()
                .initial_slots(4)
                .lock_timeout(Duration::ZERO)
                .build();

            // Issue every slot once so that all of them are candidates.
            let claims = (0..4)
                .map(|_| pool.claim_buffer::<u8>().unwrap())
                .collect::<Vec<_>>();
            drop(claims);

            let stop = AtomicBool::new(false);

            thread::scope(|scope| {
                scope.spawn(|| {
                    while !stop.load(Ordering::Relaxed) {
                        // Only here to keep the locks busy, failures are expected.
                        if pool.free_count().is_err() {
                            thread::yield_now();
                        }
                    }
                });

                for _ in 0..20_000 {
                    // Timeouts are expected and fine.
                    if pool.run_maintenance().is_err() {
                        thread::yield_now();
                    }
                }

                stop.store(true, Ordering::Relaxed);
            });

            assert_eq!(pool.claimed_count().unwrap(), 0);
            assert_eq!(pool.free_count().unwrap(), pool.slot_count().unwrap());

            // All four original slots can still be claimed without minting new ones.
            let claims = (0..4)
                .map(|_| pool.claim_buffer::<u8>().unwrap())
                .collect::<Vec<_>>();
            assert!(claims.iter().all(|claim| claim.index() < 4));
        });
    }

    #[test]
    fn worker_runs_passes_and_stops_on_drop() {
        with_watchdog(|| {
            let pool = Arc::new(pool(4));
            bloat(&pool, 256);

            let worker = MaintenanceWorker::spawn(Arc::clone(&pool), Duration::from_millis(1));

            while worker.passes() < 3 {
                thread::yield_now();
            }

            drop(worker);

            let claim = pool.claim_buffer::<u8>().unwrap();
            assert_eq!(claim.capacity(), 16);
        });
    }
}
