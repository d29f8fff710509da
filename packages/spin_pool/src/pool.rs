use std::mem;
use std::ptr::NonNull;
use std::sync::atomic::AtomicUsize;

use foldhash::HashSet;

use crate::{
    BufferClaim, BufferElement, BufferedPtr, ConcurrentBufferPoolBuilder, Error, PackedIndexProvider,
    PoolConfig, RawClaim, RentalPolicy, Result, RwSpinLock, SubBuffer, assert_storable,
};

/// A thread-safe pool of reusable byte buffers, addressed by small integer slot indices.
///
/// Claimants take exclusive ownership of one buffer at a time through a [`BufferClaim`], use it
/// as a growable typed list and return it to the pool when done. Returned buffers are wiped and
/// handed to the next claimant, most recently released first, which keeps the hot set of buffers
/// small and warm.
///
/// # Structure
///
/// The pool keeps a table of slots. Each slot owns a separately allocated buffer header whose
/// address never changes once created, even when the table itself grows. The free slots are
/// tracked by a [`PackedIndexProvider`], the claimed ones by a set guarded by its own lock.
///
/// All bookkeeping is guarded by [`RwSpinLock`]s with a short timeout. No lock is ever held while
/// another is being acquired and no logging happens while a lock is held. Buffers are allocated
/// before taking a lock, but the claimed set and the free list may still reallocate their own
/// storage under their lock when they grow, as may the slot table when a concurrent claimant
/// grew it first.
///
/// Operations that hand a slot back (dropping a claim, undoing a failed claim) wait for the
/// bookkeeping locks without a deadline, so a slot is never stranded by contention.
///
/// # Maintenance
///
/// Buffers that grew far beyond their baseline capacity can be shrunk while free by
/// [`run_maintenance()`][Self::run_maintenance], either called directly or periodically from a
/// [`MaintenanceWorker`][crate::MaintenanceWorker].
///
/// # Examples
///
/// ```
/// use spin_pool::ConcurrentBufferPool;
///
/// let pool = ConcurrentBufferPool::builder()
///     .initial_slots(4)
///     .buffer_capacity(64)
///     .build();
///
/// let mut first = pool.claim_buffer::<u8>().unwrap();
/// first.extend_from_slice(b"hello").unwrap();
///
/// let second = pool.claim_buffer::<u64>().unwrap();
/// assert_ne!(first.index(), second.index());
///
/// assert_eq!(pool.claimed_count().unwrap(), 2);
///
/// drop(first);
/// drop(second);
/// assert_eq!(pool.claimed_count().unwrap(), 0);
/// ```
///
/// # Leak detection
///
/// Dropping the pool while slots are still claimed through [`RawClaim`]s is reported as a leak,
/// logged and escalated according to the configured [`CheckPolicy`][crate::CheckPolicy].
#[derive(Debug)]
pub struct ConcurrentBufferPool {
    /// The slot table. Entries point to boxed buffer headers owned by the pool.
    slots: RwSpinLock<Vec<BufferedPtr<SubBuffer>>>,

    /// Slots that are not claimed. Also used by maintenance to lock out claimants.
    free_slots: PackedIndexProvider,

    claimed: RwSpinLock<HashSet<usize>>,

    config: PoolConfig,

    /// Where the next maintenance pass starts looking.
    maintenance_cursor: AtomicUsize,
}

impl ConcurrentBufferPool {
    /// Creates a pool with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Starts building a pool with a custom configuration.
    pub fn builder() -> ConcurrentBufferPoolBuilder {
        ConcurrentBufferPoolBuilder::new()
    }

    pub(crate) fn new_inner(config: PoolConfig, initial_slots: usize) -> Result<Self> {
        let mut slots = Vec::with_capacity(initial_slots);

        for _ in 0..initial_slots {
            slots.push(into_slot(SubBuffer::with_capacity(config.buffer_capacity)?));
        }

        // The pool reports leaks in terms of claims, not indices.
        let mut free_slots = PackedIndexProvider::builder()
            .lock_name("free slots")
            .lock_timeout(config.lock_timeout)
            .check_policy(config.check_policy)
            .max_index(config.max_slots.saturating_sub(1))
            .without_leak_reports();

        if let Some(tracker) = &config.leak_tracker {
            free_slots = free_slots.leak_tracker(tracker);
        }

        Ok(Self {
            slots: RwSpinLock::named("slot table", slots),
            free_slots: free_slots.build(),
            claimed: RwSpinLock::named("claimed set", HashSet::default()),
            config,
            maintenance_cursor: AtomicUsize::new(0),
        })
    }

    /// Claims a free buffer for exclusive use, viewing its contents as elements of type `T`.
    ///
    /// The buffer is empty when claimed. If no free slot exists, the slot table grows by
    /// doubling, up to the configured maximum number of slots.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexExhausted`] if every slot up to the maximum is claimed and
    /// [`Error::LockTimeout`] if the pool is too contended. No slot is claimed in either case.
    ///
    /// # Panics
    ///
    /// Panics if `T` is zero-sized or more strictly aligned than [`BUFFER_ALIGN`][crate::BUFFER_ALIGN].
    pub fn claim_buffer<T: BufferElement>(&self) -> Result<BufferClaim<'_, T>> {
        assert_storable::<T>();

        let index = self.free_slots.fetch_index()?;

        if let Err(error) = self.mark_claimed(index) {
            // An index that is already claimed belongs to someone else, leave it alone.
            if !matches!(error, Error::AlreadyClaimed { .. }) {
                self.return_to_free_list(index);
            }

            return Err(error);
        }

        let mut buffer = match self.slot_buffer(index) {
            Ok(buffer) => buffer,
            Err(error) => {
                self.abandon_claim(index);
                return Err(error);
            }
        };

        // SAFETY: We just marked the slot as claimed, so we are the only ones touching it.
        // Buffers are wiped on release already; this covers buffers abandoned by failed releases.
        unsafe { buffer.as_mut() }.clear();

        // SAFETY: The slot is marked as claimed on behalf of the new claim.
        Ok(unsafe { BufferClaim::new(self, index, buffer) })
    }

    /// Reattaches a claim that was detached with [`BufferClaim::into_raw()`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandle`] if the slot is not claimed and [`Error::LockTimeout`] if
    /// the pool is too contended.
    ///
    /// # Safety
    ///
    /// The raw claim must have been detached from a claim of this pool, no other [`BufferClaim`]
    /// for the same slot may exist and the slot must not have been released since. The buffer
    /// contents must be valid elements of type `T`: use the same element type as the original
    /// claim, or one whose size divides the byte length of the contents.
    pub unsafe fn claim_from_raw<T: BufferElement>(
        &self,
        raw: RawClaim,
    ) -> Result<BufferClaim<'_, T>> {
        let index = raw.index();

        if !self.is_claimed(index)? {
            return Err(Error::InvalidHandle);
        }

        let buffer = self.slot_buffer(index)?;

        // SAFETY: The slot is claimed and the caller guarantees that nobody else is using it.
        Ok(unsafe { BufferClaim::new(self, index, buffer) })
    }

    /// Releases a claim that was detached with [`BufferClaim::into_raw()`].
    ///
    /// Releasing a slot that is not claimed is logged and otherwise does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockTimeout`] if the pool is too contended. The slot remains claimed.
    ///
    /// # Safety
    ///
    /// No [`BufferClaim`] for the same slot may exist.
    pub unsafe fn release_raw(&self, raw: RawClaim) -> Result<()> {
        let index = raw.index();

        if !self.is_claimed(index)? {
            tracing::error!(slot = index, "released a slot that is not claimed");
            return Ok(());
        }

        let mut buffer = self.slot_buffer(index)?;

        // SAFETY: The slot is claimed and the caller guarantees that no claim is using it.
        unsafe { buffer.as_mut() }.clear();

        self.recycle_slot(index).map(|_was_claimed| ())
    }

    /// The number of slots currently claimed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockTimeout`] if the pool is too contended.
    pub fn claimed_count(&self) -> Result<usize> {
        Ok(self.claimed.read(self.config.lock_timeout)?.len())
    }

    /// Whether the slot at `index` is currently claimed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockTimeout`] if the pool is too contended.
    pub fn is_claimed(&self, index: usize) -> Result<bool> {
        Ok(self.claimed.read(self.config.lock_timeout)?.contains(&index))
    }

    /// The number of slots in the slot table, claimed or not.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockTimeout`] if the pool is too contended.
    pub fn slot_count(&self) -> Result<usize> {
        Ok(self.slots.read(self.config.lock_timeout)?.len())
    }

    /// The number of slots in the slot table that can be claimed without growing it.
    ///
    /// Slots under maintenance are counted as free.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockTimeout`] if the pool is too contended.
    pub fn free_count(&self) -> Result<usize> {
        let slot_count = self.slot_count()?;
        let taken = self.free_slots.taken_count()?;

        Ok(slot_count.saturating_sub(taken))
    }

    /// The capacity in bytes that every buffer starts with.
    #[must_use]
    pub fn buffer_capacity(&self) -> usize {
        self.config.buffer_capacity
    }

    pub(crate) fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub(crate) fn rental_policy(&self) -> RentalPolicy {
        self.config.rental_policy
    }

    pub(crate) fn free_slots(&self) -> &PackedIndexProvider {
        &self.free_slots
    }

    pub(crate) fn maintenance_cursor(&self) -> &AtomicUsize {
        &self.maintenance_cursor
    }

    /// Returns a claimed slot to the free list. The caller must have wiped the buffer.
    ///
    /// Returns `false` if the slot was not claimed, which is logged. On error nothing changed and
    /// the slot is still claimed.
    pub(crate) fn recycle_slot(&self, index: usize) -> Result<bool> {
        let was_claimed = self
            .claimed
            .write(self.config.lock_timeout)?
            .remove(&index);

        Ok(self.finish_recycle(index, was_claimed))
    }

    /// Like [`recycle_slot()`][Self::recycle_slot] but waits for the locks without a deadline.
    pub(crate) fn recycle_slot_unbounded(&self, index: usize) -> bool {
        let was_claimed = self.claimed.write_unbounded().remove(&index);

        self.finish_recycle(index, was_claimed)
    }

    fn finish_recycle(&self, index: usize, was_claimed: bool) -> bool {
        if !was_claimed {
            tracing::error!(slot = index, "released a slot that is not claimed");
            return false;
        }

        // Once unclaimed, the slot must reach the free list or it is lost for good.
        self.free_slots.return_index_unbounded(index);
        true
    }

    /// The buffer of a slot if the slot table already covers it, without creating anything.
    pub(crate) fn existing_slot_buffer(&self, index: usize) -> Result<Option<NonNull<SubBuffer>>> {
        Ok(self
            .slots
            .read(self.config.lock_timeout)?
            .get(index)
            .and_then(BufferedPtr::get))
    }

    fn mark_claimed(&self, index: usize) -> Result<()> {
        let newly_claimed = self.claimed.write(self.config.lock_timeout)?.insert(index);

        if newly_claimed {
            return Ok(());
        }

        tracing::error!(slot = index, "free list issued a slot that is already claimed");
        self.config
            .check_policy
            .escalate(&format!("slot {index} was issued while it was already claimed"));

        Err(Error::AlreadyClaimed { index })
    }

    /// Undoes a claim that got as far as being marked.
    fn abandon_claim(&self, index: usize) {
        self.claimed.write_unbounded().remove(&index);
        self.return_to_free_list(index);
    }

    fn return_to_free_list(&self, index: usize) {
        self.free_slots.return_index_unbounded(index);
    }

    /// The buffer of the slot at `index`, creating it (and growing the slot table) if needed.
    fn slot_buffer(&self, index: usize) -> Result<NonNull<SubBuffer>> {
        if let Some(buffer) = self.existing_slot_buffer(index)? {
            return Ok(buffer);
        }

        self.populate_slot(index)
    }

    fn populate_slot(&self, index: usize) -> Result<NonNull<SubBuffer>> {
        // Allocate everything we may need before taking the lock.
        let fresh = Box::new(SubBuffer::with_capacity(self.config.buffer_capacity)?);

        let observed_len = self.slots.read(self.config.lock_timeout)?.len();
        let mut replacement = (index >= observed_len).then(|| {
            Vec::with_capacity(grown_len(observed_len, index, self.config.max_slots))
        });

        let (buffer, unused, retired, corrupted) = {
            let mut slots = self.slots.write(self.config.lock_timeout)?;

            let retired = if index >= slots.len() {
                let target_len = grown_len(slots.len(), index, self.config.max_slots);

                let mut table = replacement.take().unwrap_or_default();
                table.extend_from_slice(&slots);
                table.resize(target_len, BufferedPtr::invalid());

                Some(mem::replace(&mut *slots, table))
            } else {
                None
            };

            let entry = slots
                .get_mut(index)
                .expect("the slot table was grown to cover the index above");

            let corrupted = !entry.is_valid() && !entry.as_ptr_unchecked().is_null();

            match entry.get() {
                // Someone else populated the slot while we were allocating.
                Some(existing) => (existing, Some(fresh), retired, corrupted),
                None => {
                    let buffer = NonNull::from(Box::leak(fresh));
                    *entry = BufferedPtr::new(buffer);
                    (buffer, None, retired, corrupted)
                }
            }
        };

        if corrupted {
            tracing::error!(
                slot = index,
                "slot table entry was corrupted and has been replaced with a fresh buffer"
            );
        }

        if let Some(retired) = retired {
            tracing::debug!(
                from = retired.len(),
                min_len = index.saturating_add(1),
                "grew the pool slot table"
            );
        }

        drop(unused);

        Ok(buffer)
    }
}

impl Default for ConcurrentBufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConcurrentBufferPool {
    fn drop(&mut self) {
        for slot in self.slots.get_mut().drain(..) {
            if let Some(buffer) = slot.get() {
                // SAFETY: Every valid entry was created from Box::leak() in this pool, and claims
                // borrow the pool so none can outlive it.
                drop(unsafe { Box::from_raw(buffer.as_ptr()) });
            }
        }

        tracing::debug!("freed the pool buffers");

        // Escalation may panic, so it comes after the buffers are freed.
        let leaked = self.claimed.get_mut().len();

        if leaked > 0 {
            tracing::warn!(leaked, "buffer pool dropped with slots that were never released");

            if let Some(tracker) = &self.config.leak_tracker {
                tracker.record_claims(leaked);
            }

            self.config.check_policy.escalate(&format!(
                "buffer pool dropped with {leaked} slots that were never released"
            ));
        }
    }
}

// SAFETY: The slot table holds pointers to buffers owned by the pool. Access to each buffer is
// governed by the claimed set: only the claimant (or maintenance, while it holds the index)
// touches a buffer. All other state is behind locks.
unsafe impl Send for ConcurrentBufferPool {}

// SAFETY: See above.
unsafe impl Sync for ConcurrentBufferPool {}

fn into_slot(buffer: SubBuffer) -> BufferedPtr<SubBuffer> {
    BufferedPtr::new(NonNull::from(Box::leak(Box::new(buffer))))
}

/// The slot table doubles in size, but covers at least `index` and stays within `max_slots`.
fn grown_len(current_len: usize, index: usize, max_slots: usize) -> usize {
    current_len
        .saturating_mul(2)
        .min(max_slots)
        .max(index.saturating_add(1))
}

#[cfg(test)]
#[allow(
    clippy::arithmetic_side_effects,
    clippy::indexing_slicing,
    reason = "test code, be concise"
)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::collections::BTreeSet;
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    use static_assertions::assert_impl_all;
    use testing::with_watchdog;
    use tracing_test::traced_test;

    use super::*;
    use crate::{CheckPolicy, LeakTracker};

    assert_impl_all!(ConcurrentBufferPool: Send, Sync);

    #[test]
    fn grown_len_doubles_within_limits() {
        assert_eq!(grown_len(4, 4, usize::MAX), 8);
        assert_eq!(grown_len(0, 0, usize::MAX), 1);
        assert_eq!(grown_len(4, 20, usize::MAX), 21);
        assert_eq!(grown_len(4, 4, 6), 6);
    }

    #[test]
    fn initial_slots_are_allocated_eagerly() {
        let pool = ConcurrentBufferPool::builder()
            .initial_slots(4)
            .buffer_capacity(64)
            .build();

        assert_eq!(pool.slot_count().unwrap(), 4);
        assert_eq!(pool.free_count().unwrap(), 4);
        assert_eq!(pool.claimed_count().unwrap(), 0);
        assert_eq!(pool.buffer_capacity(), 64);
    }

    #[test]
    fn claims_use_distinct_slots() {
        let pool = ConcurrentBufferPool::builder().initial_slots(2).build();

        let a = pool.claim_buffer::<u8>().unwrap();
        let b = pool.claim_buffer::<u8>().unwrap();

        assert_eq!((a.index(), b.index()), (0, 1));
        assert!(pool.is_claimed(0).unwrap());
        assert!(pool.is_claimed(1).unwrap());
        assert_eq!(pool.free_count().unwrap(), 0);
    }

    #[test]
    fn released_slot_is_reused_first_and_wiped() {
        let pool = ConcurrentBufferPool::builder()
            .initial_slots(4)
            .buffer_capacity(16)
            .build();

        let a = pool.claim_buffer::<u8>().unwrap();
        let mut b = pool.claim_buffer::<u8>().unwrap();
        let c = pool.claim_buffer::<u8>().unwrap();

        b.extend_from_slice(&[0xAB; 16]).unwrap();
        let b_index = b.index();
        b.release().unwrap();

        let reused = pool.claim_buffer::<u8>().unwrap();
        assert_eq!(reused.index(), b_index);
        assert!(reused.is_empty());
        assert!(reused.as_bytes().iter().all(|&byte| byte == 0));

        drop((a, c, reused));
    }

    #[test]
    fn slot_table_grows_without_moving_buffers() {
        let pool = ConcurrentBufferPool::builder()
            .initial_slots(2)
            .buffer_capacity(8)
            .build();

        let mut first = pool.claim_buffer::<u8>().unwrap();
        first.push(42).unwrap();
        let before = first.as_slice().as_ptr();

        let claims = (0..10)
            .map(|_| pool.claim_buffer::<u8>().unwrap())
            .collect::<Vec<_>>();

        assert!(pool.slot_count().unwrap() >= 11);
        assert_eq!(first.as_slice().as_ptr(), before);
        assert_eq!(first.get(0), Some(42));

        drop(claims);
    }

    #[test]
    fn max_slots_is_enforced() {
        let pool = ConcurrentBufferPool::builder()
            .initial_slots(1)
            .max_slots(2)
            .build();

        let a = pool.claim_buffer::<u8>().unwrap();
        let b = pool.claim_buffer::<u8>().unwrap();

        assert_eq!(
            pool.claim_buffer::<u8>().unwrap_err(),
            Error::IndexExhausted { max_index: 1 }
        );
        assert_eq!(pool.slot_count().unwrap(), 2);

        drop(a);
        pool.claim_buffer::<u8>().unwrap();

        drop(b);
    }

    #[test]
    #[traced_test]
    fn releasing_unclaimed_raw_slot_is_ignored() {
        let pool = ConcurrentBufferPool::new();

        let raw = pool.claim_buffer::<u8>().unwrap().into_raw();

        // SAFETY: The claim was detached above and nobody else uses it.
        unsafe { pool.release_raw(raw) }.unwrap();
        // SAFETY: Misuse on purpose, the slot is free and untouched.
        unsafe { pool.release_raw(raw) }.unwrap();

        assert!(logs_contain("released a slot that is not claimed"));
        assert_eq!(pool.claimed_count().unwrap(), 0);
        assert_eq!(pool.free_count().unwrap(), pool.slot_count().unwrap());
    }

    #[test]
    fn reattaching_a_released_claim_is_refused() {
        let pool = ConcurrentBufferPool::new();

        let raw = pool.claim_buffer::<u8>().unwrap().into_raw();
        // SAFETY: The claim was detached above and nobody else uses it.
        unsafe { pool.release_raw(raw) }.unwrap();

        // SAFETY: Misuse on purpose, the call validates the claim before touching memory.
        let result = unsafe { pool.claim_from_raw::<u8>(raw) };
        assert_eq!(result.unwrap_err(), Error::InvalidHandle);
    }

    #[test]
    #[traced_test]
    fn leaked_raw_claims_are_reported() {
        let tracker = LeakTracker::new();

        let pool = ConcurrentBufferPool::builder()
            .check_policy(CheckPolicy::Lenient)
            .leak_tracker(&tracker)
            .build();

        let _raw = pool.claim_buffer::<u32>().unwrap().into_raw();
        drop(pool);

        assert_eq!(tracker.report().leaked_claims, 1);
        assert_eq!(tracker.report().leaked_indices, 0);
        assert!(logs_contain("never released"));
    }

    #[test]
    #[should_panic(expected = "never released")]
    fn leaked_raw_claims_panic_when_strict() {
        let pool = ConcurrentBufferPool::builder()
            .check_policy(CheckPolicy::Strict)
            .build();

        let _raw = pool.claim_buffer::<u32>().unwrap().into_raw();
    }

    #[test]
    #[traced_test]
    fn corrupted_slot_entry_is_replaced() {
        let pool = ConcurrentBufferPool::builder()
            .initial_slots(1)
            .check_policy(CheckPolicy::Lenient)
            .build();

        let original = {
            let mut slots = pool.slots.write(Duration::from_secs(1)).unwrap();
            let original = slots[0];

            // A pointer whose check value no longer matches.
            let mut garbage = [0_usize; 2];
            garbage[0] = 0x1000;
            garbage[1] = 0x1001;
            // SAFETY: BufferedPtr is two pointer-sized fields laid out in order.
            slots[0] = unsafe { mem::transmute::<[usize; 2], BufferedPtr<SubBuffer>>(garbage) };

            original
        };

        let claim = pool.claim_buffer::<u8>().unwrap();
        assert!(logs_contain("was corrupted"));
        assert_eq!(claim.capacity(), pool.buffer_capacity());
        drop(claim);

        // SAFETY: We replaced this entry above, so nobody else owns the original buffer.
        drop(unsafe { Box::from_raw(original.get().unwrap().as_ptr()) });
    }

    #[test]
    fn concurrent_claims_never_share_a_slot() {
        with_watchdog(|| {
            const THREADS: usize = 4;
            const ROUNDS: usize = 200;

            let pool = Arc::new(
                ConcurrentBufferPool::builder()
                    .initial_slots(2)
                    .buffer_capacity(16)
                    .lock_timeout(Duration::from_secs(5))
                    .build(),
            );

            let handles = (0..THREADS)
                .map(|thread_index| {
                    let pool = Arc::clone(&pool);

                    thread::spawn(move || {
                        let mut seen = BTreeSet::new();

                        for round in 0..ROUNDS {
                            let mut claim = pool.claim_buffer::<u64>().unwrap();

                            // Anything left over from a previous claimant would show up here.
                            assert!(claim.is_empty());

                            let marker = u64::try_from(thread_index * ROUNDS + round).unwrap();
                            claim.push(marker).unwrap();
                            claim.push(marker).unwrap();
                            thread::yield_now();
                            assert_eq!(claim.as_slice(), &[marker, marker]);

                            seen.insert(claim.index());
                        }

                        seen
                    })
                })
                .collect::<Vec<_>>();

            for handle in handles {
                for index in handle.join().unwrap() {
                    assert!(index < THREADS + 2);
                }
            }

            assert_eq!(pool.claimed_count().unwrap(), 0);
        });
    }

    #[test]
    #[traced_test]
    fn strict_leak_escalation_comes_after_freeing_buffers() {
        let pool = ConcurrentBufferPool::builder()
            .initial_slots(2)
            .check_policy(CheckPolicy::Strict)
            .build();

        let _raw = pool.claim_buffer::<u32>().unwrap().into_raw();

        let result = panic::catch_unwind(AssertUnwindSafe(move || drop(pool)));

        assert!(result.is_err());
        assert!(logs_contain("freed the pool buffers"));
        assert!(logs_contain("never released"));
    }

    #[test]
    fn failed_release_hands_the_claim_back() {
        let pool = ConcurrentBufferPool::builder()
            .initial_slots(2)
            .lock_timeout(Duration::from_millis(10))
            .build();

        let mut claim = pool.claim_buffer::<u8>().unwrap();
        claim.extend_from_slice(&[1, 2, 3]).unwrap();
        let index = claim.index();

        let failed = {
            let _blocker = pool.claimed.read(Duration::from_secs(1)).unwrap();
            claim.release().unwrap_err()
        };

        assert!(matches!(failed.error(), Error::LockTimeout { .. }));
        assert!(pool.is_claimed(index).unwrap());
        assert_eq!(pool.free_count().unwrap(), 1);

        let claim = failed.into_claim();
        assert_eq!(claim.index(), index);
        assert!(claim.is_empty());

        claim.release().unwrap();
        assert_eq!(pool.claimed_count().unwrap(), 0);
        assert_eq!(pool.free_count().unwrap(), 2);
    }

    #[test]
    fn dropping_a_claim_waits_out_contention() {
        with_watchdog(|| {
            let pool = ConcurrentBufferPool::builder()
                .initial_slots(1)
                .lock_timeout(Duration::from_millis(1))
                .build();

            let claim = pool.claim_buffer::<u8>().unwrap();
            let blocker = pool.claimed.read(Duration::from_secs(1)).unwrap();

            thread::scope(|s| {
                let dropper = s.spawn(move || drop(claim));

                thread::sleep(Duration::from_millis(50));
                assert!(!dropper.is_finished());

                drop(blocker);
                dropper.join().unwrap();
            });

            assert_eq!(pool.claimed_count().unwrap(), 0);
            assert_eq!(pool.free_count().unwrap(), 1);
        });
    }

    #[test]
    fn contended_claims_and_releases_never_strand_a_slot() {
        with_watchdog(|| {
            let pool = ConcurrentBufferPool::builder()
                .initial_slots(4)
                .lock_timeout(Duration::ZERO)
                .build();
            let done = AtomicBool::new(false);

            thread::scope(|s| {
                s.spawn(|| {
                    while !done.load(Ordering::Relaxed) {
                        if pool.claimed_count().is_err() {
                            thread::yield_now();
                        }
                    }
                });

                for _ in 0..20_000 {
                    let Ok(claim) = pool.claim_buffer::<u8>() else {
                        thread::yield_now();
                        continue;
                    };

                    let mut pending = claim;
                    while let Err(failed) = pending.release() {
                        pending = failed.into_claim();
                        thread::yield_now();
                    }
                }

                done.store(true, Ordering::Relaxed);
            });

            // The contender is gone, so plain reads succeed now.
            assert_eq!(pool.claimed_count().unwrap(), 0);
            assert_eq!(pool.free_count().unwrap(), pool.slot_count().unwrap());
        });
    }
}
