use std::cell::Cell;
use std::marker::PhantomData;
use std::time::Duration;

use crate::{CheckPolicy, ConcurrentBufferPool, LeakTracker, RentalPolicy};

/// Settings shared by the pool and its maintenance.
#[derive(Debug)]
pub(crate) struct PoolConfig {
    pub(crate) buffer_capacity: usize,
    pub(crate) max_slots: usize,
    pub(crate) maintenance_batch_size: usize,
    pub(crate) shrink_factor: usize,
    pub(crate) lock_timeout: Duration,
    pub(crate) check_policy: CheckPolicy,
    pub(crate) rental_policy: RentalPolicy,
    pub(crate) leak_tracker: Option<LeakTracker>,
}

/// Builder for creating an instance of [`ConcurrentBufferPool`].
///
/// Every setting is optional.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use spin_pool::{ConcurrentBufferPool, RentalPolicy};
///
/// let pool = ConcurrentBufferPool::builder()
///     .initial_slots(8)
///     .max_slots(64)
///     .buffer_capacity(1024)
///     .lock_timeout(Duration::from_millis(5))
///     .rental_policy(RentalPolicy::Refuse)
///     .build();
///
/// assert_eq!(pool.slot_count().unwrap(), 8);
/// ```
///
/// # Thread safety
///
/// The builder is thread-mobile ([`Send`]) but not thread-safe ([`Sync`]).
#[derive(Debug)]
#[must_use]
pub struct ConcurrentBufferPoolBuilder {
    initial_slots: usize,
    config: PoolConfig,

    _not_sync: PhantomData<Cell<()>>,
}

const DEFAULT_INITIAL_SLOTS: usize = 16;
const DEFAULT_BUFFER_CAPACITY: usize = 256;
const DEFAULT_MAINTENANCE_BATCH_SIZE: usize = 8;
const DEFAULT_SHRINK_FACTOR: usize = 4;
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(1);

impl ConcurrentBufferPoolBuilder {
    pub(crate) fn new() -> Self {
        Self {
            initial_slots: DEFAULT_INITIAL_SLOTS,
            config: PoolConfig {
                buffer_capacity: DEFAULT_BUFFER_CAPACITY,
                max_slots: usize::MAX,
                maintenance_batch_size: DEFAULT_MAINTENANCE_BATCH_SIZE,
                shrink_factor: DEFAULT_SHRINK_FACTOR,
                lock_timeout: DEFAULT_LOCK_TIMEOUT,
                check_policy: CheckPolicy::default(),
                rental_policy: RentalPolicy::default(),
                leak_tracker: None,
            },
            _not_sync: PhantomData,
        }
    }

    /// Sets how many slots are created, each with a buffer, when the pool is built.
    ///
    /// Defaults to 16. Zero is allowed; the first claim then creates the first slot.
    pub fn initial_slots(mut self, count: usize) -> Self {
        self.initial_slots = count;
        self
    }

    /// Sets the upper bound on the number of slots. Unbounded by default.
    ///
    /// # Panics
    ///
    /// Panics if `count` is zero.
    pub fn max_slots(mut self, count: usize) -> Self {
        assert!(count > 0, "a buffer pool needs room for at least one slot");
        self.config.max_slots = count;
        self
    }

    /// Sets the capacity in bytes that every buffer starts with. Defaults to 256.
    ///
    /// Maintenance shrinks idle buffers back to this capacity.
    pub fn buffer_capacity(mut self, bytes: usize) -> Self {
        self.config.buffer_capacity = bytes;
        self
    }

    /// Sets how many slots a single maintenance pass inspects. Defaults to 8.
    ///
    /// # Panics
    ///
    /// Panics if `count` is zero.
    pub fn maintenance_batch_size(mut self, count: usize) -> Self {
        assert!(count > 0, "a maintenance pass must inspect at least one slot");
        self.config.maintenance_batch_size = count;
        self
    }

    /// Sets how many times its baseline capacity an idle buffer may grow before maintenance
    /// shrinks it. Defaults to 4.
    ///
    /// # Panics
    ///
    /// Panics if `factor` is zero.
    pub fn shrink_factor(mut self, factor: usize) -> Self {
        assert!(factor > 0, "the shrink factor must be at least 1");
        self.config.shrink_factor = factor;
        self
    }

    /// Sets how long operations spin for a pool lock before giving up. Defaults to 1 ms.
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.config.lock_timeout = timeout;
        self
    }

    /// Sets how the pool reacts to detected lifecycle bugs.
    pub fn check_policy(mut self, policy: CheckPolicy) -> Self {
        self.config.check_policy = policy;
        self
    }

    /// Sets what happens to rented element handles when elements need to move.
    pub fn rental_policy(mut self, policy: RentalPolicy) -> Self {
        self.config.rental_policy = policy;
        self
    }

    /// Reports slots that are never released into the given tracker.
    pub fn leak_tracker(mut self, tracker: &LeakTracker) -> Self {
        self.config.leak_tracker = Some(tracker.clone());
        self
    }

    /// Builds the pool, allocating the initial slots.
    ///
    /// # Panics
    ///
    /// Panics if there are more initial slots than the maximum, or if the buffer capacity is too
    /// large to allocate.
    #[must_use]
    pub fn build(self) -> ConcurrentBufferPool {
        assert!(
            self.initial_slots <= self.config.max_slots,
            "cannot create {} initial slots in a pool limited to {} slots",
            self.initial_slots,
            self.config.max_slots
        );

        let buffer_capacity = self.config.buffer_capacity;

        ConcurrentBufferPool::new_inner(self.config, self.initial_slots).unwrap_or_else(|error| {
            panic!("cannot allocate pool buffers of {buffer_capacity} bytes: {error}")
        })
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;

    assert_impl_all!(ConcurrentBufferPoolBuilder: Send);
    assert_not_impl_any!(ConcurrentBufferPoolBuilder: Sync);

    #[test]
    fn defaults() {
        let pool = ConcurrentBufferPool::builder().build();

        assert_eq!(pool.slot_count().unwrap(), DEFAULT_INITIAL_SLOTS);
        assert_eq!(pool.buffer_capacity(), DEFAULT_BUFFER_CAPACITY);
        assert_eq!(pool.config().max_slots, usize::MAX);
        assert_eq!(pool.config().lock_timeout, DEFAULT_LOCK_TIMEOUT);
        assert_eq!(pool.config().rental_policy, RentalPolicy::Invalidate);
    }

    #[test]
    fn empty_pool_is_allowed() {
        let pool = ConcurrentBufferPool::builder().initial_slots(0).build();

        assert_eq!(pool.slot_count().unwrap(), 0);

        let claim = pool.claim_buffer::<u8>().unwrap();
        assert_eq!(claim.index(), 0);
        assert_eq!(pool.slot_count().unwrap(), 1);
    }

    #[test]
    #[should_panic(expected = "initial slots")]
    fn initial_slots_cannot_exceed_max() {
        let _pool = ConcurrentBufferPool::builder()
            .initial_slots(4)
            .max_slots(2)
            .build();
    }

    #[test]
    #[should_panic(expected = "at least one slot")]
    fn zero_max_slots_panics() {
        let _builder = ConcurrentBufferPool::builder().max_slots(0);
    }

    #[test]
    #[should_panic(expected = "at least 1")]
    fn zero_shrink_factor_panics() {
        let _builder = ConcurrentBufferPool::builder().shrink_factor(0);
    }

    #[test]
    #[should_panic(expected = "cannot allocate")]
    fn absurd_buffer_capacity_panics() {
        let _pool = ConcurrentBufferPool::builder()
            .initial_slots(1)
            .buffer_capacity(usize::MAX)
            .build();
    }
}
