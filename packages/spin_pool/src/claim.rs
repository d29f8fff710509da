use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ptr::{self, NonNull};
use std::{fmt, result, slice};

use crate::{
    BufferElement, ConcurrentBufferPool, Error, HandleKey, RentalPolicy, Result, SafeHandle,
    SubBuffer, assert_storable, live_rentals,
};

/// Exclusive, typed access to one buffer claimed from a [`ConcurrentBufferPool`].
///
/// The claim is a non-owning view: the memory belongs to the pool and outlives the claim, to be
/// handed to the next claimant after this one is released. While the claim exists, its holder is
/// the only one touching the memory, so none of the list-like operations take any lock.
///
/// The underlying storage is untyped bytes. The claim translates element indices into byte
/// offsets using the size of `T` as the stride, which is validated once when the claim is
/// created.
///
/// The claim is released when dropped, waiting for the pool bookkeeping for as long as it takes.
/// Use [`release()`][Self::release] to release with the configured lock timeout instead.
///
/// # Examples
///
/// ```
/// use spin_pool::ConcurrentBufferPool;
///
/// let pool = ConcurrentBufferPool::builder().buffer_capacity(64).build();
///
/// let mut claim = pool.claim_buffer::<u32>().unwrap();
/// claim.push(10).unwrap();
/// claim.push(30).unwrap();
/// claim.insert(1, 20).unwrap();
///
/// assert_eq!(claim.as_slice(), &[10, 20, 30]);
/// assert_eq!(claim.remove(0).unwrap(), 10);
/// assert_eq!(claim.get(0), Some(20));
///
/// claim.release().unwrap();
/// ```
pub struct BufferClaim<'p, T: BufferElement> {
    pool: &'p ConcurrentBufferPool,
    index: usize,
    buffer: NonNull<SubBuffer>,

    /// Shared by every handle rented out from this claim. Disposed whenever elements move.
    rentals: Option<HandleKey>,

    _element: PhantomData<T>,
}

/// A detached claim, identified only by its slot index.
///
/// Obtained from [`BufferClaim::into_raw()`] for callers that need to keep track of a claim
/// without holding a borrow of the pool. Turn it back into a [`BufferClaim`] with
/// [`ConcurrentBufferPool::claim_from_raw()`] or release it with
/// [`ConcurrentBufferPool::release_raw()`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct RawClaim {
    index: usize,
}

impl RawClaim {
    pub(crate) fn new(index: usize) -> Self {
        Self { index }
    }

    /// The pool slot this claim refers to.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }
}

impl<'p, T: BufferElement> BufferClaim<'p, T> {
    const STRIDE: usize = size_of::<T>();

    /// # Safety
    ///
    /// The caller must have recorded `index` as claimed on behalf of the new claim, and `buffer`
    /// must point to the sub-buffer of that slot.
    pub(crate) unsafe fn new(
        pool: &'p ConcurrentBufferPool,
        index: usize,
        buffer: NonNull<SubBuffer>,
    ) -> Self {
        assert_storable::<T>();

        Self {
            pool,
            index,
            buffer,
            rentals: None,
            _element: PhantomData,
        }
    }

    fn sub_buffer(&self) -> &SubBuffer {
        // SAFETY: The claim owns the slot, so nobody else accesses the sub-buffer while we live.
        unsafe { self.buffer.as_ref() }
    }

    fn sub_buffer_mut(&mut self) -> &mut SubBuffer {
        // SAFETY: The claim owns the slot and `&mut self` makes this reference unique.
        unsafe { self.buffer.as_mut() }
    }

    fn base(&self) -> *mut T {
        // The sub-buffer is aligned to BUFFER_ALIGN, which assert_storable() checked against T.
        self.sub_buffer().data().as_ptr().cast::<T>()
    }

    /// A partial trailing element is not an element.
    fn whole_elements(bytes: usize) -> usize {
        // The stride is never zero, assert_storable() rejects zero-sized types.
        bytes.checked_div(Self::STRIDE).unwrap_or_default()
    }

    /// The pool slot this claim occupies.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// The number of elements in the buffer.
    #[must_use]
    pub fn len(&self) -> usize {
        Self::whole_elements(self.sub_buffer().len())
    }

    /// Whether the buffer contains no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sub_buffer().len() == 0
    }

    /// The number of elements the buffer can hold without moving to a larger allocation.
    #[must_use]
    pub fn capacity(&self) -> usize {
        Self::whole_elements(self.sub_buffer().capacity())
    }

    /// The element at `index`, if there is one.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<T> {
        self.as_slice().get(index).copied()
    }

    /// Overwrites the element at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexOutOfBounds`] if there is no element at `index`.
    pub fn set(&mut self, index: usize, value: T) -> Result<()> {
        let len = self.len();

        let slot = self
            .as_mut_slice()
            .get_mut(index)
            .ok_or(Error::IndexOutOfBounds { index, len })?;
        *slot = value;

        Ok(())
    }

    /// Appends an element, growing the buffer if it is full.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutstandingRentals`] if growth would move elements that are rented out
    /// under [`RentalPolicy::Refuse`], and [`Error::CapacityOverflow`] if the buffer cannot grow.
    pub fn push(&mut self, value: T) -> Result<()> {
        self.insert(self.len(), value)
    }

    /// Inserts an element at `index`, shifting all elements after it to the right.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexOutOfBounds`] if `index` is greater than the length,
    /// [`Error::OutstandingRentals`] if elements would move while rented out under
    /// [`RentalPolicy::Refuse`], and [`Error::CapacityOverflow`] if the buffer cannot grow.
    pub fn insert(&mut self, index: usize, value: T) -> Result<()> {
        let len = self.len();

        if index > len {
            return Err(Error::IndexOutOfBounds { index, len });
        }

        let new_len = len
            .checked_add(1)
            .ok_or(Error::CapacityOverflow { requested: len })?;
        let required_bytes = new_len
            .checked_mul(Self::STRIDE)
            .ok_or(Error::CapacityOverflow { requested: new_len })?;

        if index < len || required_bytes > self.sub_buffer().capacity() {
            self.prepare_to_move_elements()?;
        }

        if self.sub_buffer_mut().reserve(required_bytes)? {
            tracing::debug!(
                slot = self.index,
                capacity = self.sub_buffer().capacity(),
                "pool buffer grew"
            );
        }

        let base = self.base();

        // SAFETY: We reserved room for `new_len` elements. The shifted range [index, len) moves
        // one element to the right, staying within that room.
        unsafe {
            ptr::copy(base.add(index), base.add(index.wrapping_add(1)), len.wrapping_sub(index));
        }

        // SAFETY: `index` is within the reserved room and properly aligned.
        unsafe { base.add(index).write(value) };

        // SAFETY: Exactly the first `required_bytes` bytes now hold elements; the tail beyond them
        // was zero before and we did not touch it.
        unsafe { self.sub_buffer_mut().set_len(required_bytes) };

        Ok(())
    }

    /// Removes the element at `index`, shifting all elements after it to the left.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexOutOfBounds`] if there is no element at `index`, and
    /// [`Error::OutstandingRentals`] if elements are rented out under [`RentalPolicy::Refuse`].
    pub fn remove(&mut self, index: usize) -> Result<T> {
        let len = self.len();

        if index >= len {
            return Err(Error::IndexOutOfBounds { index, len });
        }

        self.prepare_to_move_elements()?;

        let base = self.base();
        // Cannot underflow, we checked that there is at least one element above.
        let new_len = len.wrapping_sub(1);

        // SAFETY: `index` is in bounds.
        let value = unsafe { base.add(index).read() };

        // SAFETY: Both ranges lie within the first `len` elements.
        unsafe {
            ptr::copy(
                base.add(index.wrapping_add(1)),
                base.add(index),
                new_len.wrapping_sub(index),
            );
        }

        // SAFETY: The last element slot is in bounds; we wipe it to keep the tail zeroed.
        unsafe { ptr::write_bytes(base.add(new_len).cast::<u8>(), 0, Self::STRIDE) };

        // SAFETY: The bytes of the vacated slot are zero now.
        unsafe { self.sub_buffer_mut().set_len(new_len.wrapping_mul(Self::STRIDE)) };

        Ok(value)
    }

    /// Appends all elements of `values`, growing the buffer at most once.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutstandingRentals`] if growth would move elements that are rented out
    /// under [`RentalPolicy::Refuse`], and [`Error::CapacityOverflow`] if the buffer cannot grow.
    pub fn extend_from_slice(&mut self, values: &[T]) -> Result<()> {
        let len = self.len();

        let new_len = len
            .checked_add(values.len())
            .ok_or(Error::CapacityOverflow { requested: len })?;
        let required_bytes = new_len
            .checked_mul(Self::STRIDE)
            .ok_or(Error::CapacityOverflow { requested: new_len })?;

        if required_bytes > self.sub_buffer().capacity() {
            self.prepare_to_move_elements()?;
        }

        self.sub_buffer_mut().reserve(required_bytes)?;

        // SAFETY: We reserved room for `new_len` elements; the source is a separate slice.
        unsafe {
            ptr::copy_nonoverlapping(values.as_ptr(), self.base().add(len), values.len());
        }

        // SAFETY: The first `required_bytes` bytes now hold elements, the tail is untouched.
        unsafe { self.sub_buffer_mut().set_len(required_bytes) };

        Ok(())
    }

    /// Removes all elements, wiping their bytes. Invalidates every rented handle.
    pub fn clear(&mut self) {
        self.invalidate_rentals();
        self.sub_buffer_mut().clear();
    }

    /// The elements as a slice.
    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        // SAFETY: The first `len` elements are initialized values of T (every bit pattern is a
        // valid T) and we own the memory for as long as the borrow of `self` lasts.
        unsafe { slice::from_raw_parts(self.base(), self.len()) }
    }

    /// The elements as a mutable slice.
    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        let len = self.len();

        // SAFETY: As in as_slice(), plus `&mut self` makes the borrow unique.
        unsafe { slice::from_raw_parts_mut(self.base(), len) }
    }

    /// The raw bytes of the whole buffer, including the zeroed capacity beyond the elements.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.sub_buffer().bytes()
    }

    /// Rents out a handle to the element at `index`.
    ///
    /// All handles rented from one claim share a single key. The key is disposed, invalidating
    /// every handle, whenever elements move: on growth, insertion before the end, removal,
    /// clearing and release of the claim. Under [`RentalPolicy::Refuse`], operations that would
    /// move elements fail instead while any handle is still alive.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexOutOfBounds`] if there is no element at `index`.
    pub fn rent(&mut self, index: usize) -> Result<SafeHandle<T>> {
        let len = self.len();

        if index >= len {
            return Err(Error::IndexOutOfBounds { index, len });
        }

        // SAFETY: `index` is in bounds, so the pointer is within the allocation and non-null.
        let ptr = unsafe { NonNull::new_unchecked(self.base().add(index)) };

        // A renter may have disposed the shared key through its own handle.
        if self.rentals.as_ref().is_some_and(|key| !key.is_valid()) {
            self.rentals = None;
        }

        let key = self.rentals.get_or_insert_with(HandleKey::new);

        // SAFETY: The memory stays put until we dispose the key - every operation that moves
        // elements or gives up the slot calls prepare_to_move_elements() or
        // invalidate_rentals() first.
        Ok(unsafe { SafeHandle::with_key(ptr, key) })
    }

    /// The number of rented handles that are still alive and valid.
    #[must_use]
    pub fn live_rentals(&self) -> usize {
        self.rentals.as_ref().map_or(0, live_rentals)
    }

    /// Returns the buffer to the pool.
    ///
    /// The contents are wiped before anyone else can claim the buffer.
    ///
    /// # Errors
    ///
    /// Returns a [`ReleaseError`] if the pool bookkeeping could not be updated in time. The slot
    /// remains claimed and the error hands the (now empty) claim back, so the release can be
    /// retried or left to the claim's drop.
    pub fn release(self) -> result::Result<(), ReleaseError<'p, T>> {
        let mut this = ManuallyDrop::new(self);

        match this.release_inner() {
            Ok(()) => Ok(()),
            Err(error) => Err(ReleaseError {
                claim: ManuallyDrop::into_inner(this),
                error,
            }),
        }
    }

    /// Detaches the claim from its borrow of the pool, leaving the slot claimed.
    ///
    /// Every rented handle is invalidated.
    #[must_use]
    pub fn into_raw(self) -> RawClaim {
        let mut this = ManuallyDrop::new(self);
        this.invalidate_rentals();

        RawClaim::new(this.index)
    }

    fn release_inner(&mut self) -> Result<()> {
        self.invalidate_rentals();
        self.sub_buffer_mut().clear();

        self.pool.recycle_slot(self.index).map(|_was_claimed| ())
    }

    fn release_unbounded(&mut self) {
        self.invalidate_rentals();
        self.sub_buffer_mut().clear();

        self.pool.recycle_slot_unbounded(self.index);
    }

    fn invalidate_rentals(&mut self) {
        if let Some(key) = self.rentals.take() {
            let live = live_rentals(&key);
            key.dispose();

            if live > 0 {
                tracing::debug!(slot = self.index, live, "invalidated rented buffer handles");
            }
        }
    }

    /// Called before elements move. Deals with live rentals according to the pool policy.
    fn prepare_to_move_elements(&mut self) -> Result<()> {
        let live = self.live_rentals();

        if live > 0 && self.pool.rental_policy() == RentalPolicy::Refuse {
            tracing::warn!(
                slot = self.index,
                live,
                "refused to move buffer elements with live rentals"
            );
            return Err(Error::OutstandingRentals { count: live });
        }

        self.invalidate_rentals();

        Ok(())
    }
}

impl<T: BufferElement> Drop for BufferClaim<'_, T> {
    fn drop(&mut self) {
        self.release_unbounded();
    }
}

impl<T: BufferElement + fmt::Debug> fmt::Debug for BufferClaim<'_, T> {
    #[cfg_attr(coverage_nightly, coverage(off))] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferClaim")
            .field("index", &self.index)
            .field("elements", &self.as_slice())
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// A [`BufferClaim`] that could not be released because the pool was too contended.
///
/// The claim is still valid and still owns its slot. Retry with
/// [`into_claim()`][Self::into_claim] followed by [`BufferClaim::release()`], or drop the error
/// to release the claim without a deadline.
#[derive(thiserror::Error)]
#[error("failed to release pool buffer: {error}")]
pub struct ReleaseError<'p, T: BufferElement> {
    claim: BufferClaim<'p, T>,

    #[source]
    error: Error,
}

impl<'p, T: BufferElement> ReleaseError<'p, T> {
    /// Why the release failed.
    #[must_use]
    pub fn error(&self) -> &Error {
        &self.error
    }

    /// The claim that is still held, for retrying the release.
    #[must_use]
    pub fn into_claim(self) -> BufferClaim<'p, T> {
        self.claim
    }

    /// The claim that is still held and why the release failed.
    #[must_use]
    pub fn into_parts(self) -> (BufferClaim<'p, T>, Error) {
        (self.claim, self.error)
    }
}

impl<T: BufferElement> fmt::Debug for ReleaseError<'_, T> {
    #[cfg_attr(coverage_nightly, coverage(off))] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReleaseError")
            .field("slot", &self.claim.index)
            .field("error", &self.error)
            .finish()
    }
}

// SAFETY: The claim has exclusive ownership of its sub-buffer and the pool is thread-safe, so
// moving the claim to another thread is like moving a `Vec<T>` there.
unsafe impl<T: BufferElement> Send for BufferClaim<'_, T> {}

// SAFETY: Through `&BufferClaim` only reads of the owned buffer are possible.
unsafe impl<T: BufferElement> Sync for BufferClaim<'_, T> {}

#[cfg(test)]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::indexing_slicing,
    reason = "test code, be concise"
)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_impl_all;
    use tracing_test::traced_test;

    use super::*;
    use crate::CheckPolicy;

    assert_impl_all!(BufferClaim<'static, u64>: Send, Sync);
    assert_impl_all!(RawClaim: Send, Sync, Copy);

    fn pool(capacity_bytes: usize, rental_policy: RentalPolicy) -> ConcurrentBufferPool {
        ConcurrentBufferPool::builder()
            .initial_slots(2)
            .buffer_capacity(capacity_bytes)
            .rental_policy(rental_policy)
            .build()
    }

    #[test]
    fn element_stride_translates_to_bytes() {
        let pool = pool(64, RentalPolicy::Invalidate);
        let mut claim = pool.claim_buffer::<u32>().unwrap();

        assert_eq!(claim.capacity(), 16);
        assert!(claim.is_empty());

        claim.push(0x0102_0304).unwrap();
        claim.push(0x0506_0708).unwrap();

        assert_eq!(claim.len(), 2);
        assert_eq!(&claim.as_bytes()[..4], &0x0102_0304_u32.to_ne_bytes());
        assert_eq!(&claim.as_bytes()[4..8], &0x0506_0708_u32.to_ne_bytes());
        assert!(claim.as_bytes()[8..].iter().all(|&b| b == 0));
    }

    #[test]
    fn list_operations() {
        let pool = pool(64, RentalPolicy::Invalidate);
        let mut claim = pool.claim_buffer::<i64>().unwrap();

        claim.extend_from_slice(&[1, 2, 4]).unwrap();
        claim.insert(2, 3).unwrap();
        assert_eq!(claim.as_slice(), &[1, 2, 3, 4]);

        claim.set(0, -1).unwrap();
        assert_eq!(claim.get(0), Some(-1));
        assert_eq!(claim.get(4), None);

        assert_eq!(claim.remove(1).unwrap(), 2);
        assert_eq!(claim.as_slice(), &[-1, 3, 4]);

        claim.as_mut_slice()[2] = 40;
        assert_eq!(claim.get(2), Some(40));

        // The vacated slot must be wiped.
        assert!(claim.as_bytes()[3 * 8..].iter().all(|&b| b == 0));
    }

    #[test]
    fn bounds_are_checked() {
        let pool = pool(64, RentalPolicy::Invalidate);
        let mut claim = pool.claim_buffer::<u8>().unwrap();

        claim.push(1).unwrap();

        assert_eq!(
            claim.set(1, 5).unwrap_err(),
            Error::IndexOutOfBounds { index: 1, len: 1 }
        );
        assert_eq!(
            claim.insert(2, 5).unwrap_err(),
            Error::IndexOutOfBounds { index: 2, len: 1 }
        );
        assert_eq!(
            claim.remove(1).unwrap_err(),
            Error::IndexOutOfBounds { index: 1, len: 1 }
        );
        assert!(claim.rent(1).is_err());
    }

    #[test]
    fn grows_beyond_initial_capacity() {
        let pool = pool(8, RentalPolicy::Invalidate);
        let mut claim = pool.claim_buffer::<u16>().unwrap();

        for value in 0..100 {
            claim.push(value).unwrap();
        }

        assert_eq!(claim.len(), 100);
        assert!(claim.capacity() >= 100);
        assert_eq!(claim.get(99), Some(99));
    }

    #[test]
    fn clear_wipes_contents() {
        let pool = pool(16, RentalPolicy::Invalidate);
        let mut claim = pool.claim_buffer::<u8>().unwrap();

        claim.extend_from_slice(&[0xFF; 16]).unwrap();
        claim.clear();

        assert!(claim.is_empty());
        assert!(claim.as_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn rentals_survive_in_place_writes() {
        let pool = pool(64, RentalPolicy::Invalidate);
        let mut claim = pool.claim_buffer::<u32>().unwrap();

        claim.extend_from_slice(&[1, 2, 3]).unwrap();
        let handle = claim.rent(1).unwrap();
        assert_eq!(claim.live_rentals(), 1);

        claim.set(1, 20).unwrap();
        claim.push(4).unwrap();

        assert!(handle.is_valid());
        assert_eq!(unsafe { handle.try_read() }, Some(20));
    }

    #[test]
    fn moving_elements_invalidates_rentals() {
        let pool = pool(64, RentalPolicy::Invalidate);
        let mut claim = pool.claim_buffer::<u32>().unwrap();

        claim.extend_from_slice(&[1, 2, 3]).unwrap();
        let first = claim.rent(0).unwrap();
        let second = claim.rent(2).unwrap();
        assert!(first.key().is_same_key(second.key()));

        claim.remove(1).unwrap();

        assert!(!first.is_valid());
        assert!(!second.is_valid());
        assert_eq!(claim.live_rentals(), 0);

        // New rentals get a new key.
        let third = claim.rent(0).unwrap();
        assert!(third.is_valid());
        assert!(!third.key().is_same_key(first.key()));
    }

    #[test]
    fn growth_invalidates_rentals() {
        let pool = pool(4, RentalPolicy::Invalidate);
        let mut claim = pool.claim_buffer::<u32>().unwrap();

        claim.push(1).unwrap();
        let handle = claim.rent(0).unwrap();

        claim.push(2).unwrap();

        assert!(!handle.is_valid());
    }

    #[test]
    #[traced_test]
    fn refuse_policy_blocks_moves_while_rented() {
        let pool = pool(4, RentalPolicy::Refuse);
        let mut claim = pool.claim_buffer::<u32>().unwrap();

        claim.push(1).unwrap();
        let handle = claim.rent(0).unwrap();

        assert_eq!(
            claim.push(2).unwrap_err(),
            Error::OutstandingRentals { count: 1 }
        );
        assert_eq!(
            claim.remove(0).unwrap_err(),
            Error::OutstandingRentals { count: 1 }
        );
        assert!(logs_contain("refused to move buffer elements"));
        assert!(handle.is_valid());

        drop(handle);

        claim.push(2).unwrap();
        assert_eq!(claim.as_slice(), &[1, 2]);
    }

    #[test]
    fn release_invalidates_rentals_even_when_refusing() {
        let pool = pool(16, RentalPolicy::Refuse);
        let mut claim = pool.claim_buffer::<u8>().unwrap();

        claim.push(1).unwrap();
        let handle = claim.rent(0).unwrap();

        claim.release().unwrap();

        assert!(!handle.is_valid());
    }

    #[test]
    fn drop_releases_claim() {
        let pool = pool(16, RentalPolicy::Invalidate);

        {
            let mut claim = pool.claim_buffer::<u8>().unwrap();
            claim.push(1).unwrap();
            assert_eq!(pool.claimed_count().unwrap(), 1);
        }

        assert_eq!(pool.claimed_count().unwrap(), 0);
    }

    #[test]
    fn raw_round_trip() {
        let pool = ConcurrentBufferPool::builder()
            .initial_slots(1)
            .buffer_capacity(16)
            .check_policy(CheckPolicy::Strict)
            .build();

        let mut claim = pool.claim_buffer::<u8>().unwrap();
        claim.extend_from_slice(&[7, 8, 9]).unwrap();
        let handle = claim.rent(0).unwrap();

        let raw = claim.into_raw();
        assert!(!handle.is_valid());
        assert!(pool.is_claimed(raw.index()).unwrap());

        let claim = unsafe { pool.claim_from_raw::<u8>(raw) }.unwrap();
        assert_eq!(claim.as_slice(), &[7, 8, 9]);

        let raw = claim.into_raw();
        unsafe { pool.release_raw(raw) }.unwrap();

        assert_eq!(pool.claimed_count().unwrap(), 0);
    }
}
