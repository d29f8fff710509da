use std::marker::PhantomData;
use std::ptr::NonNull;
use std::slice;
use std::time::Duration;

use foldhash::HashMap;

use crate::{
    CheckPolicy, Error, HandleKey, LeakTracker, RawRwSpinLock, ReadGuard, RentalPolicy, Result,
    RwSpinLock, SafeHandle, WriteGuard, live_rentals,
};

/// A growable list guarded by a [`RwSpinLock`], shareable between threads.
///
/// The list offers its operations in three forms:
///
/// * Safe, one call per operation: each call acquires the lock, spinning for at most the given
///   timeout, and fails with [`Error::LockTimeout`] if that was not enough.
/// * Batched: [`read()`][Self::read] and [`write()`][Self::write] acquire the lock once and hand
///   out a guard that performs any number of operations before releasing it.
/// * Unsynchronized: `unsafe` methods ending in `_unsynchronized` that assume the caller already
///   holds the lock, entered manually through [`raw_lock()`][Self::raw_lock].
///
/// Elements can be rented out as [`SafeHandle`]s. Each slot has its own key, which is disposed
/// when the element in that slot moves: on insertion or removal at or before the slot, when the
/// backing storage reallocates and when the list is cleared.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use spin_pool::ConcurrentList;
///
/// let list = ConcurrentList::new();
/// let timeout = Duration::from_millis(1);
///
/// list.push("a", timeout).unwrap();
/// list.push("c", timeout).unwrap();
/// list.insert(1, "b", timeout).unwrap();
///
/// {
///     let items = list.read(timeout).unwrap();
///     assert_eq!(items.as_slice(), &["a", "b", "c"]);
/// }
///
/// assert_eq!(list.remove(0, timeout).unwrap(), "a");
/// assert_eq!(list.len(timeout).unwrap(), 2);
/// ```
#[derive(Debug)]
pub struct ConcurrentList<T> {
    state: RwSpinLock<ListState<T>>,

    rental_policy: RentalPolicy,
    check_policy: CheckPolicy,
    leak_tracker: Option<LeakTracker>,
}

#[derive(Debug)]
struct ListState<T> {
    items: Vec<T>,

    /// Keys of rented slots. An entry exists from the first rental of a slot until the element
    /// in it moves.
    rentals: HashMap<usize, HandleKey>,
}

impl<T> ListState<T> {
    fn out_of_bounds(&self, index: usize) -> Error {
        Error::IndexOutOfBounds {
            index,
            len: self.items.len(),
        }
    }

    fn set(&mut self, index: usize, value: T) -> Result<()> {
        let error = self.out_of_bounds(index);
        *self.items.get_mut(index).ok_or(error)? = value;

        Ok(())
    }

    fn push(&mut self, value: T, policy: RentalPolicy) -> Result<()> {
        if self.items.len() == self.items.capacity() {
            self.release_rentals(0, policy)?;
        }

        self.items.push(value);

        Ok(())
    }

    fn insert(&mut self, index: usize, value: T, policy: RentalPolicy) -> Result<()> {
        if index > self.items.len() {
            return Err(self.out_of_bounds(index));
        }

        let first_moved = if self.items.len() == self.items.capacity() {
            0
        } else {
            index
        };

        self.release_rentals(first_moved, policy)?;
        self.items.insert(index, value);

        Ok(())
    }

    fn remove(&mut self, index: usize, policy: RentalPolicy) -> Result<T> {
        if index >= self.items.len() {
            return Err(self.out_of_bounds(index));
        }

        self.release_rentals(index, policy)?;

        Ok(self.items.remove(index))
    }

    fn clear(&mut self) {
        self.invalidate_rentals();
        self.items.clear();
    }

    fn reserve(&mut self, additional: usize, policy: RentalPolicy) -> Result<()> {
        // Cannot underflow, the length never exceeds the capacity.
        let spare = self.items.capacity().wrapping_sub(self.items.len());

        if spare >= additional {
            return Ok(());
        }

        self.release_rentals(0, policy)?;

        self.items
            .try_reserve(additional)
            .map_err(|_reserve_error| Error::CapacityOverflow {
                requested: additional,
            })
    }

    fn rent(&mut self, index: usize) -> Result<SafeHandle<T>> {
        let error = self.out_of_bounds(index);
        let ptr = NonNull::from(self.items.get_mut(index).ok_or(error)?);

        let key = self.rentals.entry(index).or_default();

        // A renter may have disposed the key through its own handle.
        if !key.is_valid() {
            *key = HandleKey::new();
        }

        // SAFETY: The element stays at this address until it moves, and every operation that
        // moves elements disposes the keys of the affected slots first.
        Ok(unsafe { SafeHandle::with_key(ptr, key) })
    }

    fn live_rentals(&self) -> usize {
        self.rentals.values().map(live_rentals).sum()
    }

    /// Called before the elements in slots `first_moved..` move.
    fn release_rentals(&mut self, first_moved: usize, policy: RentalPolicy) -> Result<()> {
        if policy == RentalPolicy::Refuse {
            let live = self
                .rentals
                .iter()
                .filter(|&(&slot, _)| slot >= first_moved)
                .map(|(_, key)| live_rentals(key))
                .sum::<usize>();

            if live > 0 {
                return Err(Error::OutstandingRentals { count: live });
            }
        }

        self.rentals.retain(|&slot, key| {
            if slot < first_moved {
                return true;
            }

            key.dispose();
            false
        });

        Ok(())
    }

    fn invalidate_rentals(&mut self) {
        for (_, key) in self.rentals.drain() {
            key.dispose();
        }
    }
}

impl<T> ConcurrentList<T> {
    /// Creates an empty list with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Starts building a list with a custom configuration.
    pub fn builder() -> ConcurrentListBuilder<T> {
        ConcurrentListBuilder::new()
    }

    /// Returns a clone of the element at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexOutOfBounds`] if there is no element at `index` and
    /// [`Error::LockTimeout`] if the lock could not be acquired in time.
    pub fn get(&self, index: usize, timeout: Duration) -> Result<T>
    where
        T: Clone,
    {
        let state = self.state.read(timeout)?;

        state
            .items
            .get(index)
            .cloned()
            .ok_or_else(|| state.out_of_bounds(index))
    }

    /// Overwrites the element at `index`. Rentals of the slot stay valid and observe the new
    /// value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexOutOfBounds`] if there is no element at `index` and
    /// [`Error::LockTimeout`] if the lock could not be acquired in time.
    pub fn set(&self, index: usize, value: T, timeout: Duration) -> Result<()> {
        self.with_state(timeout, |state, _| state.set(index, value))
    }

    /// Appends an element.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutstandingRentals`] if the storage must grow while elements are rented
    /// out under [`RentalPolicy::Refuse`], and [`Error::LockTimeout`] if the lock could not be
    /// acquired in time.
    pub fn push(&self, value: T, timeout: Duration) -> Result<()> {
        self.with_state(timeout, |state, policy| state.push(value, policy))
    }

    /// Inserts an element at `index`, shifting all elements after it to the right.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexOutOfBounds`] if `index` is greater than the length,
    /// [`Error::OutstandingRentals`] if rented elements would move under
    /// [`RentalPolicy::Refuse`], and [`Error::LockTimeout`] if the lock could not be acquired in
    /// time.
    pub fn insert(&self, index: usize, value: T, timeout: Duration) -> Result<()> {
        self.with_state(timeout, |state, policy| state.insert(index, value, policy))
    }

    /// Removes and returns the element at `index`, shifting all elements after it to the left.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexOutOfBounds`] if there is no element at `index`,
    /// [`Error::OutstandingRentals`] if rented elements would move under
    /// [`RentalPolicy::Refuse`], and [`Error::LockTimeout`] if the lock could not be acquired in
    /// time.
    pub fn remove(&self, index: usize, timeout: Duration) -> Result<T> {
        self.with_state(timeout, |state, policy| state.remove(index, policy))
    }

    /// Removes all elements. Invalidates every rental regardless of the rental policy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockTimeout`] if the lock could not be acquired in time.
    pub fn clear(&self, timeout: Duration) -> Result<()> {
        self.with_state(timeout, |state, _| {
            state.clear();
            Ok(())
        })
    }

    /// Makes room for at least `additional` more elements.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutstandingRentals`] if the storage must grow while elements are rented
    /// out under [`RentalPolicy::Refuse`], [`Error::CapacityOverflow`] if the storage cannot grow
    /// that much and [`Error::LockTimeout`] if the lock could not be acquired in time.
    pub fn reserve(&self, additional: usize, timeout: Duration) -> Result<()> {
        self.with_state(timeout, |state, policy| state.reserve(additional, policy))
    }

    /// The number of elements.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockTimeout`] if the lock could not be acquired in time.
    pub fn len(&self, timeout: Duration) -> Result<usize> {
        Ok(self.state.read(timeout)?.items.len())
    }

    /// Whether the list contains no elements.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockTimeout`] if the lock could not be acquired in time.
    pub fn is_empty(&self, timeout: Duration) -> Result<bool> {
        Ok(self.state.read(timeout)?.items.is_empty())
    }

    /// The number of elements the list can hold without reallocating.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockTimeout`] if the lock could not be acquired in time.
    pub fn capacity(&self, timeout: Duration) -> Result<usize> {
        Ok(self.state.read(timeout)?.items.capacity())
    }

    /// Rents out a handle to the element at `index`.
    ///
    /// The handle stays valid until the element moves or the list is cleared or dropped. Reading
    /// through the handle is `unsafe`; see [`SafeHandle`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexOutOfBounds`] if there is no element at `index` and
    /// [`Error::LockTimeout`] if the lock could not be acquired in time.
    pub fn rent(&self, index: usize, timeout: Duration) -> Result<SafeHandle<T>> {
        self.with_state(timeout, |state, _| state.rent(index))
    }

    /// The number of rented handles that are alive and still valid.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockTimeout`] if the lock could not be acquired in time.
    pub fn live_rentals(&self, timeout: Duration) -> Result<usize> {
        Ok(self.state.read(timeout)?.live_rentals())
    }

    /// Acquires shared access for a batch of read operations.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockTimeout`] if the lock could not be acquired in time.
    pub fn read(&self, timeout: Duration) -> Result<ListReader<'_, T>> {
        Ok(ListReader {
            state: self.state.read(timeout)?,
        })
    }

    /// Acquires exclusive access for a batch of operations.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockTimeout`] if the lock could not be acquired in time.
    pub fn write(&self, timeout: Duration) -> Result<ListWriter<'_, T>> {
        Ok(ListWriter {
            state: self.state.write(timeout)?,
            rental_policy: self.rental_policy,
        })
    }

    /// Returns an iterator over clones of the elements.
    ///
    /// The iterator holds the read lock for its entire lifetime and releases it when dropped,
    /// also when iteration is abandoned early or by a panic. Requesting exclusive access to the
    /// same list while the iterator is alive on the same thread can never succeed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockTimeout`] if the lock could not be acquired in time.
    pub fn iter(&self, timeout: Duration) -> Result<ListIter<'_, T>>
    where
        T: Clone,
    {
        Ok(ListIter {
            state: self.state.read(timeout)?,
            position: 0,
        })
    }

    /// The lock guarding the list, for use with the `_unsynchronized` methods.
    #[must_use]
    pub fn raw_lock(&self) -> &RawRwSpinLock {
        self.state.raw()
    }

    /// Returns the element at `index` without acquiring the lock.
    ///
    /// # Safety
    ///
    /// The caller must hold the lock returned by [`raw_lock()`][Self::raw_lock], in any mode, for
    /// as long as the returned reference exists.
    #[must_use]
    pub unsafe fn get_unsynchronized(&self, index: usize) -> Option<&T> {
        // SAFETY: Forwarding the caller's guarantee.
        unsafe { self.state.get_unsynchronized() }.items.get(index)
    }

    /// Returns the number of elements without acquiring the lock.
    ///
    /// # Safety
    ///
    /// The caller must hold the lock returned by [`raw_lock()`][Self::raw_lock], in any mode.
    #[must_use]
    pub unsafe fn len_unsynchronized(&self) -> usize {
        // SAFETY: Forwarding the caller's guarantee.
        unsafe { self.state.get_unsynchronized() }.items.len()
    }

    /// Returns the capacity without acquiring the lock.
    ///
    /// # Safety
    ///
    /// The caller must hold the lock returned by [`raw_lock()`][Self::raw_lock], in any mode.
    #[must_use]
    pub unsafe fn capacity_unsynchronized(&self) -> usize {
        // SAFETY: Forwarding the caller's guarantee.
        unsafe { self.state.get_unsynchronized() }.items.capacity()
    }

    /// Overwrites the element at `index` without acquiring the lock.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexOutOfBounds`] if there is no element at `index`.
    ///
    /// # Safety
    ///
    /// The caller must hold the lock returned by [`raw_lock()`][Self::raw_lock] in exclusive
    /// mode and must not hold any reference obtained from
    /// [`get_unsynchronized()`][Self::get_unsynchronized].
    pub unsafe fn set_unsynchronized(&self, index: usize, value: T) -> Result<()> {
        // SAFETY: Forwarding the caller's guarantee.
        unsafe { self.state.get_mut_unsynchronized() }.set(index, value)
    }

    /// Appends an element without acquiring the lock.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutstandingRentals`] if the storage must grow while elements are rented
    /// out under [`RentalPolicy::Refuse`].
    ///
    /// # Safety
    ///
    /// Same as for [`set_unsynchronized()`][Self::set_unsynchronized].
    pub unsafe fn push_unsynchronized(&self, value: T) -> Result<()> {
        // SAFETY: Forwarding the caller's guarantee.
        unsafe { self.state.get_mut_unsynchronized() }.push(value, self.rental_policy)
    }

    /// Inserts an element at `index` without acquiring the lock.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexOutOfBounds`] if `index` is greater than the length and
    /// [`Error::OutstandingRentals`] if rented elements would move under
    /// [`RentalPolicy::Refuse`].
    ///
    /// # Safety
    ///
    /// Same as for [`set_unsynchronized()`][Self::set_unsynchronized].
    pub unsafe fn insert_unsynchronized(&self, index: usize, value: T) -> Result<()> {
        // SAFETY: Forwarding the caller's guarantee.
        unsafe { self.state.get_mut_unsynchronized() }.insert(index, value, self.rental_policy)
    }

    /// Removes the element at `index` without acquiring the lock.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexOutOfBounds`] if there is no element at `index` and
    /// [`Error::OutstandingRentals`] if rented elements would move under
    /// [`RentalPolicy::Refuse`].
    ///
    /// # Safety
    ///
    /// Same as for [`set_unsynchronized()`][Self::set_unsynchronized].
    pub unsafe fn remove_unsynchronized(&self, index: usize) -> Result<T> {
        // SAFETY: Forwarding the caller's guarantee.
        unsafe { self.state.get_mut_unsynchronized() }.remove(index, self.rental_policy)
    }

    /// Removes all elements without acquiring the lock.
    ///
    /// # Safety
    ///
    /// Same as for [`set_unsynchronized()`][Self::set_unsynchronized].
    pub unsafe fn clear_unsynchronized(&self) {
        // SAFETY: Forwarding the caller's guarantee.
        unsafe { self.state.get_mut_unsynchronized() }.clear();
    }

    /// Runs `op` under the exclusive lock and logs refused rentals after the lock is released.
    fn with_state<R>(
        &self,
        timeout: Duration,
        op: impl FnOnce(&mut ListState<T>, RentalPolicy) -> Result<R>,
    ) -> Result<R> {
        let result = {
            let mut state = self.state.write(timeout)?;
            op(&mut state, self.rental_policy)
        };

        if let Err(Error::OutstandingRentals { count }) = &result {
            tracing::warn!(count, "refused to move list elements with live rentals");
        }

        result
    }
}

impl<T> Default for ConcurrentList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for ConcurrentList<T> {
    fn drop(&mut self) {
        let state = self.state.get_mut();

        let leaked = state.live_rentals();
        state.invalidate_rentals();

        if leaked == 0 {
            return;
        }

        tracing::warn!(leaked, "concurrent list dropped with live rentals");

        if let Some(tracker) = &self.leak_tracker {
            tracker.record_rentals(leaked);
        }

        self.check_policy.escalate(&format!(
            "concurrent list dropped with {leaked} live rentals"
        ));
    }
}

/// Shared access to a [`ConcurrentList`] for a batch of reads.
///
/// The read lock is released when this is dropped.
#[derive(Debug)]
pub struct ListReader<'a, T> {
    state: ReadGuard<'a, ListState<T>>,
}

impl<T> ListReader<'_, T> {
    /// The element at `index`, if there is one.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&T> {
        self.state.items.get(index)
    }

    /// The number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.items.len()
    }

    /// Whether the list contains no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.items.is_empty()
    }

    /// The number of elements the list can hold without reallocating.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.state.items.capacity()
    }

    /// The elements as a slice.
    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        &self.state.items
    }

    /// Iterates over references to the elements.
    pub fn iter(&self) -> slice::Iter<'_, T> {
        self.state.items.iter()
    }
}

impl<'r, T> IntoIterator for &'r ListReader<'_, T> {
    type Item = &'r T;
    type IntoIter = slice::Iter<'r, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Exclusive access to a [`ConcurrentList`] for a batch of operations.
///
/// The lock is released when this is dropped.
#[derive(Debug)]
pub struct ListWriter<'a, T> {
    state: WriteGuard<'a, ListState<T>>,
    rental_policy: RentalPolicy,
}

impl<T> ListWriter<'_, T> {
    /// The element at `index`, if there is one.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&T> {
        self.state.items.get(index)
    }

    /// The element at `index` for in-place modification, if there is one.
    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.state.items.get_mut(index)
    }

    /// The number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.items.len()
    }

    /// Whether the list contains no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.items.is_empty()
    }

    /// The number of elements the list can hold without reallocating.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.state.items.capacity()
    }

    /// The elements as a slice.
    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        &self.state.items
    }

    /// Overwrites the element at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexOutOfBounds`] if there is no element at `index`.
    pub fn set(&mut self, index: usize, value: T) -> Result<()> {
        self.state.set(index, value)
    }

    /// Appends an element.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutstandingRentals`] if the storage must grow while elements are rented
    /// out under [`RentalPolicy::Refuse`].
    pub fn push(&mut self, value: T) -> Result<()> {
        self.state.push(value, self.rental_policy)
    }

    /// Inserts an element at `index`, shifting all elements after it to the right.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexOutOfBounds`] if `index` is greater than the length and
    /// [`Error::OutstandingRentals`] if rented elements would move under
    /// [`RentalPolicy::Refuse`].
    pub fn insert(&mut self, index: usize, value: T) -> Result<()> {
        self.state.insert(index, value, self.rental_policy)
    }

    /// Removes and returns the element at `index`, shifting all elements after it to the left.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexOutOfBounds`] if there is no element at `index` and
    /// [`Error::OutstandingRentals`] if rented elements would move under
    /// [`RentalPolicy::Refuse`].
    pub fn remove(&mut self, index: usize) -> Result<T> {
        self.state.remove(index, self.rental_policy)
    }

    /// Removes all elements, invalidating every rental.
    pub fn clear(&mut self) {
        self.state.clear();
    }

    /// Makes room for at least `additional` more elements.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutstandingRentals`] if the storage must grow while elements are rented
    /// out under [`RentalPolicy::Refuse`] and [`Error::CapacityOverflow`] if the storage cannot
    /// grow that much.
    pub fn reserve(&mut self, additional: usize) -> Result<()> {
        self.state.reserve(additional, self.rental_policy)
    }

    /// Rents out a handle to the element at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexOutOfBounds`] if there is no element at `index`.
    pub fn rent(&mut self, index: usize) -> Result<SafeHandle<T>> {
        self.state.rent(index)
    }
}

/// Iterator over clones of the elements of a [`ConcurrentList`], holding its read lock.
///
/// Returned by [`ConcurrentList::iter()`].
#[derive(Debug)]
pub struct ListIter<'a, T> {
    state: ReadGuard<'a, ListState<T>>,
    position: usize,
}

impl<T: Clone> Iterator for ListIter<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.state.items.get(self.position)?.clone();

        // Cannot overflow, bounded by the length of the list.
        self.position = self.position.wrapping_add(1);

        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.state.items.len().saturating_sub(self.position);
        (remaining, Some(remaining))
    }
}

impl<T: Clone> ExactSizeIterator for ListIter<'_, T> {}

/// Builder for creating an instance of [`ConcurrentList`].
///
/// # Examples
///
/// ```
/// use spin_pool::{ConcurrentList, RentalPolicy};
///
/// let list = ConcurrentList::<u64>::builder()
///     .initial_capacity(128)
///     .rental_policy(RentalPolicy::Refuse)
///     .build();
/// ```
#[derive(Debug)]
#[must_use]
pub struct ConcurrentListBuilder<T> {
    initial_capacity: usize,
    rental_policy: RentalPolicy,
    check_policy: CheckPolicy,
    leak_tracker: Option<LeakTracker>,

    _items: PhantomData<fn() -> T>,
}

impl<T> ConcurrentListBuilder<T> {
    fn new() -> Self {
        Self {
            initial_capacity: 0,
            rental_policy: RentalPolicy::default(),
            check_policy: CheckPolicy::default(),
            leak_tracker: None,
            _items: PhantomData,
        }
    }

    /// Sets how many elements the list can hold before it first reallocates. Defaults to zero.
    pub fn initial_capacity(mut self, capacity: usize) -> Self {
        self.initial_capacity = capacity;
        self
    }

    /// Sets what happens to rented handles when elements need to move.
    pub fn rental_policy(mut self, policy: RentalPolicy) -> Self {
        self.rental_policy = policy;
        self
    }

    /// Sets how the list reacts to detected lifecycle bugs.
    pub fn check_policy(mut self, policy: CheckPolicy) -> Self {
        self.check_policy = policy;
        self
    }

    /// Reports rentals that are still alive when the list is dropped into the given tracker.
    pub fn leak_tracker(mut self, tracker: &LeakTracker) -> Self {
        self.leak_tracker = Some(tracker.clone());
        self
    }

    /// Builds the list.
    #[must_use]
    pub fn build(self) -> ConcurrentList<T> {
        ConcurrentList {
            state: RwSpinLock::named(
                "concurrent list",
                ListState {
                    items: Vec::with_capacity(self.initial_capacity),
                    rentals: HashMap::default(),
                },
            ),
            rental_policy: self.rental_policy,
            check_policy: self.check_policy,
            leak_tracker: self.leak_tracker,
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::multiple_unsafe_ops_per_block,
    clippy::arithmetic_side_effects,
    reason = "test code, be concise"
)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::Arc;
    use std::thread;

    use static_assertions::{assert_impl_all, assert_not_impl_any};
    use testing::with_watchdog;
    use tracing_test::traced_test;

    use super::*;

    const SHORT: Duration = Duration::from_millis(5);
    const LONG: Duration = Duration::from_secs(5);

    assert_impl_all!(ConcurrentList<String>: Send, Sync);
    assert_not_impl_any!(ConcurrentList<std::cell::Cell<u32>>: Sync);

    fn list_with_capacity<T>(capacity: usize, policy: RentalPolicy) -> ConcurrentList<T> {
        ConcurrentList::builder()
            .initial_capacity(capacity)
            .rental_policy(policy)
            .check_policy(CheckPolicy::Lenient)
            .build()
    }

    #[test]
    fn safe_operations() {
        let list = ConcurrentList::new();

        assert!(list.is_empty(SHORT).unwrap());

        list.push(1, SHORT).unwrap();
        list.push(3, SHORT).unwrap();
        list.insert(1, 2, SHORT).unwrap();
        list.set(0, 10, SHORT).unwrap();

        assert_eq!(list.len(SHORT).unwrap(), 3);
        assert_eq!(list.get(0, SHORT).unwrap(), 10);
        assert_eq!(list.get(1, SHORT).unwrap(), 2);
        assert_eq!(list.remove(2, SHORT).unwrap(), 3);

        list.reserve(100, SHORT).unwrap();
        assert!(list.capacity(SHORT).unwrap() >= 102);

        list.clear(SHORT).unwrap();
        assert_eq!(list.len(SHORT).unwrap(), 0);
    }

    #[test]
    fn bounds_are_checked() {
        let list = ConcurrentList::new();
        list.push('x', SHORT).unwrap();

        assert_eq!(
            list.get(1, SHORT).unwrap_err(),
            Error::IndexOutOfBounds { index: 1, len: 1 }
        );
        assert_eq!(
            list.set(5, 'y', SHORT).unwrap_err(),
            Error::IndexOutOfBounds { index: 5, len: 1 }
        );
        assert!(list.insert(2, 'y', SHORT).is_err());
        assert!(list.remove(1, SHORT).is_err());
        assert!(list.rent(1, SHORT).is_err());
    }

    #[test]
    fn safe_operations_time_out_while_locked() {
        let list = ConcurrentList::<u32>::new();

        let writer = list.write(SHORT).unwrap();

        assert!(matches!(
            list.len(Duration::ZERO),
            Err(Error::LockTimeout {
                lock: "concurrent list",
                ..
            })
        ));
        assert!(list.push(1, Duration::ZERO).is_err());
        assert!(list.read(Duration::ZERO).is_err());

        drop(writer);

        list.push(1, Duration::ZERO).unwrap();
    }

    #[test]
    fn batch_writer_and_reader() {
        let list = ConcurrentList::new();

        {
            let mut writer = list.write(SHORT).unwrap();
            for value in 0..10 {
                writer.push(value).unwrap();
            }
            writer.remove(0).unwrap();
            writer.insert(0, 100).unwrap();
            *writer.get_mut(1).unwrap() = 200;
            assert_eq!(writer.len(), 10);
        }

        assert!(!list.raw_lock().is_locked());

        let reader = list.read(SHORT).unwrap();
        let second_reader = list.read(SHORT).unwrap();

        assert_eq!(reader.get(0), Some(&100));
        assert_eq!(second_reader.get(1), Some(&200));
        let total = (&reader).into_iter().copied().sum::<i32>();
        assert_eq!(total, 100 + 200 + (2..10).sum::<i32>());
    }

    #[test]
    fn unsynchronized_operations_under_raw_lock() {
        let list = ConcurrentList::new();

        assert!(list.raw_lock().enter_exclusive(SHORT));
        unsafe {
            list.push_unsynchronized(1).unwrap();
            list.push_unsynchronized(2).unwrap();
            list.insert_unsynchronized(0, 0).unwrap();
            list.set_unsynchronized(2, 20).unwrap();
            assert_eq!(list.remove_unsynchronized(1).unwrap(), 1);
            assert_eq!(list.len_unsynchronized(), 2);
            assert!(list.capacity_unsynchronized() >= 2);
            list.raw_lock().exit_exclusive();
        }

        assert!(list.raw_lock().enter_read(SHORT));
        unsafe {
            assert_eq!(list.get_unsynchronized(1), Some(&20));
            assert_eq!(list.get_unsynchronized(2), None);
            list.raw_lock().exit_read();
        }

        assert!(list.raw_lock().enter_exclusive(SHORT));
        unsafe {
            list.clear_unsynchronized();
            list.raw_lock().exit_exclusive();
        }

        assert!(list.is_empty(SHORT).unwrap());
    }

    #[test]
    fn iterator_holds_read_lock_until_dropped() {
        let list = ConcurrentList::new();
        for value in ["a", "b", "c"] {
            list.push(value.to_string(), SHORT).unwrap();
        }

        let mut iter = list.iter(SHORT).unwrap();
        assert_eq!(iter.len(), 3);
        assert_eq!(iter.next().as_deref(), Some("a"));

        assert!(list.raw_lock().is_locked());
        assert!(list.push("d".to_string(), Duration::ZERO).is_err());

        // Abandoned halfway.
        drop(iter);

        assert!(!list.raw_lock().is_locked());
        assert_eq!(
            list.iter(SHORT).unwrap().collect::<Vec<_>>(),
            ["a", "b", "c"]
        );
    }

    #[test]
    fn iterator_releases_lock_on_panic() {
        let list = ConcurrentList::new();
        list.push(1, SHORT).unwrap();

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut iter = list.iter(SHORT).unwrap();
            assert_eq!(iter.next(), Some(1));
            panic!("abandoned iteration");
        }));

        assert!(result.is_err());
        assert!(!list.raw_lock().is_locked());
    }

    #[test]
    fn rentals_observe_in_place_updates() {
        let list = list_with_capacity(8, RentalPolicy::Invalidate);
        list.push(1_u32, SHORT).unwrap();

        let handle = list.rent(0, SHORT).unwrap();
        list.set(0, 5, SHORT).unwrap();

        assert_eq!(unsafe { handle.try_read() }, Some(5));
        assert_eq!(list.live_rentals(SHORT).unwrap(), 1);

        drop(handle);
        assert_eq!(list.live_rentals(SHORT).unwrap(), 0);
    }

    #[test]
    fn shifts_invalidate_only_moved_slots() {
        let list = list_with_capacity(8, RentalPolicy::Invalidate);
        for value in 0..4_u32 {
            list.push(value, SHORT).unwrap();
        }

        let first = list.rent(0, SHORT).unwrap();
        let second = list.rent(1, SHORT).unwrap();
        let last = list.rent(3, SHORT).unwrap();

        list.insert(1, 100, SHORT).unwrap();

        assert!(first.is_valid());
        assert!(!second.is_valid());
        assert!(!last.is_valid());

        list.remove(0, SHORT).unwrap();
        assert!(!first.is_valid());
    }

    #[test]
    fn reallocation_invalidates_every_rental() {
        let list = list_with_capacity(1, RentalPolicy::Invalidate);
        list.push(1_u32, SHORT).unwrap();

        let handle = list.rent(0, SHORT).unwrap();
        list.push(2, SHORT).unwrap();

        assert!(!handle.is_valid());
    }

    #[test]
    fn disposed_slot_key_is_replaced_on_next_rental() {
        let list = list_with_capacity(4, RentalPolicy::Invalidate);
        list.push(1_u32, SHORT).unwrap();

        let handle = list.rent(0, SHORT).unwrap();
        handle.dispose();

        let fresh = list.rent(0, SHORT).unwrap();
        assert!(fresh.is_valid());
        assert!(!handle.is_valid());
    }

    #[test]
    #[traced_test]
    fn refuse_policy_blocks_moves() {
        let list = list_with_capacity(2, RentalPolicy::Refuse);
        list.push(1_u32, SHORT).unwrap();
        list.push(2, SHORT).unwrap();

        let handle = list.rent(1, SHORT).unwrap();

        assert_eq!(
            list.push(3, SHORT).unwrap_err(),
            Error::OutstandingRentals { count: 1 }
        );
        assert_eq!(
            list.remove(0, SHORT).unwrap_err(),
            Error::OutstandingRentals { count: 1 }
        );
        assert!(list.reserve(10, SHORT).is_err());
        assert!(logs_contain("refused to move list elements"));

        assert!(handle.is_valid());

        list.clear(SHORT).unwrap();
        assert!(!handle.is_valid());

        list.push(3, SHORT).unwrap();
    }

    #[test]
    #[traced_test]
    fn live_rentals_are_reported_on_drop() {
        let tracker = LeakTracker::new();

        let list = ConcurrentList::builder()
            .check_policy(CheckPolicy::Lenient)
            .leak_tracker(&tracker)
            .build();
        list.push(1_u32, SHORT).unwrap();

        let handle = list.rent(0, SHORT).unwrap();
        drop(list);

        assert!(!handle.is_valid());
        assert_eq!(tracker.report().leaked_rentals, 1);
        assert!(logs_contain("dropped with live rentals"));
    }

    #[test]
    fn concurrent_pushes_are_all_kept() {
        with_watchdog(|| {
            const THREADS: usize = 4;
            const PER_THREAD: usize = 500;

            let list = Arc::new(ConcurrentList::new());

            let handles = (0..THREADS)
                .map(|thread_index| {
                    let list = Arc::clone(&list);

                    thread::spawn(move || {
                        for value in 0..PER_THREAD {
                            list.push((thread_index, value), LONG).unwrap();
                        }
                    })
                })
                .collect::<Vec<_>>();

            for handle in handles {
                handle.join().unwrap();
            }

            let reader = list.read(LONG).unwrap();
            assert_eq!(reader.len(), THREADS * PER_THREAD);

            // Each thread's values stay in the order that thread pushed them.
            for thread_index in 0..THREADS {
                let values = reader
                    .iter()
                    .filter(|(owner, _)| *owner == thread_index)
                    .map(|(_, value)| *value)
                    .collect::<Vec<_>>();
                assert_eq!(values, (0..PER_THREAD).collect::<Vec<_>>());
            }
        });
    }
}
