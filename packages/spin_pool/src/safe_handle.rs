use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// The shared piece of state that decides whether a family of [`SafeHandle`]s is still valid.
///
/// A key starts out valid. Disposing it, through the key itself or through any handle that
/// references it, invalidates every handle sharing it at once. Clones of a key refer to the same
/// underlying state.
///
/// The key lives for as long as anything references it, independent of the lifetime of any
/// single handle. Dropping all handles does not dispose the key; only an explicit
/// [`dispose()`][Self::dispose] does.
#[derive(Clone)]
pub struct HandleKey {
    valid: Arc<AtomicBool>,
}

impl HandleKey {
    /// Creates a new, valid key that is not shared with anyone yet.
    #[must_use]
    pub fn new() -> Self {
        Self {
            valid: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Whether the key has not been disposed yet.
    #[must_use]
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Invalidates the key and every handle that references it.
    ///
    /// Returns `true` if this call performed the invalidation, `false` if the key was already
    /// disposed.
    pub fn dispose(&self) -> bool {
        self.valid.swap(false, Ordering::AcqRel)
    }

    /// How many copies of this key exist, including this one. Every handle holds one copy.
    #[must_use]
    pub fn share_count(&self) -> usize {
        Arc::strong_count(&self.valid)
    }

    /// Whether `other` is a copy of this key.
    #[must_use]
    pub fn is_same_key(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.valid, &other.valid)
    }
}

impl Default for HandleKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HandleKey {
    #[cfg_attr(coverage_nightly, coverage(off))] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleKey")
            .field("is_valid", &self.is_valid())
            .field("share_count", &self.share_count())
            .finish()
    }
}

/// A pointer whose validity is governed by a separately shared, disposable [`HandleKey`].
///
/// Handles are handed out by collections that let callers "rent" direct access to one of their
/// slots. The collection keeps a copy of the key and disposes it before it recycles the slot or
/// moves the memory behind it, after which every copy of the handle reports itself invalid
/// instead of pointing at stale memory.
///
/// Accessing the pointee is `unsafe`: the key tells whether the memory was given up *before* the
/// access started but cannot stop the owner from giving it up *during* the access. The caller
/// must make sure the owning collection is not being mutated concurrently.
///
/// # Examples
///
/// ```
/// use std::ptr::NonNull;
///
/// use spin_pool::SafeHandle;
///
/// let mut value = 5_u32;
///
/// // SAFETY: `value` outlives both handles.
/// let first = unsafe { SafeHandle::new(NonNull::from(&mut value)) };
/// let second = first.clone();
///
/// // SAFETY: Nothing else accesses `value` while we read through the handle.
/// assert_eq!(unsafe { second.try_read() }, Some(5));
///
/// first.dispose();
///
/// assert!(!second.is_valid());
/// // SAFETY: Same as above.
/// assert_eq!(unsafe { second.try_read() }, None);
/// ```
pub struct SafeHandle<T> {
    ptr: NonNull<T>,
    key: HandleKey,
}

impl<T> SafeHandle<T> {
    /// Wraps a pointer with a fresh key of its own.
    ///
    /// # Safety
    ///
    /// The pointer must be valid for reads and writes of `T` for as long as the key stays
    /// valid. Whoever frees or moves the memory must dispose the key first.
    #[must_use]
    pub unsafe fn new(ptr: NonNull<T>) -> Self {
        Self {
            ptr,
            key: HandleKey::new(),
        }
    }

    /// Wraps a pointer with an existing key, sharing its lifecycle.
    ///
    /// # Safety
    ///
    /// The pointer must be valid for reads and writes of `T` for as long as the key stays
    /// valid. Whoever frees or moves the memory must dispose the key first.
    #[must_use]
    pub unsafe fn with_key(ptr: NonNull<T>, key: &HandleKey) -> Self {
        Self {
            ptr,
            key: key.clone(),
        }
    }

    /// The key this handle shares with its siblings.
    #[must_use]
    pub fn key(&self) -> &HandleKey {
        &self.key
    }

    /// Whether the key of this handle has not been disposed yet.
    #[must_use]
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.key.is_valid()
    }

    /// Disposes the key, invalidating this handle and every other handle that shares the key.
    ///
    /// Returns `true` if this call performed the invalidation.
    pub fn dispose(&self) -> bool {
        self.key.dispose()
    }

    /// The pointer, if the handle is still valid.
    #[must_use]
    pub fn try_get_ptr(&self) -> Option<NonNull<T>> {
        self.is_valid().then_some(self.ptr)
    }

    /// A shared reference to the pointee, if the handle is still valid.
    ///
    /// # Safety
    ///
    /// The owner of the memory must not invalidate the key and free or move the memory while
    /// the returned reference exists, and no exclusive reference to the pointee may exist at the
    /// same time.
    #[must_use]
    pub unsafe fn try_get_ref(&self) -> Option<&T> {
        // SAFETY: Validity of the key guarantees the pointer is valid right now; the caller
        // guarantees it stays that way and that aliasing rules are upheld.
        self.try_get_ptr().map(|ptr| unsafe { ptr.as_ref() })
    }

    /// An exclusive reference to the pointee, if the handle is still valid.
    ///
    /// # Safety
    ///
    /// The owner of the memory must not invalidate the key and free or move the memory while
    /// the returned reference exists, and no other reference to the pointee (including through
    /// other handles sharing the key) may exist at the same time.
    #[must_use]
    pub unsafe fn try_get_mut(&mut self) -> Option<&mut T> {
        // SAFETY: See try_get_ref(); the caller additionally guarantees exclusivity.
        self.try_get_ptr().map(|mut ptr| unsafe { ptr.as_mut() })
    }

    /// Copies the pointee out, if the handle is still valid.
    ///
    /// # Safety
    ///
    /// The owner of the memory must not invalidate the key and free or move the memory while
    /// the read is in progress and nobody may be writing to the pointee concurrently.
    #[must_use]
    pub unsafe fn try_read(&self) -> Option<T>
    where
        T: Copy,
    {
        // SAFETY: Forwarding the caller's guarantees.
        unsafe { self.try_get_ref() }.copied()
    }

    /// Overwrites the pointee, if the handle is still valid. Returns whether the write happened.
    ///
    /// # Safety
    ///
    /// The owner of the memory must not invalidate the key and free or move the memory while
    /// the write is in progress and nobody may be accessing the pointee concurrently.
    #[must_use]
    pub unsafe fn try_write(&self, value: T) -> bool
    where
        T: Copy,
    {
        let Some(ptr) = self.try_get_ptr() else {
            return false;
        };

        // SAFETY: The key was valid, so the memory is live and initialized; the caller
        // guarantees nobody else touches it during the write. `T: Copy` means there is no
        // destructor of the old value that we would be skipping.
        unsafe { ptr.write(value) };

        true
    }
}

impl<T> Clone for SafeHandle<T> {
    fn clone(&self) -> Self {
        Self {
            ptr: self.ptr,
            key: self.key.clone(),
        }
    }
}

impl<T> fmt::Debug for SafeHandle<T> {
    #[cfg_attr(coverage_nightly, coverage(off))] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SafeHandle")
            .field("ptr", &self.ptr)
            .field("key", &self.key)
            .finish()
    }
}

// SAFETY: The handle itself is just a pointer plus an Arc; every access to the pointee is unsafe
// and the caller takes responsibility for synchronization. Moving the handle to another thread is
// equivalent to moving a `&mut T` there.
unsafe impl<T: Send> Send for SafeHandle<T> {}

// SAFETY: Sharing the handle only permits the unsafe accesses above, whose contracts require the
// caller to uphold aliasing and synchronization rules.
unsafe impl<T: Sync> Sync for SafeHandle<T> {}

/// Determines what a collection does with outstanding rentals ([`SafeHandle`]s it handed out)
/// when it needs to move or recycle the memory they point to.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum RentalPolicy {
    /// Outstanding rentals are invalidated and the operation proceeds. This is the default.
    #[default]
    Invalidate,

    /// Operations that would move memory behind a live rental fail with
    /// [`Error::OutstandingRentals`][crate::Error::OutstandingRentals].
    ///
    /// Clearing a collection or recycling a slot still invalidates rentals, since those
    /// operations cannot meaningfully be refused.
    Refuse,
}

/// How many handles (other than the copy held by the collection itself) still reference `key`,
/// provided it has not been disposed yet.
pub(crate) fn live_rentals(key: &HandleKey) -> usize {
    if key.is_valid() {
        key.share_count().saturating_sub(1)
    } else {
        0
    }
}

#[cfg(test)]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::multiple_unsafe_ops_per_block,
    reason = "test code, be concise"
)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::thread;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(HandleKey: Send, Sync, Clone);
    assert_impl_all!(SafeHandle<u64>: Send, Sync, Clone);

    #[test]
    fn fresh_handle_is_valid() {
        let mut value = 11_i32;
        let handle = unsafe { SafeHandle::new(NonNull::from(&mut value)) };

        assert!(handle.is_valid());
        assert_eq!(unsafe { handle.try_read() }, Some(11));
        assert_eq!(handle.key().share_count(), 1);
    }

    #[test]
    fn disposing_any_sharer_invalidates_all() {
        let mut value = 11_i32;
        let first = unsafe { SafeHandle::new(NonNull::from(&mut value)) };
        let second = unsafe { SafeHandle::with_key(NonNull::from(&mut value), first.key()) };
        let third = second.clone();

        assert!(first.key().is_same_key(third.key()));
        assert_eq!(first.key().share_count(), 3);

        assert!(third.dispose());
        assert!(!third.dispose());

        assert!(!first.is_valid());
        assert!(!second.is_valid());
        assert!(first.try_get_ptr().is_none());
        assert!(unsafe { second.try_get_ref() }.is_none());
    }

    #[test]
    fn unrelated_key_is_unaffected() {
        let mut a = 1_u8;
        let mut b = 2_u8;

        let first = unsafe { SafeHandle::new(NonNull::from(&mut a)) };
        let other = unsafe { SafeHandle::new(NonNull::from(&mut b)) };

        first.dispose();

        assert!(!first.is_valid());
        assert!(other.is_valid());
        assert_eq!(unsafe { other.try_read() }, Some(2));
    }

    #[test]
    fn explicit_key_owner_can_invalidate() {
        let mut value = 3_u16;
        let owner_key = HandleKey::new();

        let handle = unsafe { SafeHandle::with_key(NonNull::from(&mut value), &owner_key) };
        assert_eq!(live_rentals(&owner_key), 1);

        owner_key.dispose();

        assert!(!handle.is_valid());
        assert_eq!(live_rentals(&owner_key), 0);
    }

    #[test]
    fn writes_go_through_only_while_valid() {
        let mut value = 1_u32;
        let mut handle = unsafe { SafeHandle::new(NonNull::from(&mut value)) };

        assert!(unsafe { handle.try_write(2) });
        *unsafe { handle.try_get_mut() }.unwrap() += 1;

        handle.dispose();
        assert!(!unsafe { handle.try_write(100) });

        drop(handle);
        assert_eq!(value, 3);
    }

    #[test]
    fn invalidation_is_visible_across_threads() {
        let mut value = 0_u64;
        let handle = unsafe { SafeHandle::new(NonNull::from(&mut value)) };
        let remote = handle.clone();

        thread::spawn(move || {
            remote.dispose();
        })
        .join()
        .unwrap();

        assert!(!handle.is_valid());
    }

    #[test]
    fn dropping_handles_does_not_dispose_key() {
        let mut value = 0_u64;
        let key = HandleKey::new();

        drop(unsafe { SafeHandle::with_key(NonNull::from(&mut value), &key) });

        assert!(key.is_valid());
        assert_eq!(live_rentals(&key), 0);
    }
}
