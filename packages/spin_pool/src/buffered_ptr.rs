use std::fmt;
use std::marker::PhantomData;
use std::ptr::{self, NonNull};

/// Added to the pointer address to produce the check value. Any small nonzero constant works;
/// what matters is that all-zero memory does not satisfy the relation.
const CHECK_OFFSET: usize = 0x5A;

/// A pointer that carries a redundant copy of itself, so that corrupted or uninitialized
/// instances can be told apart from real ones.
///
/// Next to the raw pointer, the wrapper stores `address + K` for a fixed small constant `K`.
/// The pointer is considered valid only while that relation still holds. Zeroed memory, a
/// default-constructed instance or a torn copy that mixes the fields of two different pointers
/// essentially never satisfies it. Both fields must always be copied together - the wrapper is
/// `Copy` so that the compiler does exactly that.
///
/// No allocation takes place and validation is a single addition and comparison.
///
/// # Limitations
///
/// This detects gross corruption and reads of uninitialized slots. It does not detect a true
/// use-after-free where the allocator has reissued the same address for a similar object: the
/// stale pointer still has a perfectly valid check value.
///
/// # Examples
///
/// ```
/// use std::ptr::NonNull;
///
/// use spin_pool::BufferedPtr;
///
/// let mut value = 42_u64;
/// let ptr = BufferedPtr::new(NonNull::from(&mut value));
/// assert!(ptr.is_valid());
///
/// let empty = BufferedPtr::<u64>::default();
/// assert!(!empty.is_valid());
/// assert!(empty.get().is_none());
/// ```
#[repr(C)]
pub struct BufferedPtr<T> {
    ptr: *mut T,
    check: usize,

    _pointee: PhantomData<*mut T>,
}

impl<T> BufferedPtr<T> {
    /// Wraps a pointer, computing its check value.
    #[must_use]
    pub fn new(ptr: NonNull<T>) -> Self {
        let ptr = ptr.as_ptr();

        Self {
            ptr,
            check: check_value(ptr),
            _pointee: PhantomData,
        }
    }

    /// An instance that is never valid. Same as the default value.
    #[must_use]
    pub const fn invalid() -> Self {
        Self {
            ptr: ptr::null_mut(),
            check: 0,
            _pointee: PhantomData,
        }
    }

    /// Whether the check value still matches a fresh computation from the pointer.
    #[must_use]
    #[inline]
    pub fn is_valid(&self) -> bool {
        !self.ptr.is_null() && self.check == check_value(self.ptr)
    }

    /// The wrapped pointer if the instance is valid.
    #[must_use]
    #[inline]
    pub fn get(&self) -> Option<NonNull<T>> {
        if self.is_valid() {
            NonNull::new(self.ptr)
        } else {
            None
        }
    }

    /// The wrapped pointer, without validation. May be null or garbage.
    #[must_use]
    pub fn as_ptr_unchecked(&self) -> *mut T {
        self.ptr
    }
}

#[inline]
fn check_value<T>(ptr: *mut T) -> usize {
    ptr.addr().wrapping_add(CHECK_OFFSET)
}

impl<T> Clone for BufferedPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for BufferedPtr<T> {}

impl<T> Default for BufferedPtr<T> {
    fn default() -> Self {
        Self::invalid()
    }
}

impl<T> PartialEq for BufferedPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr && self.check == other.check
    }
}

impl<T> Eq for BufferedPtr<T> {}

impl<T> fmt::Debug for BufferedPtr<T> {
    #[cfg_attr(coverage_nightly, coverage(off))] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferedPtr")
            .field("ptr", &self.ptr)
            .field("is_valid", &self.is_valid())
            .finish()
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
    use std::mem::{self, MaybeUninit};

    use static_assertions::{assert_eq_size, assert_not_impl_any};

    use super::*;

    assert_eq_size!(BufferedPtr<u8>, [usize; 2]);

    // Raw pointers inside - the owner decides about thread safety.
    assert_not_impl_any!(BufferedPtr<u8>: Send, Sync);

    #[test]
    fn fresh_instance_is_valid() {
        let mut value = 7_u32;
        let ptr = BufferedPtr::new(NonNull::from(&mut value));

        assert!(ptr.is_valid());
        assert_eq!(ptr.get(), Some(NonNull::from(&mut value)));
        assert_eq!(unsafe { *ptr.get().unwrap().as_ptr() }, 7);
    }

    #[test]
    fn default_and_zeroed_are_invalid() {
        assert!(!BufferedPtr::<u32>::default().is_valid());
        assert!(!BufferedPtr::<u32>::invalid().is_valid());

        let zeroed: BufferedPtr<u32> = unsafe { mem::zeroed() };
        assert!(!zeroed.is_valid());
        assert!(zeroed.get().is_none());
    }

    #[test]
    fn bytewise_copy_stays_valid() {
        let mut value = 7_u32;
        let original = BufferedPtr::new(NonNull::from(&mut value));

        let mut copy = MaybeUninit::<BufferedPtr<u32>>::uninit();
        let copy = unsafe {
            ptr::copy_nonoverlapping(
                ptr::from_ref(&original).cast::<u8>(),
                copy.as_mut_ptr().cast::<u8>(),
                size_of::<BufferedPtr<u32>>(),
            );
            copy.assume_init()
        };

        assert!(copy.is_valid());
        assert_eq!(copy, original);
    }

    #[test]
    fn corrupting_either_field_invalidates() {
        let mut value = 7_u32;
        let original = BufferedPtr::new(NonNull::from(&mut value));

        let mut bad_check = original;
        bad_check.check = bad_check.check.wrapping_add(1);
        assert!(!bad_check.is_valid());

        let mut bad_ptr = original;
        bad_ptr.ptr = bad_ptr.ptr.wrapping_add(1);
        assert!(!bad_ptr.is_valid());
        assert!(bad_ptr.get().is_none());
    }

    #[test]
    fn torn_copy_is_invalid() {
        let mut first = 1_u32;
        let mut second = 2_u32;

        let a = BufferedPtr::new(NonNull::from(&mut first));
        let b = BufferedPtr::new(NonNull::from(&mut second));

        let torn = BufferedPtr::<u32> {
            ptr: a.ptr,
            check: b.check,
            _pointee: PhantomData,
        };

        assert!(!torn.is_valid());
    }
}
