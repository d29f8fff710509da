use std::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};
use std::ptr::{self, NonNull};
use std::slice;

use crate::{BUFFER_ALIGN, Error, Result};

/// Heap storage behind one pool slot.
///
/// Every byte of the allocation is initialized at all times and every byte at or beyond `len`
/// is zero. Growth and shrinking move the data to a new allocation; the header itself stays
/// where it is, which is what lets the pool keep stable pointers to it.
#[derive(Debug)]
pub(crate) struct SubBuffer {
    data: NonNull<u8>,

    /// Size of the allocation in bytes. Zero means nothing is allocated.
    capacity: usize,

    /// Bytes in use, counted from the start of the allocation.
    len: usize,
}

impl SubBuffer {
    pub(crate) fn with_capacity(capacity: usize) -> Result<Self> {
        Ok(Self {
            data: allocate_zeroed(capacity)?,
            capacity,
            len: 0,
        })
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn data(&self) -> NonNull<u8> {
        self.data
    }

    /// The whole allocation, including the zeroed bytes beyond `len`.
    pub(crate) fn bytes(&self) -> &[u8] {
        // SAFETY: The allocation is `capacity` bytes long and fully initialized. For a zero
        // capacity the pointer is dangling but well aligned, which is fine for an empty slice.
        unsafe { slice::from_raw_parts(self.data.as_ptr(), self.capacity) }
    }

    /// Sets the number of bytes in use.
    ///
    /// # Safety
    ///
    /// `len` must not exceed the capacity and every byte at or beyond `len` must be zero.
    pub(crate) unsafe fn set_len(&mut self, len: usize) {
        debug_assert!(len <= self.capacity);
        self.len = len;
    }

    /// Zeroes the bytes in use and marks the buffer empty.
    pub(crate) fn clear(&mut self) {
        // SAFETY: The first `len` bytes are within the allocation.
        unsafe { ptr::write_bytes(self.data.as_ptr(), 0, self.len) };
        self.len = 0;
    }

    /// Ensures there is room for at least `required` bytes, growing geometrically.
    ///
    /// Returns `true` if the data moved to a new allocation.
    pub(crate) fn reserve(&mut self, required: usize) -> Result<bool> {
        if required <= self.capacity {
            return Ok(false);
        }

        let new_capacity = required.max(self.capacity.saturating_mul(2));
        self.reallocate(new_capacity)?;

        Ok(true)
    }

    /// Moves the data into an allocation of exactly `capacity` bytes, if that is smaller than the
    /// current one and still large enough for the bytes in use.
    ///
    /// Returns `true` if the buffer was shrunk.
    pub(crate) fn shrink_to(&mut self, capacity: usize) -> Result<bool> {
        if capacity >= self.capacity || capacity < self.len {
            return Ok(false);
        }

        self.reallocate(capacity)?;

        Ok(true)
    }

    fn reallocate(&mut self, new_capacity: usize) -> Result<()> {
        let new_data = allocate_zeroed(new_capacity)?;

        // SAFETY: Both allocations hold at least `len` bytes and do not overlap.
        unsafe { ptr::copy_nonoverlapping(self.data.as_ptr(), new_data.as_ptr(), self.len) };

        // SAFETY: The old allocation was made by allocate_zeroed() with the old capacity.
        unsafe { deallocate(self.data, self.capacity) };

        self.data = new_data;
        self.capacity = new_capacity;

        Ok(())
    }
}

impl Drop for SubBuffer {
    fn drop(&mut self) {
        // SAFETY: The allocation was made by allocate_zeroed() with this capacity.
        unsafe { deallocate(self.data, self.capacity) };
    }
}

// SAFETY: The sub-buffer exclusively owns its allocation. Which thread may touch it is decided
// by the pool's claim bookkeeping.
unsafe impl Send for SubBuffer {}

fn layout_for(capacity: usize) -> Result<Layout> {
    Layout::from_size_align(capacity, BUFFER_ALIGN)
        .map_err(|_layout_error| Error::CapacityOverflow {
            requested: capacity,
        })
}

fn allocate_zeroed(capacity: usize) -> Result<NonNull<u8>> {
    let layout = layout_for(capacity)?;

    if capacity == 0 {
        return Ok(dangling());
    }

    // SAFETY: The layout has a nonzero size.
    let ptr = unsafe { alloc_zeroed(layout) };

    Ok(NonNull::new(ptr).unwrap_or_else(|| handle_alloc_error(layout)))
}

/// # Safety
///
/// `data` must come from `allocate_zeroed(capacity)` and must not be used afterwards.
unsafe fn deallocate(data: NonNull<u8>, capacity: usize) {
    if capacity == 0 {
        return;
    }

    // SAFETY: The same layout was valid when the memory was allocated.
    let layout = unsafe { Layout::from_size_align_unchecked(capacity, BUFFER_ALIGN) };

    // SAFETY: Forwarding the caller's guarantee that this is our allocation.
    unsafe { dealloc(data.as_ptr(), layout) };
}

/// A well aligned pointer for zero-capacity buffers. Never dereferenced for more than zero bytes.
fn dangling() -> NonNull<u8> {
    NonNull::<[u8; BUFFER_ALIGN]>::dangling().cast()
}

#[cfg(test)]
#[allow(clippy::indexing_slicing, reason = "test code, be concise")]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn fill(buffer: &mut SubBuffer, bytes: &[u8]) {
        buffer.reserve(bytes.len()).unwrap();

        // SAFETY: Reserved above.
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), buffer.data().as_ptr(), bytes.len());
            buffer.set_len(bytes.len());
        }
    }

    #[test]
    fn starts_zeroed_and_empty() {
        let buffer = SubBuffer::with_capacity(32).unwrap();

        assert_eq!(buffer.len(), 0);
        assert_eq!(buffer.capacity(), 32);
        assert!(buffer.bytes().iter().all(|&b| b == 0));
        assert_eq!(buffer.data().as_ptr().addr() % BUFFER_ALIGN, 0);
    }

    #[test]
    fn zero_capacity_is_allowed() {
        let mut buffer = SubBuffer::with_capacity(0).unwrap();

        assert!(buffer.bytes().is_empty());

        fill(&mut buffer, &[1, 2, 3]);
        assert_eq!(&buffer.bytes()[..3], &[1, 2, 3]);
    }

    #[test]
    fn growth_preserves_data_and_zero_tail() {
        let mut buffer = SubBuffer::with_capacity(4).unwrap();
        fill(&mut buffer, &[9, 8, 7, 6]);

        assert!(buffer.reserve(5).unwrap());
        assert_eq!(buffer.capacity(), 8);
        assert_eq!(buffer.bytes(), &[9, 8, 7, 6, 0, 0, 0, 0]);

        assert!(!buffer.reserve(8).unwrap());
    }

    #[test]
    fn clear_wipes_used_bytes() {
        let mut buffer = SubBuffer::with_capacity(8).unwrap();
        fill(&mut buffer, &[1; 8]);

        buffer.clear();

        assert_eq!(buffer.len(), 0);
        assert!(buffer.bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn shrink_respects_bytes_in_use() {
        let mut buffer = SubBuffer::with_capacity(64).unwrap();
        fill(&mut buffer, &[5; 10]);

        assert!(!buffer.shrink_to(8).unwrap());
        assert!(!buffer.shrink_to(64).unwrap());

        assert!(buffer.shrink_to(16).unwrap());
        assert_eq!(buffer.capacity(), 16);
        assert_eq!(&buffer.bytes()[..10], &[5; 10]);
        assert!(buffer.bytes()[10..].iter().all(|&b| b == 0));
    }

    #[test]
    fn absurd_capacity_is_an_error() {
        assert_eq!(
            SubBuffer::with_capacity(usize::MAX).unwrap_err(),
            Error::CapacityOverflow {
                requested: usize::MAX
            }
        );
    }
}
