/// Alignment of the storage behind every pool buffer. Element types with a stricter alignment
/// requirement cannot be stored in pool buffers.
pub const BUFFER_ALIGN: usize = 16;

/// Marks plain-old-data types that can be stored in the raw byte buffers of a
/// [`ConcurrentBufferPool`][crate::ConcurrentBufferPool].
///
/// Pool buffers are untyped byte storage that successive claimants reinterpret as whatever element
/// type they need. Released buffers are wiped to zero bytes before they are reused.
///
/// # Safety
///
/// Implementing types must:
///
/// * accept every bit pattern as a valid value, including all zeroes;
/// * contain no padding bytes, so that every byte of a stored value is initialized;
/// * have no drop glue and no interior mutability.
///
/// Primitive integers and floats, and arrays of them, satisfy this.
pub unsafe trait BufferElement: Copy + Send + Sync + 'static {}

macro_rules! impl_buffer_element {
    ($($t:ty),* $(,)?) => {
        $(
            // SAFETY: Primitive numeric types accept any bit pattern and have no padding.
            unsafe impl BufferElement for $t {}
        )*
    };
}

impl_buffer_element!(
    u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64
);

// SAFETY: Arrays have no padding between elements and inherit the bit validity of the element.
unsafe impl<T: BufferElement, const N: usize> BufferElement for [T; N] {}

/// Validates that `T` can be laid out in pool buffer storage.
///
/// # Panics
///
/// Panics if `T` is zero-sized or more strictly aligned than [`BUFFER_ALIGN`].
pub(crate) fn assert_storable<T: BufferElement>() {
    assert!(
        size_of::<T>() > 0,
        "zero-sized types cannot be stored in pool buffers"
    );
    assert!(
        align_of::<T>() <= BUFFER_ALIGN,
        "{} requires alignment {} but pool buffers are only aligned to {BUFFER_ALIGN}",
        std::any::type_name::<T>(),
        align_of::<T>()
    );
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn primitives_are_storable() {
        assert_storable::<u8>();
        assert_storable::<u128>();
        assert_storable::<f64>();
        assert_storable::<[u32; 3]>();
    }

    #[test]
    #[should_panic(expected = "zero-sized")]
    fn empty_arrays_are_rejected() {
        assert_storable::<[u64; 0]>();
    }
}
