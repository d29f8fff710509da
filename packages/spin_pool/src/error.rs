use std::time::Duration;

use thiserror::Error;

/// Errors returned by the fallible operations of this crate.
///
/// Most of these describe situations that are expected to happen occasionally under load (a lock
/// could not be acquired in time, an index is out of range) and that the caller is expected to
/// recover from by skipping the work, logging or retrying later.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// A spin lock could not be acquired before the timeout elapsed.
    ///
    /// The operation was abandoned without side effects.
    #[error("timed out after {timeout:?} waiting for the {lock} lock")]
    LockTimeout {
        /// Human-readable name of the lock that could not be acquired.
        lock: &'static str,

        /// How long the caller was willing to wait.
        timeout: Duration,
    },

    /// An element index was outside the valid range of the collection.
    #[error("index {index} is out of bounds for length {len}")]
    IndexOutOfBounds {
        /// The index the caller asked for.
        index: usize,

        /// The length of the collection at the time of the call.
        len: usize,
    },

    /// An index provider cannot hand out any more indices without exceeding its ceiling.
    #[error("all indices up to and including {max_index} are already taken")]
    IndexExhausted {
        /// The highest index the provider is allowed to issue.
        max_index: usize,
    },

    /// An attempt was made to lower the index ceiling below indices that were already issued.
    #[error(
        "cannot lower the maximum index to {requested} because indices up to {frontier} have already been issued"
    )]
    MaxIndexBelowFrontier {
        /// The ceiling the caller asked for.
        requested: usize,

        /// The next index that would be minted; every index below it may be in use.
        frontier: usize,
    },

    /// Backing storage could not be moved or recycled because handles to it are still rented out
    /// and the rental policy forbids invalidating them.
    #[error("{count} outstanding rentals prevent the backing storage from being moved")]
    OutstandingRentals {
        /// How many rented handles are still alive.
        count: usize,
    },

    /// The pool issued a slot that its bookkeeping already considers claimed.
    ///
    /// This indicates corrupted pool state. The slot is left to its current owner.
    #[error("slot {index} was issued while it was already claimed")]
    AlreadyClaimed {
        /// The slot that was issued twice.
        index: usize,
    },

    /// A handle was used after its key was disposed or after the memory it points to was released.
    #[error("the handle has been invalidated")]
    InvalidHandle,

    /// A size calculation overflowed or exceeded what the allocator can provide.
    #[error("a buffer of {requested} elements exceeds the maximum supported size")]
    CapacityOverflow {
        /// The number of elements the operation needed room for.
        requested: usize,
    },
}

/// A specialized `Result` type for this crate, returning the crate's [`Error`] type as the error
/// value.
pub(crate) type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Error: Send, Sync, Debug, Clone);

    #[test]
    fn lock_timeout_names_the_lock() {
        let error = Error::LockTimeout {
            lock: "claimed set",
            timeout: Duration::from_millis(5),
        };

        let message = error.to_string();
        assert!(message.contains("claimed set"));
        assert!(message.contains("5ms"));
    }

    #[test]
    fn out_of_bounds_mentions_index_and_length() {
        let error = Error::IndexOutOfBounds { index: 7, len: 3 };

        assert_eq!(error.to_string(), "index 7 is out of bounds for length 3");
    }
}
