use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// An explicitly constructed context that collects leak diagnostics from the structures that
/// were built with it.
///
/// Structures report aggregated counts when they are dropped: how many indices were never
/// returned to an index provider, how many buffers were still claimed from a pool and how many
/// rented handles were still alive. There is no process-wide registry; whoever creates the
/// tracker decides which structures report into it and when to inspect the result.
///
/// Cloning the tracker is cheap and every clone reports into the same counters.
///
/// # Examples
///
/// ```
/// use spin_pool::{CheckPolicy, LeakTracker, PackedIndexProvider};
///
/// let tracker = LeakTracker::new();
///
/// let provider = PackedIndexProvider::builder()
///     .check_policy(CheckPolicy::Lenient)
///     .leak_tracker(&tracker)
///     .build();
///
/// provider.fetch_index().unwrap();
/// provider.fetch_index().unwrap();
/// drop(provider);
///
/// assert_eq!(tracker.report().leaked_indices, 2);
/// ```
#[derive(Clone, Debug, Default)]
pub struct LeakTracker {
    counters: Arc<Counters>,
}

#[derive(Debug, Default)]
struct Counters {
    indices: AtomicUsize,
    claims: AtomicUsize,
    rentals: AtomicUsize,
}

/// A snapshot of the leaks collected by a [`LeakTracker`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub struct LeakReport {
    /// Indices that were fetched from an index provider and never returned.
    pub leaked_indices: usize,

    /// Pool buffers that were still claimed when the pool was dropped.
    pub leaked_claims: usize,

    /// Rented handles that were still alive when their backing collection was dropped.
    pub leaked_rentals: usize,
}

impl LeakReport {
    /// Whether no leaks of any kind were recorded.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.leaked_indices == 0 && self.leaked_claims == 0 && self.leaked_rentals == 0
    }
}

impl LeakTracker {
    /// Creates a tracker with all counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the leaks recorded so far.
    #[must_use]
    pub fn report(&self) -> LeakReport {
        LeakReport {
            leaked_indices: self.counters.indices.load(Ordering::Relaxed),
            leaked_claims: self.counters.claims.load(Ordering::Relaxed),
            leaked_rentals: self.counters.rentals.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_indices(&self, count: usize) {
        self.counters.indices.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_claims(&self, count: usize) {
        self.counters.claims.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_rentals(&self, count: usize) {
        self.counters.rentals.fetch_add(count, Ordering::Relaxed);
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(LeakTracker: Send, Sync, Clone);

    #[test]
    fn starts_clean() {
        let tracker = LeakTracker::new();

        assert!(tracker.report().is_clean());
    }

    #[test]
    fn clones_share_counters() {
        let tracker = LeakTracker::new();
        let clone = tracker.clone();

        clone.record_indices(3);
        tracker.record_claims(1);
        clone.record_rentals(2);

        let report = tracker.report();
        assert_eq!(report.leaked_indices, 3);
        assert_eq!(report.leaked_claims, 1);
        assert_eq!(report.leaked_rentals, 2);
        assert!(!report.is_clean());
        assert_eq!(report, clone.report());
    }
}
