use std::collections::BTreeMap;
use std::time::Duration;

use foldhash::{HashSet, HashSetExt};

use crate::{CheckPolicy, Error, LeakTracker, Result, RwSpinLock};

/// Hands out small integer indices and recycles returned ones.
///
/// Indices are issued densely from zero upward. Returned indices are reissued before any new
/// index is minted, most recently returned first, which keeps the set of live indices compact
/// and makes any storage addressed by them cache-friendly.
///
/// The provider is thread-safe. Every operation takes a short exclusive (or shared, for
/// introspection) spin lock and fails with [`Error::LockTimeout`] if the lock cannot be acquired
/// within the configured timeout. Each operation does a bounded amount of work under the lock;
/// the only allocations are the occasional growth of the recycle bookkeeping.
///
/// # Examples
///
/// ```
/// use spin_pool::PackedIndexProvider;
///
/// let provider = PackedIndexProvider::new();
///
/// let a = provider.fetch_index().unwrap();
/// let b = provider.fetch_index().unwrap();
/// assert_eq!((a, b), (0, 1));
///
/// provider.return_index(a).unwrap();
///
/// // The returned index is reused before a new one is minted.
/// assert_eq!(provider.fetch_index().unwrap(), 0);
/// # provider.return_index(0).unwrap();
/// # provider.return_index(1).unwrap();
/// ```
///
/// # Leak detection
///
/// When the provider is dropped, any index that was issued but never returned is reported as a
/// leak: logged, recorded in the [`LeakTracker`] if one was configured and escalated according to
/// the [`CheckPolicy`].
#[derive(Debug)]
pub struct PackedIndexProvider {
    state: RwSpinLock<ProviderState>,

    lock_timeout: Duration,
    check_policy: CheckPolicy,
    leak_tracker: Option<LeakTracker>,

    /// Structures that embed a provider report leaks in their own terms.
    report_leaks: bool,
}

#[derive(Debug)]
struct ProviderState {
    /// The next index that has never been issued. Never decreases.
    next_index: usize,

    /// The highest index we are allowed to issue.
    max_index: usize,

    /// Returned indices, all below `next_index`, in the order they were returned.
    /// The most recently returned one is at the end.
    recyclables: Vec<usize>,

    /// Mirror of `recyclables` for membership checks.
    recyclable_set: HashSet<usize>,

    /// Indices jumped over by `try_claim_index()`, as non-overlapping `start..end` ranges keyed
    /// by `start`. Issued lowest first, after the recyclables.
    skipped: BTreeMap<usize, usize>,

    /// Total number of indices in `skipped`.
    skipped_count: usize,

    /// Recyclable indices that `fetch_index()` passes over without moving them in the stack.
    held: HashSet<usize>,
}

impl ProviderState {
    fn taken_count(&self) -> usize {
        // Recyclable and skipped indices are disjoint and all below next_index.
        self.next_index
            .wrapping_sub(self.recyclables.len())
            .wrapping_sub(self.skipped_count)
    }

    fn is_taken(&self, index: usize) -> bool {
        index < self.next_index
            && !self.recyclable_set.contains(&index)
            && self.skipped_range(index).is_none()
    }

    /// The skipped range that contains `index`, if any.
    fn skipped_range(&self, index: usize) -> Option<(usize, usize)> {
        self.skipped
            .range(..=index)
            .next_back()
            .filter(|&(_, &end)| index < end)
            .map(|(&start, &end)| (start, end))
    }

    /// Position in the recycle stack of the most recently returned index that is not held.
    fn top_available(&self) -> Option<usize> {
        if self.held.is_empty() {
            self.recyclables.len().checked_sub(1)
        } else {
            self.recyclables
                .iter()
                .rposition(|index| !self.held.contains(index))
        }
    }

    fn pop_recyclable(&mut self) -> Option<usize> {
        let position = self.top_available()?;
        let index = self.recyclables.remove(position);
        self.recyclable_set.remove(&index);

        Some(index)
    }

    fn pop_skipped(&mut self) -> Option<usize> {
        let (start, end) = self.skipped.pop_first()?;

        // Cannot overflow, start < end.
        let rest = start.wrapping_add(1);
        if rest < end {
            self.skipped.insert(rest, end);
        }

        self.skipped_count = self.skipped_count.wrapping_sub(1);

        Some(start)
    }

    /// Takes `index` out of the recycle stack, wherever it is. Returns whether it was there.
    fn take_recyclable(&mut self, index: usize) -> bool {
        if self.held.contains(&index) || !self.recyclable_set.remove(&index) {
            return false;
        }

        let position = self
            .recyclables
            .iter()
            .rposition(|&candidate| candidate == index)
            .expect("recyclables and recyclable_set are always kept in sync");
        self.recyclables.remove(position);

        true
    }

    /// Takes `index` out of the skipped ranges. Returns whether it was there.
    fn take_skipped(&mut self, index: usize) -> bool {
        let Some((start, end)) = self.skipped_range(index) else {
            return false;
        };

        self.skipped.remove(&start);

        if start < index {
            self.skipped.insert(start, index);
        }

        // Cannot overflow, index < end.
        let after = index.wrapping_add(1);
        if after < end {
            self.skipped.insert(after, end);
        }

        self.skipped_count = self.skipped_count.wrapping_sub(1);

        true
    }

    fn record_return(&mut self, index: usize) -> ReturnOutcome {
        if index >= self.next_index || self.skipped_range(index).is_some() {
            ReturnOutcome::NeverIssued {
                next_index: self.next_index,
            }
        } else if self.recyclable_set.insert(index) {
            self.recyclables.push(index);
            ReturnOutcome::Recycled
        } else {
            ReturnOutcome::AlreadyReturned
        }
    }
}

/// What happened when an index was returned, logged after the lock has been released.
enum ReturnOutcome {
    Recycled,
    AlreadyReturned,
    NeverIssued { next_index: usize },
}

impl PackedIndexProvider {
    /// Creates a provider with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Starts building a provider with a custom configuration.
    pub fn builder() -> PackedIndexProviderBuilder {
        PackedIndexProviderBuilder::new()
    }

    /// Takes an index for the caller.
    ///
    /// The most recently returned index is preferred. Next come indices skipped over by
    /// [`try_claim_index()`][Self::try_claim_index], lowest first. If neither is available, the
    /// next never-issued index is minted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexExhausted`] if minting would exceed the maximum index and
    /// [`Error::LockTimeout`] if the provider is too contended.
    pub fn fetch_index(&self) -> Result<usize> {
        let mut state = self.state.write(self.lock_timeout)?;

        if let Some(index) = state.pop_recyclable() {
            return Ok(index);
        }

        if let Some(index) = state.pop_skipped() {
            return Ok(index);
        }

        let index = state.next_index;

        let next_index = index
            .checked_add(1)
            .filter(|_| index <= state.max_index)
            .ok_or(Error::IndexExhausted {
                max_index: state.max_index,
            })?;

        state.next_index = next_index;

        Ok(index)
    }

    /// Gives an index back to the provider so it can be issued again.
    ///
    /// Returning an index that is not currently taken (because it was already returned, or was
    /// never issued in the first place) does not change any state. Both situations indicate a
    /// bug in the caller and are logged as errors. Returning an index that was never issued is
    /// additionally escalated according to the [`CheckPolicy`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockTimeout`] if the provider is too contended. The index remains taken.
    pub fn return_index(&self, index: usize) -> Result<()> {
        let outcome = self.state.write(self.lock_timeout)?.record_return(index);
        self.report_return(index, outcome);

        Ok(())
    }

    /// Like [`return_index()`][Self::return_index] but waits for the lock without a deadline.
    ///
    /// For rollback paths that must not leave an index in limbo.
    pub(crate) fn return_index_unbounded(&self, index: usize) {
        let outcome = self.state.write_unbounded().record_return(index);
        self.report_return(index, outcome);
    }

    fn report_return(&self, index: usize, outcome: ReturnOutcome) {
        match outcome {
            ReturnOutcome::Recycled => {}
            ReturnOutcome::AlreadyReturned => {
                tracing::error!(index, "index returned to the provider twice");
            }
            ReturnOutcome::NeverIssued { next_index } => {
                tracing::error!(index, next_index, "returned an index that was never issued");
                self.check_policy.escalate(&format!(
                    "returned index {index} was never issued by the provider (next index is {next_index})"
                ));
            }
        }
    }

    /// Takes a specific index for the caller, even one beyond the indices issued so far.
    ///
    /// Returns `true` if the index was free and is now taken by the caller, `false` if it was
    /// already taken by someone else.
    ///
    /// When the index lies beyond the frontier of issued indices, every index skipped over
    /// becomes available through [`fetch_index()`][Self::fetch_index], lowest first. The skipped
    /// indices are recorded as a range, so the size of the jump does not matter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexOutOfBounds`] if the index exceeds the maximum index and
    /// [`Error::LockTimeout`] if the provider is too contended.
    pub fn try_claim_index(&self, index: usize) -> Result<bool> {
        let mut state = self.state.write(self.lock_timeout)?;

        if index > state.max_index || index == usize::MAX {
            return Err(Error::IndexOutOfBounds {
                index,
                len: state.max_index.saturating_add(1),
            });
        }

        if index < state.next_index {
            return Ok(state.take_recyclable(index) || state.take_skipped(index));
        }

        if index > state.next_index {
            let start = state.next_index;
            state.skipped.insert(start, index);

            // Cannot overflow, the skipped indices are a subset of 0..usize::MAX.
            state.skipped_count = state
                .skipped_count
                .wrapping_add(index.wrapping_sub(start));
        }

        // Cannot overflow, we checked against usize::MAX above.
        state.next_index = index.wrapping_add(1);

        Ok(true)
    }

    /// Keeps a returned index from being issued without changing its place in the reuse order.
    ///
    /// Returns `false` if the index is not in the recycle stack or is already held. A held index
    /// still counts as free.
    pub(crate) fn try_hold(&self, index: usize) -> Result<bool> {
        let mut state = self.state.write(self.lock_timeout)?;

        Ok(state.recyclable_set.contains(&index) && state.held.insert(index))
    }

    /// Makes a held index available again. Waits for the lock without a deadline, so a held
    /// index can never be stranded.
    pub(crate) fn unhold(&self, index: usize) {
        let was_held = self.state.write_unbounded().held.remove(&index);

        debug_assert!(was_held, "unhold() of index {index} that was not held");
    }

    /// Returns the index the next call to [`fetch_index()`][Self::fetch_index] would return,
    /// or `None` if the provider is exhausted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockTimeout`] if the provider is too contended.
    pub fn peek_next(&self) -> Result<Option<usize>> {
        let state = self.state.read(self.lock_timeout)?;

        if let Some(position) = state.top_available() {
            return Ok(state.recyclables.get(position).copied());
        }

        if let Some((&start, _)) = state.skipped.first_key_value() {
            return Ok(Some(start));
        }

        Ok((state.next_index <= state.max_index && state.next_index != usize::MAX)
            .then_some(state.next_index))
    }

    /// Returns the number of indices that are currently taken.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockTimeout`] if the provider is too contended.
    pub fn taken_count(&self) -> Result<usize> {
        Ok(self.state.read(self.lock_timeout)?.taken_count())
    }

    /// Returns whether `index` is currently taken.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockTimeout`] if the provider is too contended.
    pub fn is_taken(&self, index: usize) -> Result<bool> {
        Ok(self.state.read(self.lock_timeout)?.is_taken(index))
    }

    /// Returns the frontier: one past the highest index ever issued or claimed. Every index
    /// from here on has never been issued.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockTimeout`] if the provider is too contended.
    pub fn frontier(&self) -> Result<usize> {
        Ok(self.state.read(self.lock_timeout)?.next_index)
    }

    /// Returns the highest index the provider may issue.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockTimeout`] if the provider is too contended.
    pub fn max_index(&self) -> Result<usize> {
        Ok(self.state.read(self.lock_timeout)?.max_index)
    }

    /// Changes the highest index the provider may issue.
    ///
    /// The ceiling can be raised freely but cannot be lowered below an index that has already
    /// been issued.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MaxIndexBelowFrontier`] if indices above `max_index` have already been
    /// issued and [`Error::LockTimeout`] if the provider is too contended.
    pub fn set_max_index(&self, max_index: usize) -> Result<()> {
        let mut state = self.state.write(self.lock_timeout)?;

        if max_index.saturating_add(1) < state.next_index {
            return Err(Error::MaxIndexBelowFrontier {
                requested: max_index,
                frontier: state.next_index,
            });
        }

        state.max_index = max_index;

        Ok(())
    }
}

impl Default for PackedIndexProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PackedIndexProvider {
    fn drop(&mut self) {
        if !self.report_leaks {
            return;
        }

        let leaked = self.state.get_mut().taken_count();

        if leaked == 0 {
            return;
        }

        tracing::warn!(leaked, "index provider dropped with indices that were never returned");

        if let Some(tracker) = &self.leak_tracker {
            tracker.record_indices(leaked);
        }

        self.check_policy.escalate(&format!(
            "index provider dropped with {leaked} indices that were never returned"
        ));
    }
}

/// Builder for creating an instance of [`PackedIndexProvider`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use spin_pool::PackedIndexProvider;
///
/// let provider = PackedIndexProvider::builder()
///     .max_index(1)
///     .lock_timeout(Duration::from_millis(10))
///     .build();
///
/// assert_eq!(provider.fetch_index().unwrap(), 0);
/// assert_eq!(provider.fetch_index().unwrap(), 1);
/// assert!(provider.fetch_index().is_err());
/// # provider.return_index(0).unwrap();
/// # provider.return_index(1).unwrap();
/// ```
#[derive(Debug)]
#[must_use]
pub struct PackedIndexProviderBuilder {
    lock_name: &'static str,
    max_index: usize,
    lock_timeout: Duration,
    check_policy: CheckPolicy,
    leak_tracker: Option<LeakTracker>,
    report_leaks: bool,
}

/// Default upper bound on spinning for the provider lock.
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(1);

impl PackedIndexProviderBuilder {
    fn new() -> Self {
        Self {
            lock_name: "index provider",
            max_index: usize::MAX,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            check_policy: CheckPolicy::default(),
            leak_tracker: None,
            report_leaks: true,
        }
    }

    /// Sets the highest index the provider may issue. Unbounded by default.
    pub fn max_index(mut self, max_index: usize) -> Self {
        self.max_index = max_index;
        self
    }

    /// Sets how long operations spin for the provider lock before giving up.
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Sets how the provider reacts to detected lifecycle bugs.
    pub fn check_policy(mut self, policy: CheckPolicy) -> Self {
        self.check_policy = policy;
        self
    }

    /// Reports indices that are never returned into the given tracker.
    pub fn leak_tracker(mut self, tracker: &LeakTracker) -> Self {
        self.leak_tracker = Some(tracker.clone());
        self
    }

    pub(crate) fn lock_name(mut self, name: &'static str) -> Self {
        self.lock_name = name;
        self
    }

    pub(crate) fn without_leak_reports(mut self) -> Self {
        self.report_leaks = false;
        self
    }

    /// Builds the provider.
    #[must_use]
    pub fn build(self) -> PackedIndexProvider {
        PackedIndexProvider {
            state: RwSpinLock::named(
                self.lock_name,
                ProviderState {
                    next_index: 0,
                    max_index: self.max_index,
                    recyclables: Vec::new(),
                    recyclable_set: HashSet::new(),
                    skipped: BTreeMap::new(),
                    skipped_count: 0,
                    held: HashSet::new(),
                },
            ),
            lock_timeout: self.lock_timeout,
            check_policy: self.check_policy,
            leak_tracker: self.leak_tracker,
            report_leaks: self.report_leaks,
        }
    }
}

#[cfg(test)]
#[allow(clippy::arithmetic_side_effects, reason = "test code, be concise")]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use std::thread;

    use static_assertions::assert_impl_all;
    use testing::with_watchdog;
    use tracing_test::traced_test;

    use super::*;

    assert_impl_all!(PackedIndexProvider: Send, Sync);

    fn lenient() -> PackedIndexProvider {
        PackedIndexProvider::builder()
            .check_policy(CheckPolicy::Lenient)
            .build()
    }

    fn return_all(provider: &PackedIndexProvider, indices: impl IntoIterator<Item = usize>) {
        for index in indices {
            provider.return_index(index).unwrap();
        }
    }

    #[test]
    fn issues_dense_indices_from_zero() {
        let provider = PackedIndexProvider::new();

        let indices = (0..5)
            .map(|_| provider.fetch_index().unwrap())
            .collect::<Vec<_>>();

        assert_eq!(indices, [0, 1, 2, 3, 4]);
        assert_eq!(provider.taken_count().unwrap(), 5);
        assert_eq!(provider.frontier().unwrap(), 5);

        return_all(&provider, indices);
    }

    #[test]
    fn most_recently_returned_is_reused_first() {
        let provider = PackedIndexProvider::new();

        for _ in 0..4 {
            provider.fetch_index().unwrap();
        }

        provider.return_index(1).unwrap();
        provider.return_index(3).unwrap();

        assert_eq!(provider.peek_next().unwrap(), Some(3));
        assert_eq!(provider.fetch_index().unwrap(), 3);
        assert_eq!(provider.fetch_index().unwrap(), 1);
        assert_eq!(provider.fetch_index().unwrap(), 4);

        return_all(&provider, 0..5);
    }

    #[test]
    fn full_return_then_refetch_yields_same_indices() {
        let provider = PackedIndexProvider::new();

        let first = (0..16)
            .map(|_| provider.fetch_index().unwrap())
            .collect::<BTreeSet<_>>();

        return_all(&provider, first.iter().copied());
        assert_eq!(provider.taken_count().unwrap(), 0);

        let second = (0..16)
            .map(|_| provider.fetch_index().unwrap())
            .collect::<BTreeSet<_>>();

        assert_eq!(first, second);
        assert_eq!(provider.frontier().unwrap(), 16);

        return_all(&provider, second);
    }

    #[test]
    fn claiming_ahead_of_frontier_keeps_skipped_indices() {
        let provider = PackedIndexProvider::new();

        assert_eq!(provider.fetch_index().unwrap(), 0);
        assert!(provider.try_claim_index(5).unwrap());
        assert_eq!(provider.frontier().unwrap(), 6);
        assert_eq!(provider.taken_count().unwrap(), 2);

        let skipped = (0..4)
            .map(|_| provider.fetch_index().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(skipped, [1, 2, 3, 4]);

        // Now everything below the frontier is taken, so we mint again.
        assert_eq!(provider.fetch_index().unwrap(), 6);

        return_all(&provider, 0..7);
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn claiming_far_beyond_frontier_takes_constant_work() {
        with_watchdog(|| {
            const FAR: usize = 1 << 40;

            let provider = PackedIndexProvider::new();

            assert!(provider.try_claim_index(FAR).unwrap());
            assert_eq!(provider.frontier().unwrap(), FAR + 1);
            assert_eq!(provider.taken_count().unwrap(), 1);
            assert!(provider.is_taken(FAR).unwrap());
            assert!(!provider.is_taken(FAR - 1).unwrap());
            assert_eq!(provider.peek_next().unwrap(), Some(0));

            let fetched = (0..3)
                .map(|_| provider.fetch_index().unwrap())
                .collect::<Vec<_>>();
            assert_eq!(fetched, [0, 1, 2]);
            assert_eq!(provider.taken_count().unwrap(), 4);

            return_all(&provider, [0, 1, 2, FAR]);
            assert_eq!(provider.taken_count().unwrap(), 0);
        });
    }

    #[test]
    #[traced_test]
    fn claiming_inside_a_gap_splits_it() {
        let provider = lenient();

        assert!(provider.try_claim_index(10).unwrap());
        assert!(provider.try_claim_index(4).unwrap());
        assert!(!provider.try_claim_index(4).unwrap());
        assert_eq!(provider.taken_count().unwrap(), 2);

        // Still in the gap, so it was never issued.
        provider.return_index(7).unwrap();
        assert!(logs_contain("returned an index that was never issued"));
        assert_eq!(provider.taken_count().unwrap(), 2);

        let fetched = (0..9)
            .map(|_| provider.fetch_index().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(fetched, [0, 1, 2, 3, 5, 6, 7, 8, 9]);
        assert_eq!(provider.fetch_index().unwrap(), 11);

        return_all(&provider, 0..12);
    }

    #[test]
    fn held_indices_are_passed_over_but_keep_their_place() {
        let provider = PackedIndexProvider::new();

        for _ in 0..4 {
            provider.fetch_index().unwrap();
        }

        return_all(&provider, [1, 3, 2]);

        assert!(provider.try_hold(3).unwrap());
        assert!(!provider.try_hold(3).unwrap());
        assert!(!provider.try_hold(0).unwrap());

        // Held indices still count as free but cannot be taken.
        assert_eq!(provider.taken_count().unwrap(), 1);
        assert!(!provider.try_claim_index(3).unwrap());
        assert_eq!(provider.peek_next().unwrap(), Some(2));

        assert_eq!(provider.fetch_index().unwrap(), 2);
        assert_eq!(provider.fetch_index().unwrap(), 1);
        assert_eq!(provider.fetch_index().unwrap(), 4);

        provider.unhold(3);
        assert_eq!(provider.peek_next().unwrap(), Some(3));
        assert_eq!(provider.fetch_index().unwrap(), 3);

        return_all(&provider, 0..5);
    }

    #[test]
    fn unhold_restores_the_original_order() {
        let provider = PackedIndexProvider::new();

        for _ in 0..3 {
            provider.fetch_index().unwrap();
        }

        return_all(&provider, [0, 1, 2]);

        assert!(provider.try_hold(1).unwrap());
        provider.unhold(1);

        let order = (0..3)
            .map(|_| provider.fetch_index().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(order, [2, 1, 0]);

        return_all(&provider, 0..3);
    }

    #[test]
    fn claiming_specific_index_respects_ownership() {
        let provider = PackedIndexProvider::new();

        for _ in 0..3 {
            provider.fetch_index().unwrap();
        }

        // Taken by someone else.
        assert!(!provider.try_claim_index(1).unwrap());

        provider.return_index(1).unwrap();
        provider.return_index(2).unwrap();

        // Recycled indices can be claimed out of LIFO order.
        assert!(provider.try_claim_index(1).unwrap());
        assert!(provider.is_taken(1).unwrap());
        assert_eq!(provider.fetch_index().unwrap(), 2);

        return_all(&provider, 0..3);
    }

    #[test]
    fn ceiling_is_enforced() {
        let provider = PackedIndexProvider::builder().max_index(2).build();

        for expected in 0..3 {
            assert_eq!(provider.fetch_index().unwrap(), expected);
        }

        assert_eq!(provider.peek_next().unwrap(), None);
        assert_eq!(
            provider.fetch_index().unwrap_err(),
            Error::IndexExhausted { max_index: 2 }
        );
        assert_eq!(
            provider.try_claim_index(3).unwrap_err(),
            Error::IndexOutOfBounds { index: 3, len: 3 }
        );

        provider.set_max_index(3).unwrap();
        assert_eq!(provider.fetch_index().unwrap(), 3);

        return_all(&provider, 0..4);
    }

    #[test]
    fn ceiling_cannot_drop_below_issued_indices() {
        let provider = PackedIndexProvider::new();

        for _ in 0..4 {
            provider.fetch_index().unwrap();
        }

        assert_eq!(
            provider.set_max_index(1).unwrap_err(),
            Error::MaxIndexBelowFrontier {
                requested: 1,
                frontier: 4
            }
        );

        // Lowering exactly to the highest issued index is fine.
        provider.set_max_index(3).unwrap();
        assert_eq!(provider.max_index().unwrap(), 3);
        assert!(provider.fetch_index().is_err());

        return_all(&provider, 0..4);
    }

    #[test]
    #[traced_test]
    fn double_return_is_logged_and_ignored() {
        let provider = PackedIndexProvider::new();

        let index = provider.fetch_index().unwrap();
        provider.return_index(index).unwrap();
        provider.return_index(index).unwrap();

        assert!(logs_contain("index returned to the provider twice"));
        assert_eq!(provider.taken_count().unwrap(), 0);

        // The index must not have been duplicated in the recycle list.
        assert_eq!(provider.fetch_index().unwrap(), 0);
        assert_eq!(provider.fetch_index().unwrap(), 1);

        return_all(&provider, 0..2);
    }

    #[test]
    #[traced_test]
    fn returning_unissued_index_is_logged_when_lenient() {
        let provider = lenient();

        provider.return_index(42).unwrap();

        assert!(logs_contain("returned an index that was never issued"));
        assert_eq!(provider.taken_count().unwrap(), 0);
        assert_eq!(provider.fetch_index().unwrap(), 0);

        provider.return_index(0).unwrap();
    }

    #[test]
    #[should_panic(expected = "was never issued")]
    fn returning_unissued_index_panics_when_strict() {
        let provider = PackedIndexProvider::builder()
            .check_policy(CheckPolicy::Strict)
            .build();

        provider.return_index(7).unwrap();
    }

    #[test]
    #[traced_test]
    fn leaks_are_reported_on_drop() {
        let tracker = LeakTracker::new();

        let provider = PackedIndexProvider::builder()
            .check_policy(CheckPolicy::Lenient)
            .leak_tracker(&tracker)
            .build();

        for _ in 0..3 {
            provider.fetch_index().unwrap();
        }
        provider.return_index(0).unwrap();

        drop(provider);

        assert_eq!(tracker.report().leaked_indices, 2);
        assert!(logs_contain("never returned"));
    }

    #[test]
    #[should_panic(expected = "never returned")]
    fn leaks_panic_on_drop_when_strict() {
        let provider = PackedIndexProvider::builder()
            .check_policy(CheckPolicy::Strict)
            .build();

        provider.fetch_index().unwrap();
    }

    #[test]
    fn silenced_provider_does_not_report() {
        let tracker = LeakTracker::new();

        let provider = PackedIndexProvider::builder()
            .check_policy(CheckPolicy::Strict)
            .leak_tracker(&tracker)
            .without_leak_reports()
            .build();

        provider.fetch_index().unwrap();
        drop(provider);

        assert!(tracker.report().is_clean());
    }

    #[test]
    fn concurrent_fetches_are_unique() {
        with_watchdog(|| {
            const THREADS: usize = 4;
            const PER_THREAD: usize = 250;

            let provider = Arc::new(
                PackedIndexProvider::builder()
                    .lock_timeout(Duration::from_secs(5))
                    .build(),
            );

            let handles = (0..THREADS)
                .map(|_| {
                    let provider = Arc::clone(&provider);

                    thread::spawn(move || {
                        let mut mine = Vec::with_capacity(PER_THREAD);

                        for round in 0..PER_THREAD {
                            mine.push(provider.fetch_index().unwrap());

                            // Return every other index to exercise recycling under contention.
                            if round % 2 == 1 {
                                let index = mine.pop().unwrap();
                                provider.return_index(index).unwrap();
                            }
                        }

                        mine
                    })
                })
                .collect::<Vec<_>>();

            let mut all = BTreeSet::new();
            for handle in handles {
                for index in handle.join().unwrap() {
                    assert!(all.insert(index), "index {index} was issued twice");
                }
            }

            assert_eq!(provider.taken_count().unwrap(), all.len());

            return_all(&provider, all);
        });
    }
}
