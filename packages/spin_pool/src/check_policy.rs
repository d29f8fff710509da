use std::thread;

/// Determines how a structure reacts to lifecycle bugs that it detects at runtime.
///
/// Every structure in this crate detects a practical subset of misuse: disposing a structure
/// while one of its locks is held, dropping it with indices or claims that were never returned,
/// returning an index that was never issued. Such anomalies are always logged. The policy decides
/// whether they additionally abort the current operation with a panic.
///
/// The default is [`CheckPolicy::Strict`] in debug builds and [`CheckPolicy::Lenient`] in release
/// builds, so development catches bugs loudly while production keeps running.
///
/// # Examples
///
/// ```
/// use spin_pool::{CheckPolicy, PackedIndexProvider};
///
/// let provider = PackedIndexProvider::builder()
///     .check_policy(CheckPolicy::Lenient)
///     .build();
///
/// // Leaking an index is only logged because of the lenient policy.
/// let _leaked = provider.fetch_index().unwrap();
/// drop(provider);
/// ```
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum CheckPolicy {
    /// Detected invariant violations are logged and then cause a panic.
    ///
    /// The panic is suppressed if the thread is already panicking, so that the original panic
    /// is not obscured.
    Strict,

    /// Detected invariant violations are logged and execution continues.
    Lenient,
}

impl Default for CheckPolicy {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            Self::Strict
        } else {
            Self::Lenient
        }
    }
}

impl CheckPolicy {
    /// Escalates an already-logged violation according to the policy.
    ///
    /// The caller is expected to have emitted a log entry describing the violation before calling
    /// this, and to not hold any lock while calling it.
    #[track_caller]
    pub(crate) fn escalate(self, message: &str) {
        if self == Self::Strict && !thread::panicking() {
            panic!("{message}");
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn default_depends_on_build_profile() {
        if cfg!(debug_assertions) {
            assert_eq!(CheckPolicy::default(), CheckPolicy::Strict);
        } else {
            assert_eq!(CheckPolicy::default(), CheckPolicy::Lenient);
        }
    }

    #[test]
    fn lenient_does_not_panic() {
        CheckPolicy::Lenient.escalate("nothing to see here");
    }

    #[test]
    #[should_panic(expected = "broken invariant")]
    fn strict_panics() {
        CheckPolicy::Strict.escalate("broken invariant");
    }
}
