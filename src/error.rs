//! Errors reported by the engine and by synchronizer policies.

use core::fmt;

/// The acquisition mode of a queued thread, or of a policy hook.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Mode {
    /// At most one holder at a time.
    Exclusive,
    /// Any number of holders at a time, as allowed by the policy.
    Shared,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Exclusive => f.write_str("exclusive"),
            Mode::Shared => f.write_str("shared"),
        }
    }
}

/// The error type for synchronizer operations.
///
/// Failed compare-and-swap attempts are retried inside the engine and never
/// surface here. A timed operation that runs out of time is not an error
/// either: it returns `Ok(false)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum SyncError {
    /// The calling thread does not hold the synchronizer the way the
    /// operation requires, e.g. releasing a lock it does not own, or using a
    /// condition without holding its lock.
    #[error("current thread does not hold the synchronizer as required")]
    IllegalMonitorState,

    /// The policy does not implement the hooks for this mode.
    #[error("{0} mode is not supported by this synchronizer")]
    Unsupported(Mode),

    /// The thread was interrupted before or while waiting.
    #[error("thread was interrupted while waiting")]
    Interrupted,

    /// A bounded counter would overflow.
    #[error("maximum {0} count exceeded")]
    Saturated(&'static str),
}

/// A specialized [`Result`](core::result::Result) type for synchronizer
/// operations.
pub type Result<T, E = SyncError> = core::result::Result<T, E>;

#[cfg(all(not(loom), test))]
mod test {
    use super::{Mode, SyncError};

    #[test]
    fn display() {
        let err = SyncError::Unsupported(Mode::Shared);
        assert_eq!(err.to_string(), "shared mode is not supported by this synchronizer");
        let err = SyncError::Saturated("lock");
        assert_eq!(err.to_string(), "maximum lock count exceeded");
    }
}
