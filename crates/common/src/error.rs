use std::fmt;

use thiserror::Error;

/// Cause recorded when a memory pool subtree is aborted.
///
/// The cause travels with every subsequent [`MeldError::Aborted`] raised on
/// the subtree so callers see why their query died, not just that it did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortCause {
    /// The arbitrator selected this query as an out-of-memory victim.
    OutOfMemory(String),
    /// The query was terminated by its owner (cancellation, failure in
    /// another operator).
    Terminated(String),
}

impl fmt::Display for AbortCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortCause::OutOfMemory(msg) => write!(f, "out of memory: {msg}"),
            AbortCause::Terminated(msg) => write!(f, "terminated: {msg}"),
        }
    }
}

/// Canonical Meld error taxonomy used across crates.
///
/// Classification guidance:
/// - [`MeldError::CapExceeded`]: a reservation could not be satisfied after
///   arbitration was exhausted (or a pool-local maximum was hit)
/// - [`MeldError::Aborted`]: the operation reached a pool subtree that was
///   already aborted; the original cause is carried along
/// - [`MeldError::InvariantViolation`]: pool or operator accounting broke a
///   structural invariant (programmer error)
/// - [`MeldError::Execution`]: runtime operator evaluation or decode/encode
///   failures
/// - [`MeldError::Unsupported`]: syntactically valid but intentionally
///   unimplemented behavior
/// - [`MeldError::Io`]: raw filesystem/network IO failures from std APIs
///
/// Upstream blocking is NOT an error: sources signal it through
/// `BlockingReason::WaitForProducer` and a continue future.
#[derive(Debug, Error)]
pub enum MeldError {
    /// A reservation cannot be satisfied after exhausting arbitration.
    ///
    /// Examples:
    /// - global arbitration retries exhausted with insufficient donors
    /// - per-request arbitration timeout elapsed
    /// - a non-root pool exceeded its own maximum capacity
    #[error("capacity exceeded: {0}")]
    CapExceeded(String),

    /// Operation reached a pool already aborted; cause is propagated.
    #[error("aborted: {0}")]
    Aborted(AbortCause),

    /// Accounting violated a structural invariant (programmer error).
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Runtime execution failures (decode failures, shape mismatches).
    #[error("execution error: {0}")]
    Execution(String),

    /// Valid request for behavior not implemented in the current version.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl MeldError {
    /// Returns the abort cause when this error is an [`MeldError::Aborted`].
    pub fn abort_cause(&self) -> Option<&AbortCause> {
        match self {
            MeldError::Aborted(cause) => Some(cause),
            _ => None,
        }
    }
}

/// Standard Meld result alias.
pub type Result<T> = std::result::Result<T, MeldError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_cause_formats_with_context() {
        let err = MeldError::Aborted(AbortCause::OutOfMemory("query q1".to_string()));
        assert_eq!(err.to_string(), "aborted: out of memory: query q1");
        assert!(matches!(
            err.abort_cause(),
            Some(AbortCause::OutOfMemory(_))
        ));
    }

    #[test]
    fn non_abort_errors_have_no_cause() {
        let err = MeldError::CapExceeded("need 16 MB".to_string());
        assert!(err.abort_cause().is_none());
    }
}
