use thiserror::Error;

/// An error returned from [`Cache::get`](crate::Cache::get).
///
/// Failures of the computation itself are surfaced as [`Failed`](Self::Failed), and they are
/// shared with every caller that was coalesced onto the same computation. They are never cached,
/// so calling `get` again starts a fresh attempt.
///
/// A computation that panics does not produce an error. The panic is re-raised in every caller
/// instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError<E> {
    /// The computation returned an error.
    #[error("{0}")]
    Failed(E),
    /// A stored value or a shared failure had a different type than the one requested.
    ///
    /// This happens when call sites with different error types are coalesced onto the same
    /// lookup.
    #[error("type mismatch for `{key}`: expected `{expected}`")]
    TypeMismatch {
        /// The slot that was accessed.
        key: String,
        /// The name of the type the caller asked for.
        expected: &'static str,
    },
    /// The computation was torn down before it delivered an outcome.
    #[error("computation for `{key}` was cancelled")]
    Cancelled {
        /// The slot that was being computed.
        key: String,
    },
}

impl<E> CallError<E> {
    /// Returns the error of the computation, if this is a [`Failed`](Self::Failed) error.
    pub fn into_failure(self) -> Option<E> {
        match self {
            CallError::Failed(err) => Some(err),
            _ => None,
        }
    }

    /// Maps the error of the computation with `f`, leaving other variants untouched.
    pub fn map_failure<F, U>(self, f: F) -> CallError<U>
    where
        F: FnOnce(E) -> U,
    {
        match self {
            CallError::Failed(err) => CallError::Failed(f(err)),
            CallError::TypeMismatch { key, expected } => CallError::TypeMismatch { key, expected },
            CallError::Cancelled { key } => CallError::Cancelled { key },
        }
    }
}
