//! Result type for cancellable operations.

/// How a cancellable operation ended.
///
/// `Aborted` is cooperative cancellation and carries no error. Hosts should
/// treat it as a clean stop, never as a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum Outcome<T, E> {
    Completed(T),
    Aborted,
    Failed(E),
}

impl<T, E> Outcome<T, E> {
    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed(_))
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Outcome::Aborted)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }

    /// The completed value, if any.
    pub fn completed(self) -> Option<T> {
        match self {
            Outcome::Completed(v) => Some(v),
            _ => None,
        }
    }

    /// The failure, if any.
    pub fn failed(self) -> Option<E> {
        match self {
            Outcome::Failed(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_ref(&self) -> Outcome<&T, &E> {
        match self {
            Outcome::Completed(v) => Outcome::Completed(v),
            Outcome::Aborted => Outcome::Aborted,
            Outcome::Failed(e) => Outcome::Failed(e),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U, E> {
        match self {
            Outcome::Completed(v) => Outcome::Completed(f(v)),
            Outcome::Aborted => Outcome::Aborted,
            Outcome::Failed(e) => Outcome::Failed(e),
        }
    }

    pub fn map_err<F>(self, f: impl FnOnce(E) -> F) -> Outcome<T, F> {
        match self {
            Outcome::Completed(v) => Outcome::Completed(v),
            Outcome::Aborted => Outcome::Aborted,
            Outcome::Failed(e) => Outcome::Failed(f(e)),
        }
    }

    /// Collapse into a `Result`, with `Aborted` as `Ok(None)`.
    pub fn into_result(self) -> Result<Option<T>, E> {
        match self {
            Outcome::Completed(v) => Ok(Some(v)),
            Outcome::Aborted => Ok(None),
            Outcome::Failed(e) => Err(e),
        }
    }
}

impl<T, E> From<Result<T, E>> for Outcome<T, E> {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(v) => Outcome::Completed(v),
            Err(e) => Outcome::Failed(e),
        }
    }
}
