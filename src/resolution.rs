//! The eventual outcome carried by a promise.
use crate::Error;

/// Outcome of a [`Promise`](crate::Promise).
///
/// A promise starts `Unresolved`. Its routine moves it to `Result` or `Error`;
/// cancellation moves it to `Cancelled`. Cancellation is never reported as an
/// error, nor an error as a cancellation.
#[derive(Debug, Clone)]
pub enum Resolution<T> {
    Unresolved,
    Result(T),
    Error(Error),
    Cancelled,
}

impl<T> Default for Resolution<T> {
    fn default() -> Self {
        Resolution::Unresolved
    }
}

impl<T> Resolution<T> {
    pub fn result(&self) -> Option<&T> {
        match self {
            Resolution::Result(value) => Some(value),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&Error> {
        match self {
            Resolution::Error(err) => Some(err),
            _ => None,
        }
    }

    pub fn into_result(self) -> Option<T> {
        match self {
            Resolution::Result(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_unresolved(&self) -> bool {
        matches!(self, Resolution::Unresolved)
    }

    pub fn is_result(&self) -> bool {
        matches!(self, Resolution::Result(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Resolution::Error(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Resolution::Cancelled)
    }

    /// The outcome a success-gated successor inherits.
    ///
    /// `None` for a result, meaning the successor should run its own routine.
    /// Every other kind is carried over unchanged, `Unresolved` included.
    pub fn passthrough<U>(&self) -> Option<Resolution<U>> {
        match self {
            Resolution::Result(_) => None,
            Resolution::Unresolved => Some(Resolution::Unresolved),
            Resolution::Error(err) => Some(Resolution::Error(err.clone())),
            Resolution::Cancelled => Some(Resolution::Cancelled),
        }
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Resolution<U> {
        match self {
            Resolution::Result(value) => Resolution::Result(f(value)),
            Resolution::Unresolved => Resolution::Unresolved,
            Resolution::Error(err) => Resolution::Error(err),
            Resolution::Cancelled => Resolution::Cancelled,
        }
    }
}

impl<T> From<Result<T, Error>> for Resolution<T> {
    fn from(result: Result<T, Error>) -> Self {
        match result {
            Ok(value) => Resolution::Result(value),
            Err(err) => Resolution::Error(err),
        }
    }
}
