use std::any::Any;
use std::sync::Arc;

use thiserror::Error;

/// Error type for operations whose failures are not `Clone` on their own.
///
/// Every caller attached to a call receives its own clone of the outcome, so
/// dynamic errors are shared behind an `Arc`.
pub type SharedError = Arc<anyhow::Error>;

/// The error side of an outcome handed to every caller attached to a call.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error<E> {
    /// The operation ran and returned this error.
    #[error("{0}")]
    Operation(E),

    /// The execution ended without producing an outcome: the operation
    /// panicked, or the owner stopped driving it.
    #[error("in-flight call aborted: {0}")]
    Aborted(String),
}

impl<E> Error<E> {
    pub fn is_aborted(&self) -> bool {
        matches!(self, Error::Aborted(_))
    }

    /// Returns the operation's own error, if that is what this is.
    pub fn into_operation(self) -> Option<E> {
        match self {
            Error::Operation(e) => Some(e),
            Error::Aborted(_) => None,
        }
    }

    pub(crate) fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "operation panicked".to_owned()
        };
        Error::Aborted(message)
    }
}

/// Wraps an operation error into a [`SharedError`].
pub fn shared<E>(err: E) -> SharedError
where
    E: Into<anyhow::Error>,
{
    Arc::new(err.into())
}
