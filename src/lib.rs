//! Duplicate call suppression.
//!
//! A [`Group`] runs the function for a key once at a time: callers that arrive
//! while a call for the same key is in flight wait for it and receive a clone
//! of its outcome instead of running their own function. [`AsyncGroup`] does
//! the same for futures.
//!
//! ```
//! use inflight::Group;
//!
//! let group: Group<&str, u64, String> = Group::new();
//! let flight = group.work("answer", || Ok(42));
//! assert_eq!(flight.result, Ok(42));
//! assert!(!flight.shared);
//!
//! let flight = group.work("answer", || Err("backend down".to_owned()));
//! assert_eq!(
//!     flight.into_result(),
//!     Err(inflight::Error::Operation("backend down".to_owned()))
//! );
//! ```
//!
//! Nothing is cached: once a call completes its key is released, and the next
//! caller runs its function again. [`Group::forget`] releases a key early.

mod async_group;
mod call;
mod error;
mod group;
mod options;
pub mod registry;

pub use async_group::AsyncGroup;
pub use call::{AsyncCall, Call};
pub use error::{shared, Error, SharedError};
pub use group::Group;
pub use options::Options;
pub use registry::Registry;

/// The outcome of a call as seen by one caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Flight<V, E> {
    /// The value or error produced by the single execution.
    pub result: Result<V, Error<E>>,
    /// Whether the outcome went to more than one caller.
    pub shared: bool,
}

impl<V, E> Flight<V, E> {
    /// Drops the shared flag, keeping only the outcome.
    pub fn into_result(self) -> Result<V, Error<E>> {
        self.result
    }
}
