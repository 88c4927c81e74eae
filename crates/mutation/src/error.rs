//! Mutation Cache Error Types
//!
//! Structured errors using `exn` for automatic location tracking and error
//! tree construction.
//!
//! Failures of the mutation function and its callbacks are a
//! [`Failure`](stash_query::Failure), not an error of the cache.

use derive_more::{Display, Error};

/// A mutation cache error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for mutation cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// A key function returned no segments for the given variables.
    #[display("mutation key function returned an empty key")]
    EmptyKey,
}
