//! Query Cache Error Types
//!
//! Structured errors using `exn` for automatic location tracking and error
//! tree construction.
//!
//! These cover the cache's own operations. Failures of the caller-supplied
//! query functions are not errors of the cache; they are recorded in entry
//! state as a [`Failure`](crate::Failure).

use derive_more::{Display, Error};

/// A query cache error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for query cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// A key could not be decoded from its canonical string form.
    #[display("invalid entry key: {_0}")]
    InvalidKey(#[error(not(source))] String),
    /// Serialized cache data is malformed.
    #[display("invalid serialized entry: {_0}")]
    InvalidData(#[error(not(source))] String),
}
