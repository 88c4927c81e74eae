//! Key Error Types
//!
//! Structured errors using `exn` for automatic location tracking and error
//! tree construction.

use derive_more::{Display, Error};

/// A key error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for key operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Keys must have at least one segment.
    #[display("entry keys cannot be empty")]
    EmptyKey,
    /// A cache-key string could not be parsed back into segments.
    #[display("invalid cache key: {_0}")]
    InvalidKey(#[error(not(source))] String),
}
