//! Cancellation primitives for cooperative async work.
//!
//! An [`AbortController`] owns the right to cancel; any number of
//! [`AbortSignal`]s observe it. Work that wants to stop early can poll
//! [`AbortSignal::is_aborted`], bail out through [`AbortSignal::check`], or
//! await [`AbortSignal::aborted`].
//!
//! Nothing here depends on a specific runtime: wakers are stored and woken
//! by hand, so the types work under Tokio, `futures::executor`, or anything
//! else that polls futures.

mod abort;

pub use crate::abort::{AbortController, AbortReason, AbortSignal, Aborted};
