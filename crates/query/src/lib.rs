//! The query cache.
//!
//! A [`QueryCache`] stores one [`QueryEntry`] per canonical key in a key
//! tree. Each entry has two independent state axes: the data axis
//! ([`DataState`]: pending, success, error) and the async axis
//! ([`AsyncStatus`]: idle, loading). Both are observable through
//! `tokio::sync::watch` receivers.
//!
//! The cache owns every state transition: `fetch` runs the query function
//! and lets only the most recently started call write state, `refresh`
//! fetches only when data is stale or errored, `invalidate` forces
//! staleness, and `track`/`untrack` drive garbage collection of entries
//! nobody uses. Every operation is announced through [`QueryCache::on_action`].
//!
//! ```
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! use serde_json::json;
//! use stash_key::key;
//! use stash_query::{Failure, QueryCache, QueryDefaults, QueryOptions, Status};
//!
//! let cache = QueryCache::new(QueryDefaults::default());
//! let entry = cache.ensure(QueryOptions::new(key!["answer"], |_| async { Ok::<_, Failure>(42) }));
//! let state = cache.refresh(&entry).await.unwrap();
//! assert_eq!(state.status(), Status::Success);
//! assert_eq!(cache.get_query_data(&key!["answer"]), Some(json!(42)));
//! # }
//! ```

mod cache;
mod clock;
mod entry;
pub mod error;
mod ext;
mod failure;
mod filter;
mod hooks;
mod options;
mod persist;
mod state;

pub use crate::cache::{FetchFuture, QueryAction, QueryActionOutput, QueryCache, RefetchActive};
pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::entry::{ConsumerId, QueryEntry};
pub use crate::ext::Extensions;
pub use crate::failure::Failure;
pub use crate::filter::QueryFilter;
pub use crate::hooks::{Action, ActionEvent, ActionHooks, Settle, Subscription};
pub use crate::options::{
    Expiry, QueryContext, QueryDefaults, QueryFn, QueryOptions, QueryPolicy, RefetchPolicy, ResolvedOptions, Trigger,
};
pub use crate::persist::{SerializedCache, SerializedEntry, SerializedError};
pub use crate::state::{AsyncStatus, DataState, Status};
