//! The mutation cache.
//!
//! A mutation is created from [`MutationOptions`], registered with its
//! variables by [`MutationCache::ensure`] and run by
//! [`MutationCache::mutate`], which drives the `on_mutate` → mutation →
//! `on_success` / `on_error` → `on_settled` lifecycle. A successful mutation
//! invalidates the query keys it declares and re-fetches the active ones.
//!
//! ```
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! use serde_json::{json, Value};
//! use stash_key::key;
//! use stash_mutation::{MutationCache, MutationDefaults, MutationOptions};
//! use stash_query::{Failure, QueryCache, QueryDefaults};
//!
//! let queries = QueryCache::new(QueryDefaults::default());
//! let mutations = MutationCache::new(queries.clone(), MutationDefaults::default());
//! let create = mutations.create(
//!     MutationOptions::new(|vars: Value, _ctx| async move { Ok::<_, Failure>(vars) })
//!         .invalidate_keys(vec![key!["todos"]]),
//! );
//! let entry = mutations.ensure(&create, json!({"title": "ship it"})).unwrap();
//! let created = mutations.mutate(&entry, json!({"title": "ship it"})).await.unwrap();
//! assert_eq!(created["title"], "ship it");
//! # }
//! ```

mod cache;
mod entry;
pub mod error;
mod filter;
mod options;

pub use crate::cache::{MutationAction, MutationActionOutput, MutationCache};
pub use crate::entry::MutationEntry;
pub use crate::filter::MutationFilter;
pub use crate::options::{InvalidateKeys, MutationDefaults, MutationFn, MutationKey, MutationOptions};
