//! Client-side async query cache.
//!
//! `stash` deduplicates async reads ("queries") by key, tracks their
//! lifecycle, invalidates and re-fetches them, and coordinates writes
//! ("mutations") that invalidate related reads. The pieces live in their
//! own crates and are re-exported here:
//!
//! - [`key`](stash_key): entry keys, canonical key strings and the key tree,
//! - [`query`](stash_query): query entries and the query cache,
//! - [`mutation`](stash_mutation): mutation entries and the mutation cache,
//! - [`config`](stash_config): file and environment defaults.
//!
//! A [`Client`] ties both caches together and installs [`Plugin`]s.
//!
//! ```
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! use stash::{Client, Failure, PluginContext, QueryOptions, key};
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! let fetches = Arc::new(AtomicUsize::new(0));
//! let counter = fetches.clone();
//! let client = Client::builder()
//!     .plugin(move |ctx: &PluginContext| -> Result<(), Failure> {
//!         let counter = counter.clone();
//!         ctx.on_query_action(move |event| {
//!             if event.name() == "fetch" {
//!                 counter.fetch_add(1, Ordering::SeqCst);
//!             }
//!         });
//!         Ok(())
//!     })
//!     .build()
//!     .unwrap();
//!
//! let queries = client.query_cache();
//! let entry = queries.ensure(QueryOptions::new(key!["greeting"], |_| async { Ok::<_, Failure>("hello") }));
//! queries.refresh(&entry).await.unwrap();
//! assert_eq!(queries.get_query_data(&key!["greeting"]), Some("hello".into()));
//! assert_eq!(fetches.load(Ordering::SeqCst), 1);
//! # }
//! ```

mod client;
pub mod error;
mod plugin;

pub use crate::client::{Client, ClientBuilder};
pub use crate::plugin::{Plugin, PluginContext, Scope};

pub use stash_config as config;
pub use stash_key as keys;
pub use stash_mutation as mutation;
pub use stash_query as query;

pub use stash_asyncutils::{AbortController, AbortReason, AbortSignal};
pub use stash_config::Config;
pub use stash_key::{EntryKey, key};
pub use stash_mutation::{MutationCache, MutationEntry, MutationFilter, MutationOptions};
pub use stash_query::{
    AsyncStatus, DataState, Expiry, Failure, QueryCache, QueryContext, QueryEntry, QueryFilter, QueryOptions,
    RefetchActive, Status, Subscription,
};
