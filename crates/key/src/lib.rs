//! Entry keys and the structures that index by them.
//!
//! A key is an ordered list of JSON segments such as `["users", 1, {"page": 2}]`.
//! Array order matters, object key order does not: `{"a":1,"b":2}` and
//! `{"b":2,"a":1}` are the same segment. [`EntryKey::to_cache_key`] produces
//! the canonical string form used for lookups and display, and
//! [`EntryKey::tree_path`] splits a key into the per-segment strings that the
//! [`TreeMapNode`] branches on.
//!
//! Structural comparison beyond exact equality (partial object matching)
//! lives in [`is_subset_of`], not in the tree.

mod codec;
pub mod error;
mod key;
mod tree;

pub use crate::codec::{canonical_segment, is_subset_of, to_cache_key};
pub use crate::key::EntryKey;
pub use crate::tree::{Iter, TreeMapNode};

#[doc(hidden)]
pub mod __private {
    pub use serde_json;
}

/// Build an [`EntryKey`] from one or more segments.
///
/// Every segment goes through [`serde_json::json!`], so literals, variables
/// and inline objects all work. At least one segment is required.
///
/// ```
/// use stash_key::key;
///
/// let id = 7;
/// let a = key!["users", id, { "page": 1, "sort": "name" }];
/// let b = key!["users", 7, { "sort": "name", "page": 1 }];
/// assert_eq!(a, b);
/// assert_eq!(a.to_cache_key(), r#"["users",7,{"page":1,"sort":"name"}]"#);
/// ```
#[macro_export]
macro_rules! key {
    ($($segments:tt)+) => {
        $crate::EntryKey::__from_json_array($crate::__private::serde_json::json!([$($segments)+]))
    };
}
