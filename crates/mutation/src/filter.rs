use crate::entry::MutationEntry;
use stash_key::EntryKey;
use stash_query::Status;
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::sync::Arc;

type Predicate = Arc<dyn Fn(&MutationEntry) -> bool + Send + Sync>;

/// Selects mutation entries. All set fields must match.
///
/// The key matches as a prefix with partial objects: a filter of
/// `["todos", {"list": 1}]` matches an entry keyed
/// `["todos", {"list": 1, "page": 2}, "create"]`. Unkeyed entries never
/// match a key filter.
#[derive(Clone, Default)]
pub struct MutationFilter {
    key: Option<EntryKey>,
    status: Option<Status>,
    predicate: Option<Predicate>,
}

impl MutationFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(mut self, key: EntryKey) -> Self {
        self.key = Some(key);
        self
    }

    pub fn status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    pub fn predicate(mut self, predicate: impl Fn(&MutationEntry) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub(crate) fn matches(&self, entry: &MutationEntry) -> bool {
        self.key.as_ref().is_none_or(|filter| entry.key().is_some_and(|key| key.matches_partial(filter)))
            && self.status.is_none_or(|status| entry.state().status() == status)
            && self.predicate.as_ref().is_none_or(|predicate| predicate(entry))
    }
}

impl Debug for MutationFilter {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("MutationFilter")
            .field("key", &self.key)
            .field("status", &self.status)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}
