use crate::entry::QueryEntry;
use crate::state::Status;
use stash_key::EntryKey;
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::sync::Arc;

type Predicate = Arc<dyn Fn(&QueryEntry) -> bool + Send + Sync>;

/// Selects query entries. All set fields must match.
///
/// ```
/// use stash_key::key;
/// use stash_query::{QueryFilter, Status};
///
/// let filter = QueryFilter::new().key(key!["todos"]).active(true).status(Status::Success);
/// assert!(!filter.is_exact());
/// ```
#[derive(Clone, Default)]
pub struct QueryFilter {
    key: Option<EntryKey>,
    exact: bool,
    active: Option<bool>,
    stale: Option<bool>,
    status: Option<Status>,
    predicate: Option<Predicate>,
}

impl QueryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Match the entry at `key` and everything below it.
    pub fn key(mut self, key: EntryKey) -> Self {
        self.key = Some(key);
        self
    }

    /// Match only the entry at exactly `key`. Without a key, nothing matches.
    pub fn exact(mut self, exact: bool) -> Self {
        self.exact = exact;
        self
    }

    pub fn active(mut self, active: bool) -> Self {
        self.active = Some(active);
        self
    }

    pub fn stale(mut self, stale: bool) -> Self {
        self.stale = Some(stale);
        self
    }

    pub fn status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    pub fn predicate(mut self, predicate: impl Fn(&QueryEntry) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn get_key(&self) -> Option<&EntryKey> {
        self.key.as_ref()
    }

    pub fn is_exact(&self) -> bool {
        self.exact
    }

    /// Everything except the key; key selection happens on the tree.
    pub(crate) fn matches(&self, entry: &QueryEntry) -> bool {
        self.active.is_none_or(|active| entry.is_active() == active)
            && self.stale.is_none_or(|stale| entry.is_stale() == stale)
            && self.status.is_none_or(|status| entry.state().status() == status)
            && self.predicate.as_ref().is_none_or(|predicate| predicate(entry))
    }
}

impl Debug for QueryFilter {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("QueryFilter")
            .field("key", &self.key)
            .field("exact", &self.exact)
            .field("active", &self.active)
            .field("stale", &self.stale)
            .field("status", &self.status)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

impl From<EntryKey> for QueryFilter {
    fn from(key: EntryKey) -> Self {
        Self::new().key(key)
    }
}
