use crate::clock::{Clock, SystemClock};
use crate::entry::{ConsumerId, PendingCall, QueryEntry, SharedCall};
use crate::failure::Failure;
use crate::filter::QueryFilter;
use crate::hooks::{Action, ActionEvent, ActionHooks, Subscription};
use crate::options::{QueryContext, QueryDefaults, QueryOptions, QueryPolicy, RefetchPolicy, ResolvedOptions, Trigger};
use crate::state::{AsyncStatus, DataState};
use futures::future::{self, BoxFuture, try_join_all};
use futures::{Future, FutureExt};
use serde_json::Value;
use stash_asyncutils::{AbortController, AbortReason, AbortSignal};
use stash_key::{EntryKey, TreeMapNode};
use std::collections::HashMap;
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::runtime::Handle;
use tracing::instrument;

/// Future returned by [`QueryCache::fetch`] and [`QueryCache::refresh`].
pub type FetchFuture = BoxFuture<'static, Result<DataState, Failure>>;

/// Every interceptable query cache operation, with its arguments.
#[derive(Clone, Debug)]
pub enum QueryAction {
    Ensure { key: EntryKey },
    /// A new entry was created; plugins attach their extension fields here.
    Extend { entry: Arc<QueryEntry> },
    Fetch { entry: Arc<QueryEntry> },
    Refresh { entry: Arc<QueryEntry> },
    Invalidate { entry: Arc<QueryEntry> },
    Cancel { entry: Arc<QueryEntry>, reason: AbortReason },
    Remove { entry: Arc<QueryEntry> },
    Track { entry: Arc<QueryEntry>, consumer: ConsumerId },
    Untrack { entry: Arc<QueryEntry>, consumer: ConsumerId },
    SetEntryState { entry: Arc<QueryEntry>, state: DataState },
    SetQueryData { key: EntryKey },
}

impl Action for QueryAction {
    fn name(&self) -> &'static str {
        match self {
            Self::Ensure { .. } => "ensure",
            Self::Extend { .. } => "extend",
            Self::Fetch { .. } => "fetch",
            Self::Refresh { .. } => "refresh",
            Self::Invalidate { .. } => "invalidate",
            Self::Cancel { .. } => "cancel",
            Self::Remove { .. } => "remove",
            Self::Track { .. } => "track",
            Self::Untrack { .. } => "untrack",
            Self::SetEntryState { .. } => "setEntryState",
            Self::SetQueryData { .. } => "setQueryData",
        }
    }
}

impl QueryAction {
    /// The entry the action operates on, if it already exists.
    pub fn entry(&self) -> Option<&Arc<QueryEntry>> {
        match self {
            Self::Ensure { .. } | Self::SetQueryData { .. } => None,
            Self::Extend { entry }
            | Self::Fetch { entry }
            | Self::Refresh { entry }
            | Self::Invalidate { entry }
            | Self::Cancel { entry, .. }
            | Self::Remove { entry }
            | Self::Track { entry, .. }
            | Self::Untrack { entry, .. }
            | Self::SetEntryState { entry, .. } => Some(entry),
        }
    }
}

/// What an action produced, handed to `after` callbacks.
#[derive(Clone, Debug)]
pub enum QueryActionOutput {
    Entry(Arc<QueryEntry>),
    State(DataState),
    Done,
}

/// Which invalidated entries [`QueryCache::invalidate_queries`] re-fetches.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RefetchActive {
    None,
    #[default]
    Active,
    All,
}

/// The query cache: a key tree of entries plus the operations that drive
/// their state.
///
/// Always handled as `Arc<QueryCache>`; GC timers and in-flight fetches keep
/// a weak reference back to it.
pub struct QueryCache {
    caches: Mutex<TreeMapNode<Arc<QueryEntry>>>,
    defaults: QueryDefaults,
    clock: Arc<dyn Clock>,
    hooks: ActionHooks<QueryAction, QueryActionOutput>,
    definitions: Mutex<HashMap<String, QueryOptions>>,
    next_call: AtomicU64,
    self_ref: Weak<QueryCache>,
}

impl QueryCache {
    pub fn new(defaults: QueryDefaults) -> Arc<Self> {
        Self::with_clock(defaults, Arc::new(SystemClock))
    }

    pub fn with_clock(defaults: QueryDefaults, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            caches: Mutex::new(TreeMapNode::new()),
            defaults,
            clock,
            hooks: ActionHooks::default(),
            definitions: Mutex::new(HashMap::new()),
            next_call: AtomicU64::new(1),
            self_ref: self_ref.clone(),
        })
    }

    pub fn defaults(&self) -> &QueryDefaults {
        &self.defaults
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    fn lock_caches(&self) -> MutexGuard<'_, TreeMapNode<Arc<QueryEntry>>> {
        self.caches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Observe every action on this cache.
    pub fn on_action(
        &self,
        handler: impl Fn(&mut ActionEvent<'_, QueryAction, QueryActionOutput>) + Send + Sync + 'static,
    ) -> Subscription {
        self.hooks.subscribe(handler)
    }

    /// Look up or create the entry for `options.key`. See [`ensure_with`](Self::ensure_with).
    pub fn ensure(&self, options: QueryOptions) -> Arc<QueryEntry> {
        self.ensure_with(options, &QueryPolicy::default())
    }

    /// Look up or create the entry for `options.key`, and store the
    /// resolved options on it.
    ///
    /// Idempotent per canonical key: the same entry comes back every time,
    /// with its options replaced by the latest ones.
    #[instrument(level = "trace", skip_all, fields(key = %options.key()))]
    pub fn ensure_with(&self, options: QueryOptions, overrides: &QueryPolicy) -> Arc<QueryEntry> {
        let key = options.key().clone();
        let settle = self.hooks.begin(&QueryAction::Ensure { key: key.clone() });
        let resolved = Arc::new(ResolvedOptions::resolve(&self.defaults, options, overrides));
        let (entry, created) = self.get_or_insert_with(&key, || {
            let entry = self.new_entry(key.clone());
            if let Some(data) = resolved.initial_data() {
                entry.replace_state(DataState::success(data));
                entry.set_when(self.clock.now());
            }
            entry
        });
        entry.set_options(resolved);
        if created {
            self.extend(&entry);
        }
        settle.ok(&QueryActionOutput::Entry(Arc::clone(&entry)));
        entry
    }

    fn new_entry(&self, key: EntryKey) -> QueryEntry {
        QueryEntry::new(key, Arc::clone(&self.clock), self.defaults.stale_time, self.defaults.gc_time)
    }

    /// Returns the entry and whether it was created by this call.
    fn get_or_insert_with(&self, key: &EntryKey, create: impl FnOnce() -> QueryEntry) -> (Arc<QueryEntry>, bool) {
        let path = key.tree_path();
        let mut caches = self.lock_caches();
        if let Some(entry) = caches.get(&path) {
            return (Arc::clone(entry), false);
        }
        let entry = Arc::new(create());
        caches.set(&path, Arc::clone(&entry));
        (entry, true)
    }

    /// Entry for `key`, created without options (and announced through
    /// `extend`) if absent.
    pub(crate) fn get_or_create(&self, key: &EntryKey) -> Arc<QueryEntry> {
        let (entry, created) = self.get_or_insert_with(key, || self.new_entry(key.clone()));
        if created {
            self.extend(&entry);
        }
        entry
    }

    fn extend(&self, entry: &Arc<QueryEntry>) {
        self.hooks.begin(&QueryAction::Extend { entry: Arc::clone(entry) }).ok(&QueryActionOutput::Done);
    }

    /// The entry for `key`, without creating it.
    pub fn get(&self, key: &EntryKey) -> Option<Arc<QueryEntry>> {
        self.lock_caches().get(&key.tree_path()).cloned()
    }

    /// Start a fetch unconditionally, superseding any in-flight one.
    ///
    /// The query function is invoked before this returns. The returned
    /// future resolves with this call's own outcome, but only the most
    /// recently started call is allowed to write entry state. Under a Tokio
    /// runtime the call is driven in the background, so the entry settles
    /// even if the returned future is dropped.
    #[instrument(level = "trace", skip_all, fields(key = %entry.key()))]
    pub fn fetch(&self, entry: &Arc<QueryEntry>) -> FetchFuture {
        let settle = self.hooks.begin(&QueryAction::Fetch { entry: Arc::clone(entry) });
        let Some(options) = entry.options() else {
            tracing::warn!(key = %entry.key(), "fetch on an entry without options; call ensure first");
            let state = entry.state();
            settle.ok(&QueryActionOutput::State(state.clone()));
            return future::ready(Ok(state)).boxed();
        };

        entry.set_async_status(AsyncStatus::Loading);
        let controller = AbortController::new();
        let signal = controller.signal();
        let id = self.next_call.fetch_add(1, Ordering::Relaxed);
        let previous = entry.lock().pending.take();
        if let Some(previous) = previous {
            tracing::debug!(key = %entry.key(), "superseding in-flight fetch");
            previous.controller.abort(AbortReason::Superseded);
        }

        let query = (options.query)(QueryContext { key: entry.key().clone(), signal: signal.clone() });
        let cache = self.self_ref.clone();
        let target = Arc::clone(entry);
        let call = share(async move {
            let result = query.await;
            let outcome = match cache.upgrade() {
                Some(cache) => cache.settle_call(&target, id, &signal, result),
                None => result.map(DataState::success),
            };
            settle.settle(&outcome, |state| QueryActionOutput::State(state.clone()));
            outcome
        });

        // The call must own `pending` before it can run, or it settles as superseded.
        let superseded = {
            let mut inner = entry.lock();
            inner.pending.replace(PendingCall { id, controller, call: call.clone(), when: self.clock.now() })
        };
        if let Some(superseded) = superseded {
            superseded.controller.abort(AbortReason::Superseded);
        }
        spawn(&call);
        call.boxed()
    }

    /// Apply a finished call to its entry if it is still the authoritative one.
    fn settle_call(
        &self,
        entry: &Arc<QueryEntry>,
        id: u64,
        signal: &AbortSignal,
        result: Result<Value, Failure>,
    ) -> Result<DataState, Failure> {
        let authoritative = entry.is_current_call(id);
        let outcome = match result {
            Ok(data) => {
                let state = DataState::success(data);
                if authoritative {
                    entry.set_when(self.clock.now());
                    self.set_entry_state(entry, state.clone());
                }
                Ok(state)
            },
            Err(failure) => {
                // Only an abort carrying this call's own reason is cancellation.
                let cancelled = match (&failure, signal.reason()) {
                    (Failure::Aborted(reason), Some(own)) => *reason == own,
                    _ => false,
                };
                if authoritative && !cancelled {
                    entry.set_when(self.clock.now());
                    self.set_entry_state(entry, entry.state().failed(failure.clone()));
                }
                Err(failure)
            },
        };
        if !entry.finish_call(id) {
            tracing::debug!(key = %entry.key(), "discarding result of superseded fetch");
        }
        outcome
    }

    /// Fetch only if the entry errored or is stale. Joins an in-flight fetch
    /// instead of starting a second one; otherwise resolves immediately with
    /// the current state.
    pub fn refresh(&self, entry: &Arc<QueryEntry>) -> FetchFuture {
        let settle = self.hooks.begin(&QueryAction::Refresh { entry: Arc::clone(entry) });
        let state = entry.state();
        if entry.options().is_none() {
            tracing::warn!(key = %entry.key(), "refresh on an entry without options; call ensure first");
            settle.ok(&QueryActionOutput::State(state.clone()));
            return future::ready(Ok(state)).boxed();
        }
        if state.error().is_none() && !entry.is_stale() {
            settle.ok(&QueryActionOutput::State(state.clone()));
            return future::ready(Ok(state)).boxed();
        }
        let call = match entry.pending_call() {
            Some(pending) => pending.boxed(),
            None => self.fetch(entry),
        };
        drive(async move {
            let outcome = call.await;
            settle.settle(&outcome, |state| QueryActionOutput::State(state.clone()));
            outcome
        })
        .boxed()
    }

    /// Mark the entry stale and abort its in-flight fetch. Does not refetch.
    #[instrument(level = "trace", skip_all, fields(key = %entry.key()))]
    pub fn invalidate(&self, entry: &Arc<QueryEntry>) {
        let settle = self.hooks.begin(&QueryAction::Invalidate { entry: Arc::clone(entry) });
        entry.set_when(0);
        self.abort(entry, AbortReason::Invalidated);
        settle.ok(&QueryActionOutput::Done);
    }

    /// Abort the in-flight fetch, if any, and go back to idle right away.
    pub fn cancel(&self, entry: &Arc<QueryEntry>, reason: Option<String>) {
        self.abort(entry, AbortReason::Cancelled(reason));
    }

    fn abort(&self, entry: &Arc<QueryEntry>, reason: AbortReason) {
        let settle = self.hooks.begin(&QueryAction::Cancel { entry: Arc::clone(entry), reason: reason.clone() });
        entry.abort_pending(reason);
        settle.ok(&QueryActionOutput::Done);
    }

    /// Entries matching `filter`, in tree order.
    pub fn get_entries(&self, filter: &QueryFilter) -> Vec<Arc<QueryEntry>> {
        let candidates: Vec<Arc<QueryEntry>> = {
            let caches = self.lock_caches();
            match (filter.get_key(), filter.is_exact()) {
                (None, true) => return Vec::new(),
                (Some(key), true) => caches.get(&key.tree_path()).cloned().into_iter().collect(),
                (Some(key), false) => {
                    caches.find(&key.tree_path()).map(|node| node.iter().cloned().collect()).unwrap_or_default()
                },
                (None, false) => caches.iter().cloned().collect(),
            }
        };
        // Filters run unlocked; predicates may call back into the cache.
        candidates.into_iter().filter(|entry| filter.matches(entry)).collect()
    }

    /// Register `consumer` on the entry and cancel any pending GC.
    pub fn track(&self, entry: &Arc<QueryEntry>, consumer: ConsumerId) {
        let settle = self.hooks.begin(&QueryAction::Track { entry: Arc::clone(entry), consumer });
        entry.lock().deps.insert(consumer);
        entry.cancel_gc();
        settle.ok(&QueryActionOutput::Done);
    }

    /// Unregister `consumer`; arms GC when it was the last one.
    pub fn untrack(&self, entry: &Arc<QueryEntry>, consumer: ConsumerId) {
        let settle = self.hooks.begin(&QueryAction::Untrack { entry: Arc::clone(entry), consumer });
        let idle = {
            let mut inner = entry.lock();
            inner.deps.remove(&consumer);
            inner.deps.is_empty()
        };
        if idle {
            self.schedule_gc(entry);
        }
        settle.ok(&QueryActionOutput::Done);
    }

    fn schedule_gc(&self, entry: &Arc<QueryEntry>) {
        let gc_time = entry.lock().gc_time;
        let Some(delay) = gc_time.as_duration() else {
            entry.cancel_gc();
            return;
        };
        let Ok(runtime) = Handle::try_current() else {
            tracing::warn!(key = %entry.key(), "no tokio runtime; entry will not be garbage collected");
            return;
        };
        let cache = self.self_ref.clone();
        let target = Arc::downgrade(entry);
        let task = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let (Some(cache), Some(entry)) = (cache.upgrade(), target.upgrade()) else {
                return;
            };
            if entry.is_active() {
                return;
            }
            tracing::debug!(key = %entry.key(), "collecting inactive entry");
            cache.remove(&entry);
        });
        tracing::debug!(key = %entry.key(), delay_ms = delay.as_millis(), "gc armed");
        if let Some(previous) = entry.lock().gc.replace(task) {
            previous.abort();
        }
    }

    /// Remove the entry's value from the tree. Entries under the same
    /// prefix are kept.
    #[instrument(level = "trace", skip_all, fields(key = %entry.key()))]
    pub fn remove(&self, entry: &Arc<QueryEntry>) {
        let settle = self.hooks.begin(&QueryAction::Remove { entry: Arc::clone(entry) });
        entry.cancel_gc();
        let path = entry.key().tree_path();
        {
            let mut caches = self.lock_caches();
            // Only if the tree still holds this very entry.
            if caches.get(&path).is_some_and(|current| Arc::ptr_eq(current, entry)) {
                caches.take(&path);
            }
        }
        settle.ok(&QueryActionOutput::Done);
    }

    /// The only place entry state is written.
    pub fn set_entry_state(&self, entry: &Arc<QueryEntry>, state: DataState) {
        let settle =
            self.hooks.begin(&QueryAction::SetEntryState { entry: Arc::clone(entry), state: state.clone() });
        entry.replace_state(state);
        settle.ok(&QueryActionOutput::Done);
    }

    /// Write data for `key`, creating the entry (without options) if needed.
    pub fn set_query_data(&self, key: &EntryKey, data: Value) -> Arc<QueryEntry> {
        self.update_query_data(key, move |_| data)
    }

    /// Like [`set_query_data`](Self::set_query_data), computing the new data
    /// from the current data, if any.
    pub fn update_query_data(&self, key: &EntryKey, updater: impl FnOnce(Option<&Value>) -> Value) -> Arc<QueryEntry> {
        let settle = self.hooks.begin(&QueryAction::SetQueryData { key: key.clone() });
        let entry = self.get_or_create(key);
        let data = updater(entry.state().data());
        entry.set_when(self.clock.now());
        self.set_entry_state(&entry, DataState::success(data));
        settle.ok(&QueryActionOutput::Entry(Arc::clone(&entry)));
        entry
    }

    pub fn get_query_data(&self, key: &EntryKey) -> Option<Value> {
        self.get(key)?.state().data().cloned()
    }

    /// Update the data of every matching entry that has data.
    pub fn set_queries_data(&self, filter: &QueryFilter, updater: impl Fn(&Value) -> Value) {
        for entry in self.get_entries(filter) {
            let Some(data) = entry.state().data().map(&updater) else {
                continue;
            };
            entry.set_when(self.clock.now());
            self.set_entry_state(&entry, DataState::success(data));
        }
    }

    /// Invalidate every matching entry, then re-fetch those selected by
    /// `refetch`. Disabled entries and entries without options are never
    /// re-fetched. Resolves once all re-fetches have succeeded, or with the
    /// first failure.
    pub fn invalidate_queries(&self, filter: &QueryFilter, refetch: RefetchActive) -> BoxFuture<'static, Result<(), Failure>> {
        let mut calls = Vec::new();
        for entry in self.get_entries(filter) {
            self.invalidate(&entry);
            let selected = match refetch {
                RefetchActive::None => false,
                RefetchActive::Active => entry.is_active(),
                RefetchActive::All => true,
            };
            if selected && entry.options().is_some_and(|options| options.enabled) {
                calls.push(self.fetch(&entry));
            }
        }
        async move { try_join_all(calls).await.map(|_| ()) }.boxed()
    }

    /// [`cancel`](Self::cancel) every matching entry.
    pub fn cancel_queries(&self, filter: &QueryFilter, reason: Option<String>) {
        for entry in self.get_entries(filter) {
            self.cancel(&entry, reason.clone());
        }
    }

    /// Apply each active entry's policy for `trigger`: `Always` fetches,
    /// `IfStale` refreshes, `Never` skips.
    pub fn refetch_on(&self, trigger: Trigger) -> BoxFuture<'static, Result<(), Failure>> {
        let mut calls = Vec::new();
        for entry in self.get_entries(&QueryFilter::new().active(true)) {
            let Some(options) = entry.options().filter(|options| options.enabled) else {
                continue;
            };
            match options.refetch_policy(trigger) {
                RefetchPolicy::Never => {},
                RefetchPolicy::IfStale => calls.push(self.refresh(&entry)),
                RefetchPolicy::Always => calls.push(self.fetch(&entry)),
            }
        }
        async move { try_join_all(calls).await.map(|_| ()) }.boxed()
    }

    /// Reusable options registered under a caller-chosen id. `factory` runs
    /// only the first time `id` is seen.
    pub fn define(&self, id: impl Into<String>, factory: impl FnOnce() -> QueryOptions) -> QueryOptions {
        let mut definitions = self.definitions.lock().unwrap_or_else(PoisonError::into_inner);
        definitions.entry(id.into()).or_insert_with(factory).clone()
    }

    /// Snapshot of every entry, in tree order.
    pub fn entries(&self) -> Vec<Arc<QueryEntry>> {
        self.lock_caches().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock_caches().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Debug for QueryCache {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("QueryCache")
            .field("entries", &self.len())
            .field("defaults", &self.defaults)
            .field("subscribers", &self.hooks.len())
            .finish_non_exhaustive()
    }
}

/// Make `future` shareable and, under a Tokio runtime, drive it in the
/// background.
fn share<F>(future: F) -> SharedCall
where
    F: Future<Output = Result<DataState, Failure>> + Send + 'static,
{
    future.boxed().shared()
}

/// Drive `call` on the current Tokio runtime, if any, so it settles even
/// when every awaiter is dropped.
fn spawn(call: &SharedCall) {
    if let Ok(runtime) = Handle::try_current() {
        runtime.spawn(call.clone());
    }
}

fn drive<F>(future: F) -> SharedCall
where
    F: Future<Output = Result<DataState, Failure>> + Send + 'static,
{
    let call = share(future);
    spawn(&call);
    call
}
