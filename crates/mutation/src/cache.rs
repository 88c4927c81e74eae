use crate::entry::MutationEntry;
use crate::error::{ErrorKind, Result};
use crate::filter::MutationFilter;
use crate::options::{MutationDefaults, MutationKey, MutationOptions};
use exn::ResultExt;
use futures::future::try_join_all;
use serde_json::{Value, json};
use stash_key::{EntryKey, TreeMapNode, key};
use stash_query::{
    Action, ActionEvent, ActionHooks, AsyncStatus, Clock, ConsumerId, DataState, Failure, QueryCache, QueryFilter,
    RefetchActive, Subscription,
};
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::runtime::Handle;
use tracing::instrument;

/// Every interceptable mutation cache operation, with its arguments.
#[derive(Clone, Debug)]
pub enum MutationAction {
    Ensure { entry: Arc<MutationEntry>, vars: Value },
    Mutate { entry: Arc<MutationEntry>, vars: Value },
    Remove { entry: Arc<MutationEntry> },
    Track { entry: Arc<MutationEntry>, consumer: ConsumerId },
    Untrack { entry: Arc<MutationEntry>, consumer: ConsumerId },
    SetEntryState { entry: Arc<MutationEntry>, state: DataState },
}

impl Action for MutationAction {
    fn name(&self) -> &'static str {
        match self {
            Self::Ensure { .. } => "ensure",
            Self::Mutate { .. } => "mutate",
            Self::Remove { .. } => "remove",
            Self::Track { .. } => "track",
            Self::Untrack { .. } => "untrack",
            Self::SetEntryState { .. } => "setEntryState",
        }
    }
}

impl MutationAction {
    pub fn entry(&self) -> &Arc<MutationEntry> {
        match self {
            Self::Ensure { entry, .. }
            | Self::Mutate { entry, .. }
            | Self::Remove { entry }
            | Self::Track { entry, .. }
            | Self::Untrack { entry, .. }
            | Self::SetEntryState { entry, .. } => entry,
        }
    }
}

#[derive(Clone, Debug)]
pub enum MutationActionOutput {
    Entry(Arc<MutationEntry>),
    Data(Value),
    Done,
}

/// `$<digits>`: the segment appended to every mutation's tree key.
fn is_reserved_segment(segment: &Value) -> bool {
    segment
        .as_str()
        .and_then(|s| s.strip_prefix('$'))
        .is_some_and(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
}

/// The mutation cache.
///
/// Each `ensure` registers one invocation in the key tree under
/// `[...key, "$<id>"]` (or `["$<id>"]` for unkeyed mutations), so repeated
/// calls of the same mutation are kept apart and can be filtered by key.
pub struct MutationCache {
    caches: Mutex<TreeMapNode<Arc<MutationEntry>>>,
    query_cache: Arc<QueryCache>,
    defaults: MutationDefaults,
    clock: Arc<dyn Clock>,
    hooks: ActionHooks<MutationAction, MutationActionOutput>,
    next_id: AtomicU64,
    next_call: AtomicU64,
    self_ref: Weak<MutationCache>,
}

impl MutationCache {
    /// Successful mutations invalidate queries in `query_cache`.
    pub fn new(query_cache: Arc<QueryCache>, defaults: MutationDefaults) -> Arc<Self> {
        let clock = query_cache.clock();
        Arc::new_cyclic(|self_ref| Self {
            caches: Mutex::new(TreeMapNode::new()),
            query_cache,
            defaults,
            clock,
            hooks: ActionHooks::default(),
            next_id: AtomicU64::new(1),
            next_call: AtomicU64::new(1),
            self_ref: self_ref.clone(),
        })
    }

    pub fn query_cache(&self) -> &Arc<QueryCache> {
        &self.query_cache
    }

    pub fn defaults(&self) -> &MutationDefaults {
        &self.defaults
    }

    fn lock_caches(&self) -> MutexGuard<'_, TreeMapNode<Arc<MutationEntry>>> {
        self.caches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn on_action(
        &self,
        handler: impl Fn(&mut ActionEvent<'_, MutationAction, MutationActionOutput>) + Send + Sync + 'static,
    ) -> Subscription {
        self.hooks.subscribe(handler)
    }

    /// A new, not yet registered entry for `options`.
    pub fn create(&self, options: MutationOptions) -> Arc<MutationEntry> {
        let gc_time = options.gc_time.unwrap_or(self.defaults.gc_time);
        Arc::new(MutationEntry::new(Arc::new(options), gc_time))
    }

    /// Register an invocation of `entry` with `vars`.
    ///
    /// An entry that was already registered is left alone and a fresh entry
    /// with the same options is registered instead.
    #[instrument(level = "trace", skip_all)]
    pub fn ensure(&self, entry: &Arc<MutationEntry>, vars: Value) -> Result<Arc<MutationEntry>> {
        let key = match &entry.options().key {
            None => None,
            Some(MutationKey::Static(key)) => Some(key.clone()),
            Some(MutationKey::Dynamic(key)) => Some(EntryKey::new(key(&vars)).or_raise(|| ErrorKind::EmptyKey)?),
        };
        let settle = self.hooks.begin(&MutationAction::Ensure { entry: Arc::clone(entry), vars: vars.clone() });
        if let Some(key) = &key
            && key.segments().iter().any(is_reserved_segment)
        {
            tracing::warn!(key = %key, "mutation key uses the reserved \"$<number>\" segment format");
        }

        let entry = if entry.is_ensured() {
            Arc::new(MutationEntry::new(Arc::clone(entry.options()), entry.gc_time()))
        } else {
            Arc::clone(entry)
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let tag = format!("${id}");
        let tree_key = match &key {
            Some(key) => key.child(json!(tag)),
            None => key![tag],
        };
        {
            let mut inner = entry.lock();
            inner.id = Some(id);
            inner.key = key;
            inner.tree_key = Some(tree_key.clone());
            inner.vars = Some(vars);
        }
        self.lock_caches().set(&tree_key.tree_path(), Arc::clone(&entry));
        settle.ok(&MutationActionOutput::Entry(Arc::clone(&entry)));
        Ok(entry)
    }

    /// Run the mutation.
    ///
    /// Only the most recent call on an entry writes its state; older calls
    /// still resolve with their own outcome. On success, queries under the
    /// options' `invalidate_keys` are invalidated and active ones re-fetched
    /// before this resolves.
    #[instrument(level = "trace", skip_all, fields(id = ?entry.id()))]
    pub async fn mutate(&self, entry: &Arc<MutationEntry>, vars: Value) -> std::result::Result<Value, Failure> {
        let entry = if entry.is_ensured() {
            Arc::clone(entry)
        } else {
            tracing::warn!("mutate on an entry that was never ensured; ensuring it now");
            self.ensure(entry, vars.clone()).map_err(|error| Failure::new((*error).clone()))?
        };
        let settle = self.hooks.begin(&MutationAction::Mutate { entry: Arc::clone(&entry), vars: vars.clone() });
        let call = self.next_call.fetch_add(1, Ordering::Relaxed);
        {
            let mut inner = entry.lock();
            inner.pending_call = Some(call);
            inner.vars = Some(vars.clone());
            inner.context = None;
        }
        entry.cancel_gc();
        entry.set_async_status(AsyncStatus::Loading);
        let options = Arc::clone(entry.options());

        let context = match &options.on_mutate {
            Some(on_mutate) => on_mutate(vars.clone()).await.map(Some),
            None => Ok(None),
        };
        let (context, result) = match context {
            Ok(context) => {
                if entry.is_current_call(call) {
                    entry.lock().context = context.clone();
                }
                let result = Self::run(&options, &vars, &context).await;
                (context, result)
            },
            Err(failure) => (None, Err(failure)),
        };

        if let (Err(failure), Some(on_error)) = (&result, &options.on_error)
            && let Err(hook_failure) = on_error(failure.clone(), vars.clone(), context.clone()).await
        {
            tracing::warn!(error = %hook_failure, "on_error callback failed");
        }

        let current = entry.is_current_call(call);
        if current {
            let state = match &result {
                Ok(data) => DataState::success(data.clone()),
                Err(failure) => entry.state().failed(failure.clone()),
            };
            entry.lock().when = self.clock.now();
            self.set_entry_state(&entry, state);
        } else {
            tracing::debug!("discarding result of superseded mutation");
        }

        if let (Ok(data), Some(keys)) = (&result, &options.invalidate_keys) {
            let refetches: Vec<_> = keys
                .resolve(data, &vars)
                .into_iter()
                .map(|key| self.query_cache.invalidate_queries(&QueryFilter::new().key(key), RefetchActive::Active))
                .collect();
            if let Err(failure) = try_join_all(refetches).await {
                tracing::warn!(error = %failure, "re-fetch after mutation failed");
            }
        }

        if let Some(on_settled) = &options.on_settled {
            let data = result.as_ref().ok().cloned();
            let error = result.as_ref().err().cloned();
            if let Err(hook_failure) = on_settled(data, error, vars.clone(), context.clone()).await {
                tracing::warn!(error = %hook_failure, "on_settled callback failed");
            }
        }

        if current && entry.is_current_call(call) {
            entry.lock().pending_call = None;
            entry.set_async_status(AsyncStatus::Idle);
        }
        if !entry.is_active() {
            self.schedule_gc(&entry);
        }
        settle.settle(&result, |data| MutationActionOutput::Data(data.clone()));
        result
    }

    /// The mutation function followed by `on_success`; a failure in either
    /// fails the call.
    async fn run(
        options: &MutationOptions,
        vars: &Value,
        context: &Option<Value>,
    ) -> std::result::Result<Value, Failure> {
        let data = (options.mutation)(vars.clone(), context.clone()).await?;
        if let Some(on_success) = &options.on_success {
            on_success(data.clone(), vars.clone(), context.clone()).await?;
        }
        Ok(data)
    }

    /// The only place mutation entry state is written.
    pub fn set_entry_state(&self, entry: &Arc<MutationEntry>, state: DataState) {
        let settle =
            self.hooks.begin(&MutationAction::SetEntryState { entry: Arc::clone(entry), state: state.clone() });
        entry.replace_state(state);
        settle.ok(&MutationActionOutput::Done);
    }

    /// Registered entries matching `filter`, in tree order.
    pub fn get_entries(&self, filter: &MutationFilter) -> Vec<Arc<MutationEntry>> {
        let entries: Vec<Arc<MutationEntry>> = self.lock_caches().iter().cloned().collect();
        entries.into_iter().filter(|entry| filter.matches(entry)).collect()
    }

    pub fn track(&self, entry: &Arc<MutationEntry>, consumer: ConsumerId) {
        let settle = self.hooks.begin(&MutationAction::Track { entry: Arc::clone(entry), consumer });
        entry.lock().deps.insert(consumer);
        entry.cancel_gc();
        settle.ok(&MutationActionOutput::Done);
    }

    pub fn untrack(&self, entry: &Arc<MutationEntry>, consumer: ConsumerId) {
        let settle = self.hooks.begin(&MutationAction::Untrack { entry: Arc::clone(entry), consumer });
        let idle = {
            let mut inner = entry.lock();
            inner.deps.remove(&consumer);
            inner.deps.is_empty()
        };
        if idle && entry.async_status() == AsyncStatus::Idle {
            self.schedule_gc(entry);
        }
        settle.ok(&MutationActionOutput::Done);
    }

    fn schedule_gc(&self, entry: &Arc<MutationEntry>) {
        if !entry.is_ensured() {
            return;
        }
        let Some(delay) = entry.gc_time().as_duration() else {
            return;
        };
        let Ok(runtime) = Handle::try_current() else {
            tracing::warn!("no tokio runtime; mutation entry will not be garbage collected");
            return;
        };
        let cache = self.self_ref.clone();
        let target = Arc::downgrade(entry);
        let task = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let (Some(cache), Some(entry)) = (cache.upgrade(), target.upgrade()) else {
                return;
            };
            if entry.is_active() || entry.async_status() == AsyncStatus::Loading {
                return;
            }
            tracing::debug!(id = ?entry.id(), "collecting settled mutation");
            cache.remove(&entry);
        });
        if let Some(previous) = entry.lock().gc.replace(task) {
            previous.abort();
        }
    }

    pub fn remove(&self, entry: &Arc<MutationEntry>) {
        let settle = self.hooks.begin(&MutationAction::Remove { entry: Arc::clone(entry) });
        entry.cancel_gc();
        if let Some(tree_key) = entry.tree_key() {
            let path = tree_key.tree_path();
            let mut caches = self.lock_caches();
            if caches.get(&path).is_some_and(|current| Arc::ptr_eq(current, entry)) {
                caches.take(&path);
            }
        }
        settle.ok(&MutationActionOutput::Done);
    }

    pub fn len(&self) -> usize {
        self.lock_caches().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Debug for MutationCache {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("MutationCache")
            .field("entries", &self.len())
            .field("defaults", &self.defaults)
            .field("subscribers", &self.hooks.len())
            .finish_non_exhaustive()
    }
}
