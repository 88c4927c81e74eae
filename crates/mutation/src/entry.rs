use crate::options::MutationOptions;
use async_stream::stream;
use futures::Stream;
use serde_json::Value;
use stash_key::EntryKey;
use stash_query::{AsyncStatus, ConsumerId, DataState, Expiry, Extensions};
use std::any::Any;
use std::collections::HashSet;
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub(crate) struct MutationInner {
    pub(crate) id: Option<u64>,
    pub(crate) key: Option<EntryKey>,
    pub(crate) tree_key: Option<EntryKey>,
    pub(crate) vars: Option<Value>,
    pub(crate) context: Option<Value>,
    pub(crate) when: u64,
    pub(crate) pending_call: Option<u64>,
    pub(crate) deps: HashSet<ConsumerId>,
    pub(crate) gc: Option<JoinHandle<()>>,
    pub(crate) ext: Extensions,
}

/// One mutation invocation.
///
/// Created from options by [`MutationCache::create`](crate::MutationCache::create)
/// and registered, with its variables, by
/// [`MutationCache::ensure`](crate::MutationCache::ensure).
pub struct MutationEntry {
    options: Arc<MutationOptions>,
    gc_time: Expiry,
    state: watch::Sender<DataState>,
    async_status: watch::Sender<AsyncStatus>,
    inner: Mutex<MutationInner>,
}

impl MutationEntry {
    pub(crate) fn new(options: Arc<MutationOptions>, gc_time: Expiry) -> Self {
        let (state, _) = watch::channel(DataState::Pending);
        let (async_status, _) = watch::channel(AsyncStatus::Idle);
        Self {
            options,
            gc_time,
            state,
            async_status,
            inner: Mutex::new(MutationInner {
                id: None,
                key: None,
                tree_key: None,
                vars: None,
                context: None,
                when: 0,
                pending_call: None,
                deps: HashSet::new(),
                gc: None,
                ext: Extensions::default(),
            }),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, MutationInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn options(&self) -> &Arc<MutationOptions> {
        &self.options
    }

    /// Unique id assigned by `ensure`; `None` until then.
    pub fn id(&self) -> Option<u64> {
        self.lock().id
    }

    pub fn is_ensured(&self) -> bool {
        self.lock().id.is_some()
    }

    /// The user key, if the options define one.
    pub fn key(&self) -> Option<EntryKey> {
        self.lock().key.clone()
    }

    /// Where the entry lives in the cache tree: the user key (if any)
    /// followed by the reserved `$<id>` segment.
    pub fn tree_key(&self) -> Option<EntryKey> {
        self.lock().tree_key.clone()
    }

    pub fn vars(&self) -> Option<Value> {
        self.lock().vars.clone()
    }

    /// Output of `on_mutate` for the latest call.
    pub fn context(&self) -> Option<Value> {
        self.lock().context.clone()
    }

    pub fn when(&self) -> u64 {
        self.lock().when
    }

    pub fn gc_time(&self) -> Expiry {
        self.gc_time
    }

    pub fn state(&self) -> DataState {
        self.state.borrow().clone()
    }

    pub fn async_status(&self) -> AsyncStatus {
        *self.async_status.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<DataState> {
        self.state.subscribe()
    }

    pub fn subscribe_async_status(&self) -> watch::Receiver<AsyncStatus> {
        self.async_status.subscribe()
    }

    pub fn state_stream(&self) -> impl Stream<Item = DataState> + Send + 'static {
        let mut receiver = self.state.subscribe();
        stream! {
            loop {
                let current = receiver.borrow_and_update().clone();
                yield current;
                if receiver.changed().await.is_err() {
                    break;
                }
            }
        }
    }

    pub fn is_active(&self) -> bool {
        !self.lock().deps.is_empty()
    }

    pub fn gc_scheduled(&self) -> bool {
        self.lock().gc.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    pub fn ext<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.lock().ext.get::<T>()
    }

    pub fn set_ext<T: Any + Send + Sync>(&self, value: T) -> Option<Arc<T>> {
        self.lock().ext.insert(value)
    }

    pub(crate) fn replace_state(&self, state: DataState) {
        self.state.send_replace(state);
    }

    pub(crate) fn set_async_status(&self, status: AsyncStatus) {
        self.async_status.send_if_modified(|current| {
            let changed = *current != status;
            *current = status;
            changed
        });
    }

    pub(crate) fn is_current_call(&self, call: u64) -> bool {
        self.lock().pending_call == Some(call)
    }

    pub(crate) fn cancel_gc(&self) {
        if let Some(handle) = self.lock().gc.take() {
            handle.abort();
        }
    }
}

impl Debug for MutationEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let inner = self.lock();
        f.debug_struct("MutationEntry")
            .field("id", &inner.id)
            .field("key", &inner.key)
            .field("status", &self.state.borrow().status())
            .field("async_status", &*self.async_status.borrow())
            .field("vars", &inner.vars)
            .field("deps", &inner.deps.len())
            .finish_non_exhaustive()
    }
}
