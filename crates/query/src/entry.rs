use crate::clock::Clock;
use crate::ext::Extensions;
use crate::failure::Failure;
use crate::options::{Expiry, ResolvedOptions};
use crate::state::{AsyncStatus, DataState};
use async_stream::stream;
use futures::Stream;
use futures::future::{BoxFuture, Shared};
use stash_asyncutils::{AbortController, AbortReason};
use stash_key::EntryKey;
use std::any::Any;
use std::collections::HashSet;
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub(crate) type SharedCall = Shared<BoxFuture<'static, Result<DataState, Failure>>>;

static NEXT_CONSUMER: AtomicU64 = AtomicU64::new(1);

/// Identity of something that uses an entry (a component, an effect scope,
/// a subscription). An entry with at least one tracked consumer is active.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConsumerId(u64);

impl ConsumerId {
    pub fn new() -> Self {
        Self(NEXT_CONSUMER.fetch_add(1, Ordering::Relaxed))
    }
}
impl Default for ConsumerId {
    fn default() -> Self {
        Self::new()
    }
}

/// The in-flight fetch of an entry.
pub(crate) struct PendingCall {
    /// Identity token; compared on completion to decide whether the call is
    /// still the authoritative one.
    pub(crate) id: u64,
    pub(crate) controller: AbortController,
    pub(crate) call: SharedCall,
    pub(crate) when: u64,
}

pub(crate) struct EntryInner {
    pub(crate) when: u64,
    pub(crate) deps: HashSet<ConsumerId>,
    pub(crate) pending: Option<PendingCall>,
    pub(crate) gc: Option<JoinHandle<()>>,
    pub(crate) options: Option<Arc<ResolvedOptions>>,
    pub(crate) stale_time: Expiry,
    pub(crate) gc_time: Expiry,
    pub(crate) ext: Extensions,
}

/// One cached query.
///
/// Consumers hold `Arc<QueryEntry>` as an observational handle: they read
/// state, subscribe to changes and register themselves via
/// [`QueryCache::track`](crate::QueryCache::track). Every mutation goes
/// through the owning [`QueryCache`](crate::QueryCache).
pub struct QueryEntry {
    key: EntryKey,
    state: watch::Sender<DataState>,
    async_status: watch::Sender<AsyncStatus>,
    inner: Mutex<EntryInner>,
    clock: Arc<dyn Clock>,
}

impl QueryEntry {
    pub(crate) fn new(key: EntryKey, clock: Arc<dyn Clock>, stale_time: Expiry, gc_time: Expiry) -> Self {
        let (state, _) = watch::channel(DataState::Pending);
        let (async_status, _) = watch::channel(AsyncStatus::Idle);
        Self {
            key,
            state,
            async_status,
            inner: Mutex::new(EntryInner {
                when: 0,
                deps: HashSet::new(),
                pending: None,
                gc: None,
                options: None,
                stale_time,
                gc_time,
                ext: Extensions::default(),
            }),
            clock,
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, EntryInner> {
        // State behind this lock is only ever assigned whole, never half-written.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn key(&self) -> &EntryKey {
        &self.key
    }

    /// Snapshot of the data axis.
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

    /// Every state change from now on, starting with the current state.
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

    /// Unix milliseconds of the last settle; `0` if it never settled.
    pub fn when(&self) -> u64 {
        self.lock().when
    }

    pub fn is_stale(&self) -> bool {
        let inner = self.lock();
        inner.stale_time.is_expired(inner.when, self.clock.now())
    }

    pub fn is_active(&self) -> bool {
        !self.lock().deps.is_empty()
    }

    pub fn consumer_count(&self) -> usize {
        self.lock().deps.len()
    }

    pub fn is_pending(&self) -> bool {
        self.lock().pending.is_some()
    }

    /// When the in-flight fetch started, if there is one.
    pub fn pending_since(&self) -> Option<u64> {
        self.lock().pending.as_ref().map(|p| p.when)
    }

    /// `true` if a GC timer is armed for this entry.
    pub fn gc_scheduled(&self) -> bool {
        self.lock().gc.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    pub fn options(&self) -> Option<Arc<ResolvedOptions>> {
        self.lock().options.clone()
    }

    pub fn ext<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.lock().ext.get::<T>()
    }

    /// Attach a plugin field. Meant to be called from an `extend` hook.
    pub fn set_ext<T: Any + Send + Sync>(&self, value: T) -> Option<Arc<T>> {
        self.lock().ext.insert(value)
    }

    pub fn extensions(&self) -> Extensions {
        self.lock().ext.clone()
    }

    pub(crate) fn now(&self) -> u64 {
        self.clock.now()
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

    pub(crate) fn set_options(&self, options: Arc<ResolvedOptions>) {
        let mut inner = self.lock();
        inner.stale_time = options.stale_time;
        inner.gc_time = options.gc_time;
        inner.options = Some(options);
    }

    pub(crate) fn set_when(&self, when: u64) {
        self.lock().when = when;
    }

    /// The in-flight call to join, if any.
    pub(crate) fn pending_call(&self) -> Option<SharedCall> {
        self.lock().pending.as_ref().map(|p| p.call.clone())
    }

    pub(crate) fn is_current_call(&self, id: u64) -> bool {
        self.lock().pending.as_ref().is_some_and(|p| p.id == id)
    }

    /// Clear the pending record if `id` still owns it. Returns whether it did.
    pub(crate) fn finish_call(&self, id: u64) -> bool {
        let finished = {
            let mut inner = self.lock();
            match &inner.pending {
                Some(pending) if pending.id == id => {
                    inner.pending = None;
                    true
                },
                _ => false,
            }
        };
        if finished {
            self.set_async_status(AsyncStatus::Idle);
        }
        finished
    }

    /// Abort and drop the pending call, if any, and go back to idle.
    pub(crate) fn abort_pending(&self, reason: AbortReason) -> bool {
        let pending = self.lock().pending.take();
        match pending {
            Some(pending) => {
                pending.controller.abort(reason);
                self.set_async_status(AsyncStatus::Idle);
                true
            },
            None => false,
        }
    }

    pub(crate) fn cancel_gc(&self) {
        if let Some(handle) = self.lock().gc.take() {
            handle.abort();
        }
    }
}

impl Debug for QueryEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let inner = self.lock();
        f.debug_struct("QueryEntry")
            .field("key", &self.key)
            .field("status", &self.state.borrow().status())
            .field("async_status", &*self.async_status.borrow())
            .field("when", &inner.when)
            .field("deps", &inner.deps.len())
            .field("pending", &inner.pending.is_some())
            .field("ext", &inner.ext)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use futures::StreamExt;
    use serde_json::json;
    use stash_key::key;

    fn entry(clock: Arc<ManualClock>, stale_time: Expiry) -> QueryEntry {
        QueryEntry::new(key!["e"], clock, stale_time, Expiry::Never)
    }

    #[test]
    fn staleness_follows_when_and_stale_time() {
        let clock = Arc::new(ManualClock::new(10_000));
        let entry = entry(clock.clone(), Expiry::millis(1000));
        assert!(entry.is_stale(), "never settled");
        entry.set_when(10_000);
        assert!(!entry.is_stale());
        clock.set(10_999);
        assert!(!entry.is_stale());
        clock.set(11_000);
        assert!(entry.is_stale());
    }

    #[test]
    fn infinite_stale_time_only_stale_when_never_settled() {
        let clock = Arc::new(ManualClock::new(10_000));
        let entry = entry(clock.clone(), Expiry::Never);
        assert!(entry.is_stale());
        entry.set_when(10_000);
        clock.set(u64::MAX);
        assert!(!entry.is_stale());
        entry.set_when(0);
        assert!(entry.is_stale());
    }

    #[test]
    fn async_status_only_notifies_on_change() {
        let entry = entry(Arc::new(ManualClock::new(1)), Expiry::Never);
        let mut receiver = entry.subscribe_async_status();
        entry.set_async_status(AsyncStatus::Idle);
        assert!(!receiver.has_changed().unwrap());
        entry.set_async_status(AsyncStatus::Loading);
        assert!(receiver.has_changed().unwrap());
        assert_eq!(*receiver.borrow_and_update(), AsyncStatus::Loading);
    }

    #[tokio::test]
    async fn state_stream_yields_current_then_changes() {
        let entry = entry(Arc::new(ManualClock::new(1)), Expiry::Never);
        let mut stream = Box::pin(entry.state_stream());
        assert_eq!(stream.next().await, Some(DataState::Pending));
        entry.replace_state(DataState::success(json!(1)));
        assert_eq!(stream.next().await, Some(DataState::success(json!(1))));
    }

    #[test]
    fn consumers_are_unique() {
        assert_ne!(ConsumerId::new(), ConsumerId::new());
    }
}
