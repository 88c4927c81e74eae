use stash_mutation::{MutationAction, MutationActionOutput, MutationCache};
use stash_query::{ActionEvent, Failure, QueryAction, QueryActionOutput, QueryCache, Subscription};
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Cross-cutting behaviour installed into a [`Client`](crate::Client).
///
/// `install` runs once, synchronously, while the client is built. Plugins
/// observe the caches through `on_action` and keep their state in entry
/// extensions; anything they register through the context is torn down
/// when the scope stops.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn install(&self, context: &PluginContext) -> Result<(), Failure>;
}

impl<F> Plugin for F
where
    F: Fn(&PluginContext) -> Result<(), Failure> + Send + Sync,
{
    fn install(&self, context: &PluginContext) -> Result<(), Failure> {
        self(context)
    }
}

/// Subscriptions owned by a client. Stopping the scope unsubscribes all of
/// them; anything added afterwards is unsubscribed immediately.
#[derive(Default)]
pub struct Scope {
    inner: Mutex<ScopeInner>,
}

#[derive(Default)]
struct ScopeInner {
    stopped: bool,
    subscriptions: Vec<Subscription>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ScopeInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, subscription: Subscription) {
        let mut inner = self.lock();
        if inner.stopped {
            drop(inner);
            subscription.unsubscribe();
            return;
        }
        inner.subscriptions.push(subscription);
    }

    /// Run `cleanup` when the scope stops.
    pub fn on_stop(&self, cleanup: impl FnOnce() + Send + Sync + 'static) {
        self.add(Subscription::new(cleanup));
    }

    pub fn is_active(&self) -> bool {
        !self.lock().stopped
    }

    pub fn len(&self) -> usize {
        self.lock().subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unsubscribes in reverse registration order. Idempotent.
    pub fn stop(&self) {
        let subscriptions = {
            let mut inner = self.lock();
            inner.stopped = true;
            mem::take(&mut inner.subscriptions)
        };
        for subscription in subscriptions.into_iter().rev() {
            subscription.unsubscribe();
        }
    }
}

impl Debug for Scope {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let inner = self.lock();
        f.debug_struct("Scope")
            .field("stopped", &inner.stopped)
            .field("subscriptions", &inner.subscriptions.len())
            .finish()
    }
}

/// Handed to [`Plugin::install`].
#[derive(Clone, Debug)]
pub struct PluginContext {
    pub query_cache: Arc<QueryCache>,
    pub mutation_cache: Arc<MutationCache>,
    pub scope: Arc<Scope>,
}

impl PluginContext {
    /// Observe query cache actions for the lifetime of the scope.
    pub fn on_query_action(
        &self,
        handler: impl Fn(&mut ActionEvent<'_, QueryAction, QueryActionOutput>) + Send + Sync + 'static,
    ) {
        self.scope.add(self.query_cache.on_action(handler));
    }

    /// Observe mutation cache actions for the lifetime of the scope.
    pub fn on_mutation_action(
        &self,
        handler: impl Fn(&mut ActionEvent<'_, MutationAction, MutationActionOutput>) + Send + Sync + 'static,
    ) {
        self.scope.add(self.mutation_cache.on_action(handler));
    }
}
