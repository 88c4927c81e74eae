//! Observer hooks around named cache actions.
//!
//! A subscriber sees every action before it runs and may register an
//! `after` callback (action succeeded) and an `on_error` callback (action
//! failed). Subscribers receive the action by shared reference, so none of
//! them can change what another one observes, and a panicking callback is
//! logged and skipped without affecting the action or other subscribers.

use crate::failure::Failure;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

/// A named action descriptor.
pub trait Action {
    fn name(&self) -> &'static str;
}

type Handler<A, O> = Arc<dyn Fn(&mut ActionEvent<'_, A, O>) + Send + Sync>;
type AfterFn<O> = Box<dyn FnOnce(&O) + Send>;
type ErrorFn = Box<dyn FnOnce(&Failure) + Send>;

/// What a subscriber receives for each action.
pub struct ActionEvent<'a, A, O> {
    action: &'a A,
    after: Vec<AfterFn<O>>,
    on_error: Vec<ErrorFn>,
}

impl<A: Action, O> ActionEvent<'_, A, O> {
    pub fn name(&self) -> &'static str {
        self.action.name()
    }

    pub fn args(&self) -> &A {
        self.action
    }

    /// Run `f` with the result once the action succeeds.
    pub fn after(&mut self, f: impl FnOnce(&O) + Send + 'static) {
        self.after.push(Box::new(f));
    }

    /// Run `f` with the failure if the action fails.
    pub fn on_error(&mut self, f: impl FnOnce(&Failure) + Send + 'static) {
        self.on_error.push(Box::new(f));
    }
}

struct Registry<A, O> {
    next: AtomicU64,
    handlers: Mutex<Vec<(u64, Handler<A, O>)>>,
}

/// Subscriber list for one cache.
pub struct ActionHooks<A, O> {
    registry: Arc<Registry<A, O>>,
}

impl<A, O> Default for ActionHooks<A, O> {
    fn default() -> Self {
        Self { registry: Arc::new(Registry { next: AtomicU64::new(1), handlers: Mutex::new(Vec::new()) }) }
    }
}

impl<A, O> ActionHooks<A, O>
where
    A: Action + 'static,
    O: 'static,
{
    pub fn subscribe(&self, handler: impl Fn(&mut ActionEvent<'_, A, O>) + Send + Sync + 'static) -> Subscription {
        let id = self.registry.next.fetch_add(1, Ordering::Relaxed);
        self.registry.handlers.lock().unwrap_or_else(PoisonError::into_inner).push((id, Arc::new(handler)));
        let registry: Weak<Registry<A, O>> = Arc::downgrade(&self.registry);
        Subscription::new(move || {
            if let Some(registry) = registry.upgrade() {
                registry.handlers.lock().unwrap_or_else(PoisonError::into_inner).retain(|(other, _)| *other != id);
            }
        })
    }

    pub fn len(&self) -> usize {
        self.registry.handlers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Announce `action` to every subscriber and collect their callbacks.
    ///
    /// Call before performing the action, then settle the returned value
    /// with its outcome. No cache lock may be held here: subscribers are
    /// free to call back into the cache.
    pub fn begin(&self, action: &A) -> Settle<O> {
        let handlers: Vec<Handler<A, O>> = self
            .registry
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        let mut settle = Settle { name: action.name(), after: Vec::new(), on_error: Vec::new() };
        if handlers.is_empty() {
            return settle;
        }
        for handler in handlers {
            let mut event = ActionEvent { action, after: Vec::new(), on_error: Vec::new() };
            if catch_unwind(AssertUnwindSafe(|| handler(&mut event))).is_err() {
                tracing::error!(action = action.name(), "action subscriber panicked");
                continue;
            }
            settle.after.append(&mut event.after);
            settle.on_error.append(&mut event.on_error);
        }
        settle
    }
}

/// Callbacks waiting for an action's outcome.
#[must_use = "settle the action with ok() or err()"]
pub struct Settle<O> {
    name: &'static str,
    after: Vec<AfterFn<O>>,
    on_error: Vec<ErrorFn>,
}

impl<O> Settle<O> {
    pub fn ok(self, output: &O) {
        for callback in self.after {
            if catch_unwind(AssertUnwindSafe(|| callback(output))).is_err() {
                tracing::error!(action = self.name, "after callback panicked");
            }
        }
    }

    pub fn err(self, failure: &Failure) {
        for callback in self.on_error {
            if catch_unwind(AssertUnwindSafe(|| callback(failure))).is_err() {
                tracing::error!(action = self.name, "on_error callback panicked");
            }
        }
    }

    pub fn settle<T>(self, result: &Result<T, Failure>, output: impl FnOnce(&T) -> O) {
        match result {
            Ok(value) => self.ok(&output(value)),
            Err(failure) => self.err(failure),
        }
    }
}

/// Handle returned by `on_action`. Dropping it keeps the subscription;
/// call [`Subscription::unsubscribe`] to remove it.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self { cancel: Some(Box::new(cancel)) }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("active", &self.cancel.is_some()).finish()
    }
}
