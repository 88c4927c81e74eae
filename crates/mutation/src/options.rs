use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stash_key::EntryKey;
use stash_query::{Expiry, Failure};
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::future::Future;
use std::sync::Arc;

/// Cache-wide mutation defaults.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MutationDefaults {
    pub gc_time: Expiry,
}
impl Default for MutationDefaults {
    fn default() -> Self {
        Self { gc_time: Expiry::secs(60) }
    }
}

pub type MutationFn = Arc<dyn Fn(Value, Option<Value>) -> BoxFuture<'static, Result<Value, Failure>> + Send + Sync>;
type OnMutateFn = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, Failure>> + Send + Sync>;
type OnSuccessFn = Arc<dyn Fn(Value, Value, Option<Value>) -> BoxFuture<'static, Result<(), Failure>> + Send + Sync>;
type OnErrorFn = Arc<dyn Fn(Failure, Value, Option<Value>) -> BoxFuture<'static, Result<(), Failure>> + Send + Sync>;
type OnSettledFn = Arc<
    dyn Fn(Option<Value>, Option<Failure>, Value, Option<Value>) -> BoxFuture<'static, Result<(), Failure>> + Send + Sync,
>;
type KeyFn = Arc<dyn Fn(&Value) -> Vec<Value> + Send + Sync>;
type InvalidateFn = Arc<dyn Fn(&Value, &Value) -> Vec<EntryKey> + Send + Sync>;

/// A mutation key: fixed, or computed from the variables.
#[derive(Clone)]
pub enum MutationKey {
    Static(EntryKey),
    Dynamic(KeyFn),
}

/// Query keys to invalidate after a successful mutation.
#[derive(Clone)]
pub enum InvalidateKeys {
    Static(Vec<EntryKey>),
    /// Computed from `(data, vars)`.
    Dynamic(InvalidateFn),
}

impl InvalidateKeys {
    pub fn resolve(&self, data: &Value, vars: &Value) -> Vec<EntryKey> {
        match self {
            Self::Static(keys) => keys.clone(),
            Self::Dynamic(f) => f(data, vars),
        }
    }
}

fn boxed_unit<Fut, E>(future: Fut) -> BoxFuture<'static, Result<(), Failure>>
where
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Into<Failure> + 'static,
{
    future.map(|result| result.map_err(Into::into)).boxed()
}

/// The mutation function and its lifecycle callbacks.
///
/// Callbacks run in order: `on_mutate(vars)` produces a context, the
/// mutation runs with `(vars, context)`, then `on_success(data, vars,
/// context)` or `on_error(error, vars, context)`, and finally
/// `on_settled(data, error, vars, context)`.
///
/// ```
/// use serde_json::{json, Value};
/// use stash_key::key;
/// use stash_mutation::MutationOptions;
/// use stash_query::Failure;
///
/// let options = MutationOptions::new(|vars: Value, _ctx| async move {
///     Ok::<_, Failure>(json!({"id": 1, "title": vars["title"]}))
/// })
/// .key(key!["todos", "create"])
/// .invalidate_keys(vec![key!["todos"]]);
/// assert!(options.has_key());
/// ```
#[derive(Clone)]
pub struct MutationOptions {
    pub(crate) key: Option<MutationKey>,
    pub(crate) mutation: MutationFn,
    pub(crate) on_mutate: Option<OnMutateFn>,
    pub(crate) on_success: Option<OnSuccessFn>,
    pub(crate) on_error: Option<OnErrorFn>,
    pub(crate) on_settled: Option<OnSettledFn>,
    pub(crate) invalidate_keys: Option<InvalidateKeys>,
    pub(crate) gc_time: Option<Expiry>,
}

impl MutationOptions {
    pub fn new<F, Fut, T, E>(mutation: F) -> Self
    where
        F: Fn(Value, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Serialize + 'static,
        E: Into<Failure> + 'static,
    {
        let mutation: MutationFn = Arc::new(move |vars: Value, context: Option<Value>| {
            mutation(vars, context)
                .map(|result| match result {
                    Ok(data) => serde_json::to_value(data).map_err(Failure::from),
                    Err(error) => Err(error.into()),
                })
                .boxed()
        });
        Self {
            key: None,
            mutation,
            on_mutate: None,
            on_success: None,
            on_error: None,
            on_settled: None,
            invalidate_keys: None,
            gc_time: None,
        }
    }

    pub fn has_key(&self) -> bool {
        self.key.is_some()
    }

    pub fn key(mut self, key: EntryKey) -> Self {
        self.key = Some(MutationKey::Static(key));
        self
    }

    /// Key computed from the variables at `ensure` time.
    pub fn key_with(mut self, key: impl Fn(&Value) -> Vec<Value> + Send + Sync + 'static) -> Self {
        self.key = Some(MutationKey::Dynamic(Arc::new(key)));
        self
    }

    /// Runs first; its output becomes the context handed to every later step.
    pub fn on_mutate<F, Fut, C, E>(mut self, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<C, E>> + Send + 'static,
        C: Serialize + 'static,
        E: Into<Failure> + 'static,
    {
        self.on_mutate = Some(Arc::new(move |vars: Value| {
            f(vars)
                .map(|result| match result {
                    Ok(context) => serde_json::to_value(context).map_err(Failure::from),
                    Err(error) => Err(error.into()),
                })
                .boxed()
        }));
        self
    }

    /// A failure here fails the mutation.
    pub fn on_success<F, Fut, E>(mut self, f: F) -> Self
    where
        F: Fn(Value, Value, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<Failure> + 'static,
    {
        self.on_success =
            Some(Arc::new(move |data: Value, vars: Value, context: Option<Value>| boxed_unit(f(data, vars, context))));
        self
    }

    pub fn on_error<F, Fut, E>(mut self, f: F) -> Self
    where
        F: Fn(Failure, Value, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<Failure> + 'static,
    {
        self.on_error = Some(Arc::new(move |error: Failure, vars: Value, context: Option<Value>| {
            boxed_unit(f(error, vars, context))
        }));
        self
    }

    pub fn on_settled<F, Fut, E>(mut self, f: F) -> Self
    where
        F: Fn(Option<Value>, Option<Failure>, Value, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<Failure> + 'static,
    {
        self.on_settled = Some(Arc::new(
            move |data: Option<Value>, error: Option<Failure>, vars: Value, context: Option<Value>| {
                boxed_unit(f(data, error, vars, context))
            },
        ));
        self
    }

    /// Invalidate (and re-fetch if active) every query under these keys on success.
    pub fn invalidate_keys(mut self, keys: Vec<EntryKey>) -> Self {
        self.invalidate_keys = Some(InvalidateKeys::Static(keys));
        self
    }

    pub fn invalidate_keys_with(mut self, keys: impl Fn(&Value, &Value) -> Vec<EntryKey> + Send + Sync + 'static) -> Self {
        self.invalidate_keys = Some(InvalidateKeys::Dynamic(Arc::new(keys)));
        self
    }

    pub fn gc_time(mut self, gc_time: Expiry) -> Self {
        self.gc_time = Some(gc_time);
        self
    }
}

impl Debug for MutationOptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let key = match &self.key {
            Some(MutationKey::Static(key)) => Some(key.to_string()),
            Some(MutationKey::Dynamic(_)) => Some(String::from("<dynamic>")),
            None => None,
        };
        f.debug_struct("MutationOptions")
            .field("key", &key)
            .field("on_mutate", &self.on_mutate.is_some())
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_settled", &self.on_settled.is_some())
            .field("invalidate_keys", &self.invalidate_keys.is_some())
            .field("gc_time", &self.gc_time)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stash_key::key;

    #[test]
    fn defaults_deserialize() {
        assert_eq!(MutationDefaults::default().gc_time, Expiry::secs(60));
        let defaults: MutationDefaults = serde_json::from_value(json!({"gc_time": "never"})).unwrap();
        assert_eq!(defaults.gc_time, Expiry::Never);
    }

    #[test]
    fn invalidate_keys_resolve() {
        let fixed = InvalidateKeys::Static(vec![key!["todos"]]);
        assert_eq!(fixed.resolve(&json!(null), &json!(null)), vec![key!["todos"]]);
        let dynamic = InvalidateKeys::Dynamic(Arc::new(|data: &Value, _: &Value| vec![key!["todos", data["id"].clone()]]));
        assert_eq!(dynamic.resolve(&json!({"id": 3}), &json!(null)), vec![key!["todos", 3]]);
    }

    #[tokio::test]
    async fn mutation_output_is_serialized() {
        let options = MutationOptions::new(|vars: Value, context: Option<Value>| async move {
            Ok::<_, Failure>((vars, context))
        })
        .on_mutate(|_| async { Ok::<_, Failure>("ctx") });
        let context = (options.on_mutate.as_ref().unwrap())(json!(1)).await.unwrap();
        assert_eq!(context, json!("ctx"));
        let data = (options.mutation)(json!(1), Some(context)).await.unwrap();
        assert_eq!(data, json!([1, "ctx"]));
    }
}
