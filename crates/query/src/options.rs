//! Query options and their layered resolution.
//!
//! Three layers, later wins: the cache-wide [`QueryDefaults`], the
//! per-entry [`QueryOptions`], and call-site [`QueryPolicy`] overrides.
//! [`ResolvedOptions::resolve`] flattens them once per `ensure`.

use crate::failure::Failure;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use stash_asyncutils::AbortSignal;
use stash_key::EntryKey;
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// A duration that may be infinite.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Expiry {
    After(Duration),
    Never,
}

impl Expiry {
    pub const fn millis(ms: u64) -> Self {
        Self::After(Duration::from_millis(ms))
    }

    pub const fn secs(secs: u64) -> Self {
        Self::After(Duration::from_secs(secs))
    }

    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Self::After(d) => Some(*d),
            Self::Never => None,
        }
    }

    /// `true` if something settled at `when` has expired by `now`. A `when`
    /// of `0` means "never settled" and is always expired.
    pub fn is_expired(&self, when: u64, now: u64) -> bool {
        if when == 0 {
            return true;
        }
        match self {
            Self::Never => false,
            Self::After(d) => {
                let millis = u64::try_from(d.as_millis()).unwrap_or(u64::MAX);
                now >= when.saturating_add(millis)
            },
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ExpiryRepr {
    Millis(u64),
    Flag(bool),
    Word(String),
}

/// Accepts milliseconds, `"never"` / `"infinity"`, or `false`.
impl<'de> Deserialize<'de> for Expiry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match ExpiryRepr::deserialize(deserializer)? {
            ExpiryRepr::Millis(ms) => Ok(Self::millis(ms)),
            ExpiryRepr::Flag(false) => Ok(Self::Never),
            ExpiryRepr::Flag(true) => Err(D::Error::custom("expected milliseconds, \"never\" or false")),
            ExpiryRepr::Word(word) => match word.to_ascii_lowercase().as_str() {
                "never" | "infinity" => Ok(Self::Never),
                other => Err(D::Error::custom(format!("unknown expiry: {other}"))),
            },
        }
    }
}
impl Serialize for Expiry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::After(d) => serializer.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            Self::Never => serializer.serialize_str("never"),
        }
    }
}

/// When an automatic trigger (mount, window focus, reconnect) should refetch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RefetchPolicy {
    Never,
    /// Only if the entry is stale or errored.
    #[default]
    IfStale,
    Always,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RefetchRepr {
    Flag(bool),
    Word(String),
}

/// Accepts `true` (if stale), `false` (never), or `"never"` / `"if-stale"` / `"always"`.
impl<'de> Deserialize<'de> for RefetchPolicy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match RefetchRepr::deserialize(deserializer)? {
            RefetchRepr::Flag(true) => Ok(Self::IfStale),
            RefetchRepr::Flag(false) => Ok(Self::Never),
            RefetchRepr::Word(word) => match word.as_str() {
                "never" => Ok(Self::Never),
                "if-stale" => Ok(Self::IfStale),
                "always" => Ok(Self::Always),
                other => Err(D::Error::custom(format!("unknown refetch policy: {other}"))),
            },
        }
    }
}

/// Automatic refetch triggers, see [`QueryCache::refetch_on`](crate::QueryCache::refetch_on).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Trigger {
    Mount,
    WindowFocus,
    Reconnect,
}

/// Cache-wide defaults; the bottom configuration layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryDefaults {
    pub stale_time: Expiry,
    pub gc_time: Expiry,
    pub refetch_on_mount: RefetchPolicy,
    pub refetch_on_window_focus: RefetchPolicy,
    pub refetch_on_reconnect: RefetchPolicy,
    pub enabled: bool,
}
impl Default for QueryDefaults {
    fn default() -> Self {
        Self {
            stale_time: Expiry::secs(5),
            gc_time: Expiry::secs(5 * 60),
            refetch_on_mount: RefetchPolicy::IfStale,
            refetch_on_window_focus: RefetchPolicy::IfStale,
            refetch_on_reconnect: RefetchPolicy::IfStale,
            enabled: true,
        }
    }
}

/// Optional policy fields. Used both inside [`QueryOptions`] and as
/// call-site overrides.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryPolicy {
    pub stale_time: Option<Expiry>,
    pub gc_time: Option<Expiry>,
    pub refetch_on_mount: Option<RefetchPolicy>,
    pub refetch_on_window_focus: Option<RefetchPolicy>,
    pub refetch_on_reconnect: Option<RefetchPolicy>,
    pub enabled: Option<bool>,
}
impl QueryPolicy {
    /// Fields set in `over` replace the ones in `self`.
    pub fn merge(&self, over: &QueryPolicy) -> QueryPolicy {
        QueryPolicy {
            stale_time: over.stale_time.or(self.stale_time),
            gc_time: over.gc_time.or(self.gc_time),
            refetch_on_mount: over.refetch_on_mount.or(self.refetch_on_mount),
            refetch_on_window_focus: over.refetch_on_window_focus.or(self.refetch_on_window_focus),
            refetch_on_reconnect: over.refetch_on_reconnect.or(self.refetch_on_reconnect),
            enabled: over.enabled.or(self.enabled),
        }
    }
}

/// What a query function receives.
#[derive(Clone, Debug)]
pub struct QueryContext {
    pub key: EntryKey,
    /// Fires when this call is superseded, cancelled or invalidated.
    pub signal: AbortSignal,
}

pub type QueryFn = Arc<dyn Fn(QueryContext) -> BoxFuture<'static, Result<Value, Failure>> + Send + Sync>;
type InitialData = Arc<dyn Fn() -> Value + Send + Sync>;

/// Per-entry options: the key, the query function and optional policy.
///
/// ```
/// use stash_key::key;
/// use stash_query::{Expiry, Failure, QueryOptions};
///
/// let options = QueryOptions::new(key!["todos", 1], |ctx| async move {
///     ctx.signal.check()?;
///     Ok::<_, Failure>(serde_json::json!({"id": 1, "title": "write docs"}))
/// })
/// .stale_time(Expiry::secs(30))
/// .gc_time(Expiry::Never);
/// assert_eq!(options.policy().stale_time, Some(Expiry::secs(30)));
/// ```
#[derive(Clone)]
pub struct QueryOptions {
    key: EntryKey,
    query: QueryFn,
    policy: QueryPolicy,
    initial_data: Option<InitialData>,
    meta: Option<Value>,
}

impl QueryOptions {
    /// `query` may return any serializable data and any error convertible
    /// into a [`Failure`].
    pub fn new<F, Fut, T, E>(key: EntryKey, query: F) -> Self
    where
        F: Fn(QueryContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Serialize + 'static,
        E: Into<Failure> + 'static,
    {
        let query: QueryFn = Arc::new(move |ctx: QueryContext| {
            query(ctx)
                .map(|result| match result {
                    Ok(data) => serde_json::to_value(data).map_err(Failure::from),
                    Err(error) => Err(error.into()),
                })
                .boxed()
        });
        Self { key, query, policy: QueryPolicy::default(), initial_data: None, meta: None }
    }

    pub fn key(&self) -> &EntryKey {
        &self.key
    }

    pub fn policy(&self) -> &QueryPolicy {
        &self.policy
    }

    pub fn stale_time(mut self, stale_time: Expiry) -> Self {
        self.policy.stale_time = Some(stale_time);
        self
    }

    pub fn gc_time(mut self, gc_time: Expiry) -> Self {
        self.policy.gc_time = Some(gc_time);
        self
    }

    pub fn refetch_on_mount(mut self, policy: RefetchPolicy) -> Self {
        self.policy.refetch_on_mount = Some(policy);
        self
    }

    pub fn refetch_on_window_focus(mut self, policy: RefetchPolicy) -> Self {
        self.policy.refetch_on_window_focus = Some(policy);
        self
    }

    pub fn refetch_on_reconnect(mut self, policy: RefetchPolicy) -> Self {
        self.policy.refetch_on_reconnect = Some(policy);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.policy.enabled = Some(enabled);
        self
    }

    /// Data the entry starts with when it is first created.
    pub fn initial_data(self, data: Value) -> Self {
        self.initial_data_with(move || data.clone())
    }

    pub fn initial_data_with(mut self, data: impl Fn() -> Value + Send + Sync + 'static) -> Self {
        self.initial_data = Some(Arc::new(data));
        self
    }

    /// Opaque metadata, carried into serialized entries.
    pub fn meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }
}

impl Debug for QueryOptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("QueryOptions")
            .field("key", &self.key)
            .field("policy", &self.policy)
            .field("initial_data", &self.initial_data.is_some())
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}

/// Fully resolved options stored on an entry.
#[derive(Clone)]
pub struct ResolvedOptions {
    pub key: EntryKey,
    pub query: QueryFn,
    pub stale_time: Expiry,
    pub gc_time: Expiry,
    pub refetch_on_mount: RefetchPolicy,
    pub refetch_on_window_focus: RefetchPolicy,
    pub refetch_on_reconnect: RefetchPolicy,
    pub enabled: bool,
    pub meta: Option<Value>,
    initial_data: Option<InitialData>,
}

impl ResolvedOptions {
    pub fn resolve(defaults: &QueryDefaults, options: QueryOptions, overrides: &QueryPolicy) -> Self {
        let policy = options.policy.merge(overrides);
        Self {
            key: options.key,
            query: options.query,
            stale_time: policy.stale_time.unwrap_or(defaults.stale_time),
            gc_time: policy.gc_time.unwrap_or(defaults.gc_time),
            refetch_on_mount: policy.refetch_on_mount.unwrap_or(defaults.refetch_on_mount),
            refetch_on_window_focus: policy.refetch_on_window_focus.unwrap_or(defaults.refetch_on_window_focus),
            refetch_on_reconnect: policy.refetch_on_reconnect.unwrap_or(defaults.refetch_on_reconnect),
            enabled: policy.enabled.unwrap_or(defaults.enabled),
            meta: options.meta,
            initial_data: options.initial_data,
        }
    }

    pub fn initial_data(&self) -> Option<Value> {
        self.initial_data.as_ref().map(|f| f())
    }

    pub fn refetch_policy(&self, trigger: Trigger) -> RefetchPolicy {
        match trigger {
            Trigger::Mount => self.refetch_on_mount,
            Trigger::WindowFocus => self.refetch_on_window_focus,
            Trigger::Reconnect => self.refetch_on_reconnect,
        }
    }
}

impl Debug for ResolvedOptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("ResolvedOptions")
            .field("key", &self.key)
            .field("stale_time", &self.stale_time)
            .field("gc_time", &self.gc_time)
            .field("refetch_on_mount", &self.refetch_on_mount)
            .field("refetch_on_window_focus", &self.refetch_on_window_focus)
            .field("refetch_on_reconnect", &self.refetch_on_reconnect)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;
    use stash_key::key;

    #[rstest]
    #[case(Expiry::millis(1000), 5_000, 5_999, false)]
    #[case(Expiry::millis(1000), 5_000, 6_000, true)]
    #[case(Expiry::millis(1000), 5_000, 9_000, true)]
    #[case(Expiry::millis(0), 5_000, 5_000, true)]
    #[case(Expiry::Never, 5_000, u64::MAX, false)]
    #[case(Expiry::Never, 0, 1, true)]
    #[case(Expiry::millis(1000), 0, 0, true)]
    fn expiry_is_expired(#[case] expiry: Expiry, #[case] when: u64, #[case] now: u64, #[case] expired: bool) {
        assert_eq!(expiry.is_expired(when, now), expired);
    }

    #[rstest]
    #[case(json!(1500), Expiry::millis(1500))]
    #[case(json!("never"), Expiry::Never)]
    #[case(json!("Infinity"), Expiry::Never)]
    #[case(json!(false), Expiry::Never)]
    fn expiry_deserialize(#[case] input: Value, #[case] expected: Expiry) {
        assert_eq!(serde_json::from_value::<Expiry>(input).unwrap(), expected);
    }

    #[rstest]
    #[case(json!(true))]
    #[case(json!("soon"))]
    #[case(json!(-1))]
    fn expiry_rejects(#[case] input: Value) {
        assert!(serde_json::from_value::<Expiry>(input).is_err());
    }

    #[rstest]
    #[case(json!(true), RefetchPolicy::IfStale)]
    #[case(json!(false), RefetchPolicy::Never)]
    #[case(json!("always"), RefetchPolicy::Always)]
    #[case(json!("if-stale"), RefetchPolicy::IfStale)]
    fn refetch_policy_deserialize(#[case] input: Value, #[case] expected: RefetchPolicy) {
        assert_eq!(serde_json::from_value::<RefetchPolicy>(input).unwrap(), expected);
    }

    #[test]
    fn layers_resolve_in_order() {
        let defaults = QueryDefaults { stale_time: Expiry::secs(1), gc_time: Expiry::secs(2), ..Default::default() };
        let options = QueryOptions::new(key!["a"], |_| async { Ok::<_, Failure>(1) })
            .stale_time(Expiry::secs(10))
            .refetch_on_mount(RefetchPolicy::Always);
        let overrides = QueryPolicy { stale_time: Some(Expiry::Never), ..Default::default() };
        let resolved = ResolvedOptions::resolve(&defaults, options, &overrides);
        assert_eq!(resolved.stale_time, Expiry::Never);
        assert_eq!(resolved.gc_time, Expiry::secs(2));
        assert_eq!(resolved.refetch_on_mount, RefetchPolicy::Always);
        assert_eq!(resolved.refetch_on_window_focus, RefetchPolicy::IfStale);
        assert!(resolved.enabled);
        assert_eq!(resolved.refetch_policy(Trigger::Mount), RefetchPolicy::Always);
    }

    #[test]
    fn defaults_deserialize_partially() {
        let defaults: QueryDefaults = serde_json::from_value(json!({"stale_time": 0, "gc_time": false})).unwrap();
        assert_eq!(defaults.stale_time, Expiry::millis(0));
        assert_eq!(defaults.gc_time, Expiry::Never);
        assert_eq!(defaults.refetch_on_reconnect, RefetchPolicy::IfStale);
    }

    #[tokio::test]
    async fn query_fn_serializes_output() {
        let options = QueryOptions::new(key!["a"], |ctx| async move {
            Ok::<_, Failure>(vec![ctx.key.to_cache_key().to_string()])
        })
        .initial_data(json!("seed"));
        let resolved = ResolvedOptions::resolve(&QueryDefaults::default(), options, &QueryPolicy::default());
        let ctx = QueryContext { key: key!["a"], signal: stash_asyncutils::AbortController::new().signal() };
        assert_eq!((resolved.query)(ctx).await.unwrap(), json!([r#"["a"]"#]));
        assert_eq!(resolved.initial_data(), Some(json!("seed")));
    }
}
