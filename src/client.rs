use crate::error::{ErrorKind, Result};
use crate::plugin::{Plugin, PluginContext, Scope};
use exn::ResultExt;
use stash_config::{Config, Loader};
use stash_mutation::{MutationCache, MutationDefaults};
use stash_query::{Clock, QueryCache, QueryDefaults, SystemClock};
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::sync::Arc;

/// A query cache, a mutation cache bound to it, and the plugins installed
/// on both.
#[derive(Clone)]
pub struct Client {
    query_cache: Arc<QueryCache>,
    mutation_cache: Arc<MutationCache>,
    scope: Arc<Scope>,
}

impl Client {
    /// A client with built-in defaults and no plugins.
    pub fn new() -> Self {
        let query_cache = QueryCache::new(QueryDefaults::default());
        let mutation_cache = MutationCache::new(query_cache.clone(), MutationDefaults::default());
        Self { query_cache, mutation_cache, scope: Arc::new(Scope::new()) }
    }

    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    pub fn query_cache(&self) -> &Arc<QueryCache> {
        &self.query_cache
    }

    pub fn mutation_cache(&self) -> &Arc<MutationCache> {
        &self.mutation_cache
    }

    pub fn scope(&self) -> &Arc<Scope> {
        &self.scope
    }

    /// Unsubscribes every plugin. The caches stay usable.
    pub fn dispose(&self) {
        tracing::debug!(subscriptions = self.scope.len(), "disposing client scope");
        self.scope.stop();
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for Client {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("Client")
            .field("queries", &self.query_cache.len())
            .field("mutations", &self.mutation_cache.len())
            .field("scope", &self.scope)
            .finish()
    }
}

/// Configures and builds a [`Client`].
#[derive(Default)]
pub struct ClientBuilder {
    defaults: QueryDefaults,
    mutation_defaults: MutationDefaults,
    clock: Option<Arc<dyn Clock>>,
    plugins: Vec<Box<dyn Plugin>>,
}

impl ClientBuilder {
    pub fn defaults(mut self, defaults: QueryDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn mutation_defaults(mut self, defaults: MutationDefaults) -> Self {
        self.mutation_defaults = defaults;
        self
    }

    /// Both sets of defaults from a loaded [`Config`].
    pub fn config(self, config: Config) -> Self {
        self.defaults(config.query).mutation_defaults(config.mutation)
    }

    /// Load defaults through `loader`.
    pub fn load_config(self, loader: &Loader) -> Result<Self> {
        let config = loader.load().or_raise(|| ErrorKind::Config)?;
        Ok(self.config(config))
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Plugins install in the order they are added.
    pub fn plugin(mut self, plugin: impl Plugin + 'static) -> Self {
        self.plugins.push(Box::new(plugin));
        self
    }

    /// Creates both caches and installs every plugin. If one fails, the
    /// subscriptions of those already installed are removed again.
    pub fn build(self) -> Result<Client> {
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let query_cache = QueryCache::with_clock(self.defaults, clock);
        let mutation_cache = MutationCache::new(query_cache.clone(), self.mutation_defaults);
        let scope = Arc::new(Scope::new());
        let context = PluginContext {
            query_cache: query_cache.clone(),
            mutation_cache: mutation_cache.clone(),
            scope: scope.clone(),
        };
        for plugin in &self.plugins {
            tracing::debug!(plugin = plugin.name(), "installing plugin");
            if let Err(failure) = plugin.install(&context) {
                scope.stop();
                return Err(failure).or_raise(|| ErrorKind::Plugin(plugin.name().to_string()));
            }
        }
        Ok(Client { query_cache, mutation_cache, scope })
    }
}

impl Debug for ClientBuilder {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("ClientBuilder")
            .field("defaults", &self.defaults)
            .field("mutation_defaults", &self.mutation_defaults)
            .field("plugins", &self.plugins.iter().map(|plugin| plugin.name()).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stash_query::{Expiry, Failure, ManualClock};

    #[test]
    fn builder_applies_defaults_and_clock() {
        let clock = Arc::new(ManualClock::new(1_000));
        let client = Client::builder()
            .config(Config {
                query: QueryDefaults { stale_time: Expiry::Never, ..QueryDefaults::default() },
                mutation: MutationDefaults { gc_time: Expiry::millis(10) },
            })
            .clock(clock.clone())
            .build()
            .unwrap();
        assert_eq!(client.query_cache().defaults().stale_time, Expiry::Never);
        assert_eq!(client.mutation_cache().defaults().gc_time, Expiry::millis(10));
        assert_eq!(client.query_cache().clock().now(), 1_000);
        assert!(Arc::ptr_eq(client.mutation_cache().query_cache(), client.query_cache()));
    }

    #[test]
    fn failed_install_rolls_back_earlier_plugins() {
        let result = Client::builder()
            .plugin(|ctx: &PluginContext| -> std::result::Result<(), Failure> {
                ctx.on_query_action(|_| {});
                Ok(())
            })
            .plugin(|_: &PluginContext| -> std::result::Result<(), Failure> { Err(Failure::msg("no")) })
            .build();
        let err = result.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Plugin(_)));
    }

    #[test]
    fn dispose_stops_scope() {
        let client = Client::builder()
            .plugin(|ctx: &PluginContext| -> std::result::Result<(), Failure> {
                ctx.on_query_action(|_| {});
                ctx.on_mutation_action(|_| {});
                Ok(())
            })
            .build()
            .unwrap();
        assert_eq!(client.scope().len(), 2);
        client.dispose();
        assert!(client.scope().is_empty());
        assert!(!client.scope().is_active());
    }
}
