//! Engine facade and subscriptions.
//!
//! One `Engine` owns every table — cache entries, in-flight records,
//! mutation windows, subscription registry — with a lifetime tied to that
//! instance. Consumers subscribe with a key and an optional fetch function;
//! the subscription handle exposes snapshots, manual revalidation, and
//! mutation, and tears its triggers down on drop.

use std::future::{Future, ready};
use std::sync::Arc;

use dashmap::DashMap;
use metrics::counter;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::config::{Config, Fetcher, Overrides, default_config, resolve};
use crate::coordinator::{Coordinator, Owner, RevalidateJob};
use crate::env::{AlwaysActive, Environment};
use crate::error::{EngineError, FetchError};
use crate::key::Key;
use crate::provider::{CacheProvider, MapProvider};
use crate::scheduler::{SubscriptionCore, arm_interval, run_mount};
use crate::state::{EntryState, Field, Snapshot, StatePatch};
use crate::store::{ChangeCallback, Store, StoreSubscription};
use crate::telemetry::METRIC_MUTATION_TOTAL;

/// Builder for an [`Engine`].
///
/// The engine needs a tokio runtime to spawn fetches and timers on; by
/// default the ambient runtime is captured at build time, and building
/// outside one fails fast with [`EngineError::Runtime`].
#[derive(Default)]
pub struct EngineBuilder {
    provider: Option<Arc<dyn CacheProvider>>,
    environment: Option<Arc<dyn Environment>>,
    overrides: Overrides,
    runtime: Option<Handle>,
}

impl EngineBuilder {
    /// Replace the default in-process provider.
    pub fn provider(mut self, provider: Arc<dyn CacheProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Replace the default always-active environment.
    pub fn environment(mut self, environment: Arc<dyn Environment>) -> Self {
        self.environment = Some(environment);
        self
    }

    /// Engine-wide configuration overrides, layered over the built-in
    /// defaults and under each subscription's call-site overrides.
    pub fn overrides(mut self, overrides: Overrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Use an explicit runtime handle instead of the ambient one.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn build(self) -> Result<Engine, EngineError> {
        let runtime = match self.runtime {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|err| EngineError::runtime(err.to_string()))?,
        };
        let provider = self
            .provider
            .unwrap_or_else(|| Arc::new(MapProvider::new()));
        let environment = self
            .environment
            .unwrap_or_else(|| Arc::new(AlwaysActive));
        let config = Arc::new(resolve(default_config(), &self.overrides));
        let store = Store::new(provider);
        let coordinator = Coordinator::new(store.clone(), Arc::clone(&environment), runtime);

        Ok(Engine {
            inner: Arc::new(EngineInner {
                store,
                coordinator,
                config,
                environment,
                registry: DashMap::new(),
            }),
        })
    }
}

struct EngineInner {
    store: Store,
    coordinator: Coordinator,
    config: Arc<Config>,
    environment: Arc<dyn Environment>,
    registry: DashMap<Uuid, Arc<SubscriptionCore>>,
}

/// The stale-while-revalidate engine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// An engine with default provider, environment, and configuration.
    pub fn new() -> Result<Engine, EngineError> {
        Self::builder().build()
    }

    /// The notification-layer store, for direct reads and subscriptions.
    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    /// Subscribe to a key. The mount trigger runs immediately and the
    /// periodic refresh timer is armed per the resolved configuration;
    /// dropping the returned handle tears both down.
    ///
    /// A disabled key, or a subscription with no fetch function (neither
    /// here nor in configuration), never fetches: snapshots then only
    /// reflect cache contents and fallback data.
    pub fn subscribe(
        &self,
        key: impl Into<Key>,
        fetcher: Option<Fetcher>,
        overrides: Overrides,
    ) -> Subscription {
        let config = Arc::new(resolve(&self.inner.config, &overrides));
        let (cache_key, args) = key.into().serialize();
        let fetcher = fetcher.or_else(|| config.fetcher.clone());
        let core = Arc::new(SubscriptionCore::new(cache_key, args, fetcher, config));

        debug!(cache_key = %core.key, subscription_id = %core.id, "Subscription created");
        self.inner.registry.insert(core.id, Arc::clone(&core));

        run_mount(&self.inner.coordinator, &self.inner.store, &core);
        let interval = arm_interval(
            &self.inner.coordinator,
            &self.inner.store,
            &self.inner.environment,
            &core,
        );
        core.store_interval_task(interval);

        Subscription {
            core,
            engine: self.clone(),
        }
    }

    /// Revalidate a key through the engine-wide configuration. Resolves to
    /// true iff a fetch ran to completion and updated state.
    pub async fn revalidate(&self, key: impl Into<Key>, dedupe: bool) -> bool {
        let (cache_key, args) = key.into().serialize();
        if cache_key.is_empty() {
            return false;
        }
        let Some(job) = self.job_for_key(&cache_key, &args, dedupe) else {
            return false;
        };
        self.inner.coordinator.spawn(job).await.unwrap_or(false)
    }

    /// Write a value to a key, superseding any in-flight fetch.
    pub async fn mutate(
        &self,
        key: impl Into<Key>,
        value: Value,
    ) -> Result<Value, EngineError> {
        self.mutate_with(key, ready(Ok(value))).await
    }

    /// Write the result of a future to a key. The mutation window opens
    /// immediately, so any fetch already in flight is superseded even while
    /// the value is still resolving. A failed future settles the window,
    /// leaves the store untouched, and returns the error.
    pub async fn mutate_with<F>(
        &self,
        key: impl Into<Key>,
        value: F,
    ) -> Result<Value, EngineError>
    where
        F: Future<Output = Result<Value, FetchError>>,
    {
        let (cache_key, args) = key.into().serialize();
        self.mutate_serialized(cache_key, args, value).await
    }

    async fn mutate_serialized<F>(
        &self,
        cache_key: String,
        args: Vec<Value>,
        value: F,
    ) -> Result<Value, EngineError>
    where
        F: Future<Output = Result<Value, FetchError>>,
    {
        if cache_key.is_empty() {
            return Err(EngineError::DisabledKey);
        }
        let coordinator = &self.inner.coordinator;

        counter!(METRIC_MUTATION_TOTAL).increment(1);
        let issued_at = coordinator.clock().tick();
        coordinator.mutations().stamp(&cache_key, issued_at);
        debug!(cache_key = %cache_key, issued_at, "Mutation issued");

        let result = value.await;
        let settled_at = coordinator.clock().tick();
        let latest = coordinator
            .mutations()
            .settle(&cache_key, issued_at, settled_at);

        match result {
            Ok(resolved) => {
                if latest {
                    let patch = StatePatch {
                        data: Field::Set(resolved.clone()),
                        error: Field::Clear,
                        ..StatePatch::default()
                    };
                    self.inner.store.set(&cache_key, &patch);
                    debug!(cache_key = %cache_key, issued_at, settled_at, "Mutation committed");

                    if let Some(job) = self.job_for_key(&cache_key, &args, true) {
                        let _ = coordinator.spawn(job).await;
                    }
                }
                Ok(resolved)
            }
            Err(error) => Err(EngineError::Mutation(error)),
        }
    }

    /// Complete stored state for a key, if any.
    pub fn state(&self, key: impl Into<Key>) -> Option<EntryState> {
        self.inner.store.get(&key.into().cache_key())
    }

    /// Remove a key's entry. The only removal path; entries otherwise live
    /// for the life of the store.
    pub fn delete(&self, key: impl Into<Key>) {
        self.inner.store.delete(&key.into().cache_key());
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.store.keys()
    }

    /// External "became visible/focused" signal. Fires the focus trigger of
    /// every live subscription, subject to per-subscription throttling.
    pub fn notify_focus(&self) {
        if !self.inner.environment.is_active() {
            return;
        }
        let now = Instant::now();
        for entry in self.inner.registry.iter() {
            let core = entry.value();
            if !core.is_alive() || !core.config.revalidate_on_focus {
                continue;
            }
            if !core.focus_due(now) {
                continue;
            }
            debug!(cache_key = %core.key, "Focus revalidation");
            if let Some(job) = core.job(true, 0) {
                self.inner.coordinator.spawn(job);
            }
        }
    }

    /// External "came online" signal. Not independently throttled.
    pub fn notify_reconnect(&self) {
        if !self.inner.environment.is_active() {
            return;
        }
        for entry in self.inner.registry.iter() {
            let core = entry.value();
            if !core.is_alive() || !core.config.revalidate_on_reconnect {
                continue;
            }
            debug!(cache_key = %core.key, "Reconnect revalidation");
            if let Some(job) = core.job(true, 0) {
                self.inner.coordinator.spawn(job);
            }
        }
    }

    /// Build a revalidation job for a key outside any subscription: prefer
    /// a live subscription's fetcher and config, fall back to the
    /// engine-wide fetcher.
    fn job_for_key(&self, cache_key: &str, args: &[Value], dedupe: bool) -> Option<RevalidateJob> {
        for entry in self.inner.registry.iter() {
            let core = entry.value();
            if core.key == cache_key && core.is_alive() {
                if let Some(job) = core.job(dedupe, 0) {
                    return Some(job);
                }
            }
        }

        let fetcher = self.inner.config.fetcher.clone()?;
        Some(RevalidateJob {
            key: cache_key.to_string(),
            args: args.to_vec(),
            fetcher,
            config: Arc::clone(&self.inner.config),
            dedupe,
            retry_count: 0,
            owner: Owner::none(),
        })
    }
}

/// Handle for one consumer's interest in a key.
///
/// Dropping the handle detaches the subscription's triggers and pending
/// timers; a fetch already in flight still commits for the next reader.
pub struct Subscription {
    core: Arc<SubscriptionCore>,
    engine: Engine,
}

impl Subscription {
    /// The serialized cache key this subscription observes.
    pub fn key(&self) -> &str {
        &self.core.key
    }

    pub fn id(&self) -> Uuid {
        self.core.id
    }

    /// Whether this subscription can fetch at all.
    pub fn is_enabled(&self) -> bool {
        !self.core.key.is_empty() && self.core.fetcher.is_some()
    }

    /// Consumer view of the entry: fallback applied, absent flags resolved
    /// to their defaults.
    pub fn snapshot(&self) -> Snapshot {
        self.core.snapshot(&self.engine.inner.store)
    }

    /// Raw stored state, absent fields preserved.
    pub fn state(&self) -> Option<EntryState> {
        self.engine.inner.store.get(&self.core.key)
    }

    /// Manually revalidate (deduped). Resolves to true iff a fetch ran to
    /// completion and updated state.
    pub async fn revalidate(&self) -> bool {
        let Some(job) = self.core.job(true, 0) else {
            return false;
        };
        self.engine
            .inner
            .coordinator
            .spawn(job)
            .await
            .unwrap_or(false)
    }

    /// Write a value to this subscription's key, superseding any in-flight
    /// fetch, then revalidate (deduped).
    pub async fn mutate(&self, value: Value) -> Result<Value, EngineError> {
        self.engine
            .mutate_serialized(self.core.key.clone(), self.core.args.clone(), ready(Ok(value)))
            .await
    }

    /// Register a change callback for this subscription's key.
    pub fn on_change(&self, callback: ChangeCallback) -> StoreSubscription {
        self.engine.inner.store.subscribe(&self.core.key, callback)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        debug!(cache_key = %self.core.key, subscription_id = %self.core.id, "Subscription dropped");
        self.core.teardown();
        self.engine.inner.registry.remove(&self.core.id);
    }
}
