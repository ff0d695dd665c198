//! Engine configuration.
//!
//! Options are layered in increasing precedence — built-in defaults, then
//! engine-wide overrides, then call-site overrides — with a shallow merge: a
//! field present in a higher layer fully replaces the same field below it.
//! The only exception is the `fallback` map, which merges per cache key.
//! The resolved [`Config`] is immutable and shared by reference.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use serde_json::Value;

use crate::error::FetchError;

// Built-in defaults, matching the engine's documented behavior.
const DEFAULT_DEDUPING_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_FOCUS_THROTTLE_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_LOADING_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_ERROR_RETRY_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_ERROR_RETRY_COUNT: u32 = 3;

/// The future a fetch function produces.
pub type FetchFuture = BoxFuture<'static, Result<Value, FetchError>>;

/// A fetch function: opaque, caller-supplied, transport-agnostic. Receives
/// the argument list derived from the key.
pub type Fetcher = Arc<dyn Fn(Vec<Value>) -> FetchFuture + Send + Sync>;

/// Wrap a plain async closure as a [`Fetcher`].
pub fn fetch_fn<F, Fut, E>(f: F) -> Fetcher
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, E>> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    Arc::new(move |args| {
        let fut = f(args);
        async move { fut.await.map_err(FetchError::new) }.boxed()
    })
}

/// Comparator used before committing fetched data; `true` means "unchanged,
/// keep the previously cached value".
pub type Comparator = Arc<dyn Fn(&Value, &Value) -> bool + Send + Sync>;

pub type LoadingSlowCallback = Arc<dyn Fn(&str, &Config) + Send + Sync>;
pub type SuccessCallback = Arc<dyn Fn(&Value, &str, &Config) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&FetchError, &str, &Config) + Send + Sync>;
/// Invoked with (error, key, retry_count, delay) when a retry is scheduled.
pub type ErrorRetryCallback = Arc<dyn Fn(&FetchError, &str, u32, Duration) + Send + Sync>;
pub type DiscardedCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Periodic refresh policy.
#[derive(Clone, Default)]
pub enum RefreshInterval {
    #[default]
    Disabled,
    Every(Duration),
    /// Recomputed from the latest cached data on every tick.
    ForData(Arc<dyn Fn(Option<&Value>) -> Option<Duration> + Send + Sync>),
}

impl RefreshInterval {
    /// The period for the next tick, `None` when the timer is disarmed.
    pub fn period(&self, latest: Option<&Value>) -> Option<Duration> {
        let period = match self {
            RefreshInterval::Disabled => None,
            RefreshInterval::Every(period) => Some(*period),
            RefreshInterval::ForData(f) => f(latest),
        };
        period.filter(|p| !p.is_zero())
    }
}

impl fmt::Debug for RefreshInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefreshInterval::Disabled => write!(f, "Disabled"),
            RefreshInterval::Every(period) => write!(f, "Every({period:?})"),
            RefreshInterval::ForData(_) => write!(f, "ForData(..)"),
        }
    }
}

/// Whether a failed fetch is eligible for retry.
#[derive(Clone)]
pub enum RetryPolicy {
    Always,
    Never,
    Predicate(Arc<dyn Fn(&FetchError) -> bool + Send + Sync>),
}

impl RetryPolicy {
    pub fn allows(&self, error: &FetchError) -> bool {
        match self {
            RetryPolicy::Always => true,
            RetryPolicy::Never => false,
            RetryPolicy::Predicate(p) => p(error),
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryPolicy::Always => write!(f, "Always"),
            RetryPolicy::Never => write!(f, "Never"),
            RetryPolicy::Predicate(_) => write!(f, "Predicate(..)"),
        }
    }
}

/// Fully-resolved, immutable options object.
#[derive(Clone)]
pub struct Config {
    /// Default fetch function, used when a subscription supplies none.
    pub fetcher: Option<Fetcher>,
    pub revalidate_if_stale: bool,
    /// Overrides the mount decision entirely when set.
    pub revalidate_on_mount: Option<bool>,
    pub revalidate_on_focus: bool,
    pub revalidate_on_reconnect: bool,
    pub refresh_interval: RefreshInterval,
    pub refresh_when_hidden: bool,
    pub refresh_when_offline: bool,
    pub should_retry_on_error: RetryPolicy,
    pub deduping_interval: Duration,
    pub focus_throttle_interval: Duration,
    /// `None` disables the loading-slow advisory.
    pub loading_timeout: Option<Duration>,
    pub error_retry_interval: Duration,
    /// `None` retries without bound.
    pub error_retry_count: Option<u32>,
    pub keep_previous_data: bool,
    /// Snapshot fallback for any key, highest priority.
    pub fallback_data: Option<Value>,
    /// Snapshot fallback per cache key.
    pub fallback: HashMap<String, Value>,
    pub compare: Comparator,
    pub on_loading_slow: LoadingSlowCallback,
    pub on_success: SuccessCallback,
    pub on_error: ErrorCallback,
    pub on_error_retry: ErrorRetryCallback,
    pub on_discarded: DiscardedCallback,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fetcher: None,
            revalidate_if_stale: true,
            revalidate_on_mount: None,
            revalidate_on_focus: true,
            revalidate_on_reconnect: true,
            refresh_interval: RefreshInterval::Disabled,
            refresh_when_hidden: false,
            refresh_when_offline: false,
            should_retry_on_error: RetryPolicy::Always,
            deduping_interval: DEFAULT_DEDUPING_INTERVAL,
            focus_throttle_interval: DEFAULT_FOCUS_THROTTLE_INTERVAL,
            loading_timeout: Some(DEFAULT_LOADING_TIMEOUT),
            error_retry_interval: DEFAULT_ERROR_RETRY_INTERVAL,
            error_retry_count: Some(DEFAULT_ERROR_RETRY_COUNT),
            keep_previous_data: false,
            fallback_data: None,
            fallback: HashMap::new(),
            compare: Arc::new(|a, b| a == b),
            on_loading_slow: Arc::new(|_, _| {}),
            on_success: Arc::new(|_, _, _| {}),
            on_error: Arc::new(|_, _, _| {}),
            on_error_retry: Arc::new(|_, _, _, _| {}),
            on_discarded: Arc::new(|_| {}),
        }
    }
}

static DEFAULTS: Lazy<Config> = Lazy::new(Config::default);

/// The built-in defaults, shared by reference.
pub fn default_config() -> &'static Config {
    &DEFAULTS
}

impl Config {
    /// Resolve the snapshot fallback value for a cache key:
    /// `fallback_data` wins over the per-key `fallback` map.
    pub fn fallback_for(&self, cache_key: &str) -> Option<Value> {
        self.fallback_data
            .clone()
            .or_else(|| self.fallback.get(cache_key).cloned())
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("fetcher", &self.fetcher.as_ref().map(|_| ".."))
            .field("revalidate_if_stale", &self.revalidate_if_stale)
            .field("revalidate_on_mount", &self.revalidate_on_mount)
            .field("revalidate_on_focus", &self.revalidate_on_focus)
            .field("revalidate_on_reconnect", &self.revalidate_on_reconnect)
            .field("refresh_interval", &self.refresh_interval)
            .field("refresh_when_hidden", &self.refresh_when_hidden)
            .field("refresh_when_offline", &self.refresh_when_offline)
            .field("should_retry_on_error", &self.should_retry_on_error)
            .field("deduping_interval", &self.deduping_interval)
            .field("focus_throttle_interval", &self.focus_throttle_interval)
            .field("loading_timeout", &self.loading_timeout)
            .field("error_retry_interval", &self.error_retry_interval)
            .field("error_retry_count", &self.error_retry_count)
            .field("keep_previous_data", &self.keep_previous_data)
            .field("fallback_data", &self.fallback_data)
            .field("fallback", &self.fallback)
            .finish_non_exhaustive()
    }
}

/// One layer of overrides; unset fields inherit from the layer below.
#[derive(Clone, Default)]
pub struct Overrides {
    pub fetcher: Option<Fetcher>,
    pub revalidate_if_stale: Option<bool>,
    pub revalidate_on_mount: Option<bool>,
    pub revalidate_on_focus: Option<bool>,
    pub revalidate_on_reconnect: Option<bool>,
    pub refresh_interval: Option<RefreshInterval>,
    pub refresh_when_hidden: Option<bool>,
    pub refresh_when_offline: Option<bool>,
    pub should_retry_on_error: Option<RetryPolicy>,
    pub deduping_interval: Option<Duration>,
    pub focus_throttle_interval: Option<Duration>,
    pub loading_timeout: Option<Option<Duration>>,
    pub error_retry_interval: Option<Duration>,
    pub error_retry_count: Option<Option<u32>>,
    pub keep_previous_data: Option<bool>,
    pub fallback_data: Option<Value>,
    pub fallback: HashMap<String, Value>,
    pub compare: Option<Comparator>,
    pub on_loading_slow: Option<LoadingSlowCallback>,
    pub on_success: Option<SuccessCallback>,
    pub on_error: Option<ErrorCallback>,
    pub on_error_retry: Option<ErrorRetryCallback>,
    pub on_discarded: Option<DiscardedCallback>,
}

impl fmt::Debug for Overrides {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Overrides")
            .field("revalidate_if_stale", &self.revalidate_if_stale)
            .field("revalidate_on_mount", &self.revalidate_on_mount)
            .field("revalidate_on_focus", &self.revalidate_on_focus)
            .field("revalidate_on_reconnect", &self.revalidate_on_reconnect)
            .field("refresh_interval", &self.refresh_interval)
            .field("deduping_interval", &self.deduping_interval)
            .finish_non_exhaustive()
    }
}

/// Shallow-merge one override layer onto a resolved base.
pub fn resolve(base: &Config, overrides: &Overrides) -> Config {
    let mut fallback = base.fallback.clone();
    fallback.extend(
        overrides
            .fallback
            .iter()
            .map(|(k, v)| (k.clone(), v.clone())),
    );

    Config {
        fetcher: overrides.fetcher.clone().or_else(|| base.fetcher.clone()),
        revalidate_if_stale: overrides
            .revalidate_if_stale
            .unwrap_or(base.revalidate_if_stale),
        revalidate_on_mount: overrides.revalidate_on_mount.or(base.revalidate_on_mount),
        revalidate_on_focus: overrides
            .revalidate_on_focus
            .unwrap_or(base.revalidate_on_focus),
        revalidate_on_reconnect: overrides
            .revalidate_on_reconnect
            .unwrap_or(base.revalidate_on_reconnect),
        refresh_interval: overrides
            .refresh_interval
            .clone()
            .unwrap_or_else(|| base.refresh_interval.clone()),
        refresh_when_hidden: overrides
            .refresh_when_hidden
            .unwrap_or(base.refresh_when_hidden),
        refresh_when_offline: overrides
            .refresh_when_offline
            .unwrap_or(base.refresh_when_offline),
        should_retry_on_error: overrides
            .should_retry_on_error
            .clone()
            .unwrap_or_else(|| base.should_retry_on_error.clone()),
        deduping_interval: overrides.deduping_interval.unwrap_or(base.deduping_interval),
        focus_throttle_interval: overrides
            .focus_throttle_interval
            .unwrap_or(base.focus_throttle_interval),
        loading_timeout: overrides.loading_timeout.unwrap_or(base.loading_timeout),
        error_retry_interval: overrides
            .error_retry_interval
            .unwrap_or(base.error_retry_interval),
        error_retry_count: overrides.error_retry_count.unwrap_or(base.error_retry_count),
        keep_previous_data: overrides
            .keep_previous_data
            .unwrap_or(base.keep_previous_data),
        fallback_data: overrides
            .fallback_data
            .clone()
            .or_else(|| base.fallback_data.clone()),
        fallback,
        compare: overrides
            .compare
            .clone()
            .unwrap_or_else(|| base.compare.clone()),
        on_loading_slow: overrides
            .on_loading_slow
            .clone()
            .unwrap_or_else(|| base.on_loading_slow.clone()),
        on_success: overrides
            .on_success
            .clone()
            .unwrap_or_else(|| base.on_success.clone()),
        on_error: overrides
            .on_error
            .clone()
            .unwrap_or_else(|| base.on_error.clone()),
        on_error_retry: overrides
            .on_error_retry
            .clone()
            .unwrap_or_else(|| base.on_error_retry.clone()),
        on_discarded: overrides
            .on_discarded
            .clone()
            .unwrap_or_else(|| base.on_discarded.clone()),
    }
}
