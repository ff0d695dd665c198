//! Request coordinator: deduplication, race and mutation guards, retry.
//!
//! One flight record exists per cache key while a request is in flight (or
//! pending dedupe-window cleanup). Deduped callers await the same shared
//! result. After the await, a result is committed only if its flight is
//! still the live one for the key and no mutation window supersedes it;
//! everything else is discarded without touching the store.
//!
//! The whole revalidation runs on a spawned task: dropping the public
//! future abandons neither the fetch nor the commit, which is what keeps
//! teardown cooperative rather than preemptive.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use metrics::{counter, histogram};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::{Config, Fetcher};
use crate::env::Environment;
use crate::error::FetchError;
use crate::mutation::{LogicalClock, MutationLedger};
use crate::state::{Field, StatePatch};
use crate::store::Store;
use crate::telemetry::{
    METRIC_DEDUPE_HIT_TOTAL, METRIC_DISCARDED_TOTAL, METRIC_FETCH_DURATION_MS,
    METRIC_FETCH_ERROR_TOTAL, METRIC_FETCH_TOTAL, METRIC_RETRY_SCHEDULED_TOTAL,
};

/// Backoff exponent cap: `2^8` times the base interval at most.
const MAX_RETRY_EXPONENT: u32 = 8;

type SharedFetch = Shared<BoxFuture<'static, Result<Value, FetchError>>>;

/// In-flight record for one cache key.
struct Flight {
    result: SharedFetch,
    started_at: u64,
}

/// Liveness of the subscription that issued a revalidation. Callbacks tied
/// to "am I still the relevant request" are skipped once the owner is gone.
/// Engine-level calls carry no owner and count as always live.
#[derive(Clone, Default)]
pub(crate) struct Owner(Option<Arc<AtomicBool>>);

impl Owner {
    pub(crate) fn none() -> Self {
        Self(None)
    }

    pub(crate) fn of(alive: Arc<AtomicBool>) -> Self {
        Self(Some(alive))
    }

    pub(crate) fn is_live(&self) -> bool {
        self.0
            .as_ref()
            .is_none_or(|alive| alive.load(Ordering::SeqCst))
    }
}

/// One revalidation request, ready to run on the coordinator.
#[derive(Clone)]
pub(crate) struct RevalidateJob {
    pub key: String,
    pub args: Vec<Value>,
    pub fetcher: Fetcher,
    pub config: Arc<Config>,
    pub dedupe: bool,
    pub retry_count: u32,
    pub owner: Owner,
}

struct CoordinatorInner {
    store: Store,
    env: Arc<dyn Environment>,
    runtime: Handle,
    flights: DashMap<String, Flight>,
    mutations: MutationLedger,
    clock: LogicalClock,
}

/// Cheap to clone; clones share the flight and mutation tables.
#[derive(Clone)]
pub(crate) struct Coordinator {
    inner: Arc<CoordinatorInner>,
}

impl Coordinator {
    pub(crate) fn new(store: Store, env: Arc<dyn Environment>, runtime: Handle) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                store,
                env,
                runtime,
                flights: DashMap::new(),
                mutations: MutationLedger::new(),
                clock: LogicalClock::new(),
            }),
        }
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.inner.runtime
    }

    pub(crate) fn mutations(&self) -> &MutationLedger {
        &self.inner.mutations
    }

    pub(crate) fn clock(&self) -> &LogicalClock {
        &self.inner.clock
    }

    /// Run a revalidation to completion on its own task. The handle resolves
    /// to true iff a fetch ran to completion and updated state.
    pub(crate) fn spawn(&self, job: RevalidateJob) -> JoinHandle<bool> {
        let coordinator = self.clone();
        self.inner.runtime.spawn(async move { coordinator.run(job).await })
    }

    async fn run(self, job: RevalidateJob) -> bool {
        if job.key.is_empty() || !job.owner.is_live() {
            return false;
        }
        let key = job.key.clone();
        let config = Arc::clone(&job.config);

        // Join an existing flight when deduping; otherwise start a new one.
        let existing = if job.dedupe {
            self.inner
                .flights
                .get(&key)
                .map(|flight| (flight.result.clone(), flight.started_at))
        } else {
            None
        };

        let (shared, start_at, started_new, finished) = match existing {
            Some((shared, start_at)) => {
                counter!(METRIC_DEDUPE_HIT_TOTAL).increment(1);
                debug!(cache_key = %key, start_at, "Joining in-flight request");
                (shared, start_at, false, None)
            }
            None => {
                let is_loading = self
                    .inner
                    .store
                    .get(&key)
                    .and_then(|state| state.data)
                    .is_none();
                self.inner.store.set(&key, &StatePatch::validating(is_loading));

                let start_at = self.inner.clock.tick();
                let finished = Arc::new(AtomicBool::new(false));

                if let Some(timeout) = config.loading_timeout {
                    if is_loading {
                        self.arm_loading_slow_timer(
                            &key,
                            start_at,
                            timeout,
                            Arc::clone(&finished),
                            &job,
                        );
                    }
                }

                let shared = self.start_fetch(&job);
                self.inner.flights.insert(
                    key.clone(),
                    Flight {
                        result: shared.clone(),
                        started_at: start_at,
                    },
                );
                counter!(METRIC_FETCH_TOTAL).increment(1);
                debug!(cache_key = %key, start_at, retry_count = job.retry_count, "Fetch started");
                (shared, start_at, true, Some(finished))
            }
        };

        let outcome = shared.await;
        if let Some(finished) = &finished {
            finished.store(true, Ordering::SeqCst);
        }

        match outcome {
            Ok(new_data) => {
                if started_new {
                    self.schedule_flight_cleanup(&key, start_at, config.deduping_interval);
                }

                // Race guard: a newer request owns the key now.
                if !self.flight_live(&key, start_at) {
                    self.discard(&key, &config, started_new && job.owner.is_live());
                    return false;
                }

                // Mutation guard: an explicit write is (or became) authoritative.
                if self
                    .inner
                    .mutations
                    .window(&key)
                    .is_some_and(|window| window.supersedes(start_at))
                {
                    self.inner.store.set(&key, &StatePatch::settled());
                    self.discard(&key, &config, started_new && job.owner.is_live());
                    return false;
                }

                let mut final_patch = StatePatch::settled();
                final_patch.error = Field::Clear;

                let cached = self.inner.store.get(&key).and_then(|state| state.data);
                let committed = match &cached {
                    // Unchanged under the comparator: keep the cached value so
                    // downstream change detection stays quiet.
                    Some(old) if (config.compare)(old, &new_data) => old.clone(),
                    _ => new_data.clone(),
                };
                final_patch.data = Field::Set(committed);

                if started_new && job.owner.is_live() {
                    (config.on_success)(&new_data, &key, &config);
                }

                self.inner.store.set(&key, &final_patch);
                debug!(cache_key = %key, start_at, "Fetch committed");
                true
            }
            Err(error) => {
                self.remove_flight_if(&key, start_at);
                counter!(METRIC_FETCH_ERROR_TOTAL).increment(1);
                warn!(
                    cache_key = %key,
                    start_at,
                    error = %error,
                    "Fetch failed"
                );

                let mut final_patch = StatePatch::settled();
                final_patch.error = Field::Set(error.clone());

                if started_new && job.owner.is_live() {
                    (config.on_error)(&error, &key, &config);
                    self.maybe_schedule_retry(&job, &error);
                }

                self.inner.store.set(&key, &final_patch);
                true
            }
        }
    }

    /// Invoke the fetch function eagerly on its own task, so neither caller
    /// cancellation nor subscription teardown can abort it, and hand back a
    /// shareable handle to its result.
    fn start_fetch(&self, job: &RevalidateJob) -> SharedFetch {
        let (tx, rx) = oneshot::channel::<Result<Value, FetchError>>();
        let fut = (job.fetcher)(job.args.clone());
        self.inner.runtime.spawn(async move {
            let fetch_started = Instant::now();
            let result = fut.await;
            histogram!(METRIC_FETCH_DURATION_MS)
                .record(fetch_started.elapsed().as_secs_f64() * 1000.0);
            let _ = tx.send(result);
        });

        rx.map(|received| match received {
            Ok(result) => result,
            Err(_) => Err(FetchError::msg("fetch task terminated before completion")),
        })
        .boxed()
        .shared()
    }

    fn arm_loading_slow_timer(
        &self,
        key: &str,
        start_at: u64,
        timeout: Duration,
        finished: Arc<AtomicBool>,
        job: &RevalidateJob,
    ) {
        let coordinator = self.clone();
        let key = key.to_string();
        let owner = job.owner.clone();
        let config = Arc::clone(&job.config);
        self.inner.runtime.spawn(async move {
            sleep(timeout).await;
            let still_pending = !finished.load(Ordering::SeqCst);
            if still_pending && coordinator.flight_live(&key, start_at) && owner.is_live() {
                debug!(cache_key = %key, start_at, "Fetch is slow");
                (config.on_loading_slow)(&key, &config);
            }
        });
    }

    /// Keep the flight around for the dedupe window, then drop it if it is
    /// still ours.
    fn schedule_flight_cleanup(&self, key: &str, start_at: u64, after: Duration) {
        let coordinator = self.clone();
        let key = key.to_string();
        self.inner.runtime.spawn(async move {
            sleep(after).await;
            coordinator.remove_flight_if(&key, start_at);
        });
    }

    fn remove_flight_if(&self, key: &str, start_at: u64) {
        self.inner
            .flights
            .remove_if(key, |_, flight| flight.started_at == start_at);
    }

    fn flight_live(&self, key: &str, start_at: u64) -> bool {
        self.inner
            .flights
            .get(key)
            .is_some_and(|flight| flight.started_at == start_at)
    }

    fn discard(&self, key: &str, config: &Config, notify: bool) {
        counter!(METRIC_DISCARDED_TOTAL).increment(1);
        debug!(cache_key = %key, "Fetch result discarded");
        if notify {
            (config.on_discarded)(key);
        }
    }

    fn maybe_schedule_retry(&self, job: &RevalidateJob, error: &FetchError) {
        let config = &job.config;
        if !config.should_retry_on_error.allows(error) {
            return;
        }
        // Focus and reconnect will revalidate once the host becomes active
        // again; backoff only covers the case where they cannot.
        let deferred_to_triggers = config.revalidate_on_focus
            && config.revalidate_on_reconnect
            && !self.inner.env.is_active();
        if deferred_to_triggers {
            debug!(cache_key = %job.key, "Retry deferred to focus/reconnect triggers");
            return;
        }

        let next_retry = job.retry_count + 1;
        if config.error_retry_count.is_some_and(|max| next_retry > max) {
            debug!(cache_key = %job.key, next_retry, "Retry budget exhausted");
            return;
        }

        let delay = retry_delay(next_retry, config.error_retry_interval);
        counter!(METRIC_RETRY_SCHEDULED_TOTAL).increment(1);
        debug!(
            cache_key = %job.key,
            next_retry,
            delay_ms = delay.as_millis() as u64,
            "Retry scheduled"
        );
        (config.on_error_retry)(error, &job.key, next_retry, delay);

        let coordinator = self.clone();
        let retry_job = RevalidateJob {
            dedupe: true,
            retry_count: next_retry,
            ..job.clone()
        };
        self.inner.runtime.spawn(async move {
            sleep(delay).await;
            coordinator.run(retry_job).await;
        });
    }
}

/// Exponential backoff with jitter:
/// `floor((U(0,1) + 0.5) * 2^min(retry_count, 8))` base intervals.
fn retry_delay(retry_count: u32, base: Duration) -> Duration {
    let exponent = retry_count.min(MAX_RETRY_EXPONENT);
    let factor = ((rand::random::<f64>() + 0.5) * f64::from(1u32 << exponent)).floor() as u32;
    base * factor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_is_within_backoff_bounds() {
        let base = Duration::from_millis(100);
        for retry_count in 1..=12u32 {
            let exponent = retry_count.min(MAX_RETRY_EXPONENT);
            let delay = retry_delay(retry_count, base);

            let lower = base * (1u32 << exponent) / 2;
            let upper = base * (1u32 << exponent) * 3 / 2;
            assert!(delay >= lower, "retry {retry_count}: {delay:?} < {lower:?}");
            assert!(delay <= upper, "retry {retry_count}: {delay:?} > {upper:?}");
        }
    }

    #[test]
    fn owner_without_flag_is_always_live() {
        assert!(Owner::none().is_live());
    }

    #[test]
    fn owner_follows_its_flag() {
        let alive = Arc::new(AtomicBool::new(true));
        let owner = Owner::of(Arc::clone(&alive));

        assert!(owner.is_live());
        alive.store(false, Ordering::SeqCst);
        assert!(!owner.is_live());
    }
}
