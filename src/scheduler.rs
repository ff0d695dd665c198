//! Revalidation triggers.
//!
//! Each subscription owns a set of independent triggers — mount, focus,
//! reconnect, periodic refresh — that all funnel into the coordinator with
//! dedupe on. Timers are explicit cancellable tasks over the tokio clock,
//! so every trigger is deterministically testable under paused time.
//! Teardown cancels triggers and pending timers only; it never aborts a
//! fetch that already started.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tracing::debug;
use uuid::Uuid;

use crate::config::{Config, Fetcher, RefreshInterval};
use crate::coordinator::{Coordinator, Owner, RevalidateJob};
use crate::env::Environment;
use crate::lock::mutex_lock;
use crate::state::{EntryState, Snapshot};
use crate::store::Store;

const SOURCE: &str = "scheduler";

/// Cached data is observable synchronously before a mount revalidation runs;
/// the deferred revalidation starts one tick later.
const MOUNT_DEFER_TICK: Duration = Duration::from_millis(1);

/// A scheduled task that is cancelled when its handle is dropped.
pub(crate) struct TaskHandle {
    handle: JoinHandle<()>,
}

impl TaskHandle {
    pub(crate) fn new(handle: JoinHandle<()>) -> Self {
        Self { handle }
    }

    pub(crate) fn cancel(&self) {
        self.handle.abort();
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// The mount trigger's decision for a freshly created subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MountRevalidation {
    Skip,
    Immediate,
    /// Data is already cached; refresh one tick later.
    Deferred,
}

/// Compute the mount decision: an explicit `revalidate_on_mount` wins;
/// otherwise revalidate when nothing is cached or staleness is assumed.
/// A cached error always skips.
pub(crate) fn mount_revalidation(
    entry: Option<&EntryState>,
    config: &Config,
) -> MountRevalidation {
    if entry.is_some_and(|state| state.error.is_some()) {
        return MountRevalidation::Skip;
    }
    let has_data = entry.is_some_and(|state| state.data.is_some());
    let should = config
        .revalidate_on_mount
        .unwrap_or(!has_data || config.revalidate_if_stale);

    if !should {
        MountRevalidation::Skip
    } else if has_data {
        MountRevalidation::Deferred
    } else {
        MountRevalidation::Immediate
    }
}

/// Shared core of one subscription: identity, resolved config, trigger
/// state. Shared between the public handle and the engine's registry.
pub(crate) struct SubscriptionCore {
    pub(crate) id: Uuid,
    pub(crate) key: String,
    pub(crate) args: Vec<Value>,
    pub(crate) fetcher: Option<Fetcher>,
    pub(crate) config: Arc<Config>,
    alive: Arc<AtomicBool>,
    next_focus_at: Mutex<Option<Instant>>,
    interval_task: Mutex<Option<TaskHandle>>,
    last_data: Mutex<Option<Value>>,
}

impl SubscriptionCore {
    pub(crate) fn new(
        key: String,
        args: Vec<Value>,
        fetcher: Option<Fetcher>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            key,
            args,
            fetcher,
            config,
            alive: Arc::new(AtomicBool::new(true)),
            next_focus_at: Mutex::new(None),
            interval_task: Mutex::new(None),
            last_data: Mutex::new(None),
        }
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub(crate) fn owner(&self) -> Owner {
        Owner::of(Arc::clone(&self.alive))
    }

    /// Build a revalidation job for this subscription, if it can fetch.
    pub(crate) fn job(&self, dedupe: bool, retry_count: u32) -> Option<RevalidateJob> {
        let fetcher = self.fetcher.clone()?;
        if self.key.is_empty() {
            return None;
        }
        Some(RevalidateJob {
            key: self.key.clone(),
            args: self.args.clone(),
            fetcher,
            config: Arc::clone(&self.config),
            dedupe,
            retry_count,
            owner: self.owner(),
        })
    }

    /// Focus throttle: at most one focus revalidation per
    /// `focus_throttle_interval`. Advances the window when due.
    pub(crate) fn focus_due(&self, now: Instant) -> bool {
        let mut next_at = mutex_lock(&self.next_focus_at, SOURCE, "focus_due");
        match *next_at {
            Some(at) if now < at => false,
            _ => {
                *next_at = Some(now + self.config.focus_throttle_interval);
                true
            }
        }
    }

    /// Consumer-facing view: fallback applied, absent flags resolved.
    pub(crate) fn snapshot(&self, store: &Store) -> Snapshot {
        let entry = store.get(&self.key).unwrap_or_default();

        let cached = entry.data.clone();
        if cached.is_some() {
            *mutex_lock(&self.last_data, SOURCE, "snapshot.remember") = cached.clone();
        }
        let mut data = cached;
        if data.is_none() && self.config.keep_previous_data {
            data = mutex_lock(&self.last_data, SOURCE, "snapshot.previous").clone();
        }
        if data.is_none() {
            data = self.config.fallback_for(&self.key);
        }

        let enabled = !self.key.is_empty() && self.fetcher.is_some();
        let is_validating = entry.is_validating.unwrap_or(enabled);
        let is_loading = entry.is_loading.unwrap_or(is_validating);

        Snapshot {
            data,
            error: entry.error,
            is_validating,
            is_loading,
        }
    }

    pub(crate) fn store_interval_task(&self, task: Option<TaskHandle>) {
        *mutex_lock(&self.interval_task, SOURCE, "store_interval_task") = task;
    }

    /// Detach every trigger. Already-started fetches are not aborted.
    pub(crate) fn teardown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        if let Some(task) = mutex_lock(&self.interval_task, SOURCE, "teardown").take() {
            task.cancel();
        }
    }
}

/// Kick off the mount trigger for a new subscription.
pub(crate) fn run_mount(coordinator: &Coordinator, store: &Store, core: &Arc<SubscriptionCore>) {
    let Some(job) = core.job(true, 0) else {
        return;
    };
    let entry = store.get(&core.key);
    match mount_revalidation(entry.as_ref(), &core.config) {
        MountRevalidation::Skip => {}
        MountRevalidation::Immediate => {
            coordinator.spawn(job);
        }
        MountRevalidation::Deferred => {
            let coordinator = coordinator.clone();
            let core = Arc::clone(core);
            let runtime = coordinator.runtime().clone();
            runtime.spawn(async move {
                sleep(MOUNT_DEFER_TICK).await;
                if core.is_alive() {
                    coordinator.spawn(job);
                }
            });
        }
    }
}

/// Arm the periodic refresh loop, if the subscription's config calls for
/// one. The period is recomputed from the latest cached data every tick; a
/// tick with a cached error, or hidden/offline without the matching
/// `refresh_when_*` opt-in, reschedules silently.
pub(crate) fn arm_interval(
    coordinator: &Coordinator,
    store: &Store,
    env: &Arc<dyn Environment>,
    core: &Arc<SubscriptionCore>,
) -> Option<TaskHandle> {
    if matches!(core.config.refresh_interval, RefreshInterval::Disabled) {
        return None;
    }
    core.job(true, 0)?;

    let coordinator = coordinator.clone();
    let store = store.clone();
    let env = Arc::clone(env);
    let core = Arc::clone(core);
    let runtime = coordinator.runtime().clone();
    let handle = runtime.spawn(async move {
        loop {
            let latest = store.get(&core.key).and_then(|state| state.data);
            let Some(period) = core.config.refresh_interval.period(latest.as_ref()) else {
                break;
            };
            sleep(period).await;
            if !core.is_alive() {
                break;
            }

            let has_error = store
                .get(&core.key)
                .is_some_and(|state| state.error.is_some());
            let visible_ok = core.config.refresh_when_hidden || env.is_visible();
            let online_ok = core.config.refresh_when_offline || env.is_online();
            if has_error || !visible_ok || !online_ok {
                debug!(cache_key = %core.key, "Refresh tick skipped");
                continue;
            }

            if let Some(job) = core.job(true, 0) {
                let _ = coordinator.spawn(job).await;
            }
        }
    });
    Some(TaskHandle::new(handle))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::FetchError;

    fn entry(data: Option<Value>, error: Option<FetchError>) -> EntryState {
        EntryState {
            data,
            error,
            ..EntryState::default()
        }
    }

    #[test]
    fn mount_revalidates_immediately_without_cached_data() {
        let config = Config::default();

        assert_eq!(
            mount_revalidation(None, &config),
            MountRevalidation::Immediate
        );
    }

    #[test]
    fn mount_defers_when_data_is_cached() {
        let config = Config::default();
        let cached = entry(Some(json!(1)), None);

        assert_eq!(
            mount_revalidation(Some(&cached), &config),
            MountRevalidation::Deferred
        );
    }

    #[test]
    fn mount_skips_on_cached_error() {
        let config = Config::default();
        let cached = entry(None, Some(FetchError::msg("boom")));

        assert_eq!(
            mount_revalidation(Some(&cached), &config),
            MountRevalidation::Skip
        );
    }

    #[test]
    fn mount_skips_fresh_data_when_stale_revalidation_is_off() {
        let config = Config {
            revalidate_if_stale: false,
            ..Config::default()
        };
        let cached = entry(Some(json!(1)), None);

        assert_eq!(
            mount_revalidation(Some(&cached), &config),
            MountRevalidation::Skip
        );
        // But an empty cache still loads.
        assert_eq!(
            mount_revalidation(None, &config),
            MountRevalidation::Immediate
        );
    }

    #[test]
    fn explicit_revalidate_on_mount_wins() {
        let on = Config {
            revalidate_on_mount: Some(true),
            revalidate_if_stale: false,
            ..Config::default()
        };
        let off = Config {
            revalidate_on_mount: Some(false),
            ..Config::default()
        };

        assert_eq!(
            mount_revalidation(Some(&entry(Some(json!(1)), None)), &on),
            MountRevalidation::Deferred
        );
        assert_eq!(mount_revalidation(None, &off), MountRevalidation::Skip);
    }

    #[tokio::test]
    async fn focus_throttle_opens_then_closes() {
        let core = SubscriptionCore::new(
            "k".to_string(),
            Vec::new(),
            None,
            Arc::new(Config::default()),
        );

        let t0 = Instant::now();
        assert!(core.focus_due(t0));
        assert!(!core.focus_due(t0 + Duration::from_secs(1)));
        assert!(core.focus_due(t0 + Duration::from_secs(6)));
    }

    #[test]
    fn job_requires_fetcher_and_enabled_key() {
        let config = Arc::new(Config::default());

        let no_fetcher =
            SubscriptionCore::new("k".to_string(), Vec::new(), None, Arc::clone(&config));
        assert!(no_fetcher.job(true, 0).is_none());

        let disabled = SubscriptionCore::new(
            String::new(),
            Vec::new(),
            Some(crate::config::fetch_fn(|_| async {
                Ok::<_, FetchError>(json!(1))
            })),
            config,
        );
        assert!(disabled.job(true, 0).is_none());
    }

    #[test]
    fn teardown_marks_owner_dead() {
        let core = SubscriptionCore::new(
            "k".to_string(),
            Vec::new(),
            None,
            Arc::new(Config::default()),
        );
        let owner = core.owner();

        assert!(owner.is_live());
        core.teardown();
        assert!(!owner.is_live());
        assert!(!core.is_alive());
    }
}
