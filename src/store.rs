//! Cache store: the notification layer over a provider.
//!
//! The store is the single source of truth read by every observer. Commits
//! arrive as shallow-merge patches; the merged state is always stored (so a
//! subsequent `get` is exact), and subscribers are notified only when the
//! serialized next state differs from the serialized previous state.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;
use uuid::Uuid;

use crate::lock::{rw_read, rw_write};
use crate::provider::CacheProvider;
use crate::state::{EntryState, StatePatch};

const SOURCE: &str = "store";

/// Callback invoked with (next, previous) state on every committed change.
pub type ChangeCallback = Arc<dyn Fn(&EntryState, &EntryState) + Send + Sync>;

struct Subscriber {
    id: Uuid,
    callback: ChangeCallback,
}

/// Key→state table with per-key publish/subscribe.
#[derive(Clone)]
pub struct Store {
    provider: Arc<dyn CacheProvider>,
    subscribers: Arc<RwLock<HashMap<String, Vec<Subscriber>>>>,
}

impl Store {
    pub fn new(provider: Arc<dyn CacheProvider>) -> Self {
        Self {
            provider,
            subscribers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// A complete snapshot of the entry, never a partial update.
    pub fn get(&self, key: &str) -> Option<EntryState> {
        self.provider.get(key)
    }

    /// Shallow-merge `patch` into the entry, store the result, then notify.
    ///
    /// Storing happens even when the merged state is equal to the previous
    /// one; only the notification is skipped in that case.
    pub fn set(&self, key: &str, patch: &StatePatch) {
        let prev = self.provider.get(key).unwrap_or_default();
        let next = prev.apply(patch);
        self.provider.set(key, next.clone());

        if next.same_serialized(&prev) {
            return;
        }

        debug!(cache_key = key, "Store entry changed");
        // Callbacks run outside the table lock so they may re-enter the store.
        let callbacks: Vec<ChangeCallback> = {
            let subs = rw_read(&self.subscribers, SOURCE, "set.notify");
            subs.get(key)
                .map(|list| list.iter().map(|s| s.callback.clone()).collect())
                .unwrap_or_default()
        };
        for callback in callbacks {
            callback(&next, &prev);
        }
    }

    pub fn delete(&self, key: &str) {
        self.provider.delete(key);
    }

    pub fn keys(&self) -> Vec<String> {
        self.provider.keys()
    }

    /// Register a change callback for one cache key. Dropping the returned
    /// guard unsubscribes.
    pub fn subscribe(&self, key: &str, callback: ChangeCallback) -> StoreSubscription {
        let id = Uuid::new_v4();
        let mut subs = rw_write(&self.subscribers, SOURCE, "subscribe");
        subs.entry(key.to_string())
            .or_default()
            .push(Subscriber { id, callback });

        StoreSubscription {
            id,
            key: key.to_string(),
            subscribers: Arc::clone(&self.subscribers),
        }
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self, key: &str) -> usize {
        rw_read(&self.subscribers, SOURCE, "subscriber_count")
            .get(key)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

/// Guard for one registered change callback.
pub struct StoreSubscription {
    id: Uuid,
    key: String,
    subscribers: Arc<RwLock<HashMap<String, Vec<Subscriber>>>>,
}

impl Drop for StoreSubscription {
    fn drop(&mut self) {
        let mut subs = rw_write(&self.subscribers, SOURCE, "unsubscribe");
        if let Some(list) = subs.get_mut(&self.key) {
            list.retain(|s| s.id != self.id);
            if list.is_empty() {
                subs.remove(&self.key);
            }
        }
    }
}
