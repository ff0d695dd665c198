//! Pluggable cache providers.
//!
//! A provider is the raw key→state table. The default is an in-process
//! concurrent map; embedders can supply their own (bounded, instrumented,
//! tiered) as long as it honors the contract below. Providers know nothing
//! about subscribers: the store's notification layer wraps them.

use dashmap::DashMap;

use crate::state::EntryState;

/// Raw key→state table contract.
///
/// `set` must store the state exactly as given; entries persist until an
/// explicit `delete`.
pub trait CacheProvider: Send + Sync + 'static {
    fn get(&self, key: &str) -> Option<EntryState>;
    fn set(&self, key: &str, state: EntryState);
    fn delete(&self, key: &str);
    fn keys(&self) -> Vec<String>;
}

/// Default in-process provider backed by a concurrent map.
#[derive(Default)]
pub struct MapProvider {
    entries: DashMap<String, EntryState>,
}

impl MapProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheProvider for MapProvider {
    fn get(&self, key: &str) -> Option<EntryState> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    fn set(&self, key: &str, state: EntryState) {
        self.entries.insert(key.to_string(), state);
    }

    fn delete(&self, key: &str) {
        self.entries.remove(key);
    }

    fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn map_provider_roundtrip() {
        let provider = MapProvider::new();

        assert!(provider.get("/api/user").is_none());

        provider.set(
            "/api/user",
            EntryState {
                data: Some(json!({"name": "Ann"})),
                ..EntryState::default()
            },
        );

        let cached = provider.get("/api/user").expect("cached entry");
        assert_eq!(cached.data, Some(json!({"name": "Ann"})));

        provider.delete("/api/user");
        assert!(provider.get("/api/user").is_none());
    }

    #[test]
    fn keys_lists_live_entries() {
        let provider = MapProvider::new();
        provider.set("a", EntryState::default());
        provider.set("b", EntryState::default());

        let mut keys = provider.keys();
        keys.sort();
        assert_eq!(keys, vec!["a", "b"]);
    }
}
