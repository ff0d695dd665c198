//! Per-key entry state and the patches that update it.
//!
//! `EntryState` is the only object stored per cache key. Every field is
//! independently optional: "field absent" means the engine has not written
//! it yet, and consumers compute their own defaults for absent flags (see
//! `Subscription::snapshot`). Commits are expressed as a `StatePatch` whose
//! fields are tri-state, so a transition can clear `error` without touching
//! `data`.

use serde::Serialize;
use serde_json::Value;

use crate::error::FetchError;

/// Cached state for one cache key.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EntryState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<FetchError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_validating: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_loading: Option<bool>,
}

impl EntryState {
    /// Shallow-merge a patch into this state, producing the next state.
    pub fn apply(&self, patch: &StatePatch) -> EntryState {
        EntryState {
            data: patch.data.merge(&self.data),
            error: patch.error.merge(&self.error),
            is_validating: patch.is_validating.merge(&self.is_validating),
            is_loading: patch.is_loading.merge(&self.is_loading),
        }
    }

    /// Canonical serialized form, used for change detection: the store
    /// notifies subscribers iff this differs between previous and next.
    pub(crate) fn serialized(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Whether the two states are equal under serialized comparison.
    pub fn same_serialized(&self, other: &EntryState) -> bool {
        self.serialized() == other.serialized()
    }
}

/// One field of a [`StatePatch`]: leave the stored value alone, clear it,
/// or overwrite it.
#[derive(Debug, Clone)]
pub enum Field<T> {
    Keep,
    Clear,
    Set(T),
}

impl<T> Default for Field<T> {
    fn default() -> Self {
        Field::Keep
    }
}

impl<T: Clone> Field<T> {
    fn merge(&self, current: &Option<T>) -> Option<T> {
        match self {
            Field::Keep => current.clone(),
            Field::Clear => None,
            Field::Set(value) => Some(value.clone()),
        }
    }
}

/// A shallow-merge update for one cache entry.
#[derive(Debug, Clone, Default)]
pub struct StatePatch {
    pub data: Field<Value>,
    pub error: Field<FetchError>,
    pub is_validating: Field<bool>,
    pub is_loading: Field<bool>,
}

impl StatePatch {
    /// The interim commit at the start of a new request.
    pub fn validating(is_loading: bool) -> Self {
        let mut patch = StatePatch {
            is_validating: Field::Set(true),
            ..StatePatch::default()
        };
        if is_loading {
            patch.is_loading = Field::Set(true);
        }
        patch
    }

    /// The terminal flags transition committed on every completed request.
    pub fn settled() -> Self {
        StatePatch {
            is_validating: Field::Set(false),
            is_loading: Field::Set(false),
            ..StatePatch::default()
        }
    }
}

/// The consumer-facing view of an entry, with absent flags resolved to
/// their computed defaults and fallback data applied.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub data: Option<Value>,
    pub error: Option<FetchError>,
    pub is_validating: bool,
    pub is_loading: bool,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn patch_keeps_untouched_fields() {
        let state = EntryState {
            data: Some(json!({"name": "Ann"})),
            error: Some(FetchError::msg("old failure")),
            is_validating: Some(true),
            is_loading: None,
        };

        let next = state.apply(&StatePatch::settled());

        assert_eq!(next.data, Some(json!({"name": "Ann"})));
        assert!(next.error.is_some());
        assert_eq!(next.is_validating, Some(false));
        assert_eq!(next.is_loading, Some(false));
    }

    #[test]
    fn patch_clears_error_without_touching_data() {
        let state = EntryState {
            data: Some(json!(1)),
            error: Some(FetchError::msg("boom")),
            ..EntryState::default()
        };

        let patch = StatePatch {
            error: Field::Clear,
            ..StatePatch::default()
        };
        let next = state.apply(&patch);

        assert_eq!(next.data, Some(json!(1)));
        assert!(next.error.is_none());
    }

    #[test]
    fn validating_patch_marks_loading_only_without_data() {
        let cold = StatePatch::validating(true);
        assert!(matches!(cold.is_loading, Field::Set(true)));

        let warm = StatePatch::validating(false);
        assert!(matches!(warm.is_loading, Field::Keep));
        assert!(matches!(warm.is_validating, Field::Set(true)));
    }

    #[test]
    fn serialized_comparison_ignores_absent_fields() {
        let a = EntryState::default();
        let b = EntryState {
            data: None,
            error: None,
            is_validating: None,
            is_loading: None,
        };

        assert!(a.same_serialized(&b));
        assert_eq!(a.serialized(), "{}");
    }

    #[test]
    fn serialized_comparison_detects_data_changes() {
        let a = EntryState {
            data: Some(json!({"n": 1})),
            ..EntryState::default()
        };
        let b = EntryState {
            data: Some(json!({"n": 2})),
            ..EntryState::default()
        };

        assert!(!a.same_serialized(&b));
        assert!(a.same_serialized(&a.clone()));
    }

    #[test]
    fn errors_compare_by_message() {
        let a = EntryState {
            error: Some(FetchError::msg("boom")),
            ..EntryState::default()
        };
        let b = EntryState {
            error: Some(FetchError::msg("boom")),
            ..EntryState::default()
        };

        assert!(a.same_serialized(&b));
    }
}
