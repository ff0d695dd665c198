//! Error taxonomy for the synchronization engine.
//!
//! `FetchError` is the only error a fetch function can surface: it is stored
//! verbatim in entry state and routed to the `on_error` callback. Discarded
//! fetch results are not errors at all; they are observable only through the
//! `on_discarded` callback. `EngineError` covers misuse of the engine itself.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use serde::{Serialize, Serializer};
use thiserror::Error;

/// A failed fetch, stored verbatim in [`EntryState::error`].
///
/// Cloneable so the same error can live in the cache entry, be delivered to
/// every deduped awaiter of the shared in-flight future, and be handed to
/// callbacks without copying the underlying error value.
///
/// [`EntryState::error`]: crate::state::EntryState
#[derive(Debug, Clone)]
pub struct FetchError {
    inner: Arc<dyn StdError + Send + Sync + 'static>,
}

impl FetchError {
    /// Wrap an arbitrary error produced by a fetch function.
    pub fn new(error: impl StdError + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(error),
        }
    }

    /// Build a fetch error from a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(MessageError(message.into())),
        }
    }

    /// The full message chain, outermost first.
    pub fn messages(&self) -> Vec<String> {
        let mut messages = vec![self.inner.to_string()];
        let mut current = self.inner.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        messages
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl StdError for FetchError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.source()
    }
}

impl Serialize for FetchError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

#[derive(Debug)]
struct MessageError(String);

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl StdError for MessageError {}

/// Errors raised by the engine's own entry points.
///
/// Fetch failures never cross the public revalidation boundary as errors;
/// they are observable through entry state. The exception is
/// [`Engine::mutate_with`], whose supplied future belongs to the caller, so
/// its failure is returned to the caller.
///
/// [`Engine::mutate_with`]: crate::engine::Engine::mutate_with
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine was built outside a tokio runtime and no handle was given.
    #[error("engine requires a tokio runtime: {message}")]
    Runtime { message: String },
    /// A mutation was issued for a disabled (empty) cache key.
    #[error("cache key is disabled, nothing to mutate")]
    DisabledKey,
    /// The value supplied to a mutation failed to resolve.
    #[error(transparent)]
    Mutation(#[from] FetchError),
}

impl EngineError {
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("outer failure")]
    struct Outer {
        #[source]
        cause: MessageError,
    }

    #[test]
    fn message_chain_is_collected() {
        let error = FetchError::new(Outer {
            cause: MessageError("inner failure".to_string()),
        });

        assert_eq!(error.messages(), vec!["outer failure", "inner failure"]);
    }

    #[test]
    fn msg_constructor_displays_verbatim() {
        let error = FetchError::msg("boom");
        assert_eq!(error.to_string(), "boom");
        assert!(error.source().is_none());
    }

    #[test]
    fn serializes_as_display_string() {
        let error = FetchError::msg("boom");
        let json = serde_json::to_string(&error).expect("serialize");
        assert_eq!(json, "\"boom\"");
    }

    #[test]
    fn clones_share_the_underlying_error() {
        let error = FetchError::msg("shared");
        let clone = error.clone();
        assert_eq!(error.to_string(), clone.to_string());
    }
}
