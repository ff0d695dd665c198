//! Key descriptors and cache key serialization.
//!
//! A key describes one logical piece of remote data. It is never stored
//! itself; the store is indexed by the deterministic string derived here.
//! The same derivation also yields the argument list handed to the fetch
//! function.

use serde_json::{Map, Value};

/// Caller-supplied descriptor identifying one logical piece of remote data.
///
/// A disabled key (absent input) serializes to the empty cache key, which
/// turns fetching off for the subscription that carries it.
#[derive(Debug, Clone, PartialEq)]
pub enum Key {
    /// No key: fetching is disabled.
    Disabled,
    /// A plain string key, used as the cache key verbatim.
    Str(String),
    /// An ordered tuple of arguments for the fetch function.
    Args(Vec<Value>),
    /// A plain mapping; passed to the fetch function as a single argument.
    Object(Map<String, Value>),
}

impl Key {
    /// Derive the cache key string and the fetch argument list.
    ///
    /// Equal keys of the same logical shape serialize identically: tuples
    /// and mappings are rendered as canonical JSON (object keys ordered), a
    /// string key is its own cache key and its own single argument. An
    /// empty string or empty tuple disables fetching, like an absent key.
    pub fn serialize(&self) -> (String, Vec<Value>) {
        match self {
            Key::Disabled => (String::new(), Vec::new()),
            Key::Str(s) => {
                if s.is_empty() {
                    (String::new(), Vec::new())
                } else {
                    (s.clone(), vec![Value::String(s.clone())])
                }
            }
            Key::Args(args) => {
                if args.is_empty() {
                    (String::new(), Vec::new())
                } else {
                    (canonical(&Value::Array(args.clone())), args.clone())
                }
            }
            Key::Object(map) => {
                let value = Value::Object(map.clone());
                (canonical(&value), vec![value])
            }
        }
    }

    /// The cache key alone, without the argument list.
    pub fn cache_key(&self) -> String {
        self.serialize().0
    }

    pub fn is_disabled(&self) -> bool {
        self.cache_key().is_empty()
    }
}

/// Canonical JSON rendering. `serde_json` keeps object keys ordered, so two
/// equal mappings built in different insertion orders render identically.
fn canonical(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::Str(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::Str(s)
    }
}

impl From<Vec<Value>> for Key {
    fn from(args: Vec<Value>) -> Self {
        Key::Args(args)
    }
}

impl From<Map<String, Value>> for Key {
    fn from(map: Map<String, Value>) -> Self {
        Key::Object(map)
    }
}

impl<T: Into<Key>> From<Option<T>> for Key {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(inner) => inner.into(),
            None => Key::Disabled,
        }
    }
}

impl From<Value> for Key {
    /// Map a loosely-typed value onto the recognized key shapes. `null` and
    /// `false` disable fetching; other scalars behave like single-element
    /// tuples.
    fn from(value: Value) -> Self {
        match value {
            Value::Null | Value::Bool(false) => Key::Disabled,
            Value::String(s) => Key::Str(s),
            Value::Array(args) => Key::Args(args),
            Value::Object(map) => Key::Object(map),
            other => Key::Args(vec![other]),
        }
    }
}
