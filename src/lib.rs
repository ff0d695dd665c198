//! Freshet: a stale-while-revalidate data-synchronization engine.
//!
//! Given a logical key and a fetch function, the engine maintains a per-key
//! cache entry, decides when to refresh it, coordinates concurrent refresh
//! attempts so at most one is authoritative, and notifies observers when
//! the entry changes. Cached values are served immediately while refreshes
//! run in the background.
//!
//! - **Deduplication**: concurrent revalidations of one key share a single
//!   fetch within the dedupe window.
//! - **Ordering guards**: a fetch result is committed only while its
//!   request is still the live one for the key, and only when no explicit
//!   mutation supersedes it.
//! - **Triggers**: mount, focus, reconnect, periodic refresh, and bounded
//!   exponential error backoff, all funneling into the same coordinator.
//!
//! ## Example
//!
//! ```no_run
//! use freshet::{Engine, Overrides, fetch_fn};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), freshet::EngineError> {
//! let engine = Engine::new()?;
//!
//! let user = engine.subscribe(
//!     "/api/user/123",
//!     Some(fetch_fn(|_args| async {
//!         Ok::<_, std::io::Error>(json!({ "name": "Ann" }))
//!     })),
//!     Overrides::default(),
//! );
//!
//! // Serve whatever is cached right away; the mount trigger refreshes in
//! // the background and subscribers hear about the change.
//! let snapshot = user.snapshot();
//! # let _ = snapshot;
//! # Ok(())
//! # }
//! ```

mod config;
mod coordinator;
mod engine;
mod env;
mod error;
mod key;
mod lock;
mod mutation;
mod provider;
mod scheduler;
mod state;
mod store;
mod telemetry;

pub use config::{
    Comparator, Config, DiscardedCallback, ErrorCallback, ErrorRetryCallback, FetchFuture,
    Fetcher, LoadingSlowCallback, Overrides, RefreshInterval, RetryPolicy, SuccessCallback,
    default_config, fetch_fn, resolve,
};
pub use engine::{Engine, EngineBuilder, Subscription};
pub use env::{AlwaysActive, Environment, ManualEnvironment};
pub use error::{EngineError, FetchError};
pub use key::Key;
pub use provider::{CacheProvider, MapProvider};
pub use state::{EntryState, Field, Snapshot, StatePatch};
pub use store::{ChangeCallback, Store, StoreSubscription};
pub use telemetry::describe_metrics;
