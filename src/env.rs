//! Host environment signals.
//!
//! Focus, reconnect, and interval triggers consult the environment before
//! firing. Interactive hosts map these to window visibility and network
//! state; non-interactive hosts keep the always-active default.

use std::sync::atomic::{AtomicBool, Ordering};

/// Online/visible signals supplied by the embedding host.
pub trait Environment: Send + Sync + 'static {
    fn is_online(&self) -> bool {
        true
    }

    fn is_visible(&self) -> bool {
        true
    }

    /// Online and visible at once.
    fn is_active(&self) -> bool {
        self.is_online() && self.is_visible()
    }
}

/// Default preset: always online, always visible.
#[derive(Debug, Default)]
pub struct AlwaysActive;

impl Environment for AlwaysActive {}

/// An environment whose flags can be flipped at runtime, for hosts that
/// track their own visibility/connectivity and for tests.
#[derive(Debug)]
pub struct ManualEnvironment {
    online: AtomicBool,
    visible: AtomicBool,
}

impl ManualEnvironment {
    pub fn new(online: bool, visible: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
            visible: AtomicBool::new(visible),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn set_visible(&self, visible: bool) {
        self.visible.store(visible, Ordering::SeqCst);
    }
}

impl Default for ManualEnvironment {
    fn default() -> Self {
        Self::new(true, true)
    }
}

impl Environment for ManualEnvironment {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn is_visible(&self) -> bool {
        self.visible.load(Ordering::SeqCst)
    }
}
