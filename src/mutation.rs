//! Mutation windows.
//!
//! Every explicit external write stamps a window `[issued_at, settled_at]`
//! on its cache key, drawn from the engine's logical clock. While a window
//! is open (`settled_at == 0`) or postdates a fetch's start, that fetch's
//! result is superseded and must not reach the store. Windows are retained
//! until overwritten by a later mutation; they never expire on a timer.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

/// Monotonic logical clock ordering fetch starts and mutation stamps.
///
/// Ticks start at 1; zero is reserved to mean "still open" in a window's
/// `settled_at`.
#[derive(Debug)]
pub(crate) struct LogicalClock {
    counter: AtomicU64,
}

impl LogicalClock {
    pub(crate) fn new() -> Self {
        Self {
            counter: AtomicU64::new(1),
        }
    }

    pub(crate) fn tick(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst)
    }
}

/// The authoritative time window of one explicit write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MutationWindow {
    pub issued_at: u64,
    /// Zero while the mutation's own value is still resolving.
    pub settled_at: u64,
}

impl MutationWindow {
    /// Whether a fetch that started at `start_at` is superseded by this
    /// window: the window covers or postdates the start, or is still open.
    pub(crate) fn supersedes(&self, start_at: u64) -> bool {
        start_at <= self.issued_at || start_at <= self.settled_at || self.settled_at == 0
    }
}

/// Per-key table of the most recent mutation window.
#[derive(Debug, Default)]
pub(crate) struct MutationLedger {
    windows: DashMap<String, MutationWindow>,
}

impl MutationLedger {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record a new open window, replacing any previous one for the key.
    pub(crate) fn stamp(&self, key: &str, issued_at: u64) {
        self.windows.insert(
            key.to_string(),
            MutationWindow {
                issued_at,
                settled_at: 0,
            },
        );
    }

    /// Close the window opened at `issued_at`. Returns false when a newer
    /// mutation has since replaced it, in which case the caller's resolved
    /// value must not be written.
    pub(crate) fn settle(&self, key: &str, issued_at: u64, settled_at: u64) -> bool {
        match self.windows.get_mut(key) {
            Some(mut window) if window.issued_at == issued_at => {
                window.settled_at = settled_at;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn window(&self, key: &str) -> Option<MutationWindow> {
        self.windows.get(key).map(|w| *w)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_monotonic_and_nonzero() {
        let clock = LogicalClock::new();
        let a = clock.tick();
        let b = clock.tick();
        let c = clock.tick();

        assert!(a >= 1);
        assert!(a < b && b < c);
    }

    #[test]
    fn open_window_supersedes_any_start() {
        let window = MutationWindow {
            issued_at: 5,
            settled_at: 0,
        };

        assert!(window.supersedes(3));
        assert!(window.supersedes(9));
    }

    #[test]
    fn closed_window_supersedes_only_earlier_starts() {
        let window = MutationWindow {
            issued_at: 5,
            settled_at: 8,
        };

        assert!(window.supersedes(4));
        assert!(window.supersedes(8));
        assert!(!window.supersedes(9));
    }

    #[test]
    fn settle_refuses_when_superseded() {
        let ledger = MutationLedger::new();

        ledger.stamp("k", 1);
        ledger.stamp("k", 3);

        // The first mutation resolved late; a newer one owns the key now.
        assert!(!ledger.settle("k", 1, 5));
        assert_eq!(
            ledger.window("k"),
            Some(MutationWindow {
                issued_at: 3,
                settled_at: 0
            })
        );

        assert!(ledger.settle("k", 3, 6));
        assert_eq!(
            ledger.window("k"),
            Some(MutationWindow {
                issued_at: 3,
                settled_at: 6
            })
        );
    }

    #[test]
    fn windows_are_retained_after_settling() {
        let ledger = MutationLedger::new();

        ledger.stamp("k", 2);
        assert!(ledger.settle("k", 2, 4));

        // Still present: a fetch started before the window must stay barred.
        let window = ledger.window("k").expect("retained window");
        assert!(window.supersedes(3));
        assert!(!window.supersedes(5));
    }
}
