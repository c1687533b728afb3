//! Monotonic time port
//!
//! The provider reads time through a trait so frame budgets and debounce
//! windows stay deterministic under test.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Monotonic nanosecond clock
pub trait Clock: Send + Sync {
    fn now_ns(&self) -> u64;
}

/// Wall clock measured from construction
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ns(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

/// Manually advanced clock for tests
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: AtomicU64::new(0),
        }
    }

    pub fn advance(&self, delta_ns: u64) {
        self.now.fetch_add(delta_ns, Ordering::SeqCst);
    }

    pub fn set(&self, now_ns: u64) {
        self.now.store(now_ns, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now_ns(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Clock that advances a fixed amount on every read, simulating work cost
/// for budget tests without wall-clock dependence
pub struct TickingClock {
    now: AtomicU64,
    tick_ns: u64,
}

impl TickingClock {
    pub fn new(tick_ns: u64) -> Self {
        Self {
            now: AtomicU64::new(0),
            tick_ns,
        }
    }
}

impl Clock for TickingClock {
    fn now_ns(&self) -> u64 {
        self.now.fetch_add(self.tick_ns, Ordering::SeqCst) + self.tick_ns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new();
        assert_eq!(clock.now_ns(), 0);
        clock.advance(500);
        assert_eq!(clock.now_ns(), 500);
        clock.set(100);
        assert_eq!(clock.now_ns(), 100);
    }

    #[test]
    fn test_ticking_clock_counts_reads() {
        let clock = TickingClock::new(10);
        assert_eq!(clock.now_ns(), 10);
        assert_eq!(clock.now_ns(), 20);
    }

    #[test]
    fn test_monotonic_clock_is_monotonic() {
        let clock = MonotonicClock::new();
        let first = clock.now_ns();
        let second = clock.now_ns();
        assert!(second >= first);
    }
}
