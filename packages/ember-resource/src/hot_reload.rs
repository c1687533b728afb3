//! Hot-reload coordination port
//!
//! The provider asks the coordinator whether reloads may proceed, whether a
//! reload is executing (which suppresses new serve dispatch) and how long to
//! debounce filesystem churn. In-progress serves delay a scheduled reload so
//! it commences once current work drains.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Coordination surface between the provider and the engine's reload driver
pub trait ReloadCoordinator: Send + Sync {
    /// Debounce window applied to additions and modifications
    fn change_wait_ns(&self) -> u64;

    /// A reload is scheduled but has not started draining yet
    fn is_scheduled(&self) -> bool;

    /// A reload is executing; no new operations may be dispatched
    fn is_executing(&self) -> bool;

    /// Promotion of debounced additions/modifications is allowed
    fn is_reload_allowed(&self) -> bool;

    /// Called by workers still serving while a reload is scheduled
    fn delay(&self);
}

/// Standalone coordinator: reloads always allowed, never executing
pub struct DefaultCoordinator {
    change_wait_ns: u64,
    delays: AtomicU64,
    scheduled: AtomicBool,
}

impl DefaultCoordinator {
    pub fn new(change_wait_ns: u64) -> Self {
        Self {
            change_wait_ns,
            delays: AtomicU64::new(0),
            scheduled: AtomicBool::new(false),
        }
    }

    pub fn set_scheduled(&self, scheduled: bool) {
        self.scheduled.store(scheduled, Ordering::SeqCst);
    }

    pub fn delay_count(&self) -> u64 {
        self.delays.load(Ordering::SeqCst)
    }
}

impl ReloadCoordinator for DefaultCoordinator {
    fn change_wait_ns(&self) -> u64 {
        self.change_wait_ns
    }

    fn is_scheduled(&self) -> bool {
        self.scheduled.load(Ordering::SeqCst)
    }

    fn is_executing(&self) -> bool {
        false
    }

    fn is_reload_allowed(&self) -> bool {
        true
    }

    fn delay(&self) {
        self.delays.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_coordinator_allows_reloads() {
        let coordinator = DefaultCoordinator::new(5_000_000);
        assert_eq!(coordinator.change_wait_ns(), 5_000_000);
        assert!(coordinator.is_reload_allowed());
        assert!(!coordinator.is_executing());
        assert!(!coordinator.is_scheduled());

        coordinator.set_scheduled(true);
        assert!(coordinator.is_scheduled());
        coordinator.delay();
        assert_eq!(coordinator.delay_count(), 1);
    }
}
