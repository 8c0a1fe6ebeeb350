//! Memory budget tracking for the allocation seam.

use std::sync::atomic::{AtomicU64, Ordering};

/// Resource class tracked by a budget manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetClass {
    DeviceMemory,
    HostMemory,
}

impl BudgetClass {
    fn index(self) -> usize {
        match self {
            BudgetClass::DeviceMemory => 0,
            BudgetClass::HostMemory => 1,
        }
    }
}

const CLASS_COUNT: usize = 2;

/// Tracks current usage per resource class and rejects out-of-budget
/// requests before the real allocator is called.
pub trait BudgetManager: Send + Sync {
    /// Try to reserve `bytes`. Returns false if the request would exceed
    /// the class budget; on false no reservation is made.
    fn try_allocate(&self, class: BudgetClass, bytes: u64) -> bool;

    /// Record an allocation made outside `try_allocate`.
    fn record_allocation(&self, class: BudgetClass, bytes: u64);

    /// Release a previous reservation.
    fn record_deallocation(&self, class: BudgetClass, bytes: u64);

    /// Current usage in bytes.
    fn usage(&self, class: BudgetClass) -> u64;
}

/// Lock-free budget manager using compare-and-swap reservation.
pub struct AtomicBudgetManager {
    limits: [u64; CLASS_COUNT],
    used: [AtomicU64; CLASS_COUNT],
}

impl AtomicBudgetManager {
    /// Create with per-class byte limits. `u64::MAX` means unlimited.
    pub fn new(device_limit: u64, host_limit: u64) -> Self {
        Self {
            limits: [device_limit, host_limit],
            used: [AtomicU64::new(0), AtomicU64::new(0)],
        }
    }

    /// Unlimited budgets; tracking only.
    pub fn unlimited() -> Self {
        Self::new(u64::MAX, u64::MAX)
    }

    pub fn limit(&self, class: BudgetClass) -> u64 {
        self.limits[class.index()]
    }

    pub fn remaining(&self, class: BudgetClass) -> u64 {
        let limit = self.limits[class.index()];
        let used = self.used[class.index()].load(Ordering::Relaxed);
        limit.saturating_sub(used)
    }
}

impl BudgetManager for AtomicBudgetManager {
    fn try_allocate(&self, class: BudgetClass, bytes: u64) -> bool {
        let idx = class.index();
        let limit = self.limits[idx];
        let used = &self.used[idx];

        let mut current = used.load(Ordering::Relaxed);
        loop {
            let Some(next) = current.checked_add(bytes) else {
                return false;
            };
            if next > limit {
                return false;
            }
            match used.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    fn record_allocation(&self, class: BudgetClass, bytes: u64) {
        self.used[class.index()].fetch_add(bytes, Ordering::AcqRel);
    }

    fn record_deallocation(&self, class: BudgetClass, bytes: u64) {
        let used = &self.used[class.index()];
        let mut current = used.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(bytes);
            match used.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    fn usage(&self, class: BudgetClass) -> u64 {
        self.used[class.index()].load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_allocate_within_budget() {
        let budget = AtomicBudgetManager::new(1024, u64::MAX);
        assert!(budget.try_allocate(BudgetClass::DeviceMemory, 512));
        assert!(budget.try_allocate(BudgetClass::DeviceMemory, 512));
        assert_eq!(budget.usage(BudgetClass::DeviceMemory), 1024);
    }

    #[test]
    fn test_try_allocate_rejects_over_budget() {
        let budget = AtomicBudgetManager::new(1024, u64::MAX);
        assert!(budget.try_allocate(BudgetClass::DeviceMemory, 1000));
        // Rejected request leaves usage untouched.
        assert!(!budget.try_allocate(BudgetClass::DeviceMemory, 100));
        assert_eq!(budget.usage(BudgetClass::DeviceMemory), 1000);
    }

    #[test]
    fn test_deallocation_releases_budget() {
        let budget = AtomicBudgetManager::new(1024, u64::MAX);
        assert!(budget.try_allocate(BudgetClass::DeviceMemory, 1024));
        budget.record_deallocation(BudgetClass::DeviceMemory, 512);
        assert!(budget.try_allocate(BudgetClass::DeviceMemory, 512));
    }

    #[test]
    fn test_classes_tracked_independently() {
        let budget = AtomicBudgetManager::new(100, 200);
        assert!(budget.try_allocate(BudgetClass::DeviceMemory, 100));
        assert!(budget.try_allocate(BudgetClass::HostMemory, 200));
        assert!(!budget.try_allocate(BudgetClass::DeviceMemory, 1));
        assert_eq!(budget.remaining(BudgetClass::HostMemory), 0);
    }
}
