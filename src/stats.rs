//! Runtime counters
//!
//! Lock-free counters bumped on slow-path events only. The inline
//! retain/release fast path never touches them.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};

static COUNTERS: Lazy<Counters> = Lazy::new(Counters::new);

struct Counters {
    objects_allocated: AtomicUsize,
    objects_freed: AtomicUsize,
    fast_frees: AtomicUsize,
    slow_frees: AtomicUsize,
    overflow_spills: AtomicUsize,
    underflow_borrows: AtomicUsize,
    weak_slots_cleared: AtomicUsize,
    pool_leaks: AtomicUsize,
}

impl Counters {
    fn new() -> Self {
        Self {
            objects_allocated: AtomicUsize::new(0),
            objects_freed: AtomicUsize::new(0),
            fast_frees: AtomicUsize::new(0),
            slow_frees: AtomicUsize::new(0),
            overflow_spills: AtomicUsize::new(0),
            underflow_borrows: AtomicUsize::new(0),
            weak_slots_cleared: AtomicUsize::new(0),
            pool_leaks: AtomicUsize::new(0),
        }
    }

    fn slot(&self, counter: Counter) -> &AtomicUsize {
        match counter {
            Counter::ObjectsAllocated => &self.objects_allocated,
            Counter::ObjectsFreed => &self.objects_freed,
            Counter::FastFrees => &self.fast_frees,
            Counter::SlowFrees => &self.slow_frees,
            Counter::OverflowSpills => &self.overflow_spills,
            Counter::UnderflowBorrows => &self.underflow_borrows,
            Counter::WeakSlotsCleared => &self.weak_slots_cleared,
            Counter::PoolLeaks => &self.pool_leaks,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    ObjectsAllocated,
    ObjectsFreed,
    FastFrees,
    SlowFrees,
    OverflowSpills,
    UnderflowBorrows,
    WeakSlotsCleared,
    PoolLeaks,
}

#[inline]
pub(crate) fn bump(counter: Counter) {
    add(counter, 1);
}

#[inline]
pub(crate) fn add(counter: Counter, amount: usize) {
    COUNTERS.slot(counter).fetch_add(amount, Ordering::Relaxed);
}

/// Point-in-time copy of the runtime counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub objects_allocated: usize,
    pub objects_freed: usize,
    pub fast_frees: usize,
    pub slow_frees: usize,
    pub overflow_spills: usize,
    pub underflow_borrows: usize,
    pub weak_slots_cleared: usize,
    pub pool_leaks: usize,
}

impl Stats {
    /// Objects allocated and not yet freed
    pub fn live_objects(&self) -> usize {
        self.objects_allocated.saturating_sub(self.objects_freed)
    }
}

/// Read all counters. Individual counters are consistent, the set is not.
pub fn snapshot() -> Stats {
    let c = &*COUNTERS;
    let load = |a: &AtomicUsize| a.load(Ordering::Relaxed);
    Stats {
        objects_allocated: load(&c.objects_allocated),
        objects_freed: load(&c.objects_freed),
        fast_frees: load(&c.fast_frees),
        slow_frees: load(&c.slow_frees),
        overflow_spills: load(&c.overflow_spills),
        underflow_borrows: load(&c.underflow_borrows),
        weak_slots_cleared: load(&c.weak_slots_cleared),
        pool_leaks: load(&c.pool_leaks),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_monotonic() {
        let before = snapshot();
        bump(Counter::OverflowSpills);
        add(Counter::WeakSlotsCleared, 3);
        let after = snapshot();

        assert!(after.overflow_spills >= before.overflow_spills + 1);
        assert!(after.weak_slots_cleared >= before.weak_slots_cleared + 3);
    }

    #[test]
    fn test_live_objects_saturates() {
        let stats = Stats {
            objects_allocated: 2,
            objects_freed: 5,
            ..Stats::default()
        };
        assert_eq!(stats.live_objects(), 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let json = serde_json::to_string(&Stats::default()).unwrap();
        assert!(json.contains("\"overflow_spills\":0"));
    }
}
