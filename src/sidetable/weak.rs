//! Weak reference table
//!
//! Maps each weakly referenced object to the addresses of the slots that
//! point at it. Mutated only under the owning shard's lock.

use crate::logging::{log_weak_clear, log_weak_mismatch};
use crate::stats::{self, Counter};
use crate::weak::WeakSlot;
use smallvec::SmallVec;
use std::collections::HashMap;

type Referrers = SmallVec<[usize; 4]>;

#[derive(Debug, Default)]
pub(crate) struct WeakTable {
    entries: HashMap<usize, Referrers>,
}

impl WeakTable {
    /// Record that `slot` points at `referent`
    pub(crate) fn register(&mut self, referent: usize, slot: usize) {
        let referrers = self.entries.entry(referent).or_default();
        if !referrers.contains(&slot) {
            referrers.push(slot);
        }
    }

    /// Forget `slot`; returns whether it was registered
    pub(crate) fn unregister(&mut self, referent: usize, slot: usize) -> bool {
        let Some(referrers) = self.entries.get_mut(&referent) else {
            return false;
        };
        let Some(pos) = referrers.iter().position(|&s| s == slot) else {
            return false;
        };

        referrers.swap_remove(pos);
        if referrers.is_empty() {
            self.entries.remove(&referent);
        }
        true
    }

    /// Null every slot registered for `referent` and drop its entry.
    ///
    /// Returns the number of slots cleared.
    ///
    /// # Safety
    /// Every registered slot address must still be a live `WeakSlot`.
    pub(crate) unsafe fn clear(&mut self, referent: usize) -> usize {
        let Some(referrers) = self.entries.remove(&referent) else {
            return 0;
        };

        let mut cleared = 0;
        for addr in referrers {
            let slot = &*(addr as *const WeakSlot);
            let holds = slot.load_bits();
            if holds == referent {
                slot.store_bits(0);
                cleared += 1;
            } else if holds != 0 {
                log_weak_mismatch(addr, holds, referent);
            }
        }

        if cleared > 0 {
            stats::add(Counter::WeakSlotsCleared, cleared);
            log_weak_clear(referent, cleared);
        }
        cleared
    }

    pub(crate) fn referrers(&self, referent: usize) -> usize {
        self.entries.get(&referent).map_or(0, |r| r.len())
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
