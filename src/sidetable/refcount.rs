//! Out-of-line reference counts
//!
//! Inline-header objects only park overflow mass here. Raw-header objects
//! keep their whole count here, along with the weak and deallocating flags
//! their header cannot hold. An absent entry means "one owner, no flags".

use super::Shard;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct RefCountEntry {
    /// Owners beyond the first (raw) or beyond the inline count
    pub extra: usize,
    pub weakly_referenced: bool,
    pub deallocating: bool,
    /// Count saturated; it is never decremented again and the object leaks
    pub pinned: bool,
}

impl RefCountEntry {
    #[inline]
    fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Outcome of releasing a raw-header object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RawRelease {
    Decremented,
    /// Last owner gone; the deallocating flag is now set
    Dealloc,
    /// Already deallocating with no owners left
    OverReleased,
}

impl Shard {
    fn update<R>(&mut self, addr: usize, f: impl FnOnce(&mut RefCountEntry) -> R) -> R {
        let entry = self.refcnts.entry(addr).or_default();
        let result = f(entry);
        if entry.is_empty() {
            self.refcnts.remove(&addr);
        }
        result
    }

    #[inline]
    fn get(&self, addr: usize) -> RefCountEntry {
        self.refcnts.get(&addr).copied().unwrap_or_default()
    }

    /// Park `delta` owners; saturates and pins instead of wrapping
    pub(crate) fn add_extra(&mut self, addr: usize, delta: usize) {
        self.update(addr, |entry| match entry.extra.checked_add(delta) {
            Some(extra) if !entry.pinned => entry.extra = extra,
            _ => {
                entry.extra = usize::MAX;
                entry.pinned = true;
            }
        })
    }

    /// Take back up to `delta` owners; returns how many were taken.
    /// A pinned count hands out whatever is asked for.
    pub(crate) fn sub_extra(&mut self, addr: usize, delta: usize) -> usize {
        self.update(addr, |entry| {
            if entry.pinned {
                return delta;
            }
            let taken = entry.extra.min(delta);
            entry.extra -= taken;
            taken
        })
    }

    pub(crate) fn extra(&self, addr: usize) -> usize {
        self.get(addr).extra
    }

    pub(crate) fn retain_raw(&mut self, addr: usize) {
        self.add_extra(addr, 1);
    }

    /// Retain unless the object already began deallocating
    pub(crate) fn try_retain_raw(&mut self, addr: usize) -> bool {
        if self.get(addr).deallocating {
            return false;
        }
        self.add_extra(addr, 1);
        true
    }

    pub(crate) fn release_raw(&mut self, addr: usize) -> RawRelease {
        self.update(addr, |entry| {
            if entry.pinned {
                RawRelease::Decremented
            } else if entry.extra > 0 {
                entry.extra -= 1;
                RawRelease::Decremented
            } else if entry.deallocating {
                RawRelease::OverReleased
            } else {
                entry.deallocating = true;
                RawRelease::Dealloc
            }
        })
    }

    pub(crate) fn raw_retain_count(&self, addr: usize) -> usize {
        self.get(addr).extra.saturating_add(1)
    }

    pub(crate) fn set_weakly_referenced_raw(&mut self, addr: usize) {
        self.update(addr, |entry| entry.weakly_referenced = true)
    }

    pub(crate) fn is_weakly_referenced_raw(&self, addr: usize) -> bool {
        self.get(addr).weakly_referenced
    }

    pub(crate) fn is_deallocating_raw(&self, addr: usize) -> bool {
        self.get(addr).deallocating
    }

    pub(crate) fn entry(&self, addr: usize) -> RefCountEntry {
        self.get(addr)
    }

    /// Take over the count and flags of an inline header whose object is
    /// switching to a raw header. Parked overflow mass stays where it is.
    pub(crate) fn transcribe_inline(
        &mut self,
        addr: usize,
        extra: usize,
        deallocating: bool,
        weakly_referenced: bool,
    ) {
        self.update(addr, |entry| {
            entry.deallocating |= deallocating;
            entry.weakly_referenced |= weakly_referenced;
        });
        if extra > 0 {
            self.add_extra(addr, extra);
        }
    }

    /// Hand the flags of a raw entry over to a new inline header; the
    /// count stays behind as overflow mass.
    pub(crate) fn adopt_inline(&mut self, addr: usize) {
        self.update(addr, |entry| {
            entry.deallocating = false;
            entry.weakly_referenced = false;
        })
    }

    pub(crate) fn remove_entry(&mut self, addr: usize) -> Option<RefCountEntry> {
        self.refcnts.remove(&addr)
    }

    pub(crate) fn contains(&self, addr: usize) -> bool {
        self.refcnts.contains_key(&addr)
    }
}
