//! Side table - out-of-line counts and weak registrations
//!
//! Design: a fixed array of cache-padded mutex shards selected by address
//! hash. Each shard holds both the overflow counts and the weak table for
//! the objects hashing to it, so one lock covers every out-of-line state
//! change of an object. Different objects contend only when they share a
//! shard.

mod refcount;
mod weak;

#[cfg(test)]
mod tests;

pub(crate) use refcount::{RawRelease, RefCountEntry};
pub(crate) use weak::WeakTable;

use crate::config;
use crate::object::ObjRef;
use crossbeam::utils::CachePadded;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, MutexGuard};
use smallvec::SmallVec;
use std::collections::HashMap;
use tracing::debug;

static SIDE_TABLE: Lazy<SideTable> =
    Lazy::new(|| SideTable::new(config::current().refcount.side_table_shards));

pub(crate) type ShardGuard = MutexGuard<'static, Shard>;

/// Out-of-line state for the objects hashing to one shard
#[derive(Debug, Default)]
pub(crate) struct Shard {
    refcnts: HashMap<usize, RefCountEntry>,
    weak: WeakTable,
}

impl Shard {
    pub(crate) fn weak_table(&mut self) -> &mut WeakTable {
        &mut self.weak
    }

    /// Objects with a refcount entry in this shard
    pub(crate) fn entry_count(&self) -> usize {
        self.refcnts.len()
    }
}

pub(crate) struct SideTable {
    shards: Box<[CachePadded<Mutex<Shard>>]>,
    mask: usize,
}

impl SideTable {
    pub(crate) fn new(requested: usize) -> Self {
        let count = requested.clamp(1, config::MAX_SIDE_TABLE_SHARDS).next_power_of_two();
        let shards = (0..count)
            .map(|_| CachePadded::new(Mutex::new(Shard::default())))
            .collect();

        debug!(target: "retainer::sidetable", shards = count, "side table created");
        Self {
            shards,
            mask: count - 1,
        }
    }

    /// Shard index for an object address
    #[inline]
    pub(crate) fn index_of(&self, addr: usize) -> usize {
        ((addr >> 4) ^ (addr >> 9)) & self.mask
    }

    #[inline]
    pub(crate) fn shard_for(&self, addr: usize) -> &Mutex<Shard> {
        &self.shards[self.index_of(addr)]
    }

    pub(crate) fn len(&self) -> usize {
        self.shards.len()
    }
}

#[inline]
pub(crate) fn side_table() -> &'static SideTable {
    &SIDE_TABLE
}

/// Force creation of the shards
pub fn init() {
    Lazy::force(&SIDE_TABLE);
}

pub fn shard_count() -> usize {
    SIDE_TABLE.len()
}

/// Lock the shard owning `obj`
#[inline]
pub(crate) fn lock(obj: ObjRef) -> ShardGuard {
    SIDE_TABLE.shard_for(obj.bits()).lock()
}

/// Guards for several shards, acquired in index order
pub(crate) struct ShardSet {
    guards: SmallVec<[(usize, ShardGuard); 2]>,
}

impl ShardSet {
    /// Shard for `obj`, if it was part of the locked set
    pub(crate) fn get_mut(&mut self, obj: ObjRef) -> Option<&mut Shard> {
        let index = SIDE_TABLE.index_of(obj.bits());
        self.guards
            .iter_mut()
            .find(|(i, _)| *i == index)
            .map(|(_, guard)| &mut **guard)
    }
}

/// Lock the shards of every non-null object without deadlocking against
/// other multi-shard lockers.
pub(crate) fn lock_many(objects: &[ObjRef]) -> ShardSet {
    let mut indices: SmallVec<[usize; 2]> = objects
        .iter()
        .filter(|obj| obj.is_heap())
        .map(|obj| SIDE_TABLE.index_of(obj.bits()))
        .collect();
    indices.sort_unstable();
    indices.dedup();

    ShardSet {
        guards: indices
            .into_iter()
            .map(|i| (i, SIDE_TABLE.shards[i].lock()))
            .collect(),
    }
}
