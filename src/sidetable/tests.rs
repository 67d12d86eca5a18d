//! Side table tests: shard selection, count bookkeeping, weak table

use super::*;
use crate::weak::WeakSlot;

const ADDR: usize = 0x7f00_1000;

// ===== Shards =====

#[test]
fn test_shard_count_rounds_to_power_of_two() {
    assert_eq!(SideTable::new(48).len(), 64);
    assert_eq!(SideTable::new(1).len(), 1);
    assert_eq!(SideTable::new(0).len(), 1);
    assert_eq!(SideTable::new(1 << 20).len(), config::MAX_SIDE_TABLE_SHARDS);
}

#[test]
fn test_shard_index_stays_in_range() {
    let table = SideTable::new(16);
    for addr in (0..4096usize).map(|i| i * 8) {
        assert!(table.index_of(addr) < 16);
    }
    // Neighbouring objects spread across shards
    let distinct: std::collections::HashSet<_> =
        (0..64usize).map(|i| table.index_of(ADDR + i * 16)).collect();
    assert!(distinct.len() > 1);
}

#[test]
fn test_lock_many_dedups_and_skips_non_heap() {
    let a = ObjRef::from_bits(ADDR);
    let tagged = ObjRef::from_bits(0x11);
    let mut set = lock_many(&[a, a, ObjRef::NULL, tagged]);

    assert_eq!(set.guards.len(), 1);
    assert!(set.get_mut(a).is_some());
}

#[test]
fn test_lock_many_orders_guards() {
    let objects: Vec<ObjRef> = (0..8).map(|i| ObjRef::from_bits(ADDR + i * 0x240)).collect();
    let set = lock_many(&objects);
    let indices: Vec<usize> = set.guards.iter().map(|(i, _)| *i).collect();

    let mut sorted = indices.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(indices, sorted);
}

// ===== Counts =====

#[test]
fn test_extra_moves_in_and_out() {
    let mut shard = Shard::default();

    shard.add_extra(ADDR, 10);
    assert_eq!(shard.extra(ADDR), 10);
    assert_eq!(shard.sub_extra(ADDR, 4), 4);
    assert_eq!(shard.extra(ADDR), 6);

    // Borrowing more than is parked takes what is there
    assert_eq!(shard.sub_extra(ADDR, 100), 6);
    assert_eq!(shard.extra(ADDR), 0);
    assert!(!shard.contains(ADDR));
    assert_eq!(shard.sub_extra(ADDR, 1), 0);
}

#[test]
fn test_saturated_count_is_pinned() {
    let mut shard = Shard::default();

    shard.add_extra(ADDR, usize::MAX - 1);
    shard.add_extra(ADDR, 5);
    assert_eq!(shard.extra(ADDR), usize::MAX);

    // Pinned entries hand out anything and never shrink
    assert_eq!(shard.sub_extra(ADDR, 1 << 18), 1 << 18);
    assert_eq!(shard.extra(ADDR), usize::MAX);
    assert_eq!(shard.release_raw(ADDR), RawRelease::Decremented);
    assert_eq!(shard.raw_retain_count(ADDR), usize::MAX);
}

#[test]
fn test_raw_release_state_machine() {
    let mut shard = Shard::default();

    assert_eq!(shard.raw_retain_count(ADDR), 1);
    shard.retain_raw(ADDR);
    assert_eq!(shard.raw_retain_count(ADDR), 2);

    assert_eq!(shard.release_raw(ADDR), RawRelease::Decremented);
    assert!(!shard.contains(ADDR));

    assert_eq!(shard.release_raw(ADDR), RawRelease::Dealloc);
    assert!(shard.is_deallocating_raw(ADDR));
    assert!(!shard.try_retain_raw(ADDR));

    assert_eq!(shard.release_raw(ADDR), RawRelease::OverReleased);
}

#[test]
fn test_raw_flags_keep_entry_alive() {
    let mut shard = Shard::default();

    shard.set_weakly_referenced_raw(ADDR);
    assert!(shard.is_weakly_referenced_raw(ADDR));
    assert!(shard.contains(ADDR));
    assert_eq!(shard.entry_count(), 1);

    let entry = shard.remove_entry(ADDR).unwrap();
    assert!(entry.weakly_referenced);
    assert_eq!(entry.extra, 0);
    assert_eq!(shard.entry_count(), 0);
}

// ===== Weak table =====

#[test]
fn test_weak_register_unregister() {
    let mut table = WeakTable::default();
    let first = WeakSlot::new();
    let second = WeakSlot::new();
    let a = &first as *const WeakSlot as usize;
    let b = &second as *const WeakSlot as usize;

    table.register(ADDR, a);
    table.register(ADDR, a);
    table.register(ADDR, b);
    assert_eq!(table.referrers(ADDR), 2);

    assert!(table.unregister(ADDR, a));
    assert!(!table.unregister(ADDR, a));
    assert!(table.unregister(ADDR, b));
    assert!(table.is_empty());
}

#[test]
fn test_weak_clear_nulls_matching_slots() {
    let mut table = WeakTable::default();
    let pointing = WeakSlot::new();
    let moved_on = WeakSlot::new();
    pointing.store_bits(ADDR);
    moved_on.store_bits(ADDR + 0x100);

    table.register(ADDR, &pointing as *const WeakSlot as usize);
    table.register(ADDR, &moved_on as *const WeakSlot as usize);

    let cleared = unsafe { table.clear(ADDR) };
    assert_eq!(cleared, 1);
    assert!(pointing.is_null());
    // A slot that no longer holds the object is left alone
    assert_eq!(moved_on.load_bits(), ADDR + 0x100);
    assert_eq!(table.referrers(ADDR), 0);
    assert_eq!(unsafe { table.clear(ADDR) }, 0);
}

#[test]
fn test_shard_exposes_weak_table() {
    let mut shard = Shard::default();
    let slot = WeakSlot::new();
    shard
        .weak_table()
        .register(ADDR, &slot as *const WeakSlot as usize);
    assert_eq!(shard.weak_table().referrers(ADDR), 1);
}
