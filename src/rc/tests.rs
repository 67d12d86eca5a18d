//! Retain/release state machine tests
//!
//! Organized by component:
//! - Inline counts: pairing, overflow spill, underflow borrow
//! - Deallocation: fast path, destructor, should-dealloc, fatal over-release
//! - Raw headers: side-table-only bookkeeping
//! - Dispatch: tagged values, null, class overrides
//! - Class change: header rewrite and count migration
//! - Handle: Retained clone/drop

use super::*;
use crate::class::{ClassDescriptor, ClassId, OverrideTable};
use crate::object::{
    class_of, header_snapshot, HeaderBits, ObjectHeader, INLINE_CAPACITY, RC_HALF,
};
use crate::sidetable;
use crate::tagged::{make_tagged, TagSlot};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Destructor that bumps the counter whose address sits in the body
unsafe fn count_drop(body: *mut u8) {
    let counter = *(body as *const *const AtomicUsize);
    if !counter.is_null() {
        (*counter).fetch_add(1, Ordering::SeqCst);
    }
}

/// Dealloc override that leaves the storage in place
unsafe fn keep_storage(_obj: ObjRef) {}

fn class(name: &str) -> ClassId {
    ClassDescriptor::new(name, 16).register().unwrap()
}

fn tracked_class(name: &str) -> ClassId {
    ClassDescriptor::new(name, 16)
        .with_destructor(count_drop)
        .register()
        .unwrap()
}

fn kept_class(name: &str, raw: bool) -> ClassId {
    let desc = ClassDescriptor::new(name, 16).with_overrides(OverrideTable {
        dealloc: Some(keep_storage),
        ..OverrideTable::default()
    });
    let desc = if raw { desc.requiring_raw_header() } else { desc };
    desc.register().unwrap()
}

fn tracked(class: ClassId) -> (Retained, &'static AtomicUsize) {
    let counter: &'static AtomicUsize = Box::leak(Box::new(AtomicUsize::new(0)));
    let obj = Retained::alloc(class).unwrap();
    unsafe { *(obj.body() as *mut *const AtomicUsize) = counter };
    (obj, counter)
}

// ===== Inline counts =====

#[test]
fn test_retain_release_pair_preserves_count() {
    let obj = Retained::alloc(class("RcPair")).unwrap();
    assert_eq!(obj.retain_count(), 1);

    unsafe {
        assert_eq!(retain(obj.as_obj()), obj.as_obj());
        assert_eq!(obj.retain_count(), 2);
        release(obj.as_obj());
    }
    assert_eq!(obj.retain_count(), 1);
}

#[test]
fn test_overflow_spills_and_borrows_back() {
    let (obj, drops) = tracked(tracked_class("RcOverflow"));
    let raw = obj.into_raw();
    let total = INLINE_CAPACITY + 5;

    unsafe {
        for _ in 0..total {
            retain(raw);
        }
        assert_eq!(retain_count(raw), 1 + INLINE_CAPACITY + 5);

        let bits = header_snapshot(raw).unwrap();
        assert!(bits.has_sidetable_count());
        assert_eq!(bits.extra_count(), RC_HALF + 4);
        assert_eq!(sidetable::lock(raw).extra(raw.bits()), RC_HALF);

        for _ in 0..total {
            release(raw);
        }
        assert_eq!(retain_count(raw), 1);
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        release(raw);
    }
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn test_borrow_refills_inline_count() {
    let obj = Retained::alloc(class("RcBorrow")).unwrap();
    let raw = obj.as_obj();

    unsafe {
        for _ in 0..=INLINE_CAPACITY {
            retain(raw);
        }
        // Drain the inline half, then one more release borrows
        for _ in 0..=RC_HALF {
            release(raw);
        }
        let bits = header_snapshot(raw).unwrap();
        assert_eq!(bits.extra_count(), RC_HALF - 1);
        assert_eq!(sidetable::lock(raw).extra(raw.bits()), 0);
        assert_eq!(retain_count(raw), RC_HALF);

        for _ in 0..RC_HALF - 1 {
            release(raw);
        }
    }
    assert_eq!(obj.retain_count(), 1);
}

// ===== Deallocation =====

#[test]
fn test_final_release_runs_destructor_once() {
    let (obj, drops) = tracked(tracked_class("RcDestructor"));
    let extra = obj.clone();

    drop(obj);
    assert_eq!(drops.load(Ordering::SeqCst), 0);
    drop(extra);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn test_plain_object_takes_fast_path() {
    let before = crate::stats::snapshot().fast_frees;
    let obj = Retained::alloc(class("RcFast")).unwrap();
    drop(obj);
    assert!(crate::stats::snapshot().fast_frees > before);
}

#[test]
fn test_release_should_dealloc_defers_teardown() {
    let (obj, drops) = tracked(tracked_class("RcDeferred"));
    let raw = obj.into_raw();

    unsafe {
        assert!(root_release_should_dealloc(raw));
        assert!(root_is_deallocating(raw));
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        root_dealloc(raw);
    }
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn test_try_retain_fails_once_deallocating() {
    let obj = Retained::alloc(kept_class("RcTryRetain", false)).unwrap();
    let raw = obj.into_raw();

    unsafe {
        assert_eq!(try_retain(raw), Some(raw));
        release(raw);

        release(raw);
        assert!(is_deallocating(raw));
        assert_eq!(try_retain(raw), None);
        assert_eq!(root_try_retain(raw), None);

        root_dealloc(raw);
    }
}

#[test]
#[should_panic(expected = "overreleased")]
fn test_double_release_is_fatal() {
    let obj = Retained::alloc(kept_class("RcDoubleRelease", false)).unwrap();
    let raw = obj.into_raw();
    unsafe {
        release(raw);
        release(raw);
    }
}

#[test]
#[should_panic(expected = "overreleased")]
fn test_double_release_is_fatal_for_raw_headers() {
    let obj = Retained::alloc(kept_class("RcDoubleReleaseRaw", true)).unwrap();
    let raw = obj.into_raw();
    unsafe {
        release(raw);
        release(raw);
    }
}

// ===== Raw headers =====

#[test]
fn test_raw_header_counts_live_in_side_table() {
    let class = ClassDescriptor::new("RcRaw", 16)
        .with_destructor(count_drop)
        .requiring_raw_header()
        .register()
        .unwrap();
    let (obj, drops) = tracked(class);
    let raw = obj.as_obj();

    unsafe {
        assert!(!header_snapshot(raw).unwrap().has_inline_metadata());
        retain(raw);
        retain(raw);
        assert_eq!(obj.retain_count(), 3);
        assert_eq!(sidetable::lock(raw).extra(raw.bits()), 2);

        release(raw);
        release(raw);
        assert_eq!(obj.retain_count(), 1);
        assert!(!sidetable::lock(raw).contains(raw.bits()));
    }

    drop(obj);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn test_zero_header_delegates_to_side_table() {
    let header = Box::new(ObjectHeader::new(HeaderBits::from_bits(0)));
    let raw = ObjRef::from_bits(&*header as *const ObjectHeader as usize);

    unsafe {
        assert_eq!(retain(raw), raw);
        assert_eq!(retain_count(raw), 2);
        release(raw);
        assert_eq!(retain_count(raw), 1);
        assert!(!is_deallocating(raw));

        // Teardown of a class-less object leaves the storage to its owner
        release(raw);
        assert!(!sidetable::lock(raw).contains(raw.bits()));
    }
    drop(header);
}

// ===== Dispatch =====

#[test]
fn test_tagged_values_are_identity() {
    let tagged = make_tagged(TagSlot::Basic(2), 1234).unwrap();

    unsafe {
        assert_eq!(retain(tagged), tagged);
        release(tagged);
        release(tagged);
        assert_eq!(try_retain(tagged), Some(tagged));
        assert_eq!(autorelease(tagged), tagged);
        assert_eq!(retain_count(tagged), tagged.bits());
        assert!(!is_deallocating(tagged));
    }
}

#[test]
fn test_null_is_a_no_op() {
    unsafe {
        assert_eq!(retain(ObjRef::NULL), ObjRef::NULL);
        release(ObjRef::NULL);
        assert_eq!(try_retain(ObjRef::NULL), None);
        assert_eq!(retain_count(ObjRef::NULL), 0);
    }
}

static OVERRIDE_RETAINS: AtomicUsize = AtomicUsize::new(0);
static OVERRIDE_RELEASES: AtomicUsize = AtomicUsize::new(0);

unsafe fn counting_retain(obj: ObjRef) -> ObjRef {
    OVERRIDE_RETAINS.fetch_add(1, Ordering::SeqCst);
    root_retain(obj)
}

unsafe fn counting_release(obj: ObjRef) {
    OVERRIDE_RELEASES.fetch_add(1, Ordering::SeqCst);
    root_release(obj);
}

unsafe fn fixed_count(_obj: ObjRef) -> usize {
    42
}

#[test]
fn test_overrides_receive_lifetime_calls() {
    let class = ClassDescriptor::new("RcOverridden", 16)
        .with_overrides(OverrideTable {
            retain: Some(counting_retain),
            release: Some(counting_release),
            retain_count: Some(fixed_count),
            ..OverrideTable::default()
        })
        .register()
        .unwrap();

    let obj = Retained::alloc(class).unwrap();
    let copy = obj.clone();
    assert_eq!(OVERRIDE_RETAINS.load(Ordering::SeqCst), 1);
    assert_eq!(obj.retain_count(), 42);

    unsafe { assert_eq!(root_retain_count(obj.as_obj()), 2) };

    drop(copy);
    drop(obj);
    assert_eq!(OVERRIDE_RELEASES.load(Ordering::SeqCst), 2);
}

// ===== Class change =====

fn raw_tracked_class(name: &str) -> ClassId {
    ClassDescriptor::new(name, 16)
        .with_destructor(count_drop)
        .requiring_raw_header()
        .register()
        .unwrap()
}

#[test]
fn test_change_class_to_raw_moves_inline_count() {
    let (obj, drops) = tracked(tracked_class("RcChangeFrom"));
    let target = raw_tracked_class("RcChangeToRaw");
    let from = unsafe { class_of(obj.as_obj()) };
    let raw = obj.into_raw();

    unsafe {
        for _ in 0..10 {
            retain(raw);
        }
        assert_eq!(change_class(raw, target), Ok(from));

        let bits = header_snapshot(raw).unwrap();
        assert!(!bits.has_inline_metadata());
        assert_eq!(bits.class_id(), Some(target));
        assert_eq!(retain_count(raw), 11);
        assert_eq!(sidetable::lock(raw).extra(raw.bits()), 10);

        for _ in 0..10 {
            release(raw);
        }
        assert_eq!(retain_count(raw), 1);
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        release(raw);
    }
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn test_change_class_to_raw_keeps_parked_overflow() {
    let (obj, drops) = tracked(tracked_class("RcChangeSpilled"));
    let target = raw_tracked_class("RcChangeSpilledRaw");
    let raw = obj.into_raw();
    let total = INLINE_CAPACITY + 5;

    unsafe {
        for _ in 0..total {
            retain(raw);
        }
        assert!(header_snapshot(raw).unwrap().has_sidetable_count());

        change_class(raw, target).unwrap();
        assert_eq!(retain_count(raw), 1 + total);
        assert_eq!(sidetable::lock(raw).extra(raw.bits()), total);

        for _ in 0..total {
            release(raw);
        }
        assert!(!sidetable::lock(raw).contains(raw.bits()));
        release(raw);
    }
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn test_change_class_inline_to_inline_updates_destructor_flag() {
    let plain = class("RcChangePlain");
    let (obj, drops) = tracked(tracked_class("RcChangeTracked"));

    unsafe {
        retain(obj.as_obj());
        assert!(header_snapshot(obj.as_obj()).unwrap().has_destructor());

        change_class(obj.as_obj(), plain).unwrap();
        let bits = header_snapshot(obj.as_obj()).unwrap();
        assert!(bits.is_valid_inline());
        assert!(!bits.has_destructor());
        assert_eq!(bits.class_id(), Some(plain));
        assert_eq!(bits.extra_count(), 1);

        release(obj.as_obj());
    }
    drop(obj);
    assert_eq!(drops.load(Ordering::SeqCst), 0);
}

#[test]
fn test_change_class_raw_stays_raw() {
    let from = raw_tracked_class("RcChangeRawFrom");
    let to = class("RcChangeRawTo");
    let obj = Retained::alloc(from).unwrap();

    unsafe {
        retain(obj.as_obj());
        assert_eq!(change_class(obj.as_obj(), to), Ok(Some(from)));

        let bits = header_snapshot(obj.as_obj()).unwrap();
        assert!(!bits.has_inline_metadata());
        assert_eq!(bits.class_id(), Some(to));
        assert_eq!(obj.retain_count(), 2);
        release(obj.as_obj());
    }
}

#[test]
fn test_change_class_adopts_zero_header() {
    let target = kept_class("RcChangeZero", false);
    let header = Box::new(ObjectHeader::new(HeaderBits::from_bits(0)));
    let raw = ObjRef::from_bits(&*header as *const ObjectHeader as usize);

    unsafe {
        retain(raw);
        assert_eq!(change_class(raw, target), Ok(None));

        let bits = header_snapshot(raw).unwrap();
        assert!(bits.is_valid_inline());
        assert!(bits.has_sidetable_count());
        assert_eq!(retain_count(raw), 2);

        release(raw);
        assert_eq!(retain_count(raw), 1);
        release(raw);
        assert!(is_deallocating(raw));
    }
    drop(header);
}

#[test]
fn test_change_class_rejects_mismatched_layout() {
    let small = class("RcChangeSmall");
    let large = ClassDescriptor::new("RcChangeLarge", 64).register().unwrap();
    let obj = Retained::alloc(small).unwrap();

    let result = unsafe { change_class(obj.as_obj(), large) };
    assert!(matches!(
        result,
        Err(crate::error::RegistryError::IncompatibleLayout { .. })
    ));
    assert_eq!(unsafe { class_of(obj.as_obj()) }, Some(small));

    let bogus = ClassId::from_index(u32::MAX).unwrap();
    assert_eq!(
        unsafe { change_class(obj.as_obj(), bogus) },
        Err(crate::error::RegistryError::UnknownClass { index: u32::MAX })
    );
}

#[test]
fn test_change_class_ignores_null_and_tagged() {
    let target = class("RcChangeIgnored");
    let tagged = make_tagged(TagSlot::Basic(2), 77).unwrap();
    unsafe {
        assert_eq!(change_class(ObjRef::NULL, target), Ok(None));
        assert_eq!(change_class(tagged, target), Ok(None));
        assert_eq!(retain_count(tagged), tagged.bits());
    }
}

// ===== Handle =====

#[test]
fn test_retained_clone_and_drop() {
    let obj = Retained::alloc(class("RcHandle")).unwrap();
    let clones: Vec<Retained> = (0..10).map(|_| obj.clone()).collect();
    assert_eq!(obj.retain_count(), 11);
    assert!(clones.iter().all(|c| *c == obj));

    drop(clones);
    assert_eq!(obj.retain_count(), 1);

    let raw = obj.into_raw();
    let back = unsafe { Retained::from_raw(raw) };
    assert_eq!(back.retain_count(), 1);
}
