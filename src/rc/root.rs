//! Root lifetime operations - the engine's own retain/release
//!
//! Inline headers are updated with weak CAS loops. The shard lock is taken
//! only to migrate count mass on overflow or underflow, or for raw headers
//! whose whole count lives in the side table. Whenever the lock is taken
//! mid-loop the header is reloaded before the next attempt.

use crate::assoc;
use crate::class::ClassId;
use crate::config;
use crate::elision::{self, ReturnDisposition};
use crate::error::{fatal, FatalFault, RegistryError};
use crate::logging::{log_class_changed, log_overflow, log_underflow};
use crate::object::{
    self, free_object, HeaderBits, InstanceLayout, ObjRef, DEALLOCATING_BIT, RC_HALF,
    SIDETABLE_BIT, WEAK_BIT,
};
use crate::pool;
use crate::sidetable::{self, RawRelease, Shard, ShardGuard};
use crate::stats::{self, Counter};
use std::sync::atomic::{fence, Ordering};

/// Shard lock either borrowed from the caller or taken on demand
enum ShardAccess<'a> {
    Held(&'a mut Shard),
    Owned(Option<ShardGuard>),
}

impl<'a> ShardAccess<'a> {
    fn new(held: Option<&'a mut Shard>) -> Self {
        match held {
            Some(shard) => Self::Held(shard),
            None => Self::Owned(None),
        }
    }

    #[inline]
    fn is_locked(&self) -> bool {
        matches!(self, Self::Held(_) | Self::Owned(Some(_)))
    }

    fn acquire(&mut self, obj: ObjRef) -> &mut Shard {
        match self {
            Self::Held(shard) => &mut **shard,
            Self::Owned(guard) => &mut **guard.get_or_insert_with(|| sidetable::lock(obj)),
        }
    }

    /// Drop an owned lock; a borrowed one stays with the caller
    fn unlock(&mut self) {
        if let Self::Owned(guard) = self {
            *guard = None;
        }
    }
}

#[inline(always)]
unsafe fn retain_impl(obj: ObjRef, try_retain: bool, held: Option<&mut Shard>) -> Option<ObjRef> {
    let header = obj.header();
    let addr = obj.bits();
    let mut access = ShardAccess::new(held);
    let mut old = header.load();

    loop {
        if !old.has_inline_metadata() {
            let shard = access.acquire(obj);
            if try_retain {
                return shard.try_retain_raw(addr).then_some(obj);
            }
            shard.retain_raw(addr);
            return Some(obj);
        }

        if try_retain && old.is_deallocating() {
            return None;
        }

        let (new, carry) = old.increment();
        if !carry {
            match header.compare_exchange(old, new, Ordering::Relaxed) {
                Ok(_) => return Some(obj),
                Err(actual) => {
                    old = actual;
                    continue;
                }
            }
        }

        // Inline count is full: keep half, park half in the side table
        if !access.is_locked() {
            access.acquire(obj);
            old = header.load();
            continue;
        }

        let spilled = old.with_extra_count(RC_HALF).with(SIDETABLE_BIT);
        match header.compare_exchange(old, spilled, Ordering::Relaxed) {
            Ok(_) => {
                access.acquire(obj).add_extra(addr, RC_HALF);
                stats::bump(Counter::OverflowSpills);
                log_overflow(addr, RC_HALF);
                return Some(obj);
            }
            Err(actual) => old = actual,
        }
    }
}

#[inline(always)]
unsafe fn release_impl(obj: ObjRef, perform_dealloc: bool) -> bool {
    let header = obj.header();
    let addr = obj.bits();
    let mut access = ShardAccess::new(None);
    let mut old = header.load();

    loop {
        if !old.has_inline_metadata() {
            match access.acquire(obj).release_raw(addr) {
                RawRelease::Decremented => return false,
                RawRelease::OverReleased => {
                    access.unlock();
                    over_release(obj);
                }
                RawRelease::Dealloc => break,
            }
        }

        let (new, borrow) = old.decrement();
        if !borrow {
            match header.compare_exchange(old, new, Ordering::Release) {
                Ok(_) => return false,
                Err(actual) => {
                    old = actual;
                    continue;
                }
            }
        }

        if old.has_sidetable_count() {
            if !access.is_locked() {
                access.acquire(obj);
                old = header.load();
                continue;
            }

            let shard = access.acquire(obj);
            let borrowed = shard.sub_extra(addr, RC_HALF);
            if borrowed > 0 {
                // One of the borrowed owners is the one being released
                let refilled = old.with_extra_count(borrowed - 1);
                match header.compare_exchange(old, refilled, Ordering::Release) {
                    Ok(_) => {
                        stats::bump(Counter::UnderflowBorrows);
                        log_underflow(addr, borrowed);
                        return false;
                    }
                    Err(actual) => {
                        shard.add_extra(addr, borrowed);
                        old = actual;
                        continue;
                    }
                }
            }
        }

        // No owners left anywhere
        if old.is_deallocating() {
            access.unlock();
            over_release(obj);
        }

        match header.compare_exchange(old, old.with(DEALLOCATING_BIT), Ordering::Release) {
            Ok(_) => break,
            Err(actual) => old = actual,
        }
    }

    access.unlock();
    fence(Ordering::Acquire);
    if perform_dealloc {
        super::dealloc(obj);
    }
    true
}

#[cold]
unsafe fn over_release(obj: ObjRef) -> ! {
    let class = object::descriptor_of(obj).map(|desc| desc.name().to_string());
    fatal(FatalFault::OverRelease {
        address: obj.bits(),
        class,
    })
}

/// Add one owner, bypassing class overrides.
///
/// # Safety
/// `obj` must be a live heap object the caller owns or borrows.
#[inline]
pub unsafe fn root_retain(obj: ObjRef) -> ObjRef {
    retain_impl(obj, false, None).unwrap_or(obj)
}

/// Add one owner unless the object began deallocating.
///
/// # Safety
/// `obj` must be a heap object whose storage is still allocated.
#[inline]
pub unsafe fn root_try_retain(obj: ObjRef) -> Option<ObjRef> {
    retain_impl(obj, true, None)
}

/// Try-retain while the caller already holds `obj`'s shard lock
pub(crate) unsafe fn try_retain_locked(obj: ObjRef, shard: &mut Shard) -> Option<ObjRef> {
    retain_impl(obj, true, Some(shard))
}

/// Drop one owner, deallocating at zero. Returns whether the object
/// began deallocating.
///
/// # Safety
/// The caller must own the reference being released.
#[inline]
pub unsafe fn root_release(obj: ObjRef) -> bool {
    release_impl(obj, true)
}

/// Like [`root_release`], but leaves deallocation to the caller when it
/// returns `true`.
///
/// # Safety
/// As [`root_release`]; on `true` the caller must eventually dealloc.
pub unsafe fn root_release_should_dealloc(obj: ObjRef) -> bool {
    release_impl(obj, false)
}

/// Current owner count, read under the shard lock
///
/// # Safety
/// `obj` must be a live heap object.
pub unsafe fn root_retain_count(obj: ObjRef) -> usize {
    let shard = sidetable::lock(obj);
    let bits = obj.header().load();

    if !bits.has_inline_metadata() {
        return shard.raw_retain_count(obj.bits());
    }

    let mut count = 1 + bits.extra_count();
    if bits.has_sidetable_count() {
        count = count.saturating_add(shard.extra(obj.bits()));
    }
    count
}

/// # Safety
/// `obj` must be a heap object whose storage is still allocated.
pub unsafe fn root_is_deallocating(obj: ObjRef) -> bool {
    let bits = obj.header().load();
    if bits.has_inline_metadata() {
        return bits.is_deallocating();
    }
    sidetable::lock(obj).is_deallocating_raw(obj.bits())
}

/// Record that a weak slot is about to point at `obj`.
///
/// Fails once the object began deallocating. The weak flag and the
/// deallocating flag are set by CAS on the same word, so teardown always
/// sees a weak flag that won the race.
pub(crate) unsafe fn mark_weakly_referenced(obj: ObjRef, shard: &mut Shard) -> bool {
    let header = obj.header();
    let mut old = header.load();
    loop {
        if !old.has_inline_metadata() {
            if shard.is_deallocating_raw(obj.bits()) {
                return false;
            }
            shard.set_weakly_referenced_raw(obj.bits());
            return true;
        }
        if old.is_deallocating() {
            return false;
        }
        if old.is_weakly_referenced() {
            return true;
        }
        match header.compare_exchange(old, old.with(WEAK_BIT), Ordering::Relaxed) {
            Ok(_) => return true,
            Err(actual) => old = actual,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ClassChange {
    /// Count storage stays where it is
    InPlace,
    /// Inline count and flags move into the side table
    ToRaw,
    /// Zero header gains inline metadata; raw state moves into the header
    FromZero,
}

/// Switch `obj` to `class`, returning its previous class.
///
/// The header is rewritten by CAS. Moving from an inline header to a class
/// that needs a raw header copies the inline count and the weak and
/// deallocating flags into the side table under the shard lock, so
/// concurrent retains and releases see one consistent count. Raw headers
/// stay raw. Null and tagged references are left alone.
///
/// # Safety
/// `obj` must be null, tagged or a live heap object. A zero header may only be given a
/// class whose layout matches how its storage was allocated.
pub unsafe fn change_class(obj: ObjRef, class: ClassId) -> Result<Option<ClassId>, RegistryError> {
    if !obj.is_heap() {
        return Ok(None);
    }
    let desc = class.descriptor().ok_or(RegistryError::UnknownClass {
        index: class.index(),
    })?;
    if let Some(current) = object::descriptor_of(obj) {
        let same_layout = match (
            InstanceLayout::for_class(current),
            InstanceLayout::for_class(desc),
        ) {
            (Ok(from), Ok(to)) => from == to,
            _ => false,
        };
        if !same_layout {
            return Err(RegistryError::IncompatibleLayout {
                from: current.name().to_string(),
                to: desc.name().to_string(),
            });
        }
    }

    let header = obj.header();
    let addr = obj.bits();
    let inline_allowed = !desc.requires_raw_header() && config::inline_metadata_enabled();
    let has_destructor = desc.destructor().is_some();
    let mut access = ShardAccess::new(None);
    let mut old = header.load();

    loop {
        let change = if old.has_inline_metadata() {
            if inline_allowed {
                ClassChange::InPlace
            } else {
                ClassChange::ToRaw
            }
        } else if old.bits() == 0 && inline_allowed {
            ClassChange::FromZero
        } else {
            ClassChange::InPlace
        };

        if change != ClassChange::InPlace && !access.is_locked() {
            access.acquire(obj);
            old = header.load();
            continue;
        }

        let new = match change {
            ClassChange::InPlace if old.has_inline_metadata() => {
                old.with_class(class, has_destructor)
            }
            ClassChange::InPlace | ClassChange::ToRaw => HeaderBits::raw(class),
            ClassChange::FromZero => {
                let entry = access.acquire(obj).entry(addr);
                let mut new = HeaderBits::inline(class, has_destructor);
                if entry.extra > 0 {
                    new = new.with(SIDETABLE_BIT);
                }
                if entry.weakly_referenced {
                    new = new.with(WEAK_BIT);
                }
                if entry.deallocating {
                    new = new.with(DEALLOCATING_BIT);
                }
                new
            }
        };

        match header.compare_exchange(old, new, Ordering::Relaxed) {
            Ok(_) => {
                match change {
                    ClassChange::ToRaw => access.acquire(obj).transcribe_inline(
                        addr,
                        old.extra_count(),
                        old.is_deallocating(),
                        old.is_weakly_referenced(),
                    ),
                    ClassChange::FromZero => access.acquire(obj).adopt_inline(addr),
                    ClassChange::InPlace => {}
                }
                access.unlock();
                log_class_changed(addr, old.class_index(), class.index(), new.has_inline_metadata());
                return Ok(old.class_id());
            }
            Err(actual) => old = actual,
        }
    }
}

/// Hand `obj` to the innermost autorelease pool.
///
/// # Safety
/// The caller transfers one owned reference to the pool.
pub unsafe fn root_autorelease(obj: ObjRef) -> ObjRef {
    if elision::prepare_optimized_return(ReturnDisposition::AtPlus1) {
        return obj;
    }
    pool::add(obj);
    obj
}

/// Tear down an object with no owners left.
///
/// Objects with nothing but an inline count are freed directly. Everything
/// else clears its weak slots, drops associated storage, runs the class
/// destructor, drops its side-table entry and then frees.
///
/// # Safety
/// `obj` must have begun deallocating and must not be used afterwards.
pub unsafe fn root_dealloc(obj: ObjRef) {
    if !obj.is_heap() {
        return;
    }

    if obj.header().load().can_fast_dealloc() {
        free_object(obj, true);
        return;
    }

    object_dispose(obj);
}

unsafe fn object_dispose(obj: ObjRef) {
    let bits = obj.header().load();
    let raw = !bits.has_inline_metadata();

    clear_weak_referrers(obj);

    if raw || bits.has_associated_storage() {
        assoc::remove_associated(obj);
    }

    if raw || bits.has_destructor() {
        let body = object::object_body(obj);
        if let Some(destructor) = object::descriptor_of(obj).and_then(|desc| desc.destructor()) {
            if !body.is_null() {
                destructor(body);
            }
        }
    }

    // Raw headers keep their deallocating flag here until the destructor
    // has run
    if raw || bits.has_sidetable_count() {
        sidetable::lock(obj).remove_entry(obj.bits());
    }

    free_object(obj, false);
}

/// Null every weak slot still pointing at `obj`, under the shard lock
unsafe fn clear_weak_referrers(obj: ObjRef) {
    let mut shard = sidetable::lock(obj);
    let bits = obj.header().load();
    let addr = obj.bits();

    let weakly_referenced = if bits.has_inline_metadata() {
        bits.is_weakly_referenced()
    } else {
        shard.is_weakly_referenced_raw(addr)
    };
    if weakly_referenced {
        shard.weak_table().clear(addr);
    }
}
