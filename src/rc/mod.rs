//! Reference counting entry points
//!
//! Design: each call filters null and tagged references first, then
//! consults the class override flag once, then falls through to the root
//! implementation in [`root`]. Overrides may call the `root_*` functions
//! to reach the engine's own behavior.

mod handle;
mod root;

#[cfg(test)]
mod tests;

pub use handle::Retained;
pub use root::{
    change_class, root_autorelease, root_dealloc, root_is_deallocating, root_release,
    root_release_should_dealloc, root_retain, root_retain_count, root_try_retain,
};
pub(crate) use root::{mark_weakly_referenced, try_retain_locked};

use crate::class::OverrideTable;
use crate::object::ObjRef;

/// Override table of a heap object's class, if it opted in
#[inline(always)]
unsafe fn custom_rr(obj: ObjRef) -> Option<&'static OverrideTable> {
    crate::object::descriptor_of(obj)?.overrides()
}

/// Add one owner and return the same reference.
///
/// # Safety
/// Heap references must be live objects the caller may use.
#[inline]
pub unsafe fn retain(obj: ObjRef) -> ObjRef {
    if !obj.is_heap() {
        return obj;
    }
    if let Some(f) = custom_rr(obj).and_then(|table| table.retain) {
        return f(obj);
    }
    root_retain(obj)
}

/// Drop one owner, tearing the object down when none remain.
///
/// # Safety
/// The caller must own the reference being released.
#[inline]
pub unsafe fn release(obj: ObjRef) {
    if !obj.is_heap() {
        return;
    }
    if let Some(f) = custom_rr(obj).and_then(|table| table.release) {
        return f(obj);
    }
    root_release(obj);
}

/// Add one owner unless the object is already being torn down.
///
/// Tagged values always succeed; null never does.
///
/// # Safety
/// Heap references must point at allocated storage.
#[inline]
pub unsafe fn try_retain(obj: ObjRef) -> Option<ObjRef> {
    if obj.is_null() {
        return None;
    }
    if obj.is_tagged() {
        return Some(obj);
    }
    if let Some(f) = custom_rr(obj).and_then(|table| table.try_retain) {
        return f(obj);
    }
    root_try_retain(obj)
}

/// Transfer one owned reference to the innermost autorelease pool.
///
/// # Safety
/// The caller must own the reference.
#[inline]
pub unsafe fn autorelease(obj: ObjRef) -> ObjRef {
    if !obj.is_heap() {
        return obj;
    }
    if let Some(f) = custom_rr(obj).and_then(|table| table.autorelease) {
        return f(obj);
    }
    root_autorelease(obj)
}

/// Retain, then autorelease: the result stays valid until the pool drains
///
/// # Safety
/// Heap references must be live objects.
pub unsafe fn retain_autorelease(obj: ObjRef) -> ObjRef {
    autorelease(retain(obj))
}

/// Owner count. Tagged values report their bits, null reports zero.
///
/// # Safety
/// Heap references must be live objects.
pub unsafe fn retain_count(obj: ObjRef) -> usize {
    if obj.is_null() {
        return 0;
    }
    if obj.is_tagged() {
        return obj.bits();
    }
    if let Some(f) = custom_rr(obj).and_then(|table| table.retain_count) {
        return f(obj);
    }
    root_retain_count(obj)
}

/// # Safety
/// Heap references must point at allocated storage.
pub unsafe fn is_deallocating(obj: ObjRef) -> bool {
    obj.is_heap() && root_is_deallocating(obj)
}

/// Run the class dealloc override, or the engine's own teardown
pub(crate) unsafe fn dealloc(obj: ObjRef) {
    if let Some(f) = custom_rr(obj).and_then(|table| table.dealloc) {
        return f(obj);
    }
    root_dealloc(obj);
}
