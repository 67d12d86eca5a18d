//! C FFI - stable ABI for host runtimes and generated code
//!
//! Design: thin wrappers over the lifetime API with:
//! 1. Object references passed as untyped pointers (tagged values included)
//! 2. Null-safe entry points (null is a no-op or a null result)
//! 3. Errors reported as null/zero results and logged

use crate::class::ClassId;
use crate::logging::log_ffi_error;
use crate::object::{self, ObjRef};
use crate::weak::{self, WeakSlot};
use crate::{pool, rc};

#[inline]
fn to_obj(raw: *mut u8) -> ObjRef {
    ObjRef::from_bits(raw as usize)
}

#[inline]
fn to_ptr(obj: ObjRef) -> *mut u8 {
    obj.bits() as *mut u8
}

/// Increment the owner count, returning the same pointer
///
/// # Safety
/// `raw` must be null, tagged or a live object.
#[no_mangle]
pub unsafe extern "C" fn retainer_retain(raw: *mut u8) -> *mut u8 {
    to_ptr(rc::retain(to_obj(raw)))
}

/// Decrement the owner count, destroying the object at zero
///
/// # Safety
/// The caller must own the reference.
#[no_mangle]
pub unsafe extern "C" fn retainer_release(raw: *mut u8) {
    rc::release(to_obj(raw))
}

/// Retain unless deallocating; null on failure
///
/// # Safety
/// `raw` must be null, tagged or point at allocated storage.
#[no_mangle]
pub unsafe extern "C" fn retainer_try_retain(raw: *mut u8) -> *mut u8 {
    rc::try_retain(to_obj(raw)).map_or(std::ptr::null_mut(), to_ptr)
}

/// # Safety
/// The caller must own the reference.
#[no_mangle]
pub unsafe extern "C" fn retainer_autorelease(raw: *mut u8) -> *mut u8 {
    to_ptr(rc::autorelease(to_obj(raw)))
}

/// Current owner count (0 for null)
///
/// # Safety
/// `raw` must be null, tagged or a live object.
#[no_mangle]
pub unsafe extern "C" fn retainer_retain_count(raw: *mut u8) -> usize {
    rc::retain_count(to_obj(raw))
}

/// Allocate an instance of a registered class at +1; null on error
#[no_mangle]
pub extern "C" fn retainer_object_new(class_index: u32) -> *mut u8 {
    let Some(class) = ClassId::from_index(class_index) else {
        log_ffi_error("retainer_object_new", "class index 0");
        return std::ptr::null_mut();
    };

    match object::alloc_object(class) {
        Ok(obj) => to_ptr(obj),
        Err(e) => {
            log_ffi_error("retainer_object_new", &e.to_string());
            std::ptr::null_mut()
        }
    }
}

/// Instance body of an object; null for null and tagged pointers
///
/// # Safety
/// `raw` must be null, tagged or a live object.
#[no_mangle]
pub unsafe extern "C" fn retainer_object_body(raw: *mut u8) -> *mut u8 {
    object::object_body(to_obj(raw))
}

/// Initialize a weak slot; returns what was stored
///
/// # Safety
/// `slot` must be null or a pointer-sized, pointer-aligned cell that stays
/// put until [`retainer_weak_detach`].
#[no_mangle]
pub unsafe extern "C" fn retainer_weak_attach(slot: *const WeakSlot, raw: *mut u8) -> *mut u8 {
    match slot.as_ref() {
        Some(slot) => to_ptr(weak::weak_attach(slot, to_obj(raw))),
        None => std::ptr::null_mut(),
    }
}

/// Retarget an initialized weak slot
///
/// # Safety
/// As [`retainer_weak_attach`], slot already initialized.
#[no_mangle]
pub unsafe extern "C" fn retainer_weak_store(slot: *const WeakSlot, raw: *mut u8) -> *mut u8 {
    match slot.as_ref() {
        Some(slot) => to_ptr(weak::weak_store(slot, to_obj(raw))),
        None => std::ptr::null_mut(),
    }
}

/// Load a weak slot's target at +1, or null
///
/// # Safety
/// `slot` must be null or an initialized weak slot.
#[no_mangle]
pub unsafe extern "C" fn retainer_weak_read(slot: *const WeakSlot) -> *mut u8 {
    slot.as_ref()
        .and_then(|slot| weak::weak_read(slot))
        .map_or(std::ptr::null_mut(), to_ptr)
}

/// # Safety
/// `slot` must be null or an initialized weak slot.
#[no_mangle]
pub unsafe extern "C" fn retainer_weak_detach(slot: *const WeakSlot) {
    if let Some(slot) = slot.as_ref() {
        weak::weak_detach(slot);
    }
}

/// Open an autorelease pool; pass the result to [`retainer_pool_pop`]
#[no_mangle]
pub extern "C" fn retainer_pool_push() -> usize {
    pool::push_raw()
}

#[no_mangle]
pub extern "C" fn retainer_pool_pop(token: usize) {
    pool::pop_raw(token)
}
