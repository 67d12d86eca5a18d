//! Optimized return-value handoff
//!
//! A callee returning an autoreleased value and a caller that immediately
//! retains it can skip the pool round trip when the callee recognizes the
//! caller's retain. Recognizing the caller means inspecting the return
//! address instruction stream, which has no portable form, so recognition
//! always declines here and both sides fall back to plain autorelease and
//! retain. The thread-local disposition handshake is kept so that the
//! pairing of calls stays balanced under either outcome.

use crate::object::ObjRef;
use crate::rc;
use std::cell::Cell;

/// Owner count a handed-off return value carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnDisposition {
    AtPlus0,
    AtPlus1,
}

thread_local! {
    static DISPOSITION: Cell<ReturnDisposition> = const { Cell::new(ReturnDisposition::AtPlus0) };
}

#[inline]
fn caller_accepts_optimized_return() -> bool {
    false
}

/// Callee side: record `disposition` if the caller will claim the value
#[inline]
pub(crate) fn prepare_optimized_return(disposition: ReturnDisposition) -> bool {
    if caller_accepts_optimized_return() {
        DISPOSITION.with(|d| d.set(disposition));
        return true;
    }
    false
}

/// Caller side: take and reset the recorded disposition
#[inline]
fn accept_optimized_return() -> ReturnDisposition {
    DISPOSITION.with(|d| d.replace(ReturnDisposition::AtPlus0))
}

/// Return an owned value to a caller at +0
///
/// # Safety
/// The caller must own the reference.
pub unsafe fn autorelease_return_value(obj: ObjRef) -> ObjRef {
    if prepare_optimized_return(ReturnDisposition::AtPlus1) {
        return obj;
    }
    rc::autorelease(obj)
}

/// Return a borrowed value to a caller at +0, keeping it alive
///
/// # Safety
/// `obj` must be null, tagged or live.
pub unsafe fn retain_autorelease_return_value(obj: ObjRef) -> ObjRef {
    if prepare_optimized_return(ReturnDisposition::AtPlus0) {
        return obj;
    }
    rc::retain_autorelease(obj)
}

/// Claim a +0 return value as an owned reference
///
/// # Safety
/// `obj` must be the value just returned by one of the functions above.
pub unsafe fn retain_autoreleased_return_value(obj: ObjRef) -> ObjRef {
    if accept_optimized_return() == ReturnDisposition::AtPlus1 {
        return obj;
    }
    rc::retain(obj)
}

/// Use a +0 return value without taking ownership
///
/// # Safety
/// As [`retain_autoreleased_return_value`].
pub unsafe fn unsafe_claim_autoreleased_return_value(obj: ObjRef) -> ObjRef {
    if accept_optimized_return() == ReturnDisposition::AtPlus0 {
        return obj;
    }
    rc::release(obj);
    obj
}
