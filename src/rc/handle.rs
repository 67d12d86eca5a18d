//! Owning handle over an object reference
//!
//! Clone retains, drop releases. The handle holds exactly one owner.

use super::{autorelease, release, retain, retain_count};
use crate::class::ClassId;
use crate::error::AllocError;
use crate::object::{self, ObjRef};
use crate::weak::Weak;
use std::fmt;

/// Owned (+1) object reference
#[repr(transparent)]
pub struct Retained {
    obj: ObjRef,
}

impl Retained {
    /// Allocate a fresh instance of `class`
    pub fn alloc(class: ClassId) -> Result<Self, AllocError> {
        object::alloc_object(class).map(|obj| Self { obj })
    }

    /// Take over an owned reference without retaining
    ///
    /// # Safety
    /// The caller must own one reference to `obj` and give it up.
    #[inline]
    pub unsafe fn from_raw(obj: ObjRef) -> Self {
        Self { obj }
    }

    /// Retain `obj` and wrap the new owner
    ///
    /// # Safety
    /// `obj` must be null, tagged or a live heap object.
    #[inline]
    pub unsafe fn retain_raw(obj: ObjRef) -> Self {
        Self { obj: retain(obj) }
    }

    #[inline]
    pub fn as_obj(&self) -> ObjRef {
        self.obj
    }

    /// Give up the handle without releasing
    #[inline]
    pub fn into_raw(self) -> ObjRef {
        let obj = self.obj;
        std::mem::forget(self);
        obj
    }

    pub fn retain_count(&self) -> usize {
        unsafe { retain_count(self.obj) }
    }

    /// Instance body pointer, null for tagged values
    pub fn body(&self) -> *mut u8 {
        unsafe { object::object_body(self.obj) }
    }

    /// Hand this owner to the innermost autorelease pool
    pub fn autorelease(self) -> ObjRef {
        let obj = self.into_raw();
        unsafe { autorelease(obj) }
    }

    /// Weak reference to the same object
    pub fn downgrade(&self) -> Weak {
        Weak::to(self)
    }
}

impl Clone for Retained {
    #[inline]
    fn clone(&self) -> Self {
        unsafe { Self::retain_raw(self.obj) }
    }
}

impl Drop for Retained {
    #[inline]
    fn drop(&mut self) {
        unsafe { release(self.obj) }
    }
}

impl PartialEq for Retained {
    fn eq(&self, other: &Self) -> bool {
        self.obj == other.obj
    }
}

impl Eq for Retained {}

impl fmt::Debug for Retained {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Retained").field(&self.obj).finish()
    }
}
