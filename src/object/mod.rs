//! Object references, allocation and reclamation
//!
//! Design: every heap object is one allocation laid out as
//! `[ObjectHeader][padding][instance body]`. References are plain
//! pointer-sized words; tagged values share the same representation.

mod header;


pub use header::{
    HeaderBits, ObjectHeader, ASSOC_BIT, DEALLOCATING_BIT, DESTRUCTOR_BIT, INLINE_BIT,
    INLINE_CAPACITY, RC_HALF, RC_ONE, SIDETABLE_BIT, WEAK_BIT,
};

use crate::class::{ClassDescriptor, ClassId};
use crate::error::AllocError;
use crate::logging::{log_allocation, log_deallocation, log_unknown_class_free};
use crate::stats::{self, Counter};
use crate::{config, tagged};
use std::alloc::{self, Layout};
use std::fmt;

/// Universal object reference (8 bytes)
///
/// Null, a tagged immediate, or the address of a heap object header.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ObjRef {
    bits: usize,
}

impl ObjRef {
    pub const NULL: Self = Self { bits: 0 };

    #[inline]
    pub const fn from_bits(bits: usize) -> Self {
        Self { bits }
    }

    #[inline]
    pub const fn bits(self) -> usize {
        self.bits
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.bits == 0
    }

    #[inline]
    pub fn is_tagged(self) -> bool {
        tagged::is_tagged(self)
    }

    /// Non-null, untagged: a counted heap object
    #[inline]
    pub fn is_heap(self) -> bool {
        !self.is_null() && !self.is_tagged()
    }

    /// # Safety
    /// `self` must be a live heap object.
    #[inline(always)]
    pub(crate) unsafe fn header<'a>(self) -> &'a ObjectHeader {
        &*(self.bits as *const ObjectHeader)
    }
}

impl fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "ObjRef(null)")
        } else if let Some(slot) = tagged::slot_of(*self) {
            write!(f, "ObjRef({:?}, {:#x})", slot, self.bits)
        } else {
            write!(f, "ObjRef({:#x})", self.bits)
        }
    }
}

/// Allocation layout of an instance and the offset of its body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceLayout {
    pub layout: Layout,
    pub body_offset: usize,
}

impl InstanceLayout {
    pub fn for_class(desc: &ClassDescriptor) -> Result<Self, AllocError> {
        let invalid = || AllocError::InvalidLayout {
            class: desc.name().to_string(),
            size: desc.instance_size(),
            align: desc.instance_align(),
        };

        let body = Layout::from_size_align(desc.instance_size(), desc.instance_align())
            .map_err(|_| invalid())?;
        let (layout, body_offset) = Layout::new::<ObjectHeader>()
            .extend(body)
            .map_err(|_| invalid())?;

        Ok(Self {
            layout: layout.pad_to_align(),
            body_offset,
        })
    }
}

/// Allocate a zeroed instance of `class` with one owner (+1).
///
/// The header keeps its count inline unless the class requires a raw
/// header or the process disabled inline metadata.
pub fn alloc_object(class: ClassId) -> Result<ObjRef, AllocError> {
    let desc = class.descriptor().ok_or(AllocError::UnknownClass {
        index: class.index(),
    })?;
    let instance = InstanceLayout::for_class(desc)?;

    let ptr = unsafe { alloc::alloc_zeroed(instance.layout) };
    if ptr.is_null() {
        return Err(AllocError::OutOfMemory {
            size: instance.layout.size(),
        });
    }

    let bits = if desc.requires_raw_header() || !config::inline_metadata_enabled() {
        HeaderBits::raw(class)
    } else {
        HeaderBits::inline(class, desc.destructor().is_some())
    };
    unsafe { (ptr as *mut ObjectHeader).write(ObjectHeader::new(bits)) };

    stats::bump(Counter::ObjectsAllocated);
    log_allocation(desc.name(), instance.layout.size(), ptr as usize);

    Ok(ObjRef::from_bits(ptr as usize))
}

/// Class of any reference: tagged slot binding or header class index
///
/// # Safety
/// Heap references must point at a live object.
pub unsafe fn class_of(obj: ObjRef) -> Option<ClassId> {
    if obj.is_null() {
        return None;
    }
    if obj.is_tagged() {
        return tagged::tagged_class(obj);
    }
    obj.header().load().class_id()
}

/// Descriptor of a heap object's class
///
/// # Safety
/// `obj` must be a live heap object.
#[inline]
pub(crate) unsafe fn descriptor_of(obj: ObjRef) -> Option<&'static ClassDescriptor> {
    obj.header().load().class_id()?.descriptor()
}

/// Pointer to the instance body, null for tagged, null and unknown-class
/// references
///
/// # Safety
/// Heap references must point at a live object.
pub unsafe fn object_body(obj: ObjRef) -> *mut u8 {
    if !obj.is_heap() {
        return std::ptr::null_mut();
    }
    match descriptor_of(obj).and_then(|desc| InstanceLayout::for_class(desc).ok()) {
        Some(instance) => (obj.bits() as *mut u8).add(instance.body_offset),
        None => std::ptr::null_mut(),
    }
}

/// Current header word of a heap object
///
/// # Safety
/// Heap references must point at a live object.
pub unsafe fn header_snapshot(obj: ObjRef) -> Option<HeaderBits> {
    obj.is_heap().then(|| obj.header().load())
}

/// Return an object's storage to the allocator.
///
/// Objects without a registered class were not allocated here; their
/// storage is left alone.
///
/// # Safety
/// `obj` must be a heap object with no remaining owners, weak slots or
/// side-table state, and must not be used again.
pub(crate) unsafe fn free_object(obj: ObjRef, fast_path: bool) {
    let instance = match descriptor_of(obj).map(InstanceLayout::for_class) {
        Some(Ok(instance)) => instance,
        _ => {
            log_unknown_class_free(obj.bits());
            return;
        }
    };

    alloc::dealloc(obj.bits() as *mut u8, instance.layout);

    stats::bump(Counter::ObjectsFreed);
    stats::bump(if fast_path {
        Counter::FastFrees
    } else {
        Counter::SlowFrees
    });
    log_deallocation(obj.bits(), fast_path);
}
