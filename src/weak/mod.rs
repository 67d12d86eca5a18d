//! Weak references - non-owning slots nulled at deallocation
//!
//! A slot is registered in the weak table of its target's shard. Teardown
//! nulls every registered slot under that shard's lock before the target's
//! storage is reclaimed, and reads re-check the slot under the same lock,
//! so a read never observes a half-destroyed object.


use crate::object::ObjRef;
use crate::rc::{self, Retained};
use crate::sidetable;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Atomic pointer-sized cell holding a weak target.
///
/// Registered slots must stay at a fixed address until detached.
#[repr(transparent)]
#[derive(Default)]
pub struct WeakSlot {
    cell: AtomicUsize,
}

impl WeakSlot {
    pub const fn new() -> Self {
        Self {
            cell: AtomicUsize::new(0),
        }
    }

    pub fn is_null(&self) -> bool {
        self.load_bits() == 0
    }

    /// Current target without retaining it; may be stale immediately
    pub fn peek(&self) -> ObjRef {
        ObjRef::from_bits(self.load_bits())
    }

    #[inline]
    pub(crate) fn load_bits(&self) -> usize {
        self.cell.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn store_bits(&self, bits: usize) {
        self.cell.store(bits, Ordering::Release)
    }

    #[inline]
    fn addr(&self) -> usize {
        self as *const Self as usize
    }
}

impl fmt::Debug for WeakSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WeakSlot").field(&self.peek()).finish()
    }
}

/// Point `slot` at `new`, unregistering its previous target when
/// `have_old`. Returns what was stored: null if `new` is deallocating.
unsafe fn store_weak(slot: &WeakSlot, new: ObjRef, have_old: bool) -> ObjRef {
    loop {
        let old = if have_old { slot.peek() } else { ObjRef::NULL };
        let mut shards = sidetable::lock_many(&[old, new]);

        // Another writer got in before the locks were taken
        if have_old && slot.load_bits() != old.bits() {
            continue;
        }

        if old.is_heap() {
            if let Some(shard) = shards.get_mut(old) {
                shard.weak_table().unregister(old.bits(), slot.addr());
            }
        }

        let mut stored = ObjRef::NULL;
        if new.is_tagged() {
            stored = new;
        } else if new.is_heap() {
            if let Some(shard) = shards.get_mut(new) {
                if rc::mark_weakly_referenced(new, shard) {
                    shard.weak_table().register(new.bits(), slot.addr());
                    stored = new;
                }
            }
        }

        slot.store_bits(stored.bits());
        return stored;
    }
}

/// Initialize a fresh slot to point at `obj`.
///
/// Returns `obj`, or null when `obj` is already deallocating.
///
/// # Safety
/// `slot` must not be registered yet and must stay at its address until
/// [`weak_detach`]. `obj` must be null, tagged or a heap object whose
/// storage is still allocated.
pub unsafe fn weak_attach(slot: &WeakSlot, obj: ObjRef) -> ObjRef {
    if obj.is_null() {
        slot.store_bits(0);
        return ObjRef::NULL;
    }
    store_weak(slot, obj, false)
}

/// Replace the target of an initialized slot.
///
/// # Safety
/// As [`weak_attach`], except `slot` must already be initialized.
pub unsafe fn weak_store(slot: &WeakSlot, obj: ObjRef) -> ObjRef {
    store_weak(slot, obj, true)
}

/// Load the target retained (+1), or `None` if it is gone.
///
/// # Safety
/// `slot` must be initialized.
pub unsafe fn weak_read(slot: &WeakSlot) -> Option<ObjRef> {
    loop {
        let obj = slot.peek();
        if obj.is_null() {
            return None;
        }
        if obj.is_tagged() {
            return Some(obj);
        }

        let mut shard = sidetable::lock(obj);
        // Teardown clears the slot under this lock before freeing
        if slot.load_bits() != obj.bits() {
            continue;
        }
        return rc::try_retain_locked(obj, &mut shard);
    }
}

/// Unregister the slot and null it
///
/// # Safety
/// `slot` must be initialized.
pub unsafe fn weak_detach(slot: &WeakSlot) {
    store_weak(slot, ObjRef::NULL, true);
}

/// Initialize `dst` to the current target of `src`
///
/// # Safety
/// `dst` as in [`weak_attach`], `src` initialized.
pub unsafe fn weak_copy(dst: &WeakSlot, src: &WeakSlot) {
    match weak_read(src) {
        Some(obj) => {
            weak_attach(dst, obj);
            rc::release(obj);
        }
        None => {
            weak_attach(dst, ObjRef::NULL);
        }
    }
}

/// Initialize `dst` from `src`, then detach `src`
///
/// # Safety
/// As [`weak_copy`].
pub unsafe fn weak_move(dst: &WeakSlot, src: &WeakSlot) {
    weak_copy(dst, src);
    weak_detach(src);
}

/// Owned weak reference with a heap-pinned slot
pub struct Weak {
    slot: Box<WeakSlot>,
}

impl Weak {
    /// Weak reference to nothing
    pub fn new() -> Self {
        Self {
            slot: Box::new(WeakSlot::new()),
        }
    }

    pub fn to(target: &Retained) -> Self {
        let weak = Self::new();
        unsafe { weak_attach(&weak.slot, target.as_obj()) };
        weak
    }

    /// Retarget, or clear with `None`
    pub fn set(&mut self, target: Option<&Retained>) {
        let obj = target.map_or(ObjRef::NULL, Retained::as_obj);
        unsafe { weak_store(&self.slot, obj) };
    }

    /// Strong reference to the target, if it is still alive
    pub fn upgrade(&self) -> Option<Retained> {
        unsafe { weak_read(&self.slot).map(|obj| Retained::from_raw(obj)) }
    }

    pub fn is_null(&self) -> bool {
        self.slot.is_null()
    }
}

impl Default for Weak {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Weak {
    fn clone(&self) -> Self {
        let slot = Box::new(WeakSlot::new());
        unsafe { weak_copy(&slot, &self.slot) };
        Self { slot }
    }
}

impl Drop for Weak {
    fn drop(&mut self) {
        unsafe { weak_detach(&self.slot) }
    }
}

impl fmt::Debug for Weak {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Weak").field(&*self.slot).finish()
    }
}
