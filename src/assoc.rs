//! Associated storage - values attached to an object by key
//!
//! Attaching sets the object's associated-storage flag so teardown knows
//! to look here. Retained values are released when replaced, removed or
//! when their owner is torn down. Releases always happen after the map
//! guard is dropped, since a release can tear down another owner.

use crate::object::{ObjRef, ASSOC_BIT};
use crate::rc::{self, Retained};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::collections::HashMap;

static ASSOCIATIONS: Lazy<DashMap<usize, HashMap<usize, Association>>> = Lazy::new(DashMap::new);

/// Ownership of an associated value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssocPolicy {
    /// Store the reference without owning it
    Assign,
    /// Own one reference for as long as the association exists
    Retain,
}

#[derive(Debug, Clone, Copy)]
struct Association {
    value: ObjRef,
    policy: AssocPolicy,
}

impl Association {
    unsafe fn dispose(self) {
        if self.policy == AssocPolicy::Retain {
            rc::release(self.value);
        }
    }
}

/// Attach `value` to `obj` under `key`; a null value removes the key.
///
/// Tagged and null owners are ignored, as are owners already being torn
/// down: their storage has been cleared and must stay clear.
///
/// # Safety
/// `obj` must be a live heap object; `value` must be null, tagged or live.
pub unsafe fn set_associated(obj: ObjRef, key: usize, value: ObjRef, policy: AssocPolicy) {
    if !obj.is_heap() || rc::is_deallocating(obj) {
        return;
    }

    let previous = if value.is_null() {
        let removed = ASSOCIATIONS
            .get_mut(&obj.bits())
            .and_then(|mut map| map.remove(&key));
        ASSOCIATIONS.remove_if(&obj.bits(), |_, map| map.is_empty());
        removed
    } else {
        let value = match policy {
            AssocPolicy::Retain => rc::retain(value),
            AssocPolicy::Assign => value,
        };
        let previous = ASSOCIATIONS
            .entry(obj.bits())
            .or_default()
            .insert(key, Association { value, policy });
        obj.header().set_flag(ASSOC_BIT);
        previous
    };

    if let Some(old) = previous {
        old.dispose();
    }
}

/// Value attached under `key`, retained for the caller
///
/// # Safety
/// `obj` must be a live heap object; an `Assign` value must still be live.
pub unsafe fn get_associated(obj: ObjRef, key: usize) -> Option<Retained> {
    if !obj.is_heap() {
        return None;
    }
    let value = ASSOCIATIONS.get(&obj.bits())?.get(&key)?.value;
    // Retain outside the map guard; overrides may touch associations
    Some(Retained::retain_raw(value))
}

/// Drop every association of `obj`, releasing retained values
///
/// # Safety
/// `obj` must not be used by other threads while its storage is removed.
pub unsafe fn remove_associated(obj: ObjRef) {
    let Some((_, map)) = ASSOCIATIONS.remove(&obj.bits()) else {
        return;
    };
    for (_, association) in map {
        association.dispose();
    }
}

pub fn has_associations(obj: ObjRef) -> bool {
    ASSOCIATIONS.contains_key(&obj.bits())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::ClassDescriptor;
    use crate::object::header_snapshot;
    use crate::rc::Retained;

    fn class() -> crate::ClassId {
        ClassDescriptor::new("AssocHolder", 16).register().unwrap()
    }

    #[test]
    fn test_set_and_get() {
        let owner = Retained::alloc(class()).unwrap();
        let value = Retained::alloc(class()).unwrap();

        unsafe {
            set_associated(owner.as_obj(), 1, value.as_obj(), AssocPolicy::Retain);
            assert_eq!(value.retain_count(), 2);
            assert!(header_snapshot(owner.as_obj()).unwrap().has_associated_storage());

            let fetched = get_associated(owner.as_obj(), 1).unwrap();
            assert_eq!(fetched, value);
            assert_eq!(value.retain_count(), 3);
            drop(fetched);

            assert!(get_associated(owner.as_obj(), 2).is_none());
        }
        assert!(has_associations(owner.as_obj()));
    }

    #[test]
    fn test_owner_teardown_releases_retained_values() {
        let owner = Retained::alloc(class()).unwrap();
        let value = Retained::alloc(class()).unwrap();

        unsafe {
            set_associated(owner.as_obj(), 7, value.as_obj(), AssocPolicy::Retain);
        }
        assert_eq!(value.retain_count(), 2);

        let owner_bits = owner.as_obj();
        drop(owner);

        assert_eq!(value.retain_count(), 1);
        assert!(!has_associations(owner_bits));
    }

    #[test]
    fn test_assign_does_not_own() {
        let owner = Retained::alloc(class()).unwrap();
        let value = Retained::alloc(class()).unwrap();

        unsafe {
            set_associated(owner.as_obj(), 1, value.as_obj(), AssocPolicy::Assign);
        }
        assert_eq!(value.retain_count(), 1);
        drop(owner);
        assert_eq!(value.retain_count(), 1);
    }

    #[test]
    fn test_replace_and_clear() {
        let owner = Retained::alloc(class()).unwrap();
        let first = Retained::alloc(class()).unwrap();
        let second = Retained::alloc(class()).unwrap();

        unsafe {
            set_associated(owner.as_obj(), 3, first.as_obj(), AssocPolicy::Retain);
            set_associated(owner.as_obj(), 3, second.as_obj(), AssocPolicy::Retain);
            assert_eq!(first.retain_count(), 1);
            assert_eq!(second.retain_count(), 2);

            set_associated(owner.as_obj(), 3, ObjRef::NULL, AssocPolicy::Retain);
            assert_eq!(second.retain_count(), 1);
        }
        assert!(!has_associations(owner.as_obj()));
    }

    #[test]
    fn test_tagged_owner_is_ignored() {
        let tagged = crate::tagged::make_tagged(crate::TagSlot::Basic(1), 9).unwrap();
        let value = Retained::alloc(class()).unwrap();
        unsafe {
            set_associated(tagged, 1, value.as_obj(), AssocPolicy::Retain);
            assert!(get_associated(tagged, 1).is_none());
        }
        assert_eq!(value.retain_count(), 1);
    }

    /// Destructor that tries to attach the value stored in its body to the
    /// dying owner, whose address is stored alongside
    unsafe fn attach_during_teardown(body: *mut u8) {
        let slots = body as *const [usize; 2];
        let [owner, value] = *slots;
        set_associated(
            ObjRef::from_bits(owner),
            99,
            ObjRef::from_bits(value),
            AssocPolicy::Retain,
        );
    }

    fn attach_on_teardown(name: &str, raw: bool) {
        let desc = ClassDescriptor::new(name, 16).with_destructor(attach_during_teardown);
        let desc = if raw { desc.requiring_raw_header() } else { desc };
        let owner = Retained::alloc(desc.register().unwrap()).unwrap();
        let value = Retained::alloc(class()).unwrap();
        unsafe {
            *(owner.body() as *mut [usize; 2]) = [owner.as_obj().bits(), value.as_obj().bits()];
        }

        let owner_bits = owner.as_obj();
        drop(owner);

        assert!(!has_associations(owner_bits));
        assert_eq!(value.retain_count(), 1);
    }

    #[test]
    fn test_dying_owner_rejects_new_associations() {
        attach_on_teardown("AssocDyingInline", false);
    }

    #[test]
    fn test_dying_raw_owner_rejects_new_associations() {
        attach_on_teardown("AssocDyingRaw", true);
    }

    static TOUCH_OWNER: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);

    /// Retain override that writes to the owner's associations
    unsafe fn retain_touching_owner(obj: ObjRef) -> ObjRef {
        let owner = TOUCH_OWNER.load(std::sync::atomic::Ordering::SeqCst);
        set_associated(ObjRef::from_bits(owner), 2, ObjRef::NULL, AssocPolicy::Assign);
        crate::rc::root_retain(obj)
    }

    #[test]
    fn test_get_retains_outside_map_guard() {
        let touching = ClassDescriptor::new("AssocTouching", 16)
            .with_overrides(crate::OverrideTable {
                retain: Some(retain_touching_owner),
                ..Default::default()
            })
            .register()
            .unwrap();
        let owner = Retained::alloc(class()).unwrap();
        let value = Retained::alloc(touching).unwrap();
        TOUCH_OWNER.store(owner.as_obj().bits(), std::sync::atomic::Ordering::SeqCst);

        unsafe {
            set_associated(owner.as_obj(), 1, value.as_obj(), AssocPolicy::Assign);
            let fetched = get_associated(owner.as_obj(), 1).unwrap();
            assert_eq!(fetched, value);
        }
        assert_eq!(value.retain_count(), 1);
    }
}
