//! Tagged slot registry
//!
//! Slots are bound once, normally at process start, and read without locks.

use super::{slot_of, TagSlot, BASIC_SLOTS, EXTENDED_SLOTS};
use crate::class::ClassId;
use crate::error::RegistryError;
use crate::object::ObjRef;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::debug;

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY: AtomicU32 = AtomicU32::new(0);

static BASIC: [AtomicU32; BASIC_SLOTS] = [EMPTY; BASIC_SLOTS];
static EXTENDED: [AtomicU32; EXTENDED_SLOTS] = [EMPTY; EXTENDED_SLOTS];

fn cell(slot: TagSlot) -> Option<&'static AtomicU32> {
    match slot {
        TagSlot::Basic(index) => BASIC.get(index as usize),
        TagSlot::Extended(index) => EXTENDED.get(index as usize),
    }
}

/// Bind a tagged slot to a class.
///
/// Rebinding a slot to the class it already holds succeeds.
pub fn register_tagged_class(slot: TagSlot, class: ClassId) -> Result<(), RegistryError> {
    let cell = cell(slot).ok_or(RegistryError::TaggedSlotOutOfRange { slot })?;

    match cell.compare_exchange(0, class.index(), Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => {
            debug!(target: "retainer::tagged", ?slot, class = class.index(), "tagged slot bound");
            Ok(())
        }
        Err(existing) if existing == class.index() => Ok(()),
        Err(existing) => Err(RegistryError::TaggedSlotTaken { slot, existing }),
    }
}

/// Class bound to a tagged slot
pub fn tagged_slot_class(slot: TagSlot) -> Option<ClassId> {
    let index = cell(slot)?.load(Ordering::Acquire);
    ClassId::from_index(index)
}

/// Class of a tagged value, `None` for heap references and unbound slots
pub fn tagged_class(obj: ObjRef) -> Option<ClassId> {
    tagged_slot_class(slot_of(obj)?)
}
