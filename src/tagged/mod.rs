//! Tagged values - immediates encoded in the reference bits
//!
//! Layout (64-bit):
//! - Bit 0 = 0: heap pointer (at least 8-byte aligned) or null
//! - Bit 0 = 1: tagged value, never counted
//!   - Bits 1-3: basic slot 0..=6, payload in bits 4-63 (60 bits)
//!   - Bits 1-3 = 7: extended tier, slot index in bits 4-11,
//!     payload in bits 12-63 (52 bits)

mod registry;


pub use registry::{register_tagged_class, tagged_class, tagged_slot_class};

use crate::object::ObjRef;

const TAG_BIT: usize = 0b1;

const BASIC_SLOT_SHIFT: u32 = 1;
const BASIC_SLOT_MASK: usize = 0b111;
const EXTENDED_MARKER: usize = 7;

const EXTENDED_SLOT_SHIFT: u32 = 4;
const EXTENDED_SLOT_MASK: usize = 0xff;

const BASIC_PAYLOAD_SHIFT: u32 = 4;
const EXTENDED_PAYLOAD_SHIFT: u32 = 12;

/// Number of basic slots (slot 7 selects the extended tier)
pub const BASIC_SLOTS: usize = 7;
pub const EXTENDED_SLOTS: usize = 256;

pub const BASIC_PAYLOAD_BITS: u32 = usize::BITS - BASIC_PAYLOAD_SHIFT;
pub const EXTENDED_PAYLOAD_BITS: u32 = usize::BITS - EXTENDED_PAYLOAD_SHIFT;

/// Class slot of a tagged value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagSlot {
    Basic(u8),
    Extended(u8),
}

impl TagSlot {
    #[inline]
    pub fn is_valid(self) -> bool {
        match self {
            TagSlot::Basic(slot) => (slot as usize) < BASIC_SLOTS,
            TagSlot::Extended(_) => true,
        }
    }

    /// Payload width available to values in this slot
    #[inline]
    pub fn payload_bits(self) -> u32 {
        match self {
            TagSlot::Basic(_) => BASIC_PAYLOAD_BITS,
            TagSlot::Extended(_) => EXTENDED_PAYLOAD_BITS,
        }
    }
}

/// Check if the reference is a tagged value (single bit test)
#[inline(always)]
pub fn is_tagged(obj: ObjRef) -> bool {
    obj.bits() & TAG_BIT != 0
}

/// Decode the class slot, `None` for heap references
#[inline]
pub fn slot_of(obj: ObjRef) -> Option<TagSlot> {
    if !is_tagged(obj) {
        return None;
    }

    let bits = obj.bits();
    let basic = (bits >> BASIC_SLOT_SHIFT) & BASIC_SLOT_MASK;
    if basic == EXTENDED_MARKER {
        Some(TagSlot::Extended(
            ((bits >> EXTENDED_SLOT_SHIFT) & EXTENDED_SLOT_MASK) as u8,
        ))
    } else {
        Some(TagSlot::Basic(basic as u8))
    }
}

/// Unsigned payload of a tagged value
#[inline]
pub fn payload_of(obj: ObjRef) -> Option<u64> {
    match slot_of(obj)? {
        TagSlot::Basic(_) => Some((obj.bits() >> BASIC_PAYLOAD_SHIFT) as u64),
        TagSlot::Extended(_) => Some((obj.bits() >> EXTENDED_PAYLOAD_SHIFT) as u64),
    }
}

/// Encode a tagged value; `None` if the slot is invalid or the payload
/// does not fit.
pub fn make_tagged(slot: TagSlot, payload: u64) -> Option<ObjRef> {
    if !slot.is_valid() || payload >> slot.payload_bits() != 0 {
        return None;
    }

    let payload = payload as usize;
    let bits = match slot {
        TagSlot::Basic(index) => {
            (payload << BASIC_PAYLOAD_SHIFT) | ((index as usize) << BASIC_SLOT_SHIFT) | TAG_BIT
        }
        TagSlot::Extended(index) => {
            (payload << EXTENDED_PAYLOAD_SHIFT)
                | ((index as usize) << EXTENDED_SLOT_SHIFT)
                | (EXTENDED_MARKER << BASIC_SLOT_SHIFT)
                | TAG_BIT
        }
    };

    Some(ObjRef::from_bits(bits))
}
