//! Object header word - lifetime metadata packed into 64 bits
//!
//! Layout (bit 0 first):
//! - 0       has_inline_metadata
//! - 1       has_associated_storage
//! - 2       has_destructor
//! - 3..=35  class index (33 bits, 0 = unset)
//! - 36..=41 magic (0b111011 with inline metadata)
//! - 42      is_weakly_referenced
//! - 43      is_deallocating
//! - 44      has_sidetable_count
//! - 45..=63 extra_count (19 bits)
//!
//! `extra_count` is the topmost field, so the carry or borrow out of the word
//! when adding or subtracting [`RC_ONE`] is exactly inline overflow or
//! underflow. A raw header holds only the class index with bit 0 clear.

use crate::class::ClassId;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

pub const INLINE_BIT: u64 = 1 << 0;
pub const ASSOC_BIT: u64 = 1 << 1;
pub const DESTRUCTOR_BIT: u64 = 1 << 2;

pub const CLASS_SHIFT: u32 = 3;
pub const CLASS_BITS: u32 = 33;
const CLASS_MASK: u64 = ((1 << CLASS_BITS) - 1) << CLASS_SHIFT;

pub const MAGIC_SHIFT: u32 = 36;
const MAGIC_MASK: u64 = 0b11_1111 << MAGIC_SHIFT;
pub const MAGIC_VALUE: u64 = 0b11_1011;

pub const WEAK_BIT: u64 = 1 << 42;
pub const DEALLOCATING_BIT: u64 = 1 << 43;
pub const SIDETABLE_BIT: u64 = 1 << 44;

pub const EXTRA_SHIFT: u32 = 45;
pub const EXTRA_BITS: u32 = 19;
const EXTRA_MASK: u64 = ((1 << EXTRA_BITS) - 1) << EXTRA_SHIFT;

/// One owner, in header units
pub const RC_ONE: u64 = 1 << EXTRA_SHIFT;
/// Largest extra count the header can hold
pub const INLINE_CAPACITY: usize = (1 << EXTRA_BITS) - 1;
/// Count mass moved on overflow and borrowed on underflow
pub const RC_HALF: usize = 1 << (EXTRA_BITS - 1);

const _: () = assert!(EXTRA_SHIFT + EXTRA_BITS == u64::BITS);
const _: () = assert!(CLASS_SHIFT + CLASS_BITS == MAGIC_SHIFT);

/// Snapshot of a header word
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct HeaderBits(u64);

impl HeaderBits {
    /// Inline header for a fresh object: one owner, nothing else set
    #[inline]
    pub const fn inline(class: ClassId, has_destructor: bool) -> Self {
        let mut bits = INLINE_BIT
            | ((class.index() as u64) << CLASS_SHIFT)
            | (MAGIC_VALUE << MAGIC_SHIFT);
        if has_destructor {
            bits |= DESTRUCTOR_BIT;
        }
        Self(bits)
    }

    /// Header for objects whose counts live in the side table
    #[inline]
    pub const fn raw(class: ClassId) -> Self {
        Self((class.index() as u64) << CLASS_SHIFT)
    }

    #[inline]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    #[inline]
    pub const fn bits(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn has_inline_metadata(self) -> bool {
        self.0 & INLINE_BIT != 0
    }

    #[inline]
    pub const fn has_associated_storage(self) -> bool {
        self.0 & ASSOC_BIT != 0
    }

    #[inline]
    pub const fn has_destructor(self) -> bool {
        self.0 & DESTRUCTOR_BIT != 0
    }

    #[inline]
    pub const fn class_index(self) -> u64 {
        (self.0 & CLASS_MASK) >> CLASS_SHIFT
    }

    #[inline]
    pub fn class_id(self) -> Option<ClassId> {
        u32::try_from(self.class_index()).ok().and_then(ClassId::from_index)
    }

    #[inline]
    pub const fn magic(self) -> u64 {
        (self.0 & MAGIC_MASK) >> MAGIC_SHIFT
    }

    /// Inline metadata with an intact magic field
    #[inline]
    pub const fn is_valid_inline(self) -> bool {
        self.has_inline_metadata() && self.magic() == MAGIC_VALUE
    }

    #[inline]
    pub const fn is_weakly_referenced(self) -> bool {
        self.0 & WEAK_BIT != 0
    }

    #[inline]
    pub const fn is_deallocating(self) -> bool {
        self.0 & DEALLOCATING_BIT != 0
    }

    #[inline]
    pub const fn has_sidetable_count(self) -> bool {
        self.0 & SIDETABLE_BIT != 0
    }

    #[inline]
    pub const fn extra_count(self) -> usize {
        (self.0 >> EXTRA_SHIFT) as usize
    }

    /// Nothing beyond the count needs teardown work
    #[inline]
    pub const fn can_fast_dealloc(self) -> bool {
        self.has_inline_metadata()
            && self.0 & (WEAK_BIT | ASSOC_BIT | DESTRUCTOR_BIT | SIDETABLE_BIT) == 0
    }

    /// Add one owner; the flag reports carry out of `extra_count`
    #[inline]
    pub const fn increment(self) -> (Self, bool) {
        let (bits, carry) = self.0.overflowing_add(RC_ONE);
        (Self(bits), carry)
    }

    /// Remove one owner; the flag reports borrow out of `extra_count`
    #[inline]
    pub const fn decrement(self) -> (Self, bool) {
        let (bits, borrow) = self.0.overflowing_sub(RC_ONE);
        (Self(bits), borrow)
    }

    /// Replace `extra_count`; `count` is truncated to the field width
    #[inline]
    pub const fn with_extra_count(self, count: usize) -> Self {
        Self((self.0 & !EXTRA_MASK) | (((count as u64) << EXTRA_SHIFT) & EXTRA_MASK))
    }

    /// Replace the class index and destructor flag, keeping counts and
    /// the other flags
    #[inline]
    pub const fn with_class(self, class: ClassId, has_destructor: bool) -> Self {
        let mut bits =
            (self.0 & !(CLASS_MASK | DESTRUCTOR_BIT)) | ((class.index() as u64) << CLASS_SHIFT);
        if has_destructor {
            bits |= DESTRUCTOR_BIT;
        }
        Self(bits)
    }

    #[inline]
    pub const fn with(self, flag: u64) -> Self {
        Self(self.0 | flag)
    }

    #[inline]
    pub const fn contains(self, flag: u64) -> bool {
        self.0 & flag == flag
    }
}

impl fmt::Debug for HeaderBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.has_inline_metadata() {
            return f
                .debug_struct("HeaderBits::Raw")
                .field("class", &self.class_index())
                .finish();
        }
        f.debug_struct("HeaderBits")
            .field("class", &self.class_index())
            .field("extra_count", &self.extra_count())
            .field("assoc", &self.has_associated_storage())
            .field("destructor", &self.has_destructor())
            .field("weak", &self.is_weakly_referenced())
            .field("deallocating", &self.is_deallocating())
            .field("sidetable", &self.has_sidetable_count())
            .finish()
    }
}

/// Object header (8 bytes) - prefixed before every heap object body
///
/// Mutated only through compare-and-swap so that concurrent retain,
/// release and flag updates never lose each other's effects.
#[repr(C, align(8))]
pub struct ObjectHeader {
    word: AtomicU64,
}

impl ObjectHeader {
    #[inline]
    pub const fn new(bits: HeaderBits) -> Self {
        Self {
            word: AtomicU64::new(bits.0),
        }
    }

    /// Relaxed load; callers validate through a later CAS
    #[inline(always)]
    pub fn load(&self) -> HeaderBits {
        HeaderBits(self.word.load(Ordering::Relaxed))
    }

    /// Weak compare-and-swap, may fail spuriously
    #[inline(always)]
    pub fn compare_exchange(
        &self,
        current: HeaderBits,
        new: HeaderBits,
        success: Ordering,
    ) -> Result<HeaderBits, HeaderBits> {
        self.word
            .compare_exchange_weak(current.0, new.0, success, Ordering::Relaxed)
            .map(HeaderBits)
            .map_err(HeaderBits)
    }

    /// Monotonically set `flag` on an inline header.
    ///
    /// Returns `false` for raw headers, which carry no flags.
    pub fn set_flag(&self, flag: u64) -> bool {
        let mut old = self.load();
        loop {
            if !old.has_inline_metadata() {
                return false;
            }
            if old.contains(flag) {
                return true;
            }
            match self.compare_exchange(old, old.with(flag), Ordering::Relaxed) {
                Ok(_) => return true,
                Err(actual) => old = actual,
            }
        }
    }
}

impl fmt::Debug for ObjectHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.load().fmt(f)
    }
}
