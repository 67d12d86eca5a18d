//! Class descriptors
//!
//! The engine reads only what it needs from a class: instance layout,
//! destructor, override table and whether instances may keep their count
//! inline. Descriptors are registered once and live for the process.

mod registry;


pub(crate) use registry::lookup;
pub use registry::{class_count, CLASS_CAPACITY};

use crate::error::RegistryError;
use crate::object::ObjRef;
use std::fmt;
use std::num::NonZeroU32;

/// Index of a registered class (never zero)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ClassId(NonZeroU32);

impl ClassId {
    #[inline]
    pub const fn index(self) -> u32 {
        self.0.get()
    }

    /// Id for a registry index; zero means "no class"
    #[inline]
    pub fn from_index(index: u32) -> Option<Self> {
        NonZeroU32::new(index).map(Self)
    }

    /// Descriptor registered under this id
    #[inline]
    pub fn descriptor(self) -> Option<&'static ClassDescriptor> {
        lookup(self)
    }
}

impl fmt::Debug for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClassId({})", self.0)
    }
}

/// Class capability flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClassFlags(u32);

impl ClassFlags {
    pub const NONE: Self = Self(0);
    /// Instances keep every count in the side table
    pub const REQUIRES_RAW_HEADER: Self = Self(1 << 0);
    pub const HAS_DESTRUCTOR: Self = Self(1 << 1);
    /// Lifetime calls go through the override table
    pub const HAS_CUSTOM_RR: Self = Self(1 << 2);

    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }
}

/// Destructor called on the instance body before storage is reclaimed
pub type Destructor = unsafe fn(*mut u8);

/// Per-class replacements for the lifetime operations.
///
/// A `None` slot falls back to the engine's own implementation. Overrides
/// may call back into the `root_*` functions in [`crate::rc`].
#[derive(Clone, Copy, Default)]
pub struct OverrideTable {
    pub retain: Option<unsafe fn(ObjRef) -> ObjRef>,
    pub release: Option<unsafe fn(ObjRef)>,
    pub try_retain: Option<unsafe fn(ObjRef) -> Option<ObjRef>>,
    pub autorelease: Option<unsafe fn(ObjRef) -> ObjRef>,
    pub retain_count: Option<unsafe fn(ObjRef) -> usize>,
    pub dealloc: Option<unsafe fn(ObjRef)>,
}

impl OverrideTable {
    pub fn is_empty(&self) -> bool {
        self.retain.is_none()
            && self.release.is_none()
            && self.try_retain.is_none()
            && self.autorelease.is_none()
            && self.retain_count.is_none()
            && self.dealloc.is_none()
    }
}

impl fmt::Debug for OverrideTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OverrideTable")
            .field("retain", &self.retain.is_some())
            .field("release", &self.release.is_some())
            .field("try_retain", &self.try_retain.is_some())
            .field("autorelease", &self.autorelease.is_some())
            .field("retain_count", &self.retain_count.is_some())
            .field("dealloc", &self.dealloc.is_some())
            .finish()
    }
}

/// Class metadata consulted by the lifetime engine
#[derive(Debug, Clone)]
pub struct ClassDescriptor {
    name: String,
    instance_size: usize,
    instance_align: usize,
    flags: ClassFlags,
    destructor: Option<Destructor>,
    overrides: OverrideTable,
}

impl ClassDescriptor {
    pub const DEFAULT_ALIGN: usize = 8;

    pub fn new(name: impl Into<String>, instance_size: usize) -> Self {
        Self {
            name: name.into(),
            instance_size,
            instance_align: Self::DEFAULT_ALIGN,
            flags: ClassFlags::NONE,
            destructor: None,
            overrides: OverrideTable::default(),
        }
    }

    pub fn with_align(mut self, align: usize) -> Self {
        self.instance_align = align;
        self
    }

    pub fn with_destructor(mut self, destructor: Destructor) -> Self {
        self.destructor = Some(destructor);
        self.flags = self.flags.with(ClassFlags::HAS_DESTRUCTOR);
        self
    }

    /// Route lifetime calls through `overrides`; an empty table is ignored
    pub fn with_overrides(mut self, overrides: OverrideTable) -> Self {
        if !overrides.is_empty() {
            self.overrides = overrides;
            self.flags = self.flags.with(ClassFlags::HAS_CUSTOM_RR);
        }
        self
    }

    /// Instances never keep their count in the header word
    pub fn requiring_raw_header(mut self) -> Self {
        self.flags = self.flags.with(ClassFlags::REQUIRES_RAW_HEADER);
        self
    }

    /// Register the class for the rest of the process
    pub fn register(self) -> Result<ClassId, RegistryError> {
        registry::register(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instance_size(&self) -> usize {
        self.instance_size
    }

    pub fn instance_align(&self) -> usize {
        self.instance_align
    }

    pub fn flags(&self) -> ClassFlags {
        self.flags
    }

    pub fn destructor(&self) -> Option<Destructor> {
        self.destructor
    }

    #[inline]
    pub fn has_custom_rr(&self) -> bool {
        self.flags.contains(ClassFlags::HAS_CUSTOM_RR)
    }

    #[inline]
    pub fn requires_raw_header(&self) -> bool {
        self.flags.contains(ClassFlags::REQUIRES_RAW_HEADER)
    }

    /// Override table, only when the class opted into custom lifetime calls
    #[inline]
    pub fn overrides(&self) -> Option<&OverrideTable> {
        self.has_custom_rr().then_some(&self.overrides)
    }
}
