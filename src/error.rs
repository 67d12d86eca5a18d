//! Error taxonomy
//!
//! Recoverable failures (configuration, registries, allocation) are plain
//! enums returned through `Result`. Lifetime protocol violations are fatal:
//! they are logged and then abort the caller via [`fatal`].

use crate::tagged::TagSlot;
use std::fmt;
use std::path::PathBuf;
use tracing::error;

/// Configuration could not be read, parsed or validated
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Io { path: PathBuf, message: String },
    Parse { message: String },
    Invalid { field: &'static str, reason: String },
    AlreadyInstalled,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, message } => {
                write!(f, "Failed to read config {}: {}", path.display(), message)
            }
            Self::Parse { message } => write!(f, "Failed to parse config: {}", message),
            Self::Invalid { field, reason } => {
                write!(f, "Invalid config value for '{}': {}", field, reason)
            }
            Self::AlreadyInstalled => {
                write!(f, "Runtime configuration is already installed for this process")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Class or tagged-slot registration failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    ClassTableFull { capacity: usize },
    UnknownClass { index: u32 },
    TaggedSlotOutOfRange { slot: TagSlot },
    TaggedSlotTaken { slot: TagSlot, existing: u32 },
    /// Instances of the two classes are not laid out alike
    IncompatibleLayout { from: String, to: String },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClassTableFull { capacity } => {
                write!(f, "Class table is full ({} classes registered)", capacity)
            }
            Self::UnknownClass { index } => write!(f, "No class registered at index {}", index),
            Self::TaggedSlotOutOfRange { slot } => {
                write!(f, "Tagged slot {:?} is outside the registry", slot)
            }
            Self::TaggedSlotTaken { slot, existing } => {
                write!(f, "Tagged slot {:?} is already bound to class #{}", slot, existing)
            }
            Self::IncompatibleLayout { from, to } => write!(
                f,
                "Cannot change class from {} to {}: instance layouts differ",
                from, to
            ),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Object storage could not be created
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    UnknownClass { index: u32 },
    InvalidLayout { class: String, size: usize, align: usize },
    OutOfMemory { size: usize },
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownClass { index } => {
                write!(f, "Cannot allocate instance of unregistered class #{}", index)
            }
            Self::InvalidLayout { class, size, align } => write!(
                f,
                "Class {} has an invalid instance layout (size {}, align {})",
                class, size, align
            ),
            Self::OutOfMemory { size } => write!(f, "Allocator returned null for {} bytes", size),
        }
    }
}

impl std::error::Error for AllocError {}

/// Unrecoverable lifetime protocol violation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FatalFault {
    /// Release observed an object that already began deallocating with no
    /// owners left: it was released more times than it was retained.
    OverRelease { address: usize, class: Option<String> },
}

impl fmt::Display for FatalFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OverRelease { address, class } => write!(
                f,
                "object {:#x} of class {} overreleased while already deallocating; \
                 break on retainer::error::fatal to debug",
                address,
                class.as_deref().unwrap_or("<unknown>")
            ),
        }
    }
}

/// Report a protocol violation and terminate the caller.
///
/// Release builds are compiled with `panic = "abort"`, so this ends the
/// process; continuing would risk touching freed memory.
#[cold]
#[inline(never)]
pub fn fatal(fault: FatalFault) -> ! {
    error!(
        target: "retainer::fatal",
        event = "protocol_violation",
        fault = %fault,
        "lifetime protocol violation"
    );
    panic!("{}", fault);
}
