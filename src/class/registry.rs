//! Process-wide class table
//!
//! Append-only: chunks are allocated on demand and entries are published
//! through `OnceCell`, so lookups never take a lock.

use super::{ClassDescriptor, ClassId};
use crate::error::RegistryError;
use crate::logging::log_class_registered;
use once_cell::sync::{Lazy, OnceCell};
use parking_lot::Mutex;

const CHUNK_SIZE: usize = 1024;
const CHUNK_COUNT: usize = 64;

pub const CLASS_CAPACITY: usize = CHUNK_SIZE * CHUNK_COUNT;

type Chunk = Box<[OnceCell<&'static ClassDescriptor>]>;

static TABLE: Lazy<ClassTable> = Lazy::new(ClassTable::new);

struct ClassTable {
    chunks: [OnceCell<Chunk>; CHUNK_COUNT],
    /// Next index to hand out; 0 is reserved for "no class"
    next: Mutex<u32>,
}

impl ClassTable {
    fn new() -> Self {
        Self {
            chunks: std::array::from_fn(|_| OnceCell::new()),
            next: Mutex::new(1),
        }
    }

    fn chunk(&self, slot: usize) -> Option<&Chunk> {
        self.chunks.get(slot / CHUNK_SIZE)?.get()
    }
}

pub(super) fn register(descriptor: ClassDescriptor) -> Result<ClassId, RegistryError> {
    let mut next = TABLE.next.lock();
    let index = *next;
    let slot = index as usize - 1;
    if slot >= CLASS_CAPACITY {
        return Err(RegistryError::ClassTableFull {
            capacity: CLASS_CAPACITY,
        });
    }

    let chunk = TABLE.chunks[slot / CHUNK_SIZE]
        .get_or_init(|| (0..CHUNK_SIZE).map(|_| OnceCell::new()).collect());

    let descriptor: &'static ClassDescriptor = Box::leak(Box::new(descriptor));
    // Indices are handed out under the lock, so the cell is always empty
    let _ = chunk[slot % CHUNK_SIZE].set(descriptor);
    *next += 1;
    drop(next);

    log_class_registered(descriptor.name(), index);
    ClassId::from_index(index).ok_or(RegistryError::UnknownClass { index })
}

/// Descriptor for a registered class
#[inline]
pub(crate) fn lookup(id: ClassId) -> Option<&'static ClassDescriptor> {
    let slot = id.index() as usize - 1;
    TABLE.chunk(slot)?.get(slot % CHUNK_SIZE)?.get().copied()
}

/// Number of registered classes
pub fn class_count() -> usize {
    *TABLE.next.lock() as usize - 1
}
