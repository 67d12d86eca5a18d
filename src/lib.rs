//! Retainer - reference-counted object lifetime engine
//!
//! Tracks how many owners a heap object has and decides when it must be
//! destroyed. Design:
//! 1. Inline counts packed into the object header word (CAS fast path)
//! 2. Sharded side table for overflowed counts and raw-header objects
//! 3. Weak slots registered per object and nulled during teardown
//! 4. Tagged values that bypass counting entirely
//!
//! Ownership cycles are not collected: two objects retaining each other leak.

#[cfg(not(target_pointer_width = "64"))]
compile_error!("retainer packs object headers into 64-bit words and requires a 64-bit target");

pub mod assoc;
pub mod class;
pub mod config;
pub mod elision;
pub mod error;
pub mod ffi;
pub mod logging;
pub mod object;
pub mod pool;
pub mod rc;
pub mod sidetable;
pub mod stats;
pub mod tagged;
pub mod weak;

pub use assoc::{get_associated, set_associated, AssocPolicy};
pub use class::{ClassDescriptor, ClassFlags, ClassId, OverrideTable};
pub use config::RuntimeConfig;
pub use error::{AllocError, ConfigError, FatalFault, RegistryError};
pub use object::{alloc_object, ObjRef};
pub use pool::{autoreleasepool, AutoreleasePool};
pub use rc::{
    autorelease, change_class, release, retain, retain_count, try_retain, Retained,
};
pub use tagged::TagSlot;
pub use weak::{
    weak_attach, weak_copy, weak_detach, weak_move, weak_read, weak_store, Weak, WeakSlot,
};

use tracing::info;

/// Runtime initialization: logging, configuration and the side table.
///
/// Calling this is optional; every subsystem initializes lazily on first
/// use. Calling it early makes configuration errors and log output appear
/// at a predictable point.
pub fn init() {
    logging::init();
    let config = config::current();
    sidetable::init();

    info!(
        inline_metadata = !config.refcount.disable_inline_metadata,
        side_table_shards = sidetable::shard_count(),
        "retainer runtime initialized"
    );
}

/// Runtime cleanup: report counters and flush buffered log output.
pub fn cleanup() {
    let stats = stats::snapshot();
    logging::log_runtime_shutdown(&stats);
    logging::flush();
}

#[no_mangle]
pub extern "C" fn retainer_runtime_init() {
    init();
}

#[no_mangle]
pub extern "C" fn retainer_runtime_cleanup() {
    cleanup();
}
