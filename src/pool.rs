//! Autorelease pools - deferred release scoped to a thread
//!
//! Each thread keeps one stack of pending objects plus the stack positions
//! where its pools begin. Popping a pool releases everything pushed since
//! it began, newest first.

use crate::config;
use crate::logging::log_pool_leak;
use crate::object::ObjRef;
use crate::rc;
use crate::stats::{self, Counter};
use std::cell::RefCell;
use std::marker::PhantomData;

thread_local! {
    static POOLS: RefCell<PoolStack> = RefCell::new(PoolStack::default());
}

#[derive(Default)]
struct PoolStack {
    objects: Vec<ObjRef>,
    /// Start index into `objects` for each open pool
    boundaries: Vec<usize>,
}

/// Guard for one autorelease pool; dropping it drains the pool
#[must_use = "the pool drains as soon as the guard is dropped"]
pub struct AutoreleasePool {
    depth: usize,
    // Pools belong to the thread that pushed them
    _not_send: PhantomData<*const ()>,
}

impl AutoreleasePool {
    pub fn push() -> Self {
        Self {
            depth: push_raw(),
            _not_send: PhantomData,
        }
    }

    /// Nesting level of this pool, starting at 1
    pub fn depth(&self) -> usize {
        self.depth
    }
}

impl Drop for AutoreleasePool {
    fn drop(&mut self) {
        pop_raw(self.depth);
    }
}

/// Run `f` inside a fresh pool
pub fn autoreleasepool<R>(f: impl FnOnce() -> R) -> R {
    let _pool = AutoreleasePool::push();
    f()
}

/// Open a pool and return its depth, for callers that cannot hold a guard
pub fn push_raw() -> usize {
    POOLS.with(|pools| {
        let mut pools = pools.borrow_mut();
        let start = pools.objects.len();
        pools.boundaries.push(start);
        pools.boundaries.len()
    })
}

/// Drain and close the pool at `depth` and every pool nested inside it
pub fn pop_raw(depth: usize) {
    if depth == 0 {
        return;
    }

    // Releasing can autorelease more objects into this pool, so drain
    // until nothing new shows up
    loop {
        let drained = POOLS
            .try_with(|pools| {
                let mut pools = pools.borrow_mut();
                match pools.boundaries.get(depth - 1).copied() {
                    Some(start) => pools.objects.split_off(start),
                    None => Vec::new(),
                }
            })
            .unwrap_or_default();

        if drained.is_empty() {
            break;
        }
        for obj in drained.into_iter().rev() {
            unsafe { rc::release(obj) };
        }
    }

    let _ = POOLS.try_with(|pools| pools.borrow_mut().boundaries.truncate(depth - 1));
}

/// Objects waiting in this thread's pools
pub fn pending() -> usize {
    POOLS.try_with(|pools| pools.borrow().objects.len()).unwrap_or(0)
}

/// Open pools on this thread
pub fn depth() -> usize {
    POOLS.try_with(|pools| pools.borrow().boundaries.len()).unwrap_or(0)
}

/// Queue one owned reference on the innermost pool. With no pool in
/// place the reference leaks.
pub(crate) fn add(obj: ObjRef) -> bool {
    let queued = POOLS
        .try_with(|pools| {
            let mut pools = pools.borrow_mut();
            if pools.boundaries.is_empty() {
                return false;
            }
            pools.objects.push(obj);
            true
        })
        .unwrap_or(false);

    if !queued {
        stats::bump(Counter::PoolLeaks);
        if config::current().refcount.warn_on_pool_leak {
            log_pool_leak(obj.bits());
        }
    }
    queued
}
