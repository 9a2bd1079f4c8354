//! Realtime allocation guard.
//!
//! Dynamic allocation on a fixed-priority thread can page-fault or take the
//! allocator lock, both unbounded. Instead of overriding the process-wide
//! allocation entry point, the check is scoped and opt-in: the realtime
//! worker enters a no-allocation region around each update call, and an
//! application that installs [`GuardedAllocator`] as its global allocator
//! gets a contract violation on any allocation inside such a region.

use crate::contract::{Violation, ViolationMode, handle_violation};
use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;
use std::marker::PhantomData;

thread_local! {
    static FORBID_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// True while the calling thread is inside a no-allocation region.
pub fn alloc_forbidden() -> bool {
    FORBID_DEPTH.try_with(|depth| depth.get() > 0).unwrap_or(false)
}

/// RAII marker for a no-allocation region on the current thread. Regions
/// nest; the flag clears when the outermost guard drops.
pub struct NoAllocGuard {
    _not_send: PhantomData<*const ()>,
}

impl NoAllocGuard {
    pub fn enter() -> Self {
        FORBID_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self {
            _not_send: PhantomData,
        }
    }
}

impl Drop for NoAllocGuard {
    fn drop(&mut self) {
        let _ = FORBID_DEPTH.try_with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Allocator wrapper that enforces no-allocation regions.
///
/// ```ignore
/// #[global_allocator]
/// static ALLOC: GuardedAllocator = GuardedAllocator::system();
/// ```
pub struct GuardedAllocator<A = System> {
    inner: A,
}

impl GuardedAllocator<System> {
    pub const fn system() -> Self {
        Self { inner: System }
    }
}

impl<A> GuardedAllocator<A> {
    pub const fn new(inner: A) -> Self {
        Self { inner }
    }

    fn check(&self) {
        if alloc_forbidden() {
            // Clear the flag first so the violation handler itself may
            // allocate without recursing back here.
            let _ = FORBID_DEPTH.try_with(|depth| depth.set(0));
            handle_violation(&Violation::new(
                ViolationMode::Ensure,
                "memory allocation not allowed in realtime thread",
                None,
                file!(),
                line!(),
            ));
        }
    }
}

unsafe impl<A: GlobalAlloc> GlobalAlloc for GuardedAllocator<A> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.check();
        unsafe { self.inner.alloc(layout) }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        self.check();
        unsafe { self.inner.alloc_zeroed(layout) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        self.check();
        unsafe { self.inner.realloc(ptr, layout, new_size) }
    }

    // Releasing memory stays legal: a realtime region may drop values it
    // received, it just must not acquire new ones.
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { self.inner.dealloc(ptr, layout) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{ViolationGuard, panicking_handler};
    use std::panic::{AssertUnwindSafe, catch_unwind};

    #[test]
    fn guard_scopes_nest() {
        assert!(!alloc_forbidden());
        {
            let _outer = NoAllocGuard::enter();
            assert!(alloc_forbidden());
            {
                let _inner = NoAllocGuard::enter();
                assert!(alloc_forbidden());
            }
            assert!(alloc_forbidden());
        }
        assert!(!alloc_forbidden());
    }

    #[test]
    fn allocator_passes_through_outside_regions() {
        let alloc = GuardedAllocator::system();
        let layout = Layout::from_size_align(64, 8).expect("bad layout");
        unsafe {
            let ptr = alloc.alloc(layout);
            assert!(!ptr.is_null());
            alloc.dealloc(ptr, layout);
        }
    }

    #[test]
    fn allocation_inside_region_violates() {
        let _handler = ViolationGuard::install(panicking_handler);
        let alloc = GuardedAllocator::system();
        let layout = Layout::from_size_align(64, 8).expect("bad layout");

        let guard = NoAllocGuard::enter();
        let result = catch_unwind(AssertUnwindSafe(|| unsafe {
            let ptr = alloc.alloc(layout);
            // Unreachable; keeps the allocation observable if it ever is.
            alloc.dealloc(ptr, layout);
        }));
        drop(guard);
        assert!(result.is_err());
        assert!(!alloc_forbidden());
    }
}
