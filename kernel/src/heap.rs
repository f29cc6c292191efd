//! Bare-metal kernel heap
//!
//! Hosted builds use the system allocator; on the board the kernel heap
//! is a fixed region handed to `linked_list_allocator` during early
//! boot, before any `alloc` use.

use linked_list_allocator::LockedHeap;

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Hand the heap region to the allocator.
///
/// # Safety
///
/// `base..base+len` must be unused, mapped, writable memory that stays
/// reserved for the heap for the lifetime of the kernel. Must be called
/// exactly once, before the first allocation.
pub unsafe fn init(base: usize, len: usize) {
    // SAFETY: the caller guarantees the region is unused, mapped,
    // writable and reserved for the heap (see the function contract);
    // the allocator is empty so no prior region can be clobbered.
    unsafe { ALLOCATOR.lock().init(base as *mut u8, len) }
}

/// Heap allocation failure is unrecoverable in the kernel.
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("kernel heap exhausted: {:?}", layout);
}
