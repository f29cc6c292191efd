//! Memory management
//!
//! Three layers, leaves first: the page-frame allocator hands out
//! physical frames in 4K/16K/64K size classes; the pmap layer maintains
//! per-process virtual-to-physical mappings with reverse-PTE lists for
//! unmap and invalidation; the bounds layer validates and copies user
//! memory through the faulting process's pmap.

pub mod bounds;
pub mod frame_allocator;
pub mod pmap;

pub use bounds::{
    bounds_check, bounds_check_kernel, copy_in, copy_in_str, copy_out, read_user_u32,
    write_user_u32,
};
pub use frame_allocator::{FrameAllocator, FrameSize, Pfn, Vpte};
pub use pmap::{FaultAccess, FaultKind, MapFlags, Pmap, PmapId, PmapTable, Prot};

/// Base page size.
pub const PAGE_SIZE: usize = 4096;

/// Bottom of the user virtual window.
pub const VM_USER_BASE: usize = 0x0040_0000;

/// Top of the user virtual window (exclusive).
pub const VM_USER_CEILING: usize = 0x7800_0000;

/// Bottom of the kernel virtual window.
pub const VM_KERNEL_BASE: usize = 0x8000_0000;

/// Top of the kernel virtual window (exclusive).
pub const VM_KERNEL_CEILING: usize = 0xffff_f000;

/// Round `addr` down to a page boundary.
pub const fn page_align_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Round `addr` up to a page boundary.
pub const fn page_align_up(addr: usize) -> usize {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}
