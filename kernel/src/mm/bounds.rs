//! Memory bounds checking and user copy
//!
//! Every user pointer crossing the syscall boundary is validated
//! against the user window before use, and every transfer resolves the
//! address page-by-page through the owning pmap. Copies behave like the
//! hardware access they replace: a touch of a demand-zero or
//! copy-on-write page takes the fault path first, and anything the
//! fault path cannot resolve is `EFAULT`.

use crate::error::{KernelError, KernelResult};
use crate::hal::Hal;
use crate::mm::frame_allocator::FrameAllocator;
use crate::mm::pmap::{FaultAccess, FaultKind, PmapId, PmapTable};
use crate::mm::{PAGE_SIZE, VM_KERNEL_BASE, VM_KERNEL_CEILING, VM_USER_BASE, VM_USER_CEILING};

/// Validate a user-space range.
pub fn bounds_check(addr: usize, sz: usize) -> KernelResult<()> {
    if (sz as isize) < 0 {
        return Err(KernelError::TooBig);
    }
    if addr < VM_USER_BASE || addr >= VM_USER_CEILING || sz >= VM_USER_CEILING - addr {
        return Err(KernelError::BadAddress);
    }
    Ok(())
}

/// Validate a kernel-space range.
pub fn bounds_check_kernel(addr: usize, sz: usize) -> KernelResult<()> {
    if (sz as isize) < 0 {
        return Err(KernelError::TooBig);
    }
    if addr < VM_KERNEL_BASE || addr >= VM_KERNEL_CEILING || sz >= VM_KERNEL_CEILING - addr {
        return Err(KernelError::BadAddress);
    }
    Ok(())
}

/// Resolve one page for an access, taking the fault path when the
/// plain translation fails (demand-zero fill, copy-on-write).
fn resolve_faulting(
    pmaps: &mut PmapTable,
    frames: &mut FrameAllocator,
    hal: &dyn Hal,
    pmap: PmapId,
    va: usize,
    access: FaultAccess,
) -> KernelResult<(crate::mm::Pfn, usize)> {
    let map = pmaps.get(pmap).ok_or(KernelError::BadAddress)?;
    match map.resolve(va, access) {
        Ok(hit) => Ok(hit),
        Err(_) => {
            pmaps
                .fault(frames, hal, pmap, va, FaultKind::NotPresent, access)
                .map_err(|_| KernelError::BadAddress)?;
            pmaps
                .get(pmap)
                .ok_or(KernelError::BadAddress)?
                .resolve(va, access)
                .map_err(|_| KernelError::BadAddress)
        }
    }
}

/// Copy `dst.len()` bytes from user address `src` into kernel memory.
pub fn copy_in(
    pmaps: &mut PmapTable,
    frames: &mut FrameAllocator,
    hal: &dyn Hal,
    pmap: PmapId,
    dst: &mut [u8],
    src: usize,
) -> KernelResult<()> {
    bounds_check(src, dst.len())?;
    let mut copied = 0;
    while copied < dst.len() {
        let va = src + copied;
        let (pfn, offset) = resolve_faulting(pmaps, frames, hal, pmap, va, FaultAccess::Read)?;
        let chunk = (PAGE_SIZE - offset).min(dst.len() - copied);
        let page = frames.frame_page_data(pfn);
        dst[copied..copied + chunk].copy_from_slice(&page[offset..offset + chunk]);
        copied += chunk;
    }
    Ok(())
}

/// Copy `src.len()` bytes from kernel memory to user address `dst`.
pub fn copy_out(
    pmaps: &mut PmapTable,
    frames: &mut FrameAllocator,
    hal: &dyn Hal,
    pmap: PmapId,
    dst: usize,
    src: &[u8],
) -> KernelResult<()> {
    bounds_check(dst, src.len())?;
    let mut copied = 0;
    while copied < src.len() {
        let va = dst + copied;
        let (pfn, offset) = resolve_faulting(pmaps, frames, hal, pmap, va, FaultAccess::Write)?;
        let chunk = (PAGE_SIZE - offset).min(src.len() - copied);
        let page = frames.frame_page_data_mut(pfn);
        page[offset..offset + chunk].copy_from_slice(&src[copied..copied + chunk]);
        copied += chunk;
    }
    Ok(())
}

/// Copy a NUL-terminated string of at most `max` bytes from user
/// memory. Returns the bytes before the terminator.
pub fn copy_in_str(
    pmaps: &mut PmapTable,
    frames: &mut FrameAllocator,
    hal: &dyn Hal,
    pmap: PmapId,
    src: usize,
    max: usize,
) -> KernelResult<alloc::string::String> {
    let mut out = alloc::vec::Vec::new();
    let mut at = src;
    while out.len() < max {
        bounds_check(at, 1)?;
        let (pfn, offset) = resolve_faulting(pmaps, frames, hal, pmap, at, FaultAccess::Read)?;
        let page = frames.frame_page_data(pfn);
        let chunk = (PAGE_SIZE - offset).min(max - out.len());
        match page[offset..offset + chunk].iter().position(|&b| b == 0) {
            Some(pos) => {
                out.extend_from_slice(&page[offset..offset + pos]);
                return alloc::string::String::from_utf8(out)
                    .map_err(|_| KernelError::InvalidArgument);
            }
            None => {
                out.extend_from_slice(&page[offset..offset + chunk]);
                at += chunk;
            }
        }
    }
    Err(KernelError::TooBig)
}

/// Read a naturally-aligned u32 from user memory (the futex word).
pub fn read_user_u32(
    pmaps: &mut PmapTable,
    frames: &mut FrameAllocator,
    hal: &dyn Hal,
    pmap: PmapId,
    uaddr: usize,
) -> KernelResult<u32> {
    if uaddr % 4 != 0 {
        return Err(KernelError::InvalidArgument);
    }
    let mut word = [0u8; 4];
    copy_in(pmaps, frames, hal, pmap, &mut word, uaddr)?;
    Ok(u32::from_le_bytes(word))
}

/// Write a naturally-aligned u32 to user memory.
pub fn write_user_u32(
    pmaps: &mut PmapTable,
    frames: &mut FrameAllocator,
    hal: &dyn Hal,
    pmap: PmapId,
    uaddr: usize,
    val: u32,
) -> KernelResult<()> {
    if uaddr % 4 != 0 {
        return Err(KernelError::InvalidArgument);
    }
    copy_out(pmaps, frames, hal, pmap, uaddr, &val.to_le_bytes())
}
