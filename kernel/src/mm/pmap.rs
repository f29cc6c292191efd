//! Per-process address spaces
//!
//! A `Pmap` is a root page directory plus the second-level tables that
//! map the user window. Every user-visible mapping also appends a
//! reverse-PTE descriptor to the target frame's list, so unmap and
//! invalidation can walk from the frame back to every address space
//! that references it.
//!
//! The kernel half is identical in every address space and is owned by
//! the boot page tables; pmaps cover the user window only, which keeps
//! the shared-higher-half invariant true by construction.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::define_id;
use crate::error::{KernelResult, VmError};
use crate::hal::Hal;
use crate::mm::frame_allocator::{FrameAllocator, FrameSize, Pfn, Vpte};
use crate::mm::{page_align_down, PAGE_SIZE, VM_USER_BASE, VM_USER_CEILING};

define_id! {
    /// Handle into the pmap table.
    PmapId
}

bitflags! {
    /// Page protection bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Prot: u32 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC  = 1 << 2;
    }
}

bitflags! {
    /// Flags accepted by `pmap_enter`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        /// Replace a conflicting mapping instead of failing with
        /// `EEXIST`.
        const MAP_REPLACE = 1 << 0;
        /// Mark the mapping copy-on-write; the first write faults and
        /// gets a private copy.
        const MAP_COW = 1 << 1;
        /// The mapping may never be paged or replaced lazily.
        const MAP_WIRED = 1 << 2;
    }
}

/// Hardware fault classification, as decoded from the fault status
/// register by the exception vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Translation fault: no valid PTE for the address.
    NotPresent,
    /// Permission fault.
    Protection,
    /// Unaligned access.
    Align,
    /// External abort.
    Bus,
}

/// Access that raised a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAccess {
    Read,
    Write,
    Execute,
}

/// One second-level page table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pte {
    /// Present mapping.
    Mapped { pfn: Pfn, prot: Prot, cow: bool },
    /// Demand-zero reservation: a frame is allocated on first touch.
    Lazy { prot: Prot },
}

/// Entries per second-level table (one 4K page of PTEs covers 1M of
/// address space at 4K granularity).
const L2_ENTRIES: usize = 256;
const L2_SPAN: usize = L2_ENTRIES * PAGE_SIZE;

/// Second-level table: 256 page slots plus the frame holding the
/// hardware table.
struct L2Table {
    table_frame: Pfn,
    entries: [Option<Pte>; L2_ENTRIES],
}

/// Per-process address space.
pub struct Pmap {
    /// Address-space id used for TLB maintenance.
    asid: u16,
    /// Frame holding the first-level directory.
    root_frame: Option<Pfn>,
    /// Second-level tables keyed by first-level index.
    l2: BTreeMap<usize, L2Table>,
}

fn l1_index(va: usize) -> usize {
    va / L2_SPAN
}

fn l2_index(va: usize) -> usize {
    (va % L2_SPAN) / PAGE_SIZE
}

fn check_user_range(va: usize, len: usize) -> KernelResult<()> {
    if va % PAGE_SIZE != 0 || len == 0 || len % PAGE_SIZE != 0 {
        return Err(VmError::OutOfBounds.into());
    }
    if va < VM_USER_BASE || va >= VM_USER_CEILING || len > VM_USER_CEILING - va {
        return Err(VmError::OutOfBounds.into());
    }
    Ok(())
}

impl Pmap {
    /// Create an address space. The kernel half is shared from the boot
    /// tables; the user window starts empty. Fails with `ENOMEM` when
    /// the root directory frame cannot be allocated.
    pub fn new(asid: u16, frames: &mut FrameAllocator) -> KernelResult<Self> {
        // The root directory itself occupies a 16K frame on this MMU
        // (4096 first-level entries of 4 bytes).
        let root = frames.alloc_zeroed(FrameSize::Size16k)?;
        frames.retain(root);
        Ok(Self {
            asid,
            root_frame: Some(root),
            l2: BTreeMap::new(),
        })
    }

    pub fn asid(&self) -> u16 {
        self.asid
    }

    fn ensure_l2(&mut self, frames: &mut FrameAllocator, va: usize) -> KernelResult<&mut L2Table> {
        let idx = l1_index(va);
        if !self.l2.contains_key(&idx) {
            let table_frame = frames.alloc_zeroed(FrameSize::Size4k)?;
            frames.retain(table_frame);
            self.l2.insert(
                idx,
                L2Table {
                    table_frame,
                    entries: [None; L2_ENTRIES],
                },
            );
        }
        Ok(self.l2.get_mut(&idx).unwrap())
    }

    fn pte(&self, va: usize) -> Option<Pte> {
        self.l2
            .get(&l1_index(va))
            .and_then(|t| t.entries[l2_index(va)])
    }

    fn pte_slot(&mut self, va: usize) -> Option<&mut Option<Pte>> {
        self.l2
            .get_mut(&l1_index(va))
            .map(|t| &mut t.entries[l2_index(va)])
    }

    /// Resolve a user virtual address to (frame, offset-in-page) for an
    /// access of the given kind. Lazy and copy-on-write state is not
    /// resolved here; the caller takes the fault path.
    pub fn resolve(&self, va: usize, access: FaultAccess) -> KernelResult<(Pfn, usize)> {
        match self.pte(page_align_down(va)) {
            Some(Pte::Mapped { pfn, prot, cow }) => {
                let ok = match access {
                    FaultAccess::Read => prot.contains(Prot::READ),
                    FaultAccess::Write => prot.contains(Prot::WRITE) && !cow,
                    FaultAccess::Execute => prot.contains(Prot::EXEC),
                };
                if ok {
                    Ok((pfn, va % PAGE_SIZE))
                } else {
                    Err(VmError::Protection.into())
                }
            }
            _ => Err(VmError::NotMapped.into()),
        }
    }
}

/// The pmap operations take the frame allocator and HAL alongside the
/// pmap table because mappings touch frame refcounts, reverse-PTE lists
/// and the TLB.
pub struct PmapTable {
    pmaps: crate::arena::Arena<Pmap>,
    next_asid: u16,
}

impl PmapTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            pmaps: crate::arena::Arena::new("pmap", capacity),
            next_asid: 1,
        }
    }

    pub fn get(&self, id: PmapId) -> Option<&Pmap> {
        self.pmaps.get(id.0)
    }

    pub fn get_mut(&mut self, id: PmapId) -> Option<&mut Pmap> {
        self.pmaps.get_mut(id.0)
    }

    /// `pmap_create`: allocate a new address space.
    pub fn create(&mut self, frames: &mut FrameAllocator) -> KernelResult<PmapId> {
        let asid = self.next_asid;
        self.next_asid = self.next_asid.wrapping_add(1).max(1);
        let pmap = Pmap::new(asid, frames)?;
        self.pmaps
            .insert(pmap)
            .map(PmapId)
            .map_err(|_| VmError::OutOfMemory.into())
    }

    /// `pmap_enter`: install a 4K mapping of `pfn` at `va`.
    ///
    /// Appends a reverse-PTE descriptor to the frame and bumps its
    /// refcount. Fails with `EEXIST` on conflict unless `MAP_REPLACE`
    /// is given, and with `ENOMEM` when a second-level table cannot be
    /// allocated.
    pub fn enter(
        &mut self,
        frames: &mut FrameAllocator,
        hal: &dyn Hal,
        id: PmapId,
        va: usize,
        pfn: Pfn,
        prot: Prot,
        flags: MapFlags,
    ) -> KernelResult<()> {
        check_user_range(va, PAGE_SIZE)?;
        let pmap = self.pmaps.get(id.0).ok_or(VmError::NotMapped)?;
        let asid = pmap.asid;

        if let Some(existing) = pmap.pte(va) {
            if !flags.contains(MapFlags::MAP_REPLACE) {
                return Err(VmError::MappingExists.into());
            }
            if let Pte::Mapped { pfn: old, .. } = existing {
                frames.remove_vpte(old, id, va);
                frames.release(old);
                hal.tlb_invalidate_page(asid, va);
            }
            *self.pmaps.get_mut(id.0).unwrap().pte_slot(va).unwrap() = None;
        }

        let pmap = self.pmaps.get_mut(id.0).unwrap();
        let l2 = pmap.ensure_l2(frames, va)?;
        l2.entries[l2_index(va)] = Some(Pte::Mapped {
            pfn,
            prot,
            cow: flags.contains(MapFlags::MAP_COW),
        });
        frames.retain(pfn);
        frames.add_vpte(pfn, Vpte { pmap: id, va });
        Ok(())
    }

    /// Reserve `[va, va+len)` as demand-zero pages: no frame is
    /// allocated until the first touch faults.
    pub fn enter_lazy(
        &mut self,
        frames: &mut FrameAllocator,
        id: PmapId,
        va: usize,
        len: usize,
        prot: Prot,
    ) -> KernelResult<()> {
        check_user_range(va, len)?;
        let pmap = self.pmaps.get_mut(id.0).ok_or(VmError::NotMapped)?;
        // Reject conflicts up front so a partial reservation never
        // needs unwinding.
        let mut at = va;
        while at < va + len {
            if pmap.pte(at).is_some() {
                return Err(VmError::MappingExists.into());
            }
            at += PAGE_SIZE;
        }
        let mut at = va;
        while at < va + len {
            let l2 = pmap.ensure_l2(frames, at)?;
            l2.entries[l2_index(at)] = Some(Pte::Lazy { prot });
            at += PAGE_SIZE;
        }
        Ok(())
    }

    /// `pmap_remove`: drop every mapping in `[va, va+len)`, unlinking
    /// reverse PTEs and invalidating the TLB for this address space.
    pub fn remove(
        &mut self,
        frames: &mut FrameAllocator,
        hal: &dyn Hal,
        id: PmapId,
        va: usize,
        len: usize,
    ) -> KernelResult<()> {
        check_user_range(va, len)?;
        let pmap = self.pmaps.get_mut(id.0).ok_or(VmError::NotMapped)?;
        let asid = pmap.asid;
        let mut at = va;
        while at < va + len {
            if let Some(slot) = pmap.pte_slot(at) {
                if let Some(Pte::Mapped { pfn, .. }) = slot.take() {
                    frames.remove_vpte(pfn, id, at);
                    frames.release(pfn);
                    hal.tlb_invalidate_page(asid, at);
                }
            }
            at += PAGE_SIZE;
        }
        Ok(())
    }

    /// `pmap_protect`: change protections on `[va, va+len)`.
    pub fn protect(
        &mut self,
        hal: &dyn Hal,
        id: PmapId,
        va: usize,
        len: usize,
        new_prot: Prot,
    ) -> KernelResult<()> {
        check_user_range(va, len)?;
        let pmap = self.pmaps.get_mut(id.0).ok_or(VmError::NotMapped)?;
        let asid = pmap.asid;
        let mut at = va;
        while at < va + len {
            if let Some(slot) = pmap.pte_slot(at) {
                match slot {
                    Some(Pte::Mapped { prot, .. }) | Some(Pte::Lazy { prot }) => {
                        *prot = new_prot;
                        hal.tlb_invalidate_page(asid, at);
                    }
                    None => {}
                }
            }
            at += PAGE_SIZE;
        }
        Ok(())
    }

    /// `pmap_fault`: resolve a fault against the address space.
    ///
    /// Demand-zero reservations get a fresh zeroed frame; a write to a
    /// copy-on-write mapping gets a private copy. Anything else is a
    /// true fault and the caller delivers SIGSEGV to the offending
    /// thread.
    pub fn fault(
        &mut self,
        frames: &mut FrameAllocator,
        hal: &dyn Hal,
        id: PmapId,
        va: usize,
        kind: FaultKind,
        access: FaultAccess,
    ) -> KernelResult<()> {
        if !(VM_USER_BASE..VM_USER_CEILING).contains(&va) {
            return Err(VmError::OutOfBounds.into());
        }
        match kind {
            FaultKind::Align | FaultKind::Bus => return Err(VmError::Protection.into()),
            FaultKind::NotPresent | FaultKind::Protection => {}
        }
        let page = page_align_down(va);
        let pmap = self.pmaps.get(id.0).ok_or(VmError::NotMapped)?;
        let asid = pmap.asid;

        match pmap.pte(page) {
            // First touch of a demand-zero page.
            Some(Pte::Lazy { prot }) => {
                let pfn = frames.alloc_zeroed(FrameSize::Size4k)?;
                let pmap = self.pmaps.get_mut(id.0).unwrap();
                *pmap.pte_slot(page).unwrap() = Some(Pte::Mapped {
                    pfn,
                    prot,
                    cow: false,
                });
                frames.retain(pfn);
                frames.add_vpte(pfn, Vpte { pmap: id, va: page });
                Ok(())
            }
            // First write to a copy-on-write page.
            Some(Pte::Mapped { pfn, prot, cow })
                if cow && access == FaultAccess::Write && prot.contains(Prot::WRITE) =>
            {
                let copy = frames.alloc(FrameSize::Size4k)?;
                let src: alloc::vec::Vec<u8> = frames.frame_page_data(pfn).into();
                frames.frame_page_data_mut(copy).copy_from_slice(&src);
                frames.remove_vpte(pfn, id, page);
                frames.release(pfn);
                let pmap = self.pmaps.get_mut(id.0).unwrap();
                *pmap.pte_slot(page).unwrap() = Some(Pte::Mapped {
                    pfn: copy,
                    prot,
                    cow: false,
                });
                frames.retain(copy);
                frames.add_vpte(copy, Vpte { pmap: id, va: page });
                hal.tlb_invalidate_page(asid, page);
                Ok(())
            }
            Some(Pte::Mapped { prot, .. }) => {
                // Present but the access is forbidden.
                let allowed = match access {
                    FaultAccess::Read => prot.contains(Prot::READ),
                    FaultAccess::Write => prot.contains(Prot::WRITE),
                    FaultAccess::Execute => prot.contains(Prot::EXEC),
                };
                if allowed {
                    // Spurious fault (stale TLB): invalidate and retry.
                    hal.tlb_invalidate_page(asid, page);
                    Ok(())
                } else {
                    Err(VmError::Protection.into())
                }
            }
            None => Err(VmError::NotMapped.into()),
        }
    }

    /// Clone an address space for fork: present pages are shared
    /// copy-on-write in both parent and child, demand-zero
    /// reservations are copied as reservations.
    pub fn fork_from(
        &mut self,
        frames: &mut FrameAllocator,
        hal: &dyn Hal,
        parent_id: PmapId,
    ) -> KernelResult<PmapId> {
        let child_id = self.create(frames)?;
        let mappings: Vec<(usize, Pte)> = {
            let parent = self.pmaps.get(parent_id.0).ok_or(VmError::NotMapped)?;
            parent
                .l2
                .iter()
                .flat_map(|(l1, table)| {
                    table.entries.iter().enumerate().filter_map(move |(i, e)| {
                        e.map(|pte| (*l1 * L2_SPAN + i * PAGE_SIZE, pte))
                    })
                })
                .collect()
        };
        let parent_asid = self.pmaps.get(parent_id.0).unwrap().asid;

        for (va, pte) in mappings {
            match pte {
                Pte::Mapped { pfn, prot, .. } => {
                    // Demote the parent's mapping to copy-on-write too.
                    {
                        let parent = self.pmaps.get_mut(parent_id.0).unwrap();
                        if let Some(slot) = parent.pte_slot(va) {
                            *slot = Some(Pte::Mapped {
                                pfn,
                                prot,
                                cow: prot.contains(Prot::WRITE),
                            });
                        }
                    }
                    hal.tlb_invalidate_page(parent_asid, va);
                    let child = self.pmaps.get_mut(child_id.0).unwrap();
                    let l2 = child.ensure_l2(frames, va)?;
                    l2.entries[l2_index(va)] = Some(Pte::Mapped {
                        pfn,
                        prot,
                        cow: prot.contains(Prot::WRITE),
                    });
                    frames.retain(pfn);
                    frames.add_vpte(pfn, Vpte { pmap: child_id, va });
                }
                Pte::Lazy { prot } => {
                    let child = self.pmaps.get_mut(child_id.0).unwrap();
                    let l2 = child.ensure_l2(frames, va)?;
                    l2.entries[l2_index(va)] = Some(Pte::Lazy { prot });
                }
            }
        }
        Ok(child_id)
    }

    /// `pmap_destroy`: unmap everything, release frames and table
    /// pages, and drop the address space.
    pub fn destroy(
        &mut self,
        frames: &mut FrameAllocator,
        hal: &dyn Hal,
        id: PmapId,
    ) -> KernelResult<()> {
        let pmap = self.pmaps.remove(id.0).ok_or(VmError::NotMapped)?;
        let asid = pmap.asid;
        for (l1, table) in pmap.l2.iter() {
            for (l2i, entry) in table.entries.iter().enumerate() {
                if let Some(Pte::Mapped { pfn, .. }) = entry {
                    let va = *l1 * L2_SPAN + l2i * PAGE_SIZE;
                    frames.remove_vpte(*pfn, id, va);
                    frames.release(*pfn);
                }
            }
            frames.release(table.table_frame);
        }
        if let Some(root) = pmap.root_frame {
            frames.release(root);
        }
        hal.tlb_invalidate_asid(asid);
        Ok(())
    }

    /// Number of live address spaces.
    pub fn len(&self) -> usize {
        self.pmaps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pmaps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::NullHal;

    fn setup() -> (FrameAllocator, PmapTable, PmapId) {
        let mut frames = FrameAllocator::new(4 * 1024 * 1024);
        let mut pmaps = PmapTable::new(8);
        let id = pmaps.create(&mut frames).unwrap();
        (frames, pmaps, id)
    }

    const VA: usize = VM_USER_BASE + 0x1000;

    #[test]
    fn enter_then_resolve() {
        let (mut frames, mut pmaps, id) = setup();
        let hal = NullHal::new();
        let pfn = frames.alloc(FrameSize::Size4k).unwrap();
        pmaps
            .enter(&mut frames, &hal, id, VA, pfn, Prot::READ | Prot::WRITE, MapFlags::empty())
            .unwrap();
        let (got, off) = pmaps
            .get(id)
            .unwrap()
            .resolve(VA + 5, FaultAccess::Read)
            .unwrap();
        assert_eq!(got, pfn);
        assert_eq!(off, 5);
        assert_eq!(frames.ref_count(pfn), 1);
        assert_eq!(frames.vptes(pfn), &[Vpte { pmap: id, va: VA }]);
    }

    #[test]
    fn conflicting_enter_needs_replace() {
        let (mut frames, mut pmaps, id) = setup();
        let hal = NullHal::new();
        let a = frames.alloc(FrameSize::Size4k).unwrap();
        let b = frames.alloc(FrameSize::Size4k).unwrap();
        pmaps
            .enter(&mut frames, &hal, id, VA, a, Prot::READ, MapFlags::empty())
            .unwrap();
        let err = pmaps
            .enter(&mut frames, &hal, id, VA, b, Prot::READ, MapFlags::empty())
            .unwrap_err();
        assert_eq!(err, VmError::MappingExists.into());
        pmaps
            .enter(&mut frames, &hal, id, VA, b, Prot::READ, MapFlags::MAP_REPLACE)
            .unwrap();
        assert!(frames.is_free(a));
        let (got, _) = pmaps
            .get(id)
            .unwrap()
            .resolve(VA, FaultAccess::Read)
            .unwrap();
        assert_eq!(got, b);
    }

    #[test]
    fn remove_then_reenter_restores_mapping() {
        let (mut frames, mut pmaps, id) = setup();
        let hal = NullHal::new();
        let pfn = frames.alloc(FrameSize::Size4k).unwrap();
        frames.retain(pfn); // hold our own reference across the unmap
        pmaps
            .enter(&mut frames, &hal, id, VA, pfn, Prot::READ, MapFlags::empty())
            .unwrap();
        pmaps.remove(&mut frames, &hal, id, VA, PAGE_SIZE).unwrap();
        assert!(frames.vptes(pfn).is_empty());
        assert!(pmaps
            .get(id)
            .unwrap()
            .resolve(VA, FaultAccess::Read)
            .is_err());
        pmaps
            .enter(&mut frames, &hal, id, VA, pfn, Prot::READ, MapFlags::empty())
            .unwrap();
        let (got, _) = pmaps
            .get(id)
            .unwrap()
            .resolve(VA, FaultAccess::Read)
            .unwrap();
        assert_eq!(got, pfn);
    }

    #[test]
    fn demand_zero_fault_allocates() {
        let (mut frames, mut pmaps, id) = setup();
        let hal = NullHal::new();
        pmaps
            .enter_lazy(&mut frames, id, VA, PAGE_SIZE, Prot::READ | Prot::WRITE)
            .unwrap();
        assert!(pmaps
            .get(id)
            .unwrap()
            .resolve(VA, FaultAccess::Read)
            .is_err());
        pmaps
            .fault(&mut frames, &hal, id, VA + 4, FaultKind::NotPresent, FaultAccess::Write)
            .unwrap();
        let (pfn, _) = pmaps
            .get(id)
            .unwrap()
            .resolve(VA, FaultAccess::Write)
            .unwrap();
        assert!(frames.frame_page_data(pfn).iter().all(|&b| b == 0));
    }

    #[test]
    fn cow_fault_takes_private_copy() {
        let (mut frames, mut pmaps, id) = setup();
        let hal = NullHal::new();
        let shared = frames.alloc(FrameSize::Size4k).unwrap();
        frames.retain(shared); // the "other" address space's reference
        frames.frame_page_data_mut(shared)[0] = 0x5a;
        pmaps
            .enter(
                &mut frames,
                &hal,
                id,
                VA,
                shared,
                Prot::READ | Prot::WRITE,
                MapFlags::MAP_COW,
            )
            .unwrap();
        // Writes must not resolve through a COW mapping.
        assert!(pmaps
            .get(id)
            .unwrap()
            .resolve(VA, FaultAccess::Write)
            .is_err());
        pmaps
            .fault(&mut frames, &hal, id, VA, FaultKind::Protection, FaultAccess::Write)
            .unwrap();
        let (private, _) = pmaps
            .get(id)
            .unwrap()
            .resolve(VA, FaultAccess::Write)
            .unwrap();
        assert_ne!(private, shared);
        assert_eq!(frames.frame_page_data(private)[0], 0x5a);
    }

    #[test]
    fn unhandled_fault_is_an_error() {
        let (mut frames, mut pmaps, id) = setup();
        let hal = NullHal::new();
        let err = pmaps
            .fault(&mut frames, &hal, id, VA, FaultKind::NotPresent, FaultAccess::Read)
            .unwrap_err();
        assert_eq!(err, VmError::NotMapped.into());
    }

    #[test]
    fn destroy_releases_everything() {
        let (mut frames, mut pmaps, id) = setup();
        let hal = NullHal::new();
        let before = frames.free_pages();
        let pfn = frames.alloc(FrameSize::Size4k).unwrap();
        pmaps
            .enter(&mut frames, &hal, id, VA, pfn, Prot::READ, MapFlags::empty())
            .unwrap();
        pmaps.destroy(&mut frames, &hal, id).unwrap();
        // Mapping reference and table pages all released; only the
        // frames freed during setup()'s create() remain accounted.
        assert!(pmaps.get(id).is_none());
        assert!(frames.free_pages() >= before);
    }
}
