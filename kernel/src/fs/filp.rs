//! Open-file descriptions
//!
//! A filp is a descriptor-table entry: a typed payload (vnode with
//! offset, message port, kqueue), a reference count shared by dup'd
//! descriptors, and open flags. Close decrements the reference count;
//! teardown of the underlying object fires only on the transition to
//! zero, and a negative count is a kernel panic.

use crate::arena::Arena;
use crate::define_id;
use crate::error::{FsError, KernelError, KernelResult};
use crate::fs::knote::KqueueId;
use crate::fs::superblock::SbId;
use crate::fs::vnode::VNodeId;
use crate::fs::OpenFlags;
use crate::ipc::PortId;
use crate::kernel_panic;

define_id! {
    /// Handle into the filp table.
    FilpId
}

/// Maximum number of open-file descriptions.
pub const NR_FILP: usize = 128;

/// Typed payload of a filp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilpPayload {
    /// Ordinary file, device or FIFO.
    Vnode { vnode: VNodeId, offset: u64 },
    /// Server's handle to a mounted superblock's message port.
    Port { port: PortId, sb: Option<SbId> },
    /// Kernel event queue.
    Kqueue { kq: KqueueId },
}

/// A descriptor-table entry.
pub struct Filp {
    pub payload: FilpPayload,
    pub reference_cnt: i32,
    pub flags: OpenFlags,
}

/// The filp table.
pub struct FilpTable {
    filps: Arena<Filp>,
}

impl FilpTable {
    pub fn new() -> Self {
        Self {
            filps: Arena::new("filp", NR_FILP),
        }
    }

    pub fn len(&self) -> usize {
        self.filps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filps.is_empty()
    }

    pub fn insert(&mut self, payload: FilpPayload, flags: OpenFlags) -> KernelResult<FilpId> {
        self.filps
            .insert(Filp {
                payload,
                reference_cnt: 1,
                flags,
            })
            .map(FilpId)
            .map_err(|_| KernelError::ResourceExhausted { resource: "filp" })
    }

    pub fn get(&self, id: FilpId) -> KernelResult<&Filp> {
        self.filps.get(id.0).ok_or(FsError::BadDescriptor.into())
    }

    pub fn get_mut(&mut self, id: FilpId) -> KernelResult<&mut Filp> {
        self.filps.get_mut(id.0).ok_or(FsError::BadDescriptor.into())
    }

    /// Share the description (dup, fork).
    pub fn ref_filp(&mut self, id: FilpId) -> KernelResult<()> {
        self.get_mut(id)?.reference_cnt += 1;
        Ok(())
    }

    /// Drop one reference. On the transition to zero the entry is
    /// removed and its payload returned so the caller can tear down the
    /// underlying object.
    pub fn unref_filp(&mut self, id: FilpId) -> KernelResult<Option<FilpPayload>> {
        let filp = self.filps.get_mut(id.0).ok_or(FsError::BadDescriptor)?;
        filp.reference_cnt -= 1;
        if filp.reference_cnt < 0 {
            kernel_panic!("filp refcount underflow for {:?}", id);
        }
        if filp.reference_cnt == 0 {
            let filp = self.filps.remove(id.0).unwrap();
            return Ok(Some(filp.payload));
        }
        Ok(None)
    }

    /// The vnode behind a filp, if it is a vnode filp.
    pub fn vnode_of(&self, id: FilpId) -> Option<VNodeId> {
        match self.filps.get(id.0)?.payload {
            FilpPayload::Vnode { vnode, .. } => Some(vnode),
            _ => None,
        }
    }
}

impl Default for FilpTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unref_tears_down_only_at_zero() {
        let mut table = FilpTable::new();
        let payload = FilpPayload::Vnode {
            vnode: VNodeId::from_u32(3),
            offset: 0,
        };
        let id = table.insert(payload, OpenFlags::READ).unwrap();
        table.ref_filp(id).unwrap();
        assert_eq!(table.unref_filp(id).unwrap(), None);
        assert_eq!(table.unref_filp(id).unwrap(), Some(payload));
        assert!(table.get(id).is_err());
    }

    #[test]
    fn vnode_of_distinguishes_payloads() {
        let mut table = FilpTable::new();
        let v = table
            .insert(
                FilpPayload::Vnode {
                    vnode: VNodeId::from_u32(3),
                    offset: 0,
                },
                OpenFlags::READ,
            )
            .unwrap();
        let p = table
            .insert(
                FilpPayload::Port {
                    port: PortId::from_u32(1),
                    sb: None,
                },
                OpenFlags::READ,
            )
            .unwrap();
        assert!(table.vnode_of(v).is_some());
        assert!(table.vnode_of(p).is_none());
    }
}
