//! Superblocks
//!
//! A superblock is a mount point: it binds a root vnode to the message
//! port of the user-mode server that implements the filesystem.

use crate::arena::Arena;
use crate::define_id;
use crate::error::{FsError, KernelError, KernelResult};
use crate::fs::vnode::VNodeId;
use crate::ipc::PortId;

define_id! {
    /// Handle into the superblock table.
    SbId
}

/// Maximum number of mounts.
pub const NR_SUPERBLOCK: usize = 8;

/// A mounted filesystem.
pub struct SuperBlock {
    /// Root directory vnode; set once the root attributes arrive from
    /// the server.
    pub root_vnode: Option<VNodeId>,
    /// The server's message port.
    pub port: PortId,
    /// Inode number of the root directory on the server.
    pub root_ino: u64,
    /// Mount is read-only.
    pub read_only: bool,
}

/// The superblock table, with the root mount singled out.
pub struct SuperBlockTable {
    superblocks: Arena<SuperBlock>,
    root: Option<SbId>,
}

impl SuperBlockTable {
    pub fn new() -> Self {
        Self {
            superblocks: Arena::new("superblock", NR_SUPERBLOCK),
            root: None,
        }
    }

    pub fn len(&self) -> usize {
        self.superblocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.superblocks.is_empty()
    }

    pub fn insert(&mut self, sb: SuperBlock) -> KernelResult<SbId> {
        self.superblocks
            .insert(sb)
            .map(SbId)
            .map_err(|_| KernelError::ResourceExhausted {
                resource: "superblock",
            })
    }

    pub fn remove(&mut self, id: SbId) -> Option<SuperBlock> {
        if self.root == Some(id) {
            self.root = None;
        }
        self.superblocks.remove(id.0)
    }

    pub fn get(&self, id: SbId) -> KernelResult<&SuperBlock> {
        self.superblocks.get(id.0).ok_or(FsError::NotFound.into())
    }

    pub fn get_mut(&mut self, id: SbId) -> KernelResult<&mut SuperBlock> {
        self.superblocks
            .get_mut(id.0)
            .ok_or(FsError::NotFound.into())
    }

    /// The root mount, if one is installed.
    pub fn root(&self) -> Option<SbId> {
        self.root
    }

    pub fn set_root(&mut self, id: SbId) -> KernelResult<()> {
        if self.root.is_some() {
            return Err(KernelError::AlreadyExists);
        }
        if !self.superblocks.contains(id.0) {
            return Err(FsError::NotFound.into());
        }
        self.root = Some(id);
        Ok(())
    }
}

impl Default for SuperBlockTable {
    fn default() -> Self {
        Self::new()
    }
}
