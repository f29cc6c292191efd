//! In-core vnodes
//!
//! A vnode is the VFS's unit of naming and locking: mode, size, ids,
//! owning superblock, a reader/writer lock, knote subscribers, and a
//! reference count separate from the on-disk link count. A vnode whose
//! reference count reaches zero keeps its identity cached on the free
//! list; the slot is recycled only when the table needs room, at which
//! point its name-cache entries are purged by the caller.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;

use crate::arena::Arena;
use crate::define_id;
use crate::error::{FsError, KernelError, KernelResult};
use crate::fs::knote::Knote;
use crate::fs::superblock::SbId;
use crate::fs::FileMode;
use crate::fs::PipeId;
use crate::kernel_panic;
use crate::sync::rwlock::RwLock;

define_id! {
    /// Handle into the vnode table.
    VNodeId
}

/// Maximum number of in-core vnodes.
pub const NR_VNODE: usize = 128;

/// An in-core file handle.
pub struct VNode {
    pub sb: SbId,
    pub ino: u64,
    pub mode: FileMode,
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    /// In-core references (filps, lookups in flight); separate from the
    /// on-disk link count.
    pub ref_cnt: u32,
    /// Serializes data and metadata operations on this file.
    pub lock: RwLock,
    /// Event subscribers.
    pub knotes: Vec<Knote>,
    /// FIFO payload when `mode.is_fifo()`.
    pub pipe: Option<PipeId>,
    /// Set when the node has been unlinked while cached.
    pub deleted: bool,
}

impl VNode {
    fn new(sb: SbId, ino: u64, mode: FileMode, size: u64, uid: u32, gid: u32) -> Self {
        Self {
            sb,
            ino,
            mode,
            size,
            uid,
            gid,
            ref_cnt: 1,
            lock: RwLock::new(),
            knotes: Vec::new(),
            pipe: None,
            deleted: false,
        }
    }
}

/// The vnode table: arena plus (superblock, inode) index and the free
/// list of cached zero-reference vnodes.
pub struct VNodeTable {
    vnodes: Arena<VNode>,
    by_ino: BTreeMap<(u32, u64), VNodeId>,
    free_list: VecDeque<VNodeId>,
}

impl VNodeTable {
    pub fn new() -> Self {
        Self {
            vnodes: Arena::new("vnode", NR_VNODE),
            by_ino: BTreeMap::new(),
            free_list: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.vnodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vnodes.is_empty()
    }

    pub fn get(&self, id: VNodeId) -> KernelResult<&VNode> {
        self.vnodes.get(id.0).ok_or(FsError::NotFound.into())
    }

    pub fn get_mut(&mut self, id: VNodeId) -> KernelResult<&mut VNode> {
        self.vnodes.get_mut(id.0).ok_or(FsError::NotFound.into())
    }

    /// Whether `id` sits on the free list (reference count zero).
    pub fn on_free_list(&self, id: VNodeId) -> bool {
        self.free_list.contains(&id)
    }

    /// Find the cached vnode for (sb, ino).
    pub fn find(&self, sb: SbId, ino: u64) -> Option<VNodeId> {
        self.by_ino.get(&(sb.as_u32(), ino)).copied()
    }

    /// Reference the cached vnode for (sb, ino), if present.
    pub fn get_ino(&mut self, sb: SbId, ino: u64) -> Option<VNodeId> {
        let id = self.find(sb, ino)?;
        self.ref_vnode(id).ok()?;
        Some(id)
    }

    /// Take one more reference; pulls the vnode off the free list on
    /// the zero-to-one transition.
    pub fn ref_vnode(&mut self, id: VNodeId) -> KernelResult<()> {
        let vnode = self.vnodes.get_mut(id.0).ok_or(FsError::NotFound)?;
        vnode.ref_cnt += 1;
        if vnode.ref_cnt == 1 {
            if let Some(pos) = self.free_list.iter().position(|&v| v == id) {
                self.free_list.remove(pos);
            }
        }
        Ok(())
    }

    /// `vnode_put`: drop one reference. On the transition to zero the
    /// vnode keeps its identity, sheds its knotes, and joins the free
    /// list. Returns true on that transition.
    pub fn unref_vnode(&mut self, id: VNodeId) -> KernelResult<bool> {
        let vnode = self.vnodes.get_mut(id.0).ok_or(FsError::NotFound)?;
        if vnode.ref_cnt == 0 {
            kernel_panic!("vnode refcount underflow for {:?}", id);
        }
        vnode.ref_cnt -= 1;
        if vnode.ref_cnt == 0 {
            vnode.knotes.clear();
            self.free_list.push_back(id);
            return Ok(true);
        }
        Ok(false)
    }

    /// Install a new vnode with one reference. When the arena is full
    /// the oldest free-list entry is evicted; the caller purges the
    /// evicted identity from the name cache.
    pub fn install(
        &mut self,
        sb: SbId,
        ino: u64,
        mode: FileMode,
        size: u64,
        uid: u32,
        gid: u32,
    ) -> KernelResult<(VNodeId, Option<(SbId, u64, VNodeId)>)> {
        if let Some(existing) = self.find(sb, ino) {
            self.ref_vnode(existing)?;
            return Ok((existing, None));
        }

        let mut evicted = None;
        if self.vnodes.is_full() {
            // Oldest reclaimable entry whose lock is quiescent; a
            // locked zero-reference vnode belongs to a parked
            // operation and must keep its slot.
            let victim = self
                .free_list
                .iter()
                .position(|&v| {
                    self.vnodes
                        .get(v.0)
                        .map(|n| n.lock.is_unlocked())
                        .unwrap_or(true)
                })
                .and_then(|pos| self.free_list.remove(pos))
                .ok_or(KernelError::ResourceExhausted { resource: "vnode" })?;
            let v = self.vnodes.remove(victim.0).unwrap();
            self.by_ino.remove(&(v.sb.as_u32(), v.ino));
            evicted = Some((v.sb, v.ino, victim));
        }

        let id = self
            .vnodes
            .insert(VNode::new(sb, ino, mode, size, uid, gid))
            .map(VNodeId)
            .map_err(|_| KernelError::ResourceExhausted { resource: "vnode" })?;
        self.by_ino.insert((sb.as_u32(), ino), id);
        Ok((id, evicted))
    }

    /// Drop a vnode entirely (unlink teardown after drain). The caller
    /// has already purged name-cache entries.
    pub fn discard(&mut self, id: VNodeId) -> KernelResult<()> {
        let vnode = self.vnodes.remove(id.0).ok_or(FsError::NotFound)?;
        self.by_ino.remove(&(vnode.sb.as_u32(), vnode.ino));
        if let Some(pos) = self.free_list.iter().position(|&v| v == id) {
            self.free_list.remove(pos);
        }
        Ok(())
    }

    /// Every live vnode id (invariant sweeps).
    pub fn handles(&self) -> Vec<VNodeId> {
        self.vnodes.handles().into_iter().map(VNodeId).collect()
    }

    /// Vnodes of one superblock (unmount sweep).
    pub fn of_superblock(&self, sb: SbId) -> Vec<VNodeId> {
        self.vnodes
            .iter()
            .filter(|(_, v)| v.sb == sb)
            .map(|(h, _)| VNodeId(h))
            .collect()
    }
}

impl Default for VNodeTable {
    fn default() -> Self {
        Self::new()
    }
}
