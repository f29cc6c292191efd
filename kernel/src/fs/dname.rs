//! Path-component (DNAME) cache
//!
//! Maps (parent vnode, component name) to a vnode, hashed by parent
//! and name and bounded by `NR_DNAME` with a global LRU. Negative
//! entries are not cached. Rename and unlink remove the affected
//! entry; vnode teardown removes every entry referencing the vnode as
//! parent or as target.

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec::Vec;

use crate::arena::Arena;
use crate::define_id;
use crate::fs::vnode::VNodeId;

define_id! {
    /// Handle into the DNAME cache.
    DNameId
}

/// Cache capacity.
pub const NR_DNAME: usize = 128;

/// Hash bucket count.
pub const NR_DNAME_HASH: usize = 64;

struct DName {
    parent: VNodeId,
    name: String,
    vnode: VNodeId,
}

fn name_hash(parent: VNodeId, name: &str) -> usize {
    let mut h: u64 = parent.as_u32() as u64;
    for b in name.bytes() {
        h = h.wrapping_mul(31).wrapping_add(b as u64);
    }
    h as usize % NR_DNAME_HASH
}

/// The component cache.
pub struct DNameCache {
    entries: Arena<DName>,
    hash: Vec<Vec<DNameId>>,
    /// Global LRU, head oldest.
    lru: VecDeque<DNameId>,
}

impl DNameCache {
    pub fn new() -> Self {
        let mut hash = Vec::with_capacity(NR_DNAME_HASH);
        hash.resize_with(NR_DNAME_HASH, Vec::new);
        Self {
            entries: Arena::new("dname", NR_DNAME),
            hash,
            lru: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn find(&self, parent: VNodeId, name: &str) -> Option<DNameId> {
        self.hash[name_hash(parent, name)]
            .iter()
            .copied()
            .find(|&id| {
                self.entries
                    .get(id.0)
                    .map(|e| e.parent == parent && e.name == name)
                    .unwrap_or(false)
            })
    }

    fn unlink_entry(&mut self, id: DNameId) {
        if let Some(entry) = self.entries.remove(id.0) {
            let bucket = &mut self.hash[name_hash(entry.parent, &entry.name)];
            if let Some(pos) = bucket.iter().position(|&e| e == id) {
                bucket.swap_remove(pos);
            }
        }
        if let Some(pos) = self.lru.iter().position(|&e| e == id) {
            self.lru.remove(pos);
        }
    }

    /// Look a component up, refreshing its LRU position on a hit.
    pub fn lookup(&mut self, parent: VNodeId, name: &str) -> Option<VNodeId> {
        let id = self.find(parent, name)?;
        if let Some(pos) = self.lru.iter().position(|&e| e == id) {
            self.lru.remove(pos);
        }
        self.lru.push_back(id);
        self.entries.get(id.0).map(|e| e.vnode)
    }

    /// Insert or update a component binding, evicting the LRU head at
    /// capacity.
    pub fn enter(&mut self, parent: VNodeId, name: &str, vnode: VNodeId) {
        if let Some(existing) = self.find(parent, name) {
            self.entries.get_mut(existing.0).unwrap().vnode = vnode;
            if let Some(pos) = self.lru.iter().position(|&e| e == existing) {
                self.lru.remove(pos);
            }
            self.lru.push_back(existing);
            return;
        }
        if self.entries.is_full() {
            if let Some(victim) = self.lru.pop_front() {
                self.unlink_entry(victim);
            }
        }
        let id = match self.entries.insert(DName {
            parent,
            name: String::from(name),
            vnode,
        }) {
            Ok(h) => DNameId(h),
            // Capacity race exhausted the table anyway; skip caching.
            Err(_) => return,
        };
        self.hash[name_hash(parent, name)].push(id);
        self.lru.push_back(id);
    }

    /// Remove one binding (rename, unlink).
    pub fn remove(&mut self, parent: VNodeId, name: &str) {
        if let Some(id) = self.find(parent, name) {
            self.unlink_entry(id);
        }
    }

    /// Remove every binding referencing `vnode` as parent or target
    /// (vnode teardown).
    pub fn purge_vnode(&mut self, vnode: VNodeId) {
        let victims: Vec<DNameId> = self
            .entries
            .iter()
            .filter(|(_, e)| e.parent == vnode || e.vnode == vnode)
            .map(|(h, _)| DNameId(h))
            .collect();
        for id in victims {
            self.unlink_entry(id);
        }
    }
}

impl Default for DNameCache {
    fn default() -> Self {
        Self::new()
    }
}
