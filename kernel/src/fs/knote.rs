//! Knotes and kqueues
//!
//! A knote is an event-notification registration attached to a kernel
//! object (here: vnodes). Write, truncate and unlink fire hint bits on
//! every subscribed knote; an activated knote surfaces on its owning
//! kqueue. `knote()` takes no locks of its own and is safe to call
//! under the vnode lock.

use alloc::vec::Vec;

use bitflags::bitflags;

use crate::arena::Arena;
use crate::define_id;
use crate::error::{KernelError, KernelResult};
use crate::fs::vnode::VNodeId;
use crate::sync::rendez::Rendez;

define_id! {
    /// Handle into the kqueue table.
    KqueueId
}

/// Maximum number of kqueues.
pub const NR_KQUEUE: usize = 16;

bitflags! {
    /// Vnode event filter bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NoteFlags: u32 {
        const NOTE_WRITE  = 1 << 0;
        const NOTE_EXTEND = 1 << 1;
        const NOTE_ATTRIB = 1 << 2;
        const NOTE_DELETE = 1 << 3;
        const NOTE_LINK   = 1 << 4;
    }
}

/// One subscription attached to a vnode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Knote {
    pub kq: KqueueId,
    /// Hints the subscriber cares about.
    pub filter: NoteFlags,
    /// Hints fired since the last harvest.
    pub active: NoteFlags,
}

/// Fire `hint` on every knote in `list` and report activations to the
/// kqueue table.
pub fn knote(kqueues: &mut KqueueTable, list: &mut [Knote], vnode: VNodeId, hint: NoteFlags) {
    for kn in list.iter_mut() {
        let fired = kn.filter & hint;
        if !fired.is_empty() {
            kn.active |= fired;
            kqueues.post(kn.kq, vnode, fired);
        }
    }
}

/// An event queue.
pub struct Kqueue {
    /// Activated (vnode, hints) pairs awaiting harvest.
    pub pending: Vec<(VNodeId, NoteFlags)>,
    /// Harvesters block here.
    pub rendez: Rendez,
}

/// The kqueue table.
pub struct KqueueTable {
    kqueues: Arena<Kqueue>,
}

impl KqueueTable {
    pub fn new() -> Self {
        Self {
            kqueues: Arena::new("kqueue", NR_KQUEUE),
        }
    }

    pub fn create(&mut self) -> KernelResult<KqueueId> {
        self.kqueues
            .insert(Kqueue {
                pending: Vec::new(),
                rendez: Rendez::new(),
            })
            .map(KqueueId)
            .map_err(|_| KernelError::ResourceExhausted { resource: "kqueue" })
    }

    pub fn remove(&mut self, id: KqueueId) -> Option<Kqueue> {
        self.kqueues.remove(id.0)
    }

    pub fn get(&self, id: KqueueId) -> KernelResult<&Kqueue> {
        self.kqueues.get(id.0).ok_or(KernelError::NotFound)
    }

    pub fn get_mut(&mut self, id: KqueueId) -> KernelResult<&mut Kqueue> {
        self.kqueues.get_mut(id.0).ok_or(KernelError::NotFound)
    }

    /// Record an activation; coalesces with an already-pending entry
    /// for the same vnode.
    fn post(&mut self, id: KqueueId, vnode: VNodeId, hint: NoteFlags) {
        if let Some(kq) = self.kqueues.get_mut(id.0) {
            match kq.pending.iter_mut().find(|(v, _)| *v == vnode) {
                Some((_, flags)) => *flags |= hint,
                None => kq.pending.push((vnode, hint)),
            }
        }
    }

    /// Harvest pending activations.
    pub fn drain(&mut self, id: KqueueId) -> Vec<(VNodeId, NoteFlags)> {
        self.kqueues
            .get_mut(id.0)
            .map(|kq| core::mem::take(&mut kq.pending))
            .unwrap_or_default()
    }
}

impl Default for KqueueTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn knote_fires_matching_filters_only() {
        let mut kqueues = KqueueTable::new();
        let kq = kqueues.create().unwrap();
        let vnode = VNodeId::from_u32(5);
        let mut list = alloc::vec![
            Knote {
                kq,
                filter: NoteFlags::NOTE_WRITE | NoteFlags::NOTE_ATTRIB,
                active: NoteFlags::empty(),
            },
            Knote {
                kq,
                filter: NoteFlags::NOTE_DELETE,
                active: NoteFlags::empty(),
            },
        ];
        knote(
            &mut kqueues,
            &mut list,
            vnode,
            NoteFlags::NOTE_WRITE | NoteFlags::NOTE_EXTEND,
        );
        assert_eq!(list[0].active, NoteFlags::NOTE_WRITE);
        assert!(list[1].active.is_empty());
        assert_eq!(kqueues.drain(kq), alloc::vec![(vnode, NoteFlags::NOTE_WRITE)]);
        assert!(kqueues.drain(kq).is_empty());
    }

    #[test]
    fn post_coalesces_per_vnode() {
        let mut kqueues = KqueueTable::new();
        let kq = kqueues.create().unwrap();
        let vnode = VNodeId::from_u32(5);
        kqueues.post(kq, vnode, NoteFlags::NOTE_WRITE);
        kqueues.post(kq, vnode, NoteFlags::NOTE_EXTEND);
        let drained = kqueues.drain(kq);
        assert_eq!(
            drained,
            alloc::vec![(vnode, NoteFlags::NOTE_WRITE | NoteFlags::NOTE_EXTEND)]
        );
    }
}
