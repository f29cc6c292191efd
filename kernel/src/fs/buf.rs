//! Buffered I/O cache
//!
//! Data clusters cached by (superblock, block-number) key, probed
//! through a hash table and recycled through an avail LRU. A buffer is
//! owned by at most one thread at a time: `buf_get` marks it BUSY for
//! the caller, a second taker blocks on `buf_list_rendez` until
//! `buf_release` broadcasts. Reclaiming a DIRTY buffer first writes it
//! back to the owning superblock's server; the caller performs that
//! round-trip and retries.

use alloc::collections::VecDeque;
use alloc::vec;
use alloc::vec::Vec;

use crate::arena::Arena;
use crate::define_id;
use crate::error::{KernelError, KernelResult};
use crate::fs::superblock::SbId;
use crate::hal::Hal;
use crate::kernel_panic;
use crate::proc::thread::{ThreadId, ThreadTable};
use crate::sched::Scheduler;
use crate::sync::rendez::{self, Rendez};
use crate::timer::TimerWheel;

define_id! {
    /// Handle into the buffer table.
    BufId
}

/// Number of cache buffers.
pub const NR_BUF: usize = 64;

/// Hash bucket count.
pub const NR_BUF_HASH: usize = 32;

/// Bytes per cached cluster.
pub const BUF_CLUSTER_SZ: usize = 4096;

/// Cache key: one cluster of one mounted filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufKey {
    pub sb: SbId,
    pub block: u64,
}

fn buf_hash(key: BufKey) -> usize {
    (key.sb.as_u32() as u64 ^ key.block.wrapping_mul(0x9e37_79b9_7f4a_7c15)) as usize % NR_BUF_HASH
}

/// One cache buffer.
pub struct Buf {
    /// Current identity; `None` for never-used buffers.
    key: Option<BufKey>,
    /// Exclusively held by this thread.
    owner: Option<ThreadId>,
    /// Contents reflect the identity (read or fully written).
    pub valid: bool,
    /// Contents newer than the server's copy.
    pub dirty: bool,
    pub data: Vec<u8>,
}

/// What `buf_get` found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufGet {
    /// The buffer is BUSY for the caller.
    Granted(BufId),
    /// The LRU victim is dirty: write `victim` back through the
    /// server, then `mark_clean` and retry.
    MustWriteback { victim: BufId },
}

/// The buffer cache.
pub struct BufCache {
    bufs: Arena<Buf>,
    hash: Vec<Vec<BufId>>,
    /// Reusable buffers, head oldest (LRU), tail most recent (MRU).
    avail: VecDeque<BufId>,
    /// Threads waiting for a busy buffer or for any buffer at all.
    pub rendez: Rendez,
}

impl BufCache {
    pub fn new() -> Self {
        let mut bufs = Arena::new("buf", NR_BUF);
        let mut avail = VecDeque::with_capacity(NR_BUF);
        for _ in 0..NR_BUF {
            let id = bufs
                .insert(Buf {
                    key: None,
                    owner: None,
                    valid: false,
                    dirty: false,
                    data: vec![0; BUF_CLUSTER_SZ],
                })
                .map(BufId)
                .unwrap_or_else(|_| kernel_panic!("buf table sized wrong"));
            avail.push_back(id);
        }
        let mut hash = Vec::with_capacity(NR_BUF_HASH);
        hash.resize_with(NR_BUF_HASH, Vec::new);
        Self {
            bufs,
            hash,
            avail,
            rendez: Rendez::new(),
        }
    }

    pub fn get_buf(&self, id: BufId) -> &Buf {
        self.bufs.get(id.0).unwrap_or_else(|| kernel_panic!("stale buf id"))
    }

    pub fn get_buf_mut(&mut self, id: BufId) -> &mut Buf {
        self.bufs
            .get_mut(id.0)
            .unwrap_or_else(|| kernel_panic!("stale buf id"))
    }

    pub fn key_of(&self, id: BufId) -> Option<BufKey> {
        self.get_buf(id).key
    }

    pub fn is_busy(&self, id: BufId) -> bool {
        self.get_buf(id).owner.is_some()
    }

    /// Find the buffer currently keyed `key`.
    pub fn probe(&self, key: BufKey) -> Option<BufId> {
        self.hash[buf_hash(key)]
            .iter()
            .copied()
            .find(|&id| self.get_buf(id).key == Some(key))
    }

    /// `buf_get`: acquire the buffer for `key`, BUSY, for the calling
    /// thread.
    ///
    /// Blocks (parks, `WouldBlock`) while another thread holds the
    /// buffer or while no buffer can be reclaimed. A dirty LRU victim
    /// is handed back as [`BufGet::MustWriteback`]; the caller performs
    /// the server round-trip, calls [`BufCache::mark_clean`], and
    /// retries.
    pub fn buf_get(
        &mut self,
        threads: &mut ThreadTable,
        sched: &mut Scheduler,
        hal: &dyn Hal,
        key: BufKey,
    ) -> KernelResult<BufGet> {
        let tid = sched.current();
        let _ = threads.get_mut(tid)?.take_wake_reason();

        if let Some(id) = self.probe(key) {
            let buf = self.get_buf(id);
            match buf.owner {
                // Idempotent retry: the caller already owns it.
                Some(owner) if owner == tid => return Ok(BufGet::Granted(id)),
                // At-most-one-owner: wait for the holder to release.
                Some(_) => {
                    return match rendez::task_sleep(threads, sched, hal, &mut self.rendez) {
                        Err(e) => Err(e),
                        Ok(()) => unreachable!("sleep always parks"),
                    };
                }
                None => {
                    self.remove_avail(id);
                    self.get_buf_mut(id).owner = Some(tid);
                    return Ok(BufGet::Granted(id));
                }
            }
        }

        // Miss: reclaim the LRU head.
        let victim = match self.avail.front().copied() {
            Some(victim) => victim,
            None => {
                // Every buffer is busy; wait for a release.
                return match rendez::task_sleep(threads, sched, hal, &mut self.rendez) {
                    Err(e) => Err(e),
                    Ok(()) => unreachable!("sleep always parks"),
                };
            }
        };
        if self.get_buf(victim).dirty {
            return Ok(BufGet::MustWriteback { victim });
        }

        // Rekey the victim for the caller.
        self.avail.pop_front();
        if let Some(old) = self.get_buf(victim).key {
            let bucket = &mut self.hash[buf_hash(old)];
            if let Some(pos) = bucket.iter().position(|&b| b == victim) {
                bucket.swap_remove(pos);
            }
        }
        {
            let buf = self.get_buf_mut(victim);
            buf.key = Some(key);
            buf.owner = Some(tid);
            buf.valid = false;
            buf.dirty = false;
            buf.data.fill(0);
        }
        self.hash[buf_hash(key)].push(victim);
        Ok(BufGet::Granted(victim))
    }

    /// `buf_release`: clear BUSY, push to the avail tail (MRU), and
    /// broadcast to waiters.
    pub fn buf_release(
        &mut self,
        threads: &mut ThreadTable,
        sched: &mut Scheduler,
        timers: &mut TimerWheel,
        id: BufId,
    ) -> KernelResult<()> {
        {
            let buf = self.get_buf_mut(id);
            if buf.owner.is_none() {
                kernel_panic!("release of un-owned buffer {:?}", id);
            }
            buf.owner = None;
        }
        self.avail.push_back(id);
        let mut rendez = core::mem::replace(&mut self.rendez, Rendez::new());
        let woke = rendez::task_wakeup(threads, sched, timers, &mut rendez);
        self.rendez = rendez;
        woke
    }

    /// Mark a buffer's contents newer than the server's copy.
    pub fn mark_dirty(&mut self, id: BufId) {
        self.get_buf_mut(id).dirty = true;
    }

    /// Writeback completed: the server's copy is current again.
    pub fn mark_clean(&mut self, id: BufId) {
        self.get_buf_mut(id).dirty = false;
    }

    pub fn mark_valid(&mut self, id: BufId) {
        self.get_buf_mut(id).valid = true;
    }

    fn remove_avail(&mut self, id: BufId) {
        if let Some(pos) = self.avail.iter().position(|&b| b == id) {
            self.avail.remove(pos);
        }
    }

    /// Discard every cached cluster of `sb` keyed in
    /// `[from_block, to_block)` (truncate, unlink teardown, unmount).
    /// Busy buffers are the caller's own and are left alone.
    pub fn purge(&mut self, sb: SbId, from_block: u64, to_block: u64) {
        let victims: Vec<BufId> = self
            .bufs
            .iter()
            .filter(|(_, b)| {
                b.owner.is_none()
                    && matches!(b.key, Some(k) if k.sb == sb
                        && k.block >= from_block
                        && k.block < to_block)
            })
            .map(|(h, _)| BufId(h))
            .collect();
        for id in victims {
            if let Some(old) = self.get_buf(id).key {
                let bucket = &mut self.hash[buf_hash(old)];
                if let Some(pos) = bucket.iter().position(|&b| b == id) {
                    bucket.swap_remove(pos);
                }
            }
            let buf = self.get_buf_mut(id);
            buf.key = None;
            buf.valid = false;
            buf.dirty = false;
        }
    }

    /// Dirty buffers of one superblock (explicit flush).
    pub fn dirty_bufs(&self, sb: SbId) -> Vec<BufId> {
        self.bufs
            .iter()
            .filter(|(_, b)| b.dirty && matches!(b.key, Some(k) if k.sb == sb))
            .map(|(h, _)| BufId(h))
            .collect()
    }
}

impl Default for BufCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::NullHal;
    use crate::proc::thread::{SchedPolicy, Thread, ThreadState};
    use crate::proc::ProcId;

    struct World {
        threads: ThreadTable,
        sched: Scheduler,
        timers: TimerWheel,
        hal: NullHal,
        cache: BufCache,
    }

    fn setup() -> World {
        let mut threads = ThreadTable::new(16);
        let idle = threads
            .insert(Thread::new_kthread(ProcId::from_u32(0), SchedPolicy::Other, 0))
            .unwrap();
        threads.get_mut(idle).unwrap().state = ThreadState::Running;
        World {
            threads,
            sched: Scheduler::new(idle),
            timers: TimerWheel::new(),
            hal: NullHal::new(),
            cache: BufCache::new(),
        }
    }

    fn spawn(w: &mut World) -> ThreadId {
        let tid = w
            .threads
            .insert(Thread::new(ProcId::from_u32(0), SchedPolicy::Rr, 20))
            .unwrap();
        w.sched.sched_ready(&mut w.threads, tid).unwrap();
        tid
    }

    fn key(block: u64) -> BufKey {
        BufKey {
            sb: SbId::from_u32(1),
            block,
        }
    }

    fn get_as(w: &mut World, tid: ThreadId, k: BufKey) -> KernelResult<BufGet> {
        w.sched.adopt(&mut w.threads, tid).unwrap();
        w.cache.buf_get(&mut w.threads, &mut w.sched, &w.hal, k)
    }

    #[test]
    fn get_assigns_identity_and_busy() {
        let mut w = setup();
        let t = spawn(&mut w);
        let got = get_as(&mut w, t, key(5)).unwrap();
        let id = match got {
            BufGet::Granted(id) => id,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(w.cache.key_of(id), Some(key(5)));
        assert!(w.cache.is_busy(id));
        assert_eq!(w.cache.probe(key(5)), Some(id));
    }

    #[test]
    fn second_taker_blocks_until_release() {
        let mut w = setup();
        let a = spawn(&mut w);
        let b = spawn(&mut w);
        let id = match get_as(&mut w, a, key(5)).unwrap() {
            BufGet::Granted(id) => id,
            other => panic!("unexpected {:?}", other),
        };
        let err = get_as(&mut w, b, key(5)).unwrap_err();
        assert_eq!(err, KernelError::WouldBlock);
        assert_eq!(w.threads.get(b).unwrap().state, ThreadState::Sleeping);

        w.sched.adopt(&mut w.threads, a).unwrap();
        w.cache
            .buf_release(&mut w.threads, &mut w.sched, &mut w.timers, id)
            .unwrap();
        assert_eq!(w.threads.get(b).unwrap().state, ThreadState::Ready);
        let again = get_as(&mut w, b, key(5)).unwrap();
        assert_eq!(again, BufGet::Granted(id));
        // Same buffer, same contents.
        assert_eq!(w.cache.key_of(id), Some(key(5)));
    }

    #[test]
    fn release_then_get_returns_same_buffer() {
        let mut w = setup();
        let t = spawn(&mut w);
        let id = match get_as(&mut w, t, key(9)).unwrap() {
            BufGet::Granted(id) => id,
            other => panic!("unexpected {:?}", other),
        };
        w.cache.get_buf_mut(id).data[0] = 0x42;
        w.cache.mark_valid(id);
        w.cache
            .buf_release(&mut w.threads, &mut w.sched, &mut w.timers, id)
            .unwrap();
        let again = get_as(&mut w, t, key(9)).unwrap();
        assert_eq!(again, BufGet::Granted(id));
        assert_eq!(w.cache.get_buf(id).data[0], 0x42);
        assert!(w.cache.get_buf(id).valid);
    }

    #[test]
    fn reclaim_of_dirty_victim_requires_writeback() {
        let mut w = setup();
        let t = spawn(&mut w);
        // Touch every buffer, dirtying block 0.
        for block in 0..NR_BUF as u64 {
            let id = match get_as(&mut w, t, key(block)).unwrap() {
                BufGet::Granted(id) => id,
                other => panic!("unexpected {:?}", other),
            };
            if block == 0 {
                w.cache.mark_dirty(id);
            }
            w.cache
                .buf_release(&mut w.threads, &mut w.sched, &mut w.timers, id)
                .unwrap();
        }
        // The LRU head is the dirty block 0 buffer.
        let got = get_as(&mut w, t, key(10_000)).unwrap();
        let victim = match got {
            BufGet::MustWriteback { victim } => victim,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(w.cache.key_of(victim), Some(key(0)));
        w.cache.mark_clean(victim);
        // Retry rekeys the victim.
        let got = get_as(&mut w, t, key(10_000)).unwrap();
        assert_eq!(got, BufGet::Granted(victim));
        assert_eq!(w.cache.key_of(victim), Some(key(10_000)));
        assert_eq!(w.cache.probe(key(0)), None);
    }

    #[test]
    fn no_two_buffers_share_a_key() {
        let mut w = setup();
        let t = spawn(&mut w);
        let a = match get_as(&mut w, t, key(7)).unwrap() {
            BufGet::Granted(id) => id,
            other => panic!("unexpected {:?}", other),
        };
        w.cache
            .buf_release(&mut w.threads, &mut w.sched, &mut w.timers, a)
            .unwrap();
        let b = match get_as(&mut w, t, key(7)).unwrap() {
            BufGet::Granted(id) => id,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(a, b);
        let mut seen = 0;
        for bucket in &w.cache.hash {
            seen += bucket
                .iter()
                .filter(|&&id| w.cache.get_buf(id).key == Some(key(7)))
                .count();
        }
        assert_eq!(seen, 1);
    }

    #[test]
    fn purge_drops_clusters_past_offset() {
        let mut w = setup();
        let t = spawn(&mut w);
        for block in [1u64, 2, 3] {
            let id = match get_as(&mut w, t, key(block)).unwrap() {
                BufGet::Granted(id) => id,
                other => panic!("unexpected {:?}", other),
            };
            w.cache
                .buf_release(&mut w.threads, &mut w.sched, &mut w.timers, id)
                .unwrap();
        }
        w.cache.purge(SbId::from_u32(1), 2, u64::MAX);
        assert!(w.cache.probe(key(1)).is_some());
        assert!(w.cache.probe(key(2)).is_none());
        assert!(w.cache.probe(key(3)).is_none());
    }
}
