//! Futexes
//!
//! Fast user-space mutexes, keyed on (process, user virtual address)
//! and hashed for lookup. A futex is created lazily on the first wait,
//! freed again when its last waiter departs, and torn down with its
//! process. `wait` re-reads the user word after the kernel takes over
//! and refuses to sleep when it no longer matches the expected value;
//! `wake` releases waiters FIFO; `requeue` wakes some waiters and moves
//! the rest to another address without waking them.

use alloc::vec::Vec;

use crate::arena::Arena;
use crate::define_id;
use crate::error::{KernelError, KernelResult};
use crate::hal::Hal;
use crate::mm::{self, FrameAllocator, PmapId, PmapTable};
use crate::proc::thread::{Intr, ThreadTable, WakeReason};
use crate::proc::ProcId;
use crate::sched::Scheduler;
use crate::sync::rendez::{self, Rendez};
use crate::timer::TimerWheel;

/// Maximum number of futexes in the system.
pub const NR_FUTEX: usize = 4096;

/// Hash table size for (process, address) lookup.
pub const FUTEX_HASH_SZ: usize = 128;

define_id! {
    /// Handle into the futex table.
    FutexId
}

struct Futex {
    proc: ProcId,
    uaddr: usize,
    rendez: Rendez,
}

fn futex_hash(proc: ProcId, uaddr: usize) -> usize {
    let h = proc.as_u32() as usize ^ (uaddr >> 2).wrapping_mul(0x9e37_79b9);
    h % FUTEX_HASH_SZ
}

/// The system-wide futex table.
pub struct FutexTable {
    futexes: Arena<Futex>,
    hash: Vec<Vec<FutexId>>,
}

impl FutexTable {
    pub fn new() -> Self {
        let mut hash = Vec::with_capacity(FUTEX_HASH_SZ);
        hash.resize_with(FUTEX_HASH_SZ, Vec::new);
        Self {
            futexes: Arena::new("futex", NR_FUTEX),
            hash,
        }
    }

    pub fn len(&self) -> usize {
        self.futexes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.futexes.is_empty()
    }

    fn find(&self, proc: ProcId, uaddr: usize) -> Option<FutexId> {
        self.hash[futex_hash(proc, uaddr)]
            .iter()
            .copied()
            .find(|&id| {
                self.futexes
                    .get(id.0)
                    .map(|f| f.proc == proc && f.uaddr == uaddr)
                    .unwrap_or(false)
            })
    }

    fn get_or_create(&mut self, proc: ProcId, uaddr: usize) -> KernelResult<FutexId> {
        if let Some(id) = self.find(proc, uaddr) {
            return Ok(id);
        }
        let id = self
            .futexes
            .insert(Futex {
                proc,
                uaddr,
                rendez: Rendez::new(),
            })
            .map(FutexId)
            .map_err(|_| KernelError::ResourceExhausted { resource: "futex" })?;
        self.hash[futex_hash(proc, uaddr)].push(id);
        Ok(id)
    }

    fn free(&mut self, id: FutexId) {
        if let Some(futex) = self.futexes.remove(id.0) {
            let bucket = &mut self.hash[futex_hash(futex.proc, futex.uaddr)];
            if let Some(pos) = bucket.iter().position(|&f| f == id) {
                bucket.swap_remove(pos);
            }
        }
    }

    /// Free the futex when no genuine waiter remains (last-departure
    /// teardown).
    fn collect_if_idle(&mut self, threads: &ThreadTable, id: FutexId) {
        let idle = self
            .futexes
            .get(id.0)
            .map(|f| !f.rendez.has_sleepers(threads))
            .unwrap_or(false);
        if idle {
            self.free(id);
        }
    }

    /// `futex_wait`: sleep until woken, as long as the user word still
    /// holds `val`.
    ///
    /// Returns `-EAGAIN` without sleeping when the word differs,
    /// `-ETIMEDOUT` when `timeout_jiffies` expires first, `-EINTR` on a
    /// signal. `pending` carries the causes already asserted against
    /// the calling thread.
    #[allow(clippy::too_many_arguments)]
    pub fn wait(
        &mut self,
        threads: &mut ThreadTable,
        sched: &mut Scheduler,
        timers: &mut TimerWheel,
        hal: &dyn Hal,
        pmaps: &mut PmapTable,
        frames: &mut FrameAllocator,
        proc: ProcId,
        pmap: PmapId,
        uaddr: usize,
        val: u32,
        timeout_jiffies: Option<u64>,
        pending: Intr,
    ) -> KernelResult<()> {
        let tid = sched.current();
        if let Some(reason) = threads.get_mut(tid)?.take_wake_reason() {
            // Re-issued after a park: the wake reason decides.
            if let Some(id) = self.find(proc, uaddr) {
                self.collect_if_idle(threads, id);
            }
            return match reason {
                WakeReason::Normal => Ok(()),
                WakeReason::Timeout => Err(KernelError::TimedOut),
                WakeReason::Signal | WakeReason::Cancel | WakeReason::Event => {
                    Err(KernelError::Interrupted)
                }
            };
        }

        let current = mm::read_user_u32(pmaps, frames, hal, pmap, uaddr)?;
        if current != val {
            return Err(KernelError::TryAgain);
        }

        let id = self.get_or_create(proc, uaddr)?;
        let futex = self.futexes.get_mut(id.0).unwrap();
        match timeout_jiffies {
            Some(jiffies) => rendez::task_sleep_timeout(
                threads,
                sched,
                timers,
                hal,
                &mut futex.rendez,
                jiffies,
                Intr::SIGNAL,
                pending,
            ),
            None => rendez::task_sleep_interruptible(
                threads,
                sched,
                hal,
                &mut futex.rendez,
                Intr::SIGNAL,
                pending,
            ),
        }
    }

    /// `futex_wake`: wake at most `n` waiters, FIFO. Returns the
    /// number woken.
    pub fn wake(
        &mut self,
        threads: &mut ThreadTable,
        sched: &mut Scheduler,
        timers: &mut TimerWheel,
        proc: ProcId,
        uaddr: usize,
        n: u32,
    ) -> KernelResult<u32> {
        let id = match self.find(proc, uaddr) {
            Some(id) => id,
            None => return Ok(0),
        };
        let mut woken = 0;
        while woken < n {
            let futex = self.futexes.get_mut(id.0).unwrap();
            if !rendez::task_wakeup_one(threads, sched, timers, &mut futex.rendez)? {
                break;
            }
            woken += 1;
        }
        self.collect_if_idle(threads, id);
        Ok(woken)
    }

    /// `futex_requeue`: wake `n` waiters of `uaddr` and move up to `m`
    /// more onto `uaddr2` without waking them. Returns (woken, moved).
    #[allow(clippy::too_many_arguments)]
    pub fn requeue(
        &mut self,
        threads: &mut ThreadTable,
        sched: &mut Scheduler,
        timers: &mut TimerWheel,
        proc: ProcId,
        uaddr: usize,
        n: u32,
        uaddr2: usize,
        m: u32,
    ) -> KernelResult<(u32, u32)> {
        let woken = self.wake(threads, sched, timers, proc, uaddr, n)?;
        let src = match self.find(proc, uaddr) {
            Some(id) => id,
            None => return Ok((woken, 0)),
        };
        let dst = self.get_or_create(proc, uaddr2)?;
        // Two distinct arena slots: split the borrows by taking the
        // source rendez out while we move its sleepers.
        let mut src_rendez = {
            let futex = self.futexes.get_mut(src.0).unwrap();
            core::mem::replace(&mut futex.rendez, Rendez::new())
        };
        let moved = {
            let dst_futex = self.futexes.get_mut(dst.0).unwrap();
            src_rendez.requeue_to(threads, &mut dst_futex.rendez, m as usize)
        };
        self.futexes.get_mut(src.0).unwrap().rendez = src_rendez;
        self.collect_if_idle(threads, src);
        self.collect_if_idle(threads, dst);
        Ok((woken, moved as u32))
    }

    /// `futex_destroy`: explicitly drop a futex with no waiters.
    pub fn destroy(&mut self, threads: &ThreadTable, proc: ProcId, uaddr: usize) -> KernelResult<()> {
        match self.find(proc, uaddr) {
            Some(id) => {
                let busy = self
                    .futexes
                    .get(id.0)
                    .map(|f| f.rendez.has_sleepers(threads))
                    .unwrap_or(false);
                if busy {
                    return Err(KernelError::TryAgain);
                }
                self.free(id);
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// `fini_futexes`: tear down every futex of an exiting process.
    /// Its threads are already gone, so no waiters can remain.
    pub fn fini_process(&mut self, proc: ProcId) {
        let ids: Vec<FutexId> = self
            .futexes
            .iter()
            .filter(|(_, f)| f.proc == proc)
            .map(|(h, _)| FutexId(h))
            .collect();
        for id in ids {
            self.free(id);
        }
    }
}

impl Default for FutexTable {
    fn default() -> Self {
        Self::new()
    }
}
