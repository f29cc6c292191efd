//! Reader/writer lock with drain semantics
//!
//! The lock tracks its sharers, at most one exclusive owner, and a
//! draining flag. Requests are the classic six: SHARED, EXCLUSIVE,
//! UPGRADE, DOWNGRADE, DRAIN and RELEASE. DRAIN gates out new sharers
//! and exclusives the moment it is requested, waits for every holder to
//! leave, and is used for object teardown; a caller already holding the
//! lock exclusively drains without blocking.
//!
//! Fairness is writer-preferring with FIFO ties: a release that leaves
//! the lock free hands it directly to the first exclusive-class waiter
//! (drain, exclusive) before any sharer is admitted, and a pending
//! upgrade by the sole remaining sharer beats both. Handoff installs
//! the waiter's hold before it wakes, so a woken waiter's requested
//! mode already holds; the retried request finds its own hold recorded
//! and succeeds without re-counting.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::error::KernelResult;
use crate::hal::Hal;
use crate::kernel_panic;
use crate::proc::thread::{ThreadId, ThreadTable, WakeReason};
use crate::sched::Scheduler;
use crate::sync::rendez::{self, Rendez};
use crate::timer::TimerWheel;

/// Lock request types for [`RwLock::lock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockRequest {
    /// Acquire shared; blocks while an exclusive holder or a drain is
    /// present.
    Shared,
    /// Acquire exclusive; blocks while any holder or drain is present.
    Exclusive,
    /// Atomically turn the caller's shared hold into exclusive; blocks
    /// while any other sharer is present.
    Upgrade,
    /// Turn the caller's exclusive hold into shared with no window.
    Downgrade,
    /// Release the caller's hold.
    Release,
    /// Gate out new holders and wait for all current ones to leave.
    Drain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitClass {
    Shared,
    Exclusive,
    Upgrade,
    Drain,
}

/// Shared/exclusive reader-writer lock.
pub struct RwLock {
    rendez: Rendez,
    /// Threads holding the lock shared.
    sharers: Vec<ThreadId>,
    /// Thread holding the lock exclusively (or draining).
    exclusive_owner: Option<ThreadId>,
    is_draining: bool,
    /// Set while the exclusive owner acquired through DRAIN; its
    /// release ends the drain.
    drained_by: Option<ThreadId>,
    waiters: VecDeque<(ThreadId, WaitClass)>,
}

impl RwLock {
    pub fn new() -> Self {
        Self {
            rendez: Rendez::new(),
            sharers: Vec::new(),
            exclusive_owner: None,
            is_draining: false,
            drained_by: None,
            waiters: VecDeque::new(),
        }
    }

    pub fn share_cnt(&self) -> u32 {
        self.sharers.len() as u32
    }

    pub fn exclusive_cnt(&self) -> u32 {
        self.exclusive_owner.is_some() as u32
    }

    pub fn is_draining(&self) -> bool {
        self.is_draining
    }

    pub fn is_unlocked(&self) -> bool {
        self.sharers.is_empty() && self.exclusive_owner.is_none() && !self.is_draining
    }

    pub fn held_shared_by(&self, tid: ThreadId) -> bool {
        self.sharers.contains(&tid)
    }

    pub fn held_exclusively_by(&self, tid: ThreadId) -> bool {
        self.exclusive_owner == Some(tid)
    }

    fn enqueue_waiter(&mut self, tid: ThreadId, class: WaitClass) {
        if !self.waiters.iter().any(|&(t, _)| t == tid) {
            self.waiters.push_back((tid, class));
        }
    }

    /// Issue a lock request on behalf of the current thread.
    ///
    /// A request that must wait parks the thread on the lock's Rendez
    /// and reports `WouldBlock`; the release path installs the hold
    /// before waking the waiter, so the re-issued request finds its own
    /// hold recorded and returns at once.
    pub fn lock(
        &mut self,
        threads: &mut ThreadTable,
        sched: &mut Scheduler,
        timers: &mut TimerWheel,
        hal: &dyn Hal,
        request: LockRequest,
    ) -> KernelResult<()> {
        let tid = sched.current();
        // Grant detection is by recorded holds, not wake reason; clear
        // any reason left from the park so later operations never
        // misread it.
        let _ = threads.get_mut(tid)?.take_wake_reason();
        match request {
            LockRequest::Shared => {
                if self.held_shared_by(tid) {
                    return Ok(());
                }
                if self.exclusive_owner.is_some() || self.is_draining {
                    self.enqueue_waiter(tid, WaitClass::Shared);
                    return rendez::task_sleep(threads, sched, hal, &mut self.rendez);
                }
                self.sharers.push(tid);
                Ok(())
            }
            LockRequest::Exclusive => {
                if self.held_exclusively_by(tid) {
                    return Ok(());
                }
                if !self.sharers.is_empty() || self.exclusive_owner.is_some() || self.is_draining
                {
                    self.enqueue_waiter(tid, WaitClass::Exclusive);
                    return rendez::task_sleep(threads, sched, hal, &mut self.rendez);
                }
                self.exclusive_owner = Some(tid);
                Ok(())
            }
            LockRequest::Upgrade => {
                if self.held_exclusively_by(tid) {
                    // Granted by a release while we were parked.
                    return Ok(());
                }
                if !self.held_shared_by(tid) {
                    kernel_panic!("upgrade of rwlock not held shared");
                }
                if self.sharers.len() == 1 {
                    self.sharers.clear();
                    self.exclusive_owner = Some(tid);
                    return Ok(());
                }
                // Keep our shared hold while waiting out the others.
                self.enqueue_waiter(tid, WaitClass::Upgrade);
                rendez::task_sleep(threads, sched, hal, &mut self.rendez)
            }
            LockRequest::Downgrade => {
                if !self.held_exclusively_by(tid) {
                    kernel_panic!("downgrade of rwlock not held exclusive");
                }
                self.exclusive_owner = None;
                self.drained_by = None;
                self.sharers.push(tid);
                // Queued sharers may join us; exclusives stay parked.
                self.grant_waiters(threads, sched, timers)
            }
            LockRequest::Drain => {
                if self.held_exclusively_by(tid) {
                    // Reentrant drain, or the grant from a release.
                    self.is_draining = true;
                    self.drained_by = Some(tid);
                    return Ok(());
                }
                // Gate out new holders immediately.
                self.is_draining = true;
                if self.sharers.is_empty() && self.exclusive_owner.is_none() {
                    self.exclusive_owner = Some(tid);
                    self.drained_by = Some(tid);
                    return Ok(());
                }
                self.enqueue_waiter(tid, WaitClass::Drain);
                rendez::task_sleep(threads, sched, hal, &mut self.rendez)
            }
            LockRequest::Release => self.release(threads, sched, timers, tid),
        }
    }

    fn release(
        &mut self,
        threads: &mut ThreadTable,
        sched: &mut Scheduler,
        timers: &mut TimerWheel,
        tid: ThreadId,
    ) -> KernelResult<()> {
        if self.held_exclusively_by(tid) {
            self.exclusive_owner = None;
            if self.drained_by == Some(tid) {
                self.is_draining = false;
                self.drained_by = None;
            }
        } else if let Some(pos) = self.sharers.iter().position(|&t| t == tid) {
            self.sharers.swap_remove(pos);
        } else {
            kernel_panic!("release of rwlock not held by caller");
        }
        self.grant_waiters(threads, sched, timers)
    }

    /// Hand the lock to waiters: the sole remaining sharer's pending
    /// upgrade first, then the first exclusive-class waiter once the
    /// lock is free, else every shared waiter unless a drain gates the
    /// lock.
    fn grant_waiters(
        &mut self,
        threads: &mut ThreadTable,
        sched: &mut Scheduler,
        timers: &mut TimerWheel,
    ) -> KernelResult<()> {
        // Pending upgrade with the upgrader as sole remaining sharer.
        if self.exclusive_owner.is_none() && self.sharers.len() == 1 {
            let sole = self.sharers[0];
            if let Some(pos) = self
                .waiters
                .iter()
                .position(|&(t, c)| c == WaitClass::Upgrade && t == sole)
            {
                self.waiters.remove(pos);
                self.sharers.clear();
                self.exclusive_owner = Some(sole);
                return rendez::task_wakeup_specific(
                    threads,
                    sched,
                    timers,
                    &mut self.rendez,
                    sole,
                    WakeReason::Normal,
                );
            }
        }

        if !self.sharers.is_empty() || self.exclusive_owner.is_some() {
            return Ok(());
        }

        // Lock is free: exclusive-class waiters first, FIFO.
        if let Some(pos) = self
            .waiters
            .iter()
            .position(|&(_, c)| matches!(c, WaitClass::Drain | WaitClass::Exclusive))
        {
            let (tid, class) = self.waiters.remove(pos).unwrap();
            self.exclusive_owner = Some(tid);
            if class == WaitClass::Drain {
                self.is_draining = true;
                self.drained_by = Some(tid);
            }
            return rendez::task_wakeup_specific(
                threads,
                sched,
                timers,
                &mut self.rendez,
                tid,
                WakeReason::Normal,
            );
        }

        // No exclusives pending: admit every sharer, unless draining.
        if self.is_draining {
            return Ok(());
        }
        while let Some(pos) = self
            .waiters
            .iter()
            .position(|&(_, c)| c == WaitClass::Shared)
        {
            let (tid, _) = self.waiters.remove(pos).unwrap();
            self.sharers.push(tid);
            rendez::task_wakeup_specific(
                threads,
                sched,
                timers,
                &mut self.rendez,
                tid,
                WakeReason::Normal,
            )?;
        }
        Ok(())
    }

    /// Drop a parked waiter (thread exit while queued). A forgotten
    /// drain request lifts its gate if no other drainer remains.
    pub fn forget_waiter(
        &mut self,
        threads: &mut ThreadTable,
        sched: &mut Scheduler,
        timers: &mut TimerWheel,
        tid: ThreadId,
    ) -> KernelResult<()> {
        if let Some(pos) = self.waiters.iter().position(|&(t, _)| t == tid) {
            let (_, class) = self.waiters.remove(pos).unwrap();
            if class == WaitClass::Drain
                && self.drained_by.is_none()
                && !self.waiters.iter().any(|&(_, c)| c == WaitClass::Drain)
            {
                self.is_draining = false;
                self.grant_waiters(threads, sched, timers)?;
            }
        }
        Ok(())
    }
}

impl Default for RwLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KernelError;
    use crate::hal::NullHal;
    use crate::proc::thread::{SchedPolicy, Thread, ThreadState};
    use crate::proc::ProcId;

    struct World {
        threads: ThreadTable,
        sched: Scheduler,
        timers: TimerWheel,
        hal: NullHal,
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
        }
    }

    fn spawn(w: &mut World, prio: u8) -> ThreadId {
        let tid = w
            .threads
            .insert(Thread::new(ProcId::from_u32(0), SchedPolicy::Rr, prio))
            .unwrap();
        w.sched.sched_ready(&mut w.threads, tid).unwrap();
        tid
    }

    fn lock_as(
        w: &mut World,
        lock: &mut RwLock,
        tid: ThreadId,
        req: LockRequest,
    ) -> KernelResult<()> {
        w.sched.adopt(&mut w.threads, tid).unwrap();
        lock.lock(&mut w.threads, &mut w.sched, &mut w.timers, &w.hal, req)
    }

    #[test]
    fn shared_holders_coexist() {
        let mut w = setup();
        let mut lock = RwLock::new();
        let a = spawn(&mut w, 20);
        let b = spawn(&mut w, 20);
        lock_as(&mut w, &mut lock, a, LockRequest::Shared).unwrap();
        lock_as(&mut w, &mut lock, b, LockRequest::Shared).unwrap();
        assert_eq!(lock.share_cnt(), 2);
        lock_as(&mut w, &mut lock, a, LockRequest::Release).unwrap();
        lock_as(&mut w, &mut lock, b, LockRequest::Release).unwrap();
        assert!(lock.is_unlocked());
    }

    #[test]
    fn exclusive_excludes_shared() {
        let mut w = setup();
        let mut lock = RwLock::new();
        let a = spawn(&mut w, 20);
        let b = spawn(&mut w, 20);
        lock_as(&mut w, &mut lock, a, LockRequest::Exclusive).unwrap();
        let err = lock_as(&mut w, &mut lock, b, LockRequest::Shared).unwrap_err();
        assert_eq!(err, KernelError::WouldBlock);
        assert_eq!(w.threads.get(b).unwrap().state, ThreadState::Sleeping);

        lock_as(&mut w, &mut lock, a, LockRequest::Release).unwrap();
        // Handoff installed b's share before it woke.
        assert_eq!(lock.share_cnt(), 1);
        assert!(lock.held_shared_by(b));
        assert_eq!(w.threads.get(b).unwrap().state, ThreadState::Ready);
        lock_as(&mut w, &mut lock, b, LockRequest::Shared).unwrap();
        assert_eq!(lock.share_cnt(), 1);
    }

    #[test]
    fn writer_preferred_over_reader_on_release() {
        let mut w = setup();
        let mut lock = RwLock::new();
        let holder = spawn(&mut w, 20);
        let writer = spawn(&mut w, 20);
        let reader = spawn(&mut w, 20);
        lock_as(&mut w, &mut lock, holder, LockRequest::Exclusive).unwrap();
        // Reader queues first, writer second.
        assert!(lock_as(&mut w, &mut lock, reader, LockRequest::Shared).is_err());
        assert!(lock_as(&mut w, &mut lock, writer, LockRequest::Exclusive).is_err());

        lock_as(&mut w, &mut lock, holder, LockRequest::Release).unwrap();
        // The writer got the lock despite queueing later.
        assert!(lock.held_exclusively_by(writer));
        assert_eq!(w.threads.get(writer).unwrap().state, ThreadState::Ready);
        assert_eq!(w.threads.get(reader).unwrap().state, ThreadState::Sleeping);
        lock_as(&mut w, &mut lock, writer, LockRequest::Exclusive).unwrap();

        lock_as(&mut w, &mut lock, writer, LockRequest::Release).unwrap();
        assert!(lock.held_shared_by(reader));
        lock_as(&mut w, &mut lock, reader, LockRequest::Shared).unwrap();
    }

    #[test]
    fn upgrade_waits_for_other_sharers() {
        let mut w = setup();
        let mut lock = RwLock::new();
        let a = spawn(&mut w, 20);
        let b = spawn(&mut w, 20);
        lock_as(&mut w, &mut lock, a, LockRequest::Shared).unwrap();
        lock_as(&mut w, &mut lock, b, LockRequest::Shared).unwrap();

        let err = lock_as(&mut w, &mut lock, a, LockRequest::Upgrade).unwrap_err();
        assert_eq!(err, KernelError::WouldBlock);

        lock_as(&mut w, &mut lock, b, LockRequest::Release).unwrap();
        assert!(lock.held_exclusively_by(a));
        assert_eq!(lock.share_cnt(), 0);
        lock_as(&mut w, &mut lock, a, LockRequest::Upgrade).unwrap();
    }

    #[test]
    fn sole_sharer_upgrades_without_blocking() {
        let mut w = setup();
        let mut lock = RwLock::new();
        let a = spawn(&mut w, 20);
        lock_as(&mut w, &mut lock, a, LockRequest::Shared).unwrap();
        lock_as(&mut w, &mut lock, a, LockRequest::Upgrade).unwrap();
        assert!(lock.held_exclusively_by(a));
    }

    #[test]
    fn downgrade_leaves_no_window() {
        let mut w = setup();
        let mut lock = RwLock::new();
        let a = spawn(&mut w, 20);
        let b = spawn(&mut w, 20);
        lock_as(&mut w, &mut lock, a, LockRequest::Exclusive).unwrap();
        assert!(lock_as(&mut w, &mut lock, b, LockRequest::Shared).is_err());

        lock_as(&mut w, &mut lock, a, LockRequest::Downgrade).unwrap();
        // Both the downgrader and the queued sharer hold shares now.
        assert_eq!(lock.exclusive_cnt(), 0);
        assert_eq!(lock.share_cnt(), 2);
        assert!(lock.held_shared_by(a));
        assert!(lock.held_shared_by(b));
        lock_as(&mut w, &mut lock, b, LockRequest::Shared).unwrap();
    }

    #[test]
    fn drain_gates_new_holders_until_released() {
        let mut w = setup();
        let mut lock = RwLock::new();
        let holder = spawn(&mut w, 20);
        let drainer = spawn(&mut w, 20);
        let late_reader = spawn(&mut w, 20);
        let late_writer = spawn(&mut w, 20);

        lock_as(&mut w, &mut lock, holder, LockRequest::Shared).unwrap();
        assert!(lock_as(&mut w, &mut lock, drainer, LockRequest::Drain).is_err());
        assert!(lock.is_draining());

        // New requests of either kind block behind the drain.
        assert!(lock_as(&mut w, &mut lock, late_reader, LockRequest::Shared).is_err());
        assert!(lock_as(&mut w, &mut lock, late_writer, LockRequest::Exclusive).is_err());

        lock_as(&mut w, &mut lock, holder, LockRequest::Release).unwrap();
        assert!(lock.is_draining());
        assert!(lock.held_exclusively_by(drainer));
        lock_as(&mut w, &mut lock, drainer, LockRequest::Drain).unwrap();

        // Sharers stay blocked while the drainer holds the lock.
        assert_eq!(
            w.threads.get(late_reader).unwrap().state,
            ThreadState::Sleeping
        );

        lock_as(&mut w, &mut lock, drainer, LockRequest::Release).unwrap();
        assert!(!lock.is_draining());
        // Exclusive waiter is preferred at release.
        assert!(lock.held_exclusively_by(late_writer));
        lock_as(&mut w, &mut lock, late_writer, LockRequest::Exclusive).unwrap();
        lock_as(&mut w, &mut lock, late_writer, LockRequest::Release).unwrap();
        assert!(lock.held_shared_by(late_reader));
        lock_as(&mut w, &mut lock, late_reader, LockRequest::Shared).unwrap();
        assert_eq!(lock.share_cnt(), 1);
    }

    #[test]
    fn reentrant_drain_does_not_block() {
        let mut w = setup();
        let mut lock = RwLock::new();
        let a = spawn(&mut w, 20);
        lock_as(&mut w, &mut lock, a, LockRequest::Exclusive).unwrap();
        lock_as(&mut w, &mut lock, a, LockRequest::Drain).unwrap();
        assert!(lock.is_draining());
        lock_as(&mut w, &mut lock, a, LockRequest::Release).unwrap();
        assert!(lock.is_unlocked());
    }

    #[test]
    fn retried_acquire_is_idempotent() {
        let mut w = setup();
        let mut lock = RwLock::new();
        let a = spawn(&mut w, 20);
        lock_as(&mut w, &mut lock, a, LockRequest::Shared).unwrap();
        // The trampoline may re-run an op from the top; a second
        // shared request by the same holder must not double-count.
        lock_as(&mut w, &mut lock, a, LockRequest::Shared).unwrap();
        assert_eq!(lock.share_cnt(), 1);
        lock_as(&mut w, &mut lock, a, LockRequest::Release).unwrap();
        assert!(lock.is_unlocked());
    }
}
