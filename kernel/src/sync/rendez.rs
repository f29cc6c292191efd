//! Rendez: the kernel's condition variable
//!
//! A Rendez is not a lock, only a rendezvous point: a list of blocked
//! threads. `task_sleep` parks the calling thread and yields the CPU;
//! `task_wakeup` makes every parked thread READY; the interruptible and
//! timed variants filter which asynchronous causes (signal, event,
//! cancel, timer) may end the sleep early.
//!
//! Parking is expressed to the caller as `KernelError::WouldBlock`: the
//! syscall trampoline re-issues the operation when the thread is next
//! dispatched, and the operation consumes the recorded wake reason to
//! decide between retrying, succeeding, `-EINTR` and `-ETIMEDOUT`.

use alloc::collections::VecDeque;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::error::{KernelError, KernelResult};
use crate::hal::Hal;
use crate::proc::thread::{Intr, ThreadId, ThreadState, ThreadTable, WakeReason};
use crate::sched::Scheduler;
use crate::timer::TimerWheel;

static NEXT_RENDEZ_ID: AtomicU32 = AtomicU32::new(1);

/// A blocked-thread list.
///
/// Each Rendez carries a unique id; a sleeping thread records the id of
/// the Rendez it is parked on, so entries left behind by an interrupted
/// sleep are recognized as stale and skipped.
pub struct Rendez {
    id: u32,
    blocked: VecDeque<ThreadId>,
}

impl Rendez {
    pub fn new() -> Self {
        Self {
            id: NEXT_RENDEZ_ID.fetch_add(1, Ordering::Relaxed),
            blocked: VecDeque::new(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Threads genuinely parked here, in FIFO order.
    pub fn sleepers(&self, threads: &ThreadTable) -> alloc::vec::Vec<ThreadId> {
        self.blocked
            .iter()
            .copied()
            .filter(|&tid| is_parked_here(threads, self.id, tid))
            .collect()
    }

    pub fn has_sleepers(&self, threads: &ThreadTable) -> bool {
        self.blocked
            .iter()
            .any(|&tid| is_parked_here(threads, self.id, tid))
    }
}

impl Default for Rendez {
    fn default() -> Self {
        Self::new()
    }
}

impl Rendez {
    /// Append an already-parked thread (boot-time kernel-thread setup;
    /// the thread's state and `sleeping_on` are maintained by the
    /// caller).
    pub fn push_sleeper(&mut self, tid: ThreadId) {
        self.blocked.push_back(tid);
    }

    /// Move up to `n` parked threads to `other` without waking them
    /// (futex requeue). Returns the number moved.
    pub fn requeue_to(&mut self, threads: &mut ThreadTable, other: &mut Rendez, n: usize) -> usize {
        let mut moved = 0;
        let mut scan = self.blocked.len();
        while moved < n && scan > 0 {
            scan -= 1;
            let tid = match self.blocked.pop_front() {
                Some(tid) => tid,
                None => break,
            };
            if is_parked_here(threads, self.id, tid) {
                if let Ok(thread) = threads.get_mut(tid) {
                    thread.sleeping_on = Some(other.id);
                }
                other.blocked.push_back(tid);
                moved += 1;
            }
        }
        moved
    }
}

fn is_parked_here(threads: &ThreadTable, rendez_id: u32, tid: ThreadId) -> bool {
    threads
        .get(tid)
        .map(|t| t.state == ThreadState::Sleeping && t.sleeping_on == Some(rendez_id))
        .unwrap_or(false)
}

fn park(
    threads: &mut ThreadTable,
    sched: &mut Scheduler,
    hal: &dyn Hal,
    rendez: &mut Rendez,
    mask: Intr,
) -> KernelResult<()> {
    let tid = sched.current();
    {
        let thread = threads.get_mut(tid)?;
        thread.state = ThreadState::Sleeping;
        thread.sleeping_on = Some(rendez.id);
        thread.intr_mask = mask;
        thread.wake_reason = None;
    }
    rendez.blocked.push_back(tid);
    sched.reschedule(threads, hal)?;
    Err(KernelError::WouldBlock)
}

/// `TaskSleep`: park the calling thread unconditionally; only a
/// `task_wakeup` ends the sleep.
pub fn task_sleep(
    threads: &mut ThreadTable,
    sched: &mut Scheduler,
    hal: &dyn Hal,
    rendez: &mut Rendez,
) -> KernelResult<()> {
    park(threads, sched, hal, rendez, Intr::NONE)
}

/// `TaskSleepInterruptible`: park the calling thread, letting any cause
/// in `mask` end the sleep with `-EINTR`. `pending` carries the causes
/// already asserted against the thread; a pending cause in the mask
/// aborts the sleep immediately without consuming the cause.
pub fn task_sleep_interruptible(
    threads: &mut ThreadTable,
    sched: &mut Scheduler,
    hal: &dyn Hal,
    rendez: &mut Rendez,
    mask: Intr,
    pending: Intr,
) -> KernelResult<()> {
    if !(pending & mask).is_empty() {
        return Err(KernelError::Interrupted);
    }
    park(threads, sched, hal, rendez, mask)
}

/// `TaskSleepTimeout`: interruptible sleep bounded by a kernel timer.
/// On expiry the sleeper is woken with reason `Timeout` and the
/// operation reports `-ETIMEDOUT`.
pub fn task_sleep_timeout(
    threads: &mut ThreadTable,
    sched: &mut Scheduler,
    timers: &mut TimerWheel,
    hal: &dyn Hal,
    rendez: &mut Rendez,
    timeout_jiffies: u64,
    mask: Intr,
    pending: Intr,
) -> KernelResult<()> {
    let mask = mask | Intr::TIMER;
    if !(pending & mask).is_empty() {
        return Err(KernelError::Interrupted);
    }
    let tid = sched.current();
    let timer = timers.arm_sleep_timeout(tid, timeout_jiffies)?;
    threads.get_mut(tid)?.sleep_timer = Some(timer);
    park(threads, sched, hal, rendez, mask)
}

/// Make one thread runnable again with the given reason. Disarms any
/// sleep timer, clears the park record and appends the thread at the
/// tail of its priority level.
fn make_runnable(
    threads: &mut ThreadTable,
    sched: &mut Scheduler,
    timers: &mut TimerWheel,
    tid: ThreadId,
    reason: WakeReason,
) -> KernelResult<()> {
    {
        let thread = threads.get_mut(tid)?;
        thread.sleeping_on = None;
        thread.intr_mask = Intr::NONE;
        thread.wake_reason = Some(reason);
        if let Some(timer) = thread.sleep_timer.take() {
            timers.disarm(timer);
        }
    }
    sched.sched_ready(threads, tid)
}

/// `TaskWakeup`: wake every thread parked on the Rendez and request a
/// reschedule. Each sleeper observes its own wake reason.
pub fn task_wakeup(
    threads: &mut ThreadTable,
    sched: &mut Scheduler,
    timers: &mut TimerWheel,
    rendez: &mut Rendez,
) -> KernelResult<()> {
    let mut woke = false;
    while let Some(tid) = rendez.blocked.pop_front() {
        if is_parked_here(threads, rendez.id, tid) {
            make_runnable(threads, sched, timers, tid, WakeReason::Normal)?;
            woke = true;
        }
    }
    if woke {
        sched.request_resched();
    }
    Ok(())
}

/// `TaskWakeupSpecific`: wake exactly one parked thread.
pub fn task_wakeup_specific(
    threads: &mut ThreadTable,
    sched: &mut Scheduler,
    timers: &mut TimerWheel,
    rendez: &mut Rendez,
    tid: ThreadId,
    reason: WakeReason,
) -> KernelResult<()> {
    if let Some(pos) = rendez.blocked.iter().position(|&t| t == tid) {
        rendez.blocked.remove(pos);
    }
    if is_parked_here(threads, rendez.id, tid) {
        make_runnable(threads, sched, timers, tid, reason)?;
        sched.request_resched();
    }
    Ok(())
}

/// Wake the first genuine sleeper on the Rendez, FIFO. Used by waiter
/// handoff paths (futex wake, pipe space).
pub fn task_wakeup_one(
    threads: &mut ThreadTable,
    sched: &mut Scheduler,
    timers: &mut TimerWheel,
    rendez: &mut Rendez,
) -> KernelResult<bool> {
    while let Some(tid) = rendez.blocked.pop_front() {
        if is_parked_here(threads, rendez.id, tid) {
            make_runnable(threads, sched, timers, tid, WakeReason::Normal)?;
            sched.request_resched();
            return Ok(true);
        }
    }
    Ok(false)
}

/// Interrupt a sleeping thread for `cause` (signal delivery, event
/// arrival, cancellation, timer expiry). The sleep ends only if its
/// mask admits the cause; the cause itself is never consumed here.
/// Returns whether the thread was woken.
pub fn interrupt_sleep(
    threads: &mut ThreadTable,
    sched: &mut Scheduler,
    timers: &mut TimerWheel,
    tid: ThreadId,
    cause: Intr,
    reason: WakeReason,
) -> KernelResult<bool> {
    let eligible = {
        let thread = threads.get(tid)?;
        thread.state == ThreadState::Sleeping && !(thread.intr_mask & cause).is_empty()
    };
    if eligible {
        // The stale entry on the Rendez list is skipped at the next
        // wakeup scan.
        make_runnable(threads, sched, timers, tid, reason)?;
        sched.request_resched();
    }
    Ok(eligible)
}
