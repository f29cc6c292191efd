//! Thread scheduler
//!
//! Thirty-two priority levels, 0 lowest to 31 highest. Levels 0-15 are
//! SCHED_OTHER (time-shared), 16-31 are SCHED_RR and SCHED_FIFO. A
//! 32-bit bitmap tracks non-empty levels and the dispatcher picks the
//! highest set bit with a count-leading-zeros. Enqueues at a level are
//! FIFO; a woken thread is appended at the tail of its level with no
//! boost; SCHED_FIFO threads never expire by timer.

use alloc::collections::VecDeque;

use crate::error::{KernelResult, SchedError};
use crate::hal::Hal;
use crate::proc::thread::{SchedPolicy, ThreadId, ThreadState, ThreadTable, SCHED_QUANTUM};

/// Number of priority levels.
pub const NR_PRIORITIES: usize = 32;

/// Lowest priority usable by SCHED_RR/SCHED_FIFO threads.
pub const RT_PRIORITY_BASE: u8 = 16;

/// The ready queues and dispatch state.
pub struct Scheduler {
    queues: [VecDeque<ThreadId>; NR_PRIORITIES],
    /// Bit `p` set iff `queues[p]` is non-empty.
    bitmap: u32,
    current: ThreadId,
    idle: ThreadId,
    resched_pending: bool,
}

impl Scheduler {
    /// Build a scheduler with `idle` as the initial running thread.
    /// The idle thread must stay permanently runnable.
    pub fn new(idle: ThreadId) -> Self {
        Self {
            queues: core::array::from_fn(|_| VecDeque::new()),
            bitmap: 0,
            current: idle,
            idle,
            resched_pending: false,
        }
    }

    /// The thread currently on the CPU.
    pub fn current(&self) -> ThreadId {
        self.current
    }

    pub fn idle_thread(&self) -> ThreadId {
        self.idle
    }

    /// Whether a reschedule has been requested but not yet performed.
    pub fn resched_pending(&self) -> bool {
        self.resched_pending
    }

    /// Request a reschedule at the next opportunity.
    pub fn request_resched(&mut self) {
        self.resched_pending = true;
    }

    /// Whether `tid` is linked into the ready queue of level `prio`.
    pub fn in_queue(&self, tid: ThreadId, prio: u8) -> bool {
        self.queues[prio as usize].contains(&tid)
    }

    /// `SchedReady`: append `tid` at the tail of its priority level and
    /// request a reschedule if it outranks the running thread.
    pub fn sched_ready(&mut self, threads: &mut ThreadTable, tid: ThreadId) -> KernelResult<()> {
        let prio = {
            let thread = threads.get_mut(tid)?;
            thread.state = ThreadState::Ready;
            thread.priority
        };
        debug_assert!(!self.in_queue(tid, prio));
        self.queues[prio as usize].push_back(tid);
        self.bitmap |= 1 << prio;

        let running_prio = threads.get(self.current).map(|t| t.priority).unwrap_or(0);
        if prio > running_prio {
            self.resched_pending = true;
        }
        Ok(())
    }

    /// `SchedUnready`: unlink `tid` from its ready queue, clearing the
    /// bitmap bit when the level empties.
    pub fn sched_unready(&mut self, threads: &mut ThreadTable, tid: ThreadId) -> KernelResult<()> {
        let prio = threads.get(tid)?.priority as usize;
        if let Some(pos) = self.queues[prio].iter().position(|&t| t == tid) {
            self.queues[prio].remove(pos);
        }
        if self.queues[prio].is_empty() {
            self.bitmap &= !(1 << prio);
        }
        Ok(())
    }

    /// Highest-priority ready thread, without dequeuing it.
    pub fn peek_next(&self) -> Option<(u8, ThreadId)> {
        if self.bitmap == 0 {
            return None;
        }
        let level = 31 - self.bitmap.leading_zeros() as usize;
        self.queues[level].front().map(|&t| (level as u8, t))
    }

    /// `Reschedule`: if the highest-priority runnable thread outranks
    /// (or must replace) the running one, switch contexts through the
    /// HAL.
    pub fn reschedule(&mut self, threads: &mut ThreadTable, hal: &dyn Hal) -> KernelResult<()> {
        self.resched_pending = false;

        let prev = self.current;
        let prev_running = threads
            .get(prev)
            .map(|t| t.state == ThreadState::Running)
            .unwrap_or(false);
        let prev_prio = threads.get(prev).map(|t| t.priority).unwrap_or(0);

        let next = match self.peek_next() {
            Some((next_prio, next)) => {
                // A running thread keeps the CPU against equal or lower
                // priorities; it is replaced only by a strictly higher
                // one. A thread that blocked or exited always yields.
                if prev_running && next_prio <= prev_prio {
                    return Ok(());
                }
                next
            }
            None => {
                // Nothing ready. The running thread continues; if it
                // blocked this only happens for the idle thread, which
                // is never allowed to block.
                return Ok(());
            }
        };

        self.sched_unready(threads, next)?;
        if prev_running {
            // Preempted, not blocked: back to the tail of its level.
            self.sched_ready(threads, prev)?;
            self.resched_pending = false;
        }

        {
            let t = threads.get_mut(next)?;
            t.state = ThreadState::Running;
            t.quantum = SCHED_QUANTUM;
        }
        self.current = next;

        // Swap register state. prev may already be gone (thread exit).
        if threads.contains(prev) && prev != next {
            let next_ctx = threads.get(next)?.context;
            let prev_t = threads.get_mut(prev)?;
            hal.switch_context(&mut prev_t.context, &next_ctx);
        }
        Ok(())
    }

    /// Put the running thread back at the tail of its level and pick
    /// the next one (quantum expiry, `sched_yield`).
    pub fn rotate_current(&mut self, threads: &mut ThreadTable, hal: &dyn Hal) -> KernelResult<()> {
        let cur = self.current;
        {
            let t = threads.get_mut(cur)?;
            t.state = ThreadState::Ready;
            t.quantum = SCHED_QUANTUM;
        }
        self.sched_ready(threads, cur)?;
        self.resched_pending = true;
        self.reschedule(threads, hal)
    }

    /// Timer top-half hook: decrement the running thread's quantum and
    /// rotate it when the quantum expires. SCHED_FIFO threads do not
    /// expire by timer.
    pub fn timer_tick(&mut self, threads: &mut ThreadTable, hal: &dyn Hal) -> KernelResult<()> {
        let cur = self.current;
        let expire = {
            let t = threads.get_mut(cur)?;
            match t.sched_policy {
                SchedPolicy::Fifo => false,
                SchedPolicy::Other | SchedPolicy::Rr => {
                    t.quantum = t.quantum.saturating_sub(1);
                    t.quantum == 0
                }
            }
        };
        if expire {
            self.rotate_current(threads, hal)?;
        }
        Ok(())
    }

    /// Make `tid` the running thread immediately. Used by the boot
    /// handoff to the root process and by test harnesses that script
    /// which thread issues the next operation; ordinary dispatch goes
    /// through [`Scheduler::reschedule`].
    pub fn adopt(&mut self, threads: &mut ThreadTable, tid: ThreadId) -> KernelResult<()> {
        if self.current == tid {
            return Ok(());
        }
        let prev = self.current;
        if let Ok(t) = threads.get_mut(prev) {
            if t.state == ThreadState::Running {
                t.state = ThreadState::Ready;
                self.sched_ready(threads, prev)?;
            }
        }
        self.sched_unready(threads, tid)?;
        {
            let t = threads.get_mut(tid)?;
            t.state = ThreadState::Running;
            t.quantum = SCHED_QUANTUM;
        }
        self.current = tid;
        self.resched_pending = false;
        Ok(())
    }

    /// Validate a (policy, priority) pair.
    pub fn check_sched_params(policy: SchedPolicy, priority: i32) -> KernelResult<u8> {
        match policy {
            SchedPolicy::Other => {
                if (0..=15).contains(&priority) {
                    Ok(priority as u8)
                } else {
                    Err(SchedError::InvalidPriority.into())
                }
            }
            SchedPolicy::Rr | SchedPolicy::Fifo => {
                if (16..=31).contains(&priority) {
                    Ok(priority as u8)
                } else {
                    Err(SchedError::InvalidPriority.into())
                }
            }
        }
    }

    /// Ready-queue bitmap (for invariant checks).
    pub fn bitmap(&self) -> u32 {
        self.bitmap
    }

    /// Number of threads queued at `prio`.
    pub fn queue_len(&self, prio: u8) -> usize {
        self.queues[prio as usize].len()
    }
}
