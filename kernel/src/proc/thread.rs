//! Kernel and user threads
//!
//! The thread is the unit of scheduling: a saved register block, a
//! kernel stack, a scheduling policy and priority pair, and a state
//! that decides which structure currently links it (one ready-queue
//! level, or the blocked list of one Rendez).

use alloc::vec::Vec;

use bitflags::bitflags;

use crate::arena::Arena;
use crate::define_id;
use crate::error::{KernelError, KernelResult, SchedError};
use crate::hal::Context;
use crate::interrupt::IsrId;
use crate::mm::Pfn;
use crate::proc::ProcId;
use crate::timer::TimerId;

define_id! {
    /// Handle into the thread table.
    ThreadId
}

/// Thread lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Runnable; linked into the ready queue of its priority.
    Ready,
    /// Currently on the CPU; never in a ready queue.
    Running,
    /// Parked on a Rendez.
    Sleeping,
    /// Stopped by a job-control signal.
    Stopped,
    /// Exited, awaiting reap.
    Zombie,
}

/// Scheduling policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedPolicy {
    /// Time-shared, priorities 0-15.
    Other,
    /// Fixed-quantum round robin, priorities 16-31.
    Rr,
    /// Runs until it blocks, yields or is preempted; priorities 16-31.
    Fifo,
}

bitflags! {
    /// Which causes may interrupt a sleep (the `INTRF_*` mask).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Intr: u32 {
        const SIGNAL = 1 << 0;
        const EVENT  = 1 << 1;
        const CANCEL = 1 << 2;
        const TIMER  = 1 << 3;
    }
}

impl Intr {
    pub const ALL: Intr = Intr::all();
    pub const NONE: Intr = Intr::empty();
}

/// Why a sleeping thread was made runnable again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// Ordinary `TaskWakeup`/`TaskWakeupSpecific`.
    Normal,
    /// A signal arrived and the sleep allowed `INTRF_SIGNAL`.
    Signal,
    /// An event bit arrived and the sleep allowed `INTRF_EVENT`.
    Event,
    /// The thread was cancelled.
    Cancel,
    /// The sleep's timer expired.
    Timeout,
}

/// Quantum granted to SCHED_OTHER and SCHED_RR threads, in jiffies.
pub const SCHED_QUANTUM: u32 = 2;

/// A schedulable thread.
pub struct Thread {
    /// Saved register block, restored by the HAL context switch.
    pub context: Context,
    /// Kernel stack frame (16K class).
    pub kstack: Option<Pfn>,
    /// Owning process.
    pub proc: ProcId,
    pub state: ThreadState,
    pub sched_policy: SchedPolicy,
    /// Priority requested by the thread.
    pub desired_priority: u8,
    /// Effective priority; selects the ready-queue level.
    pub priority: u8,
    /// Jiffies left in the current quantum.
    pub quantum: u32,
    /// Id of the Rendez this thread is parked on, when SLEEPING.
    pub sleeping_on: Option<u32>,
    /// Causes allowed to interrupt the current sleep.
    pub intr_mask: Intr,
    /// Reason the last sleep ended; consumed by the retried operation.
    pub wake_reason: Option<WakeReason>,
    /// Timer armed for the current `TaskSleepTimeout`, if any.
    pub sleep_timer: Option<TimerId>,
    /// Pending event bits posted by interrupt delivery.
    pub pending_events: u32,
    /// In-flight message-port request, carried across the park/retry
    /// of a blocking send.
    pub msgreq: Option<crate::ipc::ReqId>,
    /// Cancellation requested.
    pub cancelled: bool,
    /// Interrupt servers owned by this thread.
    pub isr_handlers: Vec<IsrId>,
    /// Kernel thread (idle, DPC, timer); never exits to user mode.
    pub kthread: bool,
    /// Exit status once ZOMBIE.
    pub exit_status: i32,
}

impl Thread {
    pub fn new(proc: ProcId, policy: SchedPolicy, priority: u8) -> Self {
        Self {
            context: Context::default(),
            kstack: None,
            proc,
            state: ThreadState::Ready,
            sched_policy: policy,
            desired_priority: priority,
            priority,
            quantum: SCHED_QUANTUM,
            sleeping_on: None,
            intr_mask: Intr::NONE,
            wake_reason: None,
            sleep_timer: None,
            pending_events: 0,
            msgreq: None,
            cancelled: false,
            isr_handlers: Vec::new(),
            kthread: false,
            exit_status: 0,
        }
    }

    pub fn new_kthread(proc: ProcId, policy: SchedPolicy, priority: u8) -> Self {
        let mut t = Self::new(proc, policy, priority);
        t.kthread = true;
        t
    }

    /// Consume the wake reason recorded by the last wakeup. `None`
    /// means the thread has not been parked since the reason was last
    /// taken.
    pub fn take_wake_reason(&mut self) -> Option<WakeReason> {
        self.wake_reason.take()
    }
}

/// The thread table.
pub struct ThreadTable {
    threads: Arena<Thread>,
}

impl ThreadTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            threads: Arena::new("thread", capacity),
        }
    }

    pub fn insert(&mut self, thread: Thread) -> KernelResult<ThreadId> {
        self.threads
            .insert(thread)
            .map(ThreadId)
            .map_err(|_| KernelError::ResourceExhausted { resource: "thread" })
    }

    pub fn remove(&mut self, tid: ThreadId) -> Option<Thread> {
        self.threads.remove(tid.0)
    }

    pub fn get(&self, tid: ThreadId) -> KernelResult<&Thread> {
        self.threads
            .get(tid.0)
            .ok_or(SchedError::ThreadNotFound.into())
    }

    pub fn get_mut(&mut self, tid: ThreadId) -> KernelResult<&mut Thread> {
        self.threads
            .get_mut(tid.0)
            .ok_or(SchedError::ThreadNotFound.into())
    }

    pub fn contains(&self, tid: ThreadId) -> bool {
        self.threads.get(tid.0).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ThreadId, &Thread)> {
        self.threads.iter().map(|(h, t)| (ThreadId(h), t))
    }

    pub fn handles(&self) -> Vec<ThreadId> {
        self.threads.handles().into_iter().map(ThreadId).collect()
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }
}
