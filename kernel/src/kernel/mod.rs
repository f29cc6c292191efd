//! The kernel object
//!
//! One structure owns every global table; the global instance sits
//! behind a single spin mutex, which IS the big kernel lock: syscall
//! entry locks it, and a thread that must wait parks itself and
//! surrenders control as described in [`crate::sync::rendez`].
//!
//! The cross-subsystem orchestration lives here: boot construction,
//! thread and process lifecycle, interrupt and timer plumbing, signal
//! posting and delivery. The VFS orchestration is in the sibling
//! [`vfs`] module.

pub mod vfs;

use alloc::string::String;

use spin::Mutex;

use crate::boot_info::BootInfo;
use crate::error::{KernelError, KernelResult};
use crate::fs::{
    BufCache, DNameCache, FilpTable, KqueueTable, PipeTable, SuperBlockTable, VNodeTable,
};
use crate::hal::Hal;
use crate::interrupt::InterruptTable;
use crate::ipc::MsgPortTable;
use crate::mm::{FrameAllocator, FrameSize, PmapTable};
use crate::proc::signal::{SigAction, SIGALRM, SIGKILL, SIGSEGV};
use crate::proc::thread::{
    Intr, SchedPolicy, Thread, ThreadId, ThreadState, ThreadTable, WakeReason,
};
use crate::proc::{ProcId, ProcState, Process, ProcessTable};
use crate::sched::Scheduler;
use crate::sync::futex::FutexTable;
use crate::sync::rendez::{self, Rendez};
use crate::timer::{TimerWheel, JIFFIES_PER_SECOND};

/// Capacity of the pmap table (one per process plus the kernel's).
const NR_PMAP: usize = crate::proc::NR_PROCESS + 1;

/// Everything the kernel owns.
pub struct Kernel {
    pub hal: &'static dyn Hal,
    pub frames: FrameAllocator,
    pub pmaps: PmapTable,
    pub threads: ThreadTable,
    pub procs: ProcessTable,
    pub sched: Scheduler,
    pub timers: TimerWheel,
    pub irqs: InterruptTable,
    pub futexes: FutexTable,
    pub ports: MsgPortTable,
    pub vnodes: VNodeTable,
    pub filps: FilpTable,
    pub superblocks: SuperBlockTable,
    pub bufs: BufCache,
    pub dnames: DNameCache,
    pub pipes: PipeTable,
    pub kqueues: KqueueTable,

    /// The kernel's own process (idle, DPC and timer threads).
    pub kernel_proc: ProcId,
    pub idle_thread: ThreadId,
    pub dpc_thread: ThreadId,
    pub timer_thread: ThreadId,
    /// The timer kernel thread blocks here between ticks.
    pub timer_rendez: Rendez,
    /// Threads in `sys_sleep` doze here; wakeups are per-thread.
    pub sleep_rendez: Rendez,
}

/// The global kernel instance. The mutex is the big kernel lock.
pub static KERNEL: Mutex<Option<Kernel>> = Mutex::new(None);

impl Kernel {
    /// Build the kernel from the bootloader's description: tables
    /// sized, the kernel process and its three kernel threads created,
    /// the DPC and timer threads parked on their rendezvous.
    pub fn new(boot_info: &BootInfo, hal: &'static dyn Hal) -> KernelResult<Self> {
        let frames = FrameAllocator::new(boot_info.ram_size);
        let mut threads = ThreadTable::new(crate::proc::NR_PROCESS * 4);
        let mut procs = ProcessTable::new();

        let kernel_proc = procs.insert(Process::new(String::from("kernel"), None))?;

        let idle_thread = threads.insert(Thread::new_kthread(
            kernel_proc,
            SchedPolicy::Other,
            0,
        ))?;
        threads.get_mut(idle_thread)?.state = ThreadState::Running;

        let dpc_thread =
            threads.insert(Thread::new_kthread(kernel_proc, SchedPolicy::Fifo, 31))?;
        let timer_thread =
            threads.insert(Thread::new_kthread(kernel_proc, SchedPolicy::Fifo, 30))?;
        {
            let p = procs.get_mut(kernel_proc)?;
            p.threads.push(idle_thread);
            p.threads.push(dpc_thread);
            p.threads.push(timer_thread);
        }

        let mut kernel = Self {
            hal,
            frames,
            pmaps: PmapTable::new(NR_PMAP),
            threads,
            procs,
            sched: Scheduler::new(idle_thread),
            timers: TimerWheel::new(),
            irqs: InterruptTable::new(),
            futexes: FutexTable::new(),
            ports: MsgPortTable::new(),
            vnodes: VNodeTable::new(),
            filps: FilpTable::new(),
            superblocks: SuperBlockTable::new(),
            bufs: BufCache::new(),
            dnames: DNameCache::new(),
            pipes: PipeTable::new(),
            kqueues: KqueueTable::new(),
            kernel_proc,
            idle_thread,
            dpc_thread,
            timer_thread,
            timer_rendez: Rendez::new(),
            sleep_rendez: Rendez::new(),
        };

        // The service threads start parked on their rendezvous.
        kernel.park_kthread_on_dpc()?;
        kernel.park_kthread_on_timer()?;
        log::info!(
            "kernel up: {} pages RAM, {} process slots",
            kernel.frames.total_pages(),
            kernel.procs.capacity()
        );
        Ok(kernel)
    }

    /// The thread issuing the current operation.
    pub fn current_thread(&self) -> ThreadId {
        self.sched.current()
    }

    /// The process of the current thread.
    pub fn current_proc(&self) -> KernelResult<ProcId> {
        Ok(self.threads.get(self.current_thread())?.proc)
    }

    /// Asynchronous causes currently asserted against a thread, for
    /// the interruptible-sleep mask check.
    pub fn pending_intr(&self, tid: ThreadId) -> Intr {
        let mut pending = Intr::NONE;
        if let Ok(thread) = self.threads.get(tid) {
            if thread.pending_events != 0 {
                pending |= Intr::EVENT;
            }
            if thread.cancelled {
                pending |= Intr::CANCEL;
            }
            if let Ok(proc) = self.procs.get(thread.proc) {
                if proc.signals.deliverable() {
                    pending |= Intr::SIGNAL;
                }
            }
        }
        pending
    }

    // -----------------------------------------------------------------
    // Thread and process lifecycle
    // -----------------------------------------------------------------

    /// Create a process with an address space, forked from nothing
    /// (the boot path builds the root process this way).
    pub fn proc_create(&mut self, name: &str, parent: Option<ProcId>) -> KernelResult<ProcId> {
        let pmap = self.pmaps.create(&mut self.frames)?;
        let pid = match parent {
            Some(parent) => self.procs.fork_from(parent, String::from(name))?,
            None => self.procs.insert(Process::new(String::from(name), parent))?,
        };
        self.procs.get_mut(pid)?.pmap = Some(pmap);
        Ok(pid)
    }

    /// Create a thread in `proc`, with a kernel stack, ready to run.
    pub fn thread_create(
        &mut self,
        proc: ProcId,
        policy: SchedPolicy,
        priority: u8,
    ) -> KernelResult<ThreadId> {
        let kstack = self.frames.alloc(FrameSize::Size16k)?;
        self.frames.retain(kstack);
        let mut thread = Thread::new(proc, policy, priority);
        thread.kstack = Some(kstack);
        let tid = self.threads.insert(thread)?;
        self.procs.get_mut(proc)?.threads.push(tid);
        self.sched.sched_ready(&mut self.threads, tid)?;
        Ok(tid)
    }

    /// `fork`: duplicate the current process. The address space is
    /// shared copy-on-write, the descriptor table is shared by
    /// reference, credentials and dispositions are inherited, and the
    /// `after_fork` privilege bitmap becomes the child's `now`. The
    /// child starts with one thread cloned from the caller.
    pub fn fork(&mut self) -> KernelResult<ProcId> {
        let tid = self.current_thread();
        let (parent_pid, policy, priority) = {
            let t = self.threads.get(tid)?;
            (t.proc, t.sched_policy, t.priority)
        };
        let parent_name = self.procs.get(parent_pid)?.name.clone();
        let mut name = parent_name;
        name.push_str("+");

        let child = self.procs.fork_from(parent_pid, name)?;

        // Clone the address space copy-on-write.
        if let Some(parent_pmap) = self.procs.get(parent_pid)?.pmap {
            let child_pmap =
                self.pmaps
                    .fork_from(&mut self.frames, self.hal, parent_pmap)?;
            self.procs.get_mut(child)?.pmap = Some(child_pmap);
        }

        // Share the open-file table.
        let fds = self.procs.get(parent_pid)?.fds;
        for filp in fds.iter().flatten() {
            self.filps.ref_filp(*filp)?;
        }
        self.procs.get_mut(child)?.fds = fds;

        let ctid = self.thread_create(child, policy, priority)?;
        let ctx = self.threads.get(tid)?.context;
        self.threads.get_mut(ctid)?.context = ctx;
        Ok(child)
    }

    /// Terminate one thread: interrupt servers freed, sleep timer
    /// disarmed, queues left, kernel stack released. When the last
    /// thread of a process goes, the process becomes a zombie and the
    /// parent is woken.
    pub fn thread_exit(&mut self, tid: ThreadId, status: i32) -> KernelResult<()> {
        self.irqs
            .free_thread_handlers(&mut self.threads, self.hal, tid)?;

        let (proc, msgreq) = {
            let thread = self.threads.get_mut(tid)?;
            thread.exit_status = status;
            (thread.proc, thread.msgreq.take())
        };
        if let Some(timer) = self.threads.get_mut(tid)?.sleep_timer.take() {
            self.timers.disarm(timer);
        }
        if let Some(req) = msgreq {
            self.ports.abandon(req);
        }
        if self.threads.get(tid)?.state == ThreadState::Ready {
            self.sched.sched_unready(&mut self.threads, tid)?;
        }
        {
            let thread = self.threads.get_mut(tid)?;
            thread.state = ThreadState::Zombie;
            thread.sleeping_on = None;
        }
        if let Some(kstack) = self.threads.get_mut(tid)?.kstack.take() {
            self.frames.release(kstack);
        }

        let last = {
            let p = self.procs.get_mut(proc)?;
            if let Some(pos) = p.threads.iter().position(|&t| t == tid) {
                p.threads.swap_remove(pos);
            }
            p.threads.is_empty()
        };
        self.threads.remove(tid);

        if last && proc != self.kernel_proc {
            self.proc_finalize(proc, status)?;
        }
        if tid == self.current_thread() {
            self.sched.request_resched();
            self.sched.reschedule(&mut self.threads, self.hal)?;
        }
        Ok(())
    }

    /// Last thread gone: close descriptors, tear down futexes and the
    /// address space, mark the process a zombie and wake the waiting
    /// parent.
    fn proc_finalize(&mut self, pid: ProcId, status: i32) -> KernelResult<()> {
        for fd in 0..crate::proc::NR_FD as i32 {
            let has = self.procs.get(pid)?.fds[fd as usize].is_some();
            if has {
                let _ = self.do_close(pid, fd);
            }
        }
        self.futexes.fini_process(pid);
        if let Some(pmap) = self.procs.get_mut(pid)?.pmap.take() {
            self.pmaps.destroy(&mut self.frames, self.hal, pmap)?;
        }
        if let Some(alarm) = self.procs.get_mut(pid)?.alarm.take() {
            self.timers.disarm(alarm);
        }
        {
            let p = self.procs.get_mut(pid)?;
            p.state = ProcState::Zombie;
            p.exit_status = status;
        }

        if let Some(parent) = self.procs.get(pid)?.parent {
            if self.procs.contains(parent) {
                let mut bed = {
                    let p = self.procs.get_mut(parent)?;
                    core::mem::replace(&mut p.wait_rendez, Rendez::new())
                };
                rendez::task_wakeup(&mut self.threads, &mut self.sched, &mut self.timers, &mut bed)?;
                self.procs.get_mut(parent)?.wait_rendez = bed;
            }
        } else {
            // No parent will ever wait; reap in place.
            self.procs.remove(pid);
        }
        Ok(())
    }

    /// `exit`: terminate every thread of the current process.
    pub fn proc_exit(&mut self, status: i32) -> KernelResult<()> {
        let pid = self.current_proc()?;
        let tids = self.procs.get(pid)?.threads.clone();
        let cur = self.current_thread();
        for tid in tids {
            if tid != cur {
                self.thread_exit(tid, status)?;
            }
        }
        self.thread_exit(cur, status)
    }

    /// `waitpid`-style wait: reap a zombie child, or park until one
    /// exits. Interruptible by signals.
    pub fn wait_for_child(&mut self) -> KernelResult<(u32, i32)> {
        let tid = self.current_thread();
        let pid = self.current_proc()?;
        let _ = self.threads.get_mut(tid)?.take_wake_reason();

        if let Some(child) = self.procs.find_zombie_child(pid) {
            let status = self.procs.reap(pid, child)?;
            return Ok((child.as_u32(), status));
        }
        if self.procs.get(pid)?.children.is_empty() {
            return Err(KernelError::NotFound);
        }
        let pending = self.pending_intr(tid);
        let mut bed = {
            let p = self.procs.get_mut(pid)?;
            core::mem::replace(&mut p.wait_rendez, Rendez::new())
        };
        let parked = rendez::task_sleep_interruptible(
            &mut self.threads,
            &mut self.sched,
            self.hal,
            &mut bed,
            Intr::SIGNAL,
            pending,
        );
        self.procs.get_mut(pid)?.wait_rendez = bed;
        match parked {
            Ok(()) => unreachable!("sleep always parks"),
            Err(e) => Err(e),
        }
    }

    // -----------------------------------------------------------------
    // Interrupts and timers
    // -----------------------------------------------------------------

    /// The interrupt top half: reads the pending lines, accounts the
    /// timer tick, queues DPC work and wakes the service threads. Runs
    /// with interrupts disabled.
    pub fn interrupt_top_half(&mut self) -> KernelResult<()> {
        let state = self.hal.disable_interrupts();
        let outcome = self.irqs.top_half(self.hal);
        if outcome.timer_tick {
            self.timer_top_half()?;
        }
        if outcome.dpc_work {
            let mut bed = core::mem::replace(&mut self.irqs.dpc_rendez, Rendez::new());
            rendez::task_wakeup(&mut self.threads, &mut self.sched, &mut self.timers, &mut bed)?;
            self.irqs.dpc_rendez = bed;
        }
        self.hal.restore_interrupts(state);
        Ok(())
    }

    /// `TimerTopHalf`: advance the hardclock, charge the running
    /// thread's quantum, and signal the timer thread when a timer is
    /// due.
    pub fn timer_top_half(&mut self) -> KernelResult<()> {
        self.hal.timer_reprogram_compare();
        let due = self.timers.top_half();
        self.sched.timer_tick(&mut self.threads, self.hal)?;
        if due {
            let mut bed = core::mem::replace(&mut self.timer_rendez, Rendez::new());
            rendez::task_wakeup(&mut self.threads, &mut self.sched, &mut self.timers, &mut bed)?;
            self.timer_rendez = bed;
        }
        Ok(())
    }

    /// Body of the timer kernel thread between parks: collect expired
    /// timers and act on them (sleep timeouts, alarms).
    pub fn run_timer_bottom_half(&mut self) -> KernelResult<()> {
        let fired = self.timers.run_bottom_half();
        for tid in fired.sleep_wakes {
            rendez::interrupt_sleep(
                &mut self.threads,
                &mut self.sched,
                &mut self.timers,
                tid,
                Intr::TIMER,
                WakeReason::Timeout,
            )?;
        }
        for pid in fired.alarms {
            if self.procs.contains(pid) {
                self.procs.get_mut(pid)?.alarm = None;
                self.send_signal(pid, SIGALRM)?;
            }
        }
        Ok(())
    }

    /// Body of the DPC kernel thread between parks.
    pub fn run_dpc(&mut self) -> KernelResult<usize> {
        self.irqs
            .run_dpc_once(&mut self.threads, &mut self.sched, &mut self.timers)
    }

    fn park_kthread_on_dpc(&mut self) -> KernelResult<()> {
        let tid = self.dpc_thread;
        if self.threads.get(tid)?.state == ThreadState::Ready {
            self.sched.sched_unready(&mut self.threads, tid)?;
        }
        let mut bed = core::mem::replace(&mut self.irqs.dpc_rendez, Rendez::new());
        park_kthread(&mut self.threads, tid, &mut bed)?;
        self.irqs.dpc_rendez = bed;
        Ok(())
    }

    fn park_kthread_on_timer(&mut self) -> KernelResult<()> {
        let tid = self.timer_thread;
        if self.threads.get(tid)?.state == ThreadState::Ready {
            self.sched.sched_unready(&mut self.threads, tid)?;
        }
        let mut bed = core::mem::replace(&mut self.timer_rendez, Rendez::new());
        park_kthread(&mut self.threads, tid, &mut bed)?;
        self.timer_rendez = bed;
        Ok(())
    }

    /// Run any woken service thread to completion and park it again:
    /// the DPC thread first (priority 31), then the timer thread (30).
    /// This is what the dispatcher does on real hardware; tests call it
    /// to drain deferred work deterministically.
    pub fn service_kthreads(&mut self) -> KernelResult<()> {
        if self.threads.get(self.dpc_thread)?.state == ThreadState::Ready {
            let prev = self.sched.current();
            self.sched.adopt(&mut self.threads, self.dpc_thread)?;
            self.run_dpc()?;
            self.park_kthread_on_dpc()?;
            self.resume_after_service(prev)?;
        }
        if self.threads.get(self.timer_thread)?.state == ThreadState::Ready {
            let prev = self.sched.current();
            self.sched.adopt(&mut self.threads, self.timer_thread)?;
            self.run_timer_bottom_half()?;
            self.park_kthread_on_timer()?;
            self.resume_after_service(prev)?;
        }
        Ok(())
    }

    fn resume_after_service(&mut self, prev: ThreadId) -> KernelResult<()> {
        if self.threads.contains(prev) && self.threads.get(prev)?.state == ThreadState::Ready {
            self.sched.adopt(&mut self.threads, prev)?;
        } else {
            self.sched.reschedule(&mut self.threads, self.hal)?;
        }
        Ok(())
    }

    /// Advance time by one jiffy and drain the deferred work it
    /// produced. Test harness convenience.
    pub fn tick(&mut self) -> KernelResult<()> {
        self.timer_top_half()?;
        self.service_kthreads()
    }

    // -----------------------------------------------------------------
    // Signals
    // -----------------------------------------------------------------

    /// Post a signal to a process and interrupt any of its threads
    /// sleeping with `INTRF_SIGNAL`. The sleep does not consume the
    /// signal; it stays pending until delivery.
    pub fn send_signal(&mut self, pid: ProcId, sig: i32) -> KernelResult<()> {
        self.procs.get_mut(pid)?.signals.raise(sig)?;
        if !self.procs.get(pid)?.signals.deliverable() && sig != SIGKILL {
            return Ok(());
        }
        let tids = self.procs.get(pid)?.threads.clone();
        for tid in tids {
            rendez::interrupt_sleep(
                &mut self.threads,
                &mut self.sched,
                &mut self.timers,
                tid,
                Intr::SIGNAL,
                WakeReason::Signal,
            )?;
        }
        Ok(())
    }

    /// Page-fault entry: try demand paging; a true fault delivers
    /// SIGSEGV to the offending thread's process.
    pub fn page_fault(
        &mut self,
        va: usize,
        kind: crate::mm::FaultKind,
        access: crate::mm::FaultAccess,
    ) -> KernelResult<()> {
        let pid = self.current_proc()?;
        let pmap = self
            .procs
            .get(pid)?
            .pmap
            .ok_or(KernelError::BadAddress)?;
        match self
            .pmaps
            .fault(&mut self.frames, self.hal, pmap, va, kind, access)
        {
            Ok(()) => Ok(()),
            Err(e) => {
                self.procs.get_mut(pid)?.signals.sigsegv_addr = va;
                self.send_signal(pid, SIGSEGV)?;
                Err(e)
            }
        }
    }

    /// Deliver pending signals to the current thread at syscall
    /// return. Default terminations and stops are carried out here;
    /// handler dispositions are handed back for the return-to-user
    /// glue to build the handler frame.
    pub fn deliver_signals(&mut self) -> KernelResult<Option<(i32, SigAction)>> {
        let pid = self.current_proc()?;
        if pid == self.kernel_proc {
            return Ok(None);
        }
        let delivered = self.procs.get_mut(pid)?.signals.deliver();
        match delivered {
            None => Ok(None),
            Some((sig, SigAction::Terminate)) => {
                log::info!("process {} killed by signal {}", pid, sig);
                self.proc_exit(128 + sig)?;
                Ok(Some((sig, SigAction::Terminate)))
            }
            Some((sig, SigAction::Stop)) => {
                let tids = self.procs.get(pid)?.threads.clone();
                for tid in tids {
                    if self.threads.get(tid)?.state == ThreadState::Ready {
                        self.sched.sched_unready(&mut self.threads, tid)?;
                    }
                    self.threads.get_mut(tid)?.state = ThreadState::Stopped;
                }
                self.sched.reschedule(&mut self.threads, self.hal)?;
                Ok(Some((sig, SigAction::Stop)))
            }
            Some((sig, SigAction::Continue)) => {
                let tids = self.procs.get(pid)?.threads.clone();
                for tid in tids {
                    if self.threads.get(tid)?.state == ThreadState::Stopped {
                        self.sched.sched_ready(&mut self.threads, tid)?;
                    }
                }
                Ok(Some((sig, SigAction::Continue)))
            }
            Some(other) => Ok(Some(other)),
        }
    }

    // -----------------------------------------------------------------
    // Sleep and alarm
    // -----------------------------------------------------------------

    /// `sys_sleep`: doze for `seconds`. Returns 0 on a full sleep, or
    /// `-EINTR` when a signal arrives first.
    pub fn sleep_seconds(&mut self, seconds: u32) -> KernelResult<()> {
        let tid = self.current_thread();
        if let Some(reason) = self.threads.get_mut(tid)?.take_wake_reason() {
            return match reason {
                WakeReason::Timeout | WakeReason::Normal => Ok(()),
                _ => Err(KernelError::Interrupted),
            };
        }
        if seconds == 0 {
            return Ok(());
        }
        let pending = self.pending_intr(tid);
        let mut bed = core::mem::replace(&mut self.sleep_rendez, Rendez::new());
        let parked = rendez::task_sleep_timeout(
            &mut self.threads,
            &mut self.sched,
            &mut self.timers,
            self.hal,
            &mut bed,
            seconds as u64 * JIFFIES_PER_SECOND,
            Intr::SIGNAL,
            pending,
        );
        self.sleep_rendez = bed;
        match parked {
            Ok(()) => unreachable!("sleep always parks"),
            Err(e) => Err(e),
        }
    }

    /// `sys_alarm`: arm (or cancel with 0) the process SIGALRM timer.
    /// Returns the seconds that were left on the previous alarm.
    pub fn alarm_seconds(&mut self, seconds: u32) -> KernelResult<u32> {
        let pid = self.current_proc()?;
        let remaining = {
            let old = self.procs.get_mut(pid)?.alarm.take();
            match old {
                Some(timer) => {
                    let left = self.timers.remaining(timer).unwrap_or(0);
                    self.timers.disarm(timer);
                    left.div_ceil(JIFFIES_PER_SECOND) as u32
                }
                None => 0,
            }
        };
        if seconds > 0 {
            let timer = self
                .timers
                .arm_alarm(pid, seconds as u64 * JIFFIES_PER_SECOND)?;
            self.procs.get_mut(pid)?.alarm = Some(timer);
        }
        Ok(remaining)
    }

    // -----------------------------------------------------------------
    // Invariant checks (test support)
    // -----------------------------------------------------------------

    /// A thread is in the ready queue of priority `p` iff its priority
    /// is `p` and its state is READY.
    pub fn check_ready_queue_invariant(&self) -> bool {
        for (tid, thread) in self.threads.iter() {
            let queued = self.sched.in_queue(tid, thread.priority);
            let should = thread.state == ThreadState::Ready;
            if queued != should {
                return false;
            }
        }
        true
    }
}

/// Park a kernel service thread on its rendez without going through the
/// scheduler (it is not the current thread during boot).
fn park_kthread(
    threads: &mut ThreadTable,
    tid: ThreadId,
    rendez: &mut Rendez,
) -> KernelResult<()> {
    let thread = threads.get_mut(tid)?;
    thread.state = ThreadState::Sleeping;
    thread.sleeping_on = Some(rendez.id());
    thread.intr_mask = Intr::NONE;
    thread.wake_reason = None;
    rendez.push_sleeper(tid);
    Ok(())
}

/// Run `f` under the big kernel lock against the global instance.
pub fn with_kernel<R>(f: impl FnOnce(&mut Kernel) -> R) -> Option<R> {
    let mut guard = KERNEL.lock();
    guard.as_mut().map(f)
}

/// Install the global kernel instance (boot).
pub fn init_kernel(kernel: Kernel) -> Result<(), Kernel> {
    let mut guard = KERNEL.lock();
    if guard.is_some() {
        return Err(kernel);
    }
    *guard = Some(kernel);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::NullHal;

    static TEST_HAL: NullHal = NullHal::new();

    fn boot() -> Kernel {
        Kernel::new(&BootInfo::hosted(8 * 1024 * 1024), &TEST_HAL).unwrap()
    }

    #[test]
    fn boot_creates_service_threads_parked() {
        let k = boot();
        assert_eq!(
            k.threads.get(k.dpc_thread).unwrap().state,
            ThreadState::Sleeping
        );
        assert_eq!(
            k.threads.get(k.timer_thread).unwrap().state,
            ThreadState::Sleeping
        );
        assert_eq!(k.sched.current(), k.idle_thread);
        assert!(k.check_ready_queue_invariant());
    }

    #[test]
    fn fork_shares_descriptors_and_narrows_privileges() {
        let mut k = boot();
        let root = k.proc_create("root", None).unwrap();
        let tid = k.thread_create(root, SchedPolicy::Other, 10).unwrap();
        k.sched.adopt(&mut k.threads, tid).unwrap();

        let child = k.fork().unwrap();
        let c = k.procs.get(child).unwrap();
        assert_eq!(c.parent, Some(root));
        assert_eq!(c.threads.len(), 1);
        assert!(k.procs.get(root).unwrap().children.contains(&child));
        assert!(k.pmaps.get(c.pmap.unwrap()).is_some());
    }

    #[test]
    fn exit_and_wait_reap_the_child() {
        let mut k = boot();
        let root = k.proc_create("root", None).unwrap();
        let rtid = k.thread_create(root, SchedPolicy::Other, 10).unwrap();
        k.sched.adopt(&mut k.threads, rtid).unwrap();
        let child = k.fork().unwrap();
        let ctid = k.procs.get(child).unwrap().threads[0];

        // Parent waits first; the child's exit wakes it.
        k.sched.adopt(&mut k.threads, rtid).unwrap();
        let err = k.wait_for_child().unwrap_err();
        assert_eq!(err, KernelError::WouldBlock);

        k.sched.adopt(&mut k.threads, ctid).unwrap();
        k.proc_exit(7).unwrap();
        assert_eq!(k.procs.get(child).unwrap().state, ProcState::Zombie);
        assert_eq!(
            k.threads.get(rtid).unwrap().state,
            ThreadState::Ready
        );

        k.sched.adopt(&mut k.threads, rtid).unwrap();
        let (pid, status) = k.wait_for_child().unwrap();
        assert_eq!(pid, child.as_u32());
        assert_eq!(status, 7);
        assert!(!k.procs.contains(child));
    }

    #[test]
    fn alarm_delivers_sigalrm_through_the_wheel() {
        let mut k = boot();
        let root = k.proc_create("root", None).unwrap();
        let tid = k.thread_create(root, SchedPolicy::Other, 10).unwrap();
        k.sched.adopt(&mut k.threads, tid).unwrap();

        assert_eq!(k.alarm_seconds(1).unwrap(), 0);
        for _ in 0..JIFFIES_PER_SECOND {
            k.tick().unwrap();
        }
        assert!(k
            .procs
            .get(root)
            .unwrap()
            .signals
            .deliverable());
        // Delivery at syscall return takes the default action.
        k.sched.adopt(&mut k.threads, tid).unwrap();
        let action = k.deliver_signals().unwrap();
        assert_eq!(action, Some((SIGALRM, SigAction::Terminate)));
        assert_eq!(k.procs.get(root).unwrap().state, ProcState::Zombie);
    }

    #[test]
    fn sleep_wakes_with_timeout_reason() {
        let mut k = boot();
        let root = k.proc_create("root", None).unwrap();
        let tid = k.thread_create(root, SchedPolicy::Other, 10).unwrap();
        k.sched.adopt(&mut k.threads, tid).unwrap();

        let err = k.sleep_seconds(1).unwrap_err();
        assert_eq!(err, KernelError::WouldBlock);
        for _ in 0..JIFFIES_PER_SECOND {
            k.tick().unwrap();
        }
        assert_eq!(k.threads.get(tid).unwrap().state, ThreadState::Ready);
        k.sched.adopt(&mut k.threads, tid).unwrap();
        k.sleep_seconds(1).unwrap();
    }
}
