//! System call surface
//!
//! The numbered entry points, the dispatcher that encodes results as
//! non-negative values or negative errnos, and the simple process and
//! identity calls. At every syscall return the big kernel lock is
//! released and pending signals are delivered; an operation that
//! parked its thread reports [`SyscallOutcome::Parked`] and is
//! re-issued by the trampoline when the thread next runs.

use crate::error::{KernelError, KernelResult, SchedError};
use crate::hal::ShutdownHow;
use crate::kernel::Kernel;
use crate::mm::{self, PAGE_SIZE};
use crate::proc::privileges::{Priv, PrivWhen};
use crate::proc::signal::{SigDisposition, SigMaskHow};
use crate::proc::thread::{SchedPolicy, ThreadState};
use crate::proc::{ProcId, NR_PROCESS};
use crate::sched::Scheduler;
use crate::timer::TimeSpec;

/// System call numbers (stable ABI).
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Close = 1,
    Write = 2,
    Read = 3,
    Truncate = 4,
    Unlink = 5,
    Mknod = 6,
    Symlink = 7,
    Readlink = 8,
    Ioctl = 9,

    ThreadSetSchedParams = 20,
    ThreadGetSchedParams = 21,
    SetPrivileges = 22,

    AddInterruptServer = 30,
    RemInterruptServer = 31,
    MaskInterrupt = 32,
    UnmaskInterrupt = 33,

    FutexWait = 40,
    FutexWake = 41,
    FutexRequeue = 42,
    FutexDestroy = 43,

    GetPid = 50,
    GetPPid = 51,
    GetUid = 52,
    GetGid = 53,
    GetEuid = 54,
    GetEgid = 55,
    SetUid = 56,
    SetGid = 57,
    SetPgrp = 58,
    GetPgrp = 59,

    Alarm = 60,
    Sleep = 61,
    Kill = 62,
    SigAction = 63,
    SigProcMask = 64,
    SignalNotify = 65,

    RpiMailbox = 70,
    SysConf = 71,
    ShutdownOs = 72,
}

/// `sysconf` names.
pub const SC_PAGE_SIZE: i32 = 1;
pub const SC_PROCESS_MAX: i32 = 2;

/// What the dispatcher hands back to the architecture glue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallOutcome {
    /// Value (or negative errno) to return to user mode.
    Done(isize),
    /// The thread parked; re-issue the call when it runs again.
    Parked,
}

/// Encode a kernel result for user mode.
pub fn encode<T: Into<isize>>(result: KernelResult<T>) -> SyscallOutcome {
    match result {
        Ok(v) => SyscallOutcome::Done(v.into()),
        Err(KernelError::WouldBlock) => SyscallOutcome::Parked,
        Err(e) => SyscallOutcome::Done(e.as_isize()),
    }
}

impl Kernel {
    // -----------------------------------------------------------------
    // Scheduling parameters
    // -----------------------------------------------------------------

    /// `sys_thread_setschedparams`: change the calling thread's policy
    /// and priority. Real-time policies need `PRIV_SCHED_RR` or
    /// `PRIV_SCHED`; the queue surgery runs with interrupts disabled.
    pub fn sys_thread_setschedparams(&mut self, policy: i32, priority: i32) -> KernelResult<()> {
        let policy = match policy {
            0 => SchedPolicy::Other,
            1 => SchedPolicy::Rr,
            2 => SchedPolicy::Fifo,
            _ => return Err(SchedError::InvalidPolicy.into()),
        };
        let priority = Scheduler::check_sched_params(policy, priority)?;
        if matches!(policy, SchedPolicy::Rr | SchedPolicy::Fifo) {
            let pid = self.current_proc()?;
            self.procs
                .get(pid)?
                .privileges
                .check(Priv::SCHED_RR | Priv::SCHED)?;
        }

        let int_state = self.hal.disable_interrupts();
        let tid = self.current_thread();
        let was_ready = self.threads.get(tid)?.state == ThreadState::Ready;
        if was_ready {
            self.sched.sched_unready(&mut self.threads, tid)?;
        }
        {
            let thread = self.threads.get_mut(tid)?;
            thread.sched_policy = policy;
            thread.desired_priority = priority;
            thread.priority = priority;
        }
        if was_ready {
            self.sched.sched_ready(&mut self.threads, tid)?;
        }
        self.sched.request_resched();
        self.sched.reschedule(&mut self.threads, self.hal)?;
        self.hal.restore_interrupts(int_state);
        Ok(())
    }

    /// `sys_thread_getschedparams` is not implemented.
    pub fn sys_thread_getschedparams(&mut self) -> KernelResult<()> {
        Err(KernelError::NoSys)
    }

    // -----------------------------------------------------------------
    // Privileges
    // -----------------------------------------------------------------

    /// Narrow one of the process's privilege bitmaps by intersection.
    /// Returns the resulting bitmap.
    pub fn sys_set_privileges(&mut self, when: i32, set: u64) -> KernelResult<u64> {
        let when = PrivWhen::from_raw(when)?;
        let set = Priv::from_bits_truncate(set);
        let pid = self.current_proc()?;
        Ok(self
            .procs
            .get_mut(pid)?
            .privileges
            .restrict(when, set)
            .bits())
    }

    /// User-pointer variant: `set` is read from, and the result
    /// written to, the caller's address space.
    pub fn sys_set_privileges_user(
        &mut self,
        when: i32,
        set_uaddr: usize,
        result_uaddr: usize,
    ) -> KernelResult<()> {
        if set_uaddr == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let pid = self.current_proc()?;
        let pmap = self.procs.get(pid)?.pmap.ok_or(KernelError::BadAddress)?;
        let mut raw = [0u8; 8];
        mm::copy_in(
            &mut self.pmaps,
            &mut self.frames,
            self.hal,
            pmap,
            &mut raw,
            set_uaddr,
        )?;
        let result = self.sys_set_privileges(when, u64::from_le_bytes(raw))?;
        if result_uaddr != 0 {
            mm::copy_out(
                &mut self.pmaps,
                &mut self.frames,
                self.hal,
                pmap,
                result_uaddr,
                &result.to_le_bytes(),
            )?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Interrupt servers
    // -----------------------------------------------------------------

    /// `sys_addinterruptserver`: register the calling thread as a
    /// server for `irq`, delivering `event` on each interrupt.
    pub fn sys_addinterruptserver(&mut self, irq: u32, event: u32) -> KernelResult<u32> {
        let pid = self.current_proc()?;
        self.procs.get(pid)?.privileges.check(Priv::INTERRUPT)?;
        let tid = self.current_thread();
        let id = self
            .irqs
            .add_server(&mut self.threads, self.hal, tid, irq, event)?;
        Ok(id.as_u32())
    }

    /// `sys_reminterruptserver`: drop one of the caller's own
    /// registrations.
    pub fn sys_reminterruptserver(&mut self, isr_id: u32) -> KernelResult<()> {
        let id = crate::interrupt::IsrId::from_u32(isr_id);
        if self.irqs.owner_of(id) != Some(self.current_thread()) {
            return Err(KernelError::PermissionDenied);
        }
        self.irqs.remove_server(&mut self.threads, self.hal, id)
    }

    pub fn sys_maskinterrupt(&mut self, irq: u32) -> KernelResult<()> {
        self.irqs.mask(self.hal, irq)
    }

    pub fn sys_unmaskinterrupt(&mut self, irq: u32) -> KernelResult<()> {
        let tid = self.current_thread();
        self.irqs.unmask(self.hal, tid, irq)
    }

    /// Consume pending event bits delivered to the calling thread.
    pub fn sys_eventcheck(&mut self) -> KernelResult<u32> {
        let tid = self.current_thread();
        let thread = self.threads.get_mut(tid)?;
        Ok(core::mem::take(&mut thread.pending_events))
    }

    // -----------------------------------------------------------------
    // Futexes
    // -----------------------------------------------------------------

    pub fn sys_futex_wait(
        &mut self,
        uaddr: usize,
        val: u32,
        timeout: Option<TimeSpec>,
    ) -> KernelResult<()> {
        let pid = self.current_proc()?;
        let pmap = self.procs.get(pid)?.pmap.ok_or(KernelError::BadAddress)?;
        let jiffies = match timeout {
            Some(ts) => Some(ts.to_jiffies()?),
            None => None,
        };
        let pending = self.pending_intr(self.current_thread());
        let Kernel {
            ref mut threads,
            ref mut sched,
            ref mut timers,
            hal,
            ref mut pmaps,
            ref mut frames,
            ref mut futexes,
            ..
        } = *self;
        futexes.wait(
            threads, sched, timers, hal, pmaps, frames, pid, pmap, uaddr, val, jiffies, pending,
        )
    }

    pub fn sys_futex_wake(&mut self, uaddr: usize, n: u32) -> KernelResult<u32> {
        let pid = self.current_proc()?;
        mm::bounds_check(uaddr, 4)?;
        self.futexes.wake(
            &mut self.threads,
            &mut self.sched,
            &mut self.timers,
            pid,
            uaddr,
            n,
        )
    }

    pub fn sys_futex_requeue(
        &mut self,
        uaddr: usize,
        n: u32,
        uaddr2: usize,
        m: u32,
    ) -> KernelResult<u32> {
        let pid = self.current_proc()?;
        mm::bounds_check(uaddr, 4)?;
        mm::bounds_check(uaddr2, 4)?;
        let (woken, _moved) = self.futexes.requeue(
            &mut self.threads,
            &mut self.sched,
            &mut self.timers,
            pid,
            uaddr,
            n,
            uaddr2,
            m,
        )?;
        Ok(woken)
    }

    pub fn sys_futex_destroy(&mut self, uaddr: usize) -> KernelResult<()> {
        let pid = self.current_proc()?;
        self.futexes.destroy(&self.threads, pid, uaddr)
    }

    // -----------------------------------------------------------------
    // Identity
    // -----------------------------------------------------------------

    pub fn sys_getpid(&self) -> KernelResult<u32> {
        Ok(self.current_proc()?.as_u32())
    }

    pub fn sys_getppid(&self) -> KernelResult<u32> {
        let pid = self.current_proc()?;
        Ok(self
            .procs
            .get(pid)?
            .parent
            .map(|p| p.as_u32())
            .unwrap_or(0))
    }

    pub fn sys_getuid(&self) -> KernelResult<u32> {
        Ok(self.procs.get(self.current_proc()?)?.cred.uid)
    }

    pub fn sys_getgid(&self) -> KernelResult<u32> {
        Ok(self.procs.get(self.current_proc()?)?.cred.gid)
    }

    pub fn sys_geteuid(&self) -> KernelResult<u32> {
        Ok(self.procs.get(self.current_proc()?)?.cred.euid)
    }

    pub fn sys_getegid(&self) -> KernelResult<u32> {
        Ok(self.procs.get(self.current_proc()?)?.cred.egid)
    }

    /// Only a root identity may change uid.
    pub fn sys_setuid(&mut self, uid: u32) -> KernelResult<()> {
        let pid = self.current_proc()?;
        let cred = self.procs.get(pid)?.cred;
        if cred.uid != 0 && cred.gid != 0 {
            return Err(KernelError::PermissionDenied);
        }
        let c = &mut self.procs.get_mut(pid)?.cred;
        c.uid = uid;
        c.euid = uid;
        Ok(())
    }

    pub fn sys_setgid(&mut self, gid: u32) -> KernelResult<()> {
        let pid = self.current_proc()?;
        let cred = self.procs.get(pid)?.cred;
        if cred.uid != 0 && cred.gid != 0 {
            return Err(KernelError::PermissionDenied);
        }
        let c = &mut self.procs.get_mut(pid)?.cred;
        c.gid = gid;
        c.egid = gid;
        Ok(())
    }

    pub fn sys_setpgrp(&mut self) -> KernelResult<u32> {
        let pid = self.current_proc()?;
        let c = &mut self.procs.get_mut(pid)?.cred;
        c.pgrp = pid.as_u32();
        Ok(c.pgrp)
    }

    pub fn sys_getpgrp(&self) -> KernelResult<u32> {
        Ok(self.procs.get(self.current_proc()?)?.cred.pgrp)
    }

    // -----------------------------------------------------------------
    // Signals
    // -----------------------------------------------------------------

    /// `sys_kill`: root, a matching uid, or `PRIV_KILL` may signal
    /// another process.
    pub fn sys_kill(&mut self, pid: u32, sig: i32) -> KernelResult<()> {
        let me = self.current_proc()?;
        let target = ProcId::from_u32(pid);
        if !self.procs.contains(target) {
            return Err(KernelError::NotFound);
        }
        let my_cred = self.procs.get(me)?.cred;
        let their_uid = self.procs.get(target)?.cred.uid;
        let allowed = my_cred.euid == 0
            || my_cred.uid == their_uid
            || self.procs.get(me)?.privileges.check(Priv::KILL).is_ok();
        if !allowed {
            return Err(KernelError::PermissionDenied);
        }
        self.send_signal(target, sig)
    }

    /// `sigaction`: install a handler. `handler` of 0 is SIG_DFL, 1 is
    /// SIG_IGN, anything else the handler entry point.
    pub fn sys_sigaction(
        &mut self,
        sig: i32,
        handler: usize,
        mask: u64,
        resethand: bool,
        nodefer: bool,
    ) -> KernelResult<usize> {
        let pid = self.current_proc()?;
        let disposition = match handler {
            0 => SigDisposition::Default,
            1 => SigDisposition::Ignore,
            entry => SigDisposition::Handler(entry),
        };
        let old = self
            .procs
            .get_mut(pid)?
            .signals
            .set_action(sig, disposition, mask, resethand, nodefer)?;
        Ok(match old {
            SigDisposition::Default => 0,
            SigDisposition::Ignore => 1,
            SigDisposition::Handler(entry) => entry,
        })
    }

    /// `sigprocmask`: 0 block, 1 unblock, 2 set. Returns the old mask.
    pub fn sys_sigprocmask(&mut self, how: i32, set: u64) -> KernelResult<u64> {
        let how = match how {
            0 => SigMaskHow::Block,
            1 => SigMaskHow::Unblock,
            2 => SigMaskHow::SetMask,
            _ => return Err(KernelError::InvalidArgument),
        };
        let pid = self.current_proc()?;
        Ok(self.procs.get_mut(pid)?.signals.set_mask(how, set))
    }

    // -----------------------------------------------------------------
    // Board services
    // -----------------------------------------------------------------

    /// `sys_rpi_mailbox`: one property-tag transaction through the
    /// VideoCore mailbox. The firmware writes the response over the
    /// request buffer; both sides are bounced through kernel memory.
    pub fn sys_rpi_mailbox(
        &mut self,
        tag: u32,
        req: usize,
        req_sz: usize,
        rsp: usize,
        rsp_sz: usize,
    ) -> KernelResult<()> {
        let pid = self.current_proc()?;
        self.procs.get(pid)?.privileges.check(Priv::IO)?;
        mm::bounds_check(req, req_sz)?;
        mm::bounds_check(rsp, rsp_sz)?;
        let pmap = self.procs.get(pid)?.pmap.ok_or(KernelError::BadAddress)?;

        let mut buffer = alloc::vec![0u8; req_sz.max(rsp_sz)];
        mm::copy_in(
            &mut self.pmaps,
            &mut self.frames,
            self.hal,
            pmap,
            &mut buffer[..req_sz],
            req,
        )?;

        self.hal.dsb();
        self.hal.mbox_write(8, tag);
        let answered = self.hal.mbox_read(8);
        self.hal.dsb();
        if answered != tag {
            return Err(KernelError::Io);
        }

        mm::copy_out(
            &mut self.pmaps,
            &mut self.frames,
            self.hal,
            pmap,
            rsp,
            &buffer[..rsp_sz.min(buffer.len())],
        )?;
        Ok(())
    }

    /// `sys_sysconf`.
    pub fn sys_sysconf(&self, name: i32) -> KernelResult<usize> {
        match name {
            SC_PAGE_SIZE => Ok(PAGE_SIZE),
            SC_PROCESS_MAX => Ok(NR_PROCESS),
            _ => Err(KernelError::NoSys),
        }
    }

    /// `sys_shutdown_os`.
    pub fn sys_shutdown_os(&mut self, how: i32) -> KernelResult<()> {
        let pid = self.current_proc()?;
        self.procs.get(pid)?.privileges.check(Priv::SHUTDOWN)?;
        let how = match how {
            0 => ShutdownHow::Halt,
            1 => ShutdownHow::Reboot,
            2 => ShutdownHow::PowerOff,
            _ => return Err(KernelError::InvalidArgument),
        };
        log::warn!("shutdown requested: {:?}", how);
        self.hal.shutdown(how);
        Ok(())
    }
}

/// Dispatch one system call against the kernel, deliver pending
/// signals on the way out, and encode the result.
pub fn dispatch(
    kernel: &mut Kernel,
    nr: Syscall,
    args: [usize; 5],
) -> SyscallOutcome {
    let result: KernelResult<isize> = match nr {
        Syscall::Close => kernel.sys_close(args[0] as i32).map(|_| 0),
        Syscall::Write => kernel
            .sys_write(args[0] as i32, args[1], args[2])
            .map(|n| n as isize),
        Syscall::Read => kernel
            .sys_read(args[0] as i32, args[1], args[2])
            .map(|n| n as isize),
        Syscall::Truncate => kernel
            .sys_truncate(args[0] as i32, args[1] as u64)
            .map(|_| 0),
        Syscall::Unlink => kernel
            .with_user_path(args[0], |k, path| k.sys_unlink(path))
            .map(|_| 0),
        Syscall::Mknod => kernel
            .sys_mknod_user(args[0], args[1] as u32, args[2])
            .map(|_| 0),
        Syscall::Symlink => kernel
            .with_user_two_paths(args[0], args[1], |k, path, target| {
                k.sys_symlink(path, target)
            })
            .map(|_| 0),
        Syscall::Readlink => kernel.sys_readlink_user(args[0], args[1], args[2]),
        Syscall::Ioctl => kernel
            .sys_ioctl(args[0] as i32, args[1] as u32, args[2])
            .map(|_| 0),

        Syscall::ThreadSetSchedParams => kernel
            .sys_thread_setschedparams(args[0] as i32, args[1] as i32)
            .map(|_| 0),
        Syscall::ThreadGetSchedParams => kernel.sys_thread_getschedparams().map(|_| 0),
        Syscall::SetPrivileges => kernel
            .sys_set_privileges_user(args[0] as i32, args[1], args[2])
            .map(|_| 0),

        Syscall::AddInterruptServer => kernel
            .sys_addinterruptserver(args[0] as u32, args[1] as u32)
            .map(|id| id as isize),
        Syscall::RemInterruptServer => kernel
            .sys_reminterruptserver(args[0] as u32)
            .map(|_| 0),
        Syscall::MaskInterrupt => kernel.sys_maskinterrupt(args[0] as u32).map(|_| 0),
        Syscall::UnmaskInterrupt => kernel.sys_unmaskinterrupt(args[0] as u32).map(|_| 0),

        Syscall::FutexWait => {
            let timeout = if args[2] == 0 {
                None
            } else {
                Some(TimeSpec::new(args[2] as i64, args[3] as i64))
            };
            kernel
                .sys_futex_wait(args[0], args[1] as u32, timeout)
                .map(|_| 0)
        }
        Syscall::FutexWake => kernel
            .sys_futex_wake(args[0], args[1] as u32)
            .map(|n| n as isize),
        Syscall::FutexRequeue => kernel
            .sys_futex_requeue(args[0], args[1] as u32, args[2], args[3] as u32)
            .map(|n| n as isize),
        Syscall::FutexDestroy => kernel.sys_futex_destroy(args[0]).map(|_| 0),

        Syscall::GetPid => kernel.sys_getpid().map(|v| v as isize),
        Syscall::GetPPid => kernel.sys_getppid().map(|v| v as isize),
        Syscall::GetUid => kernel.sys_getuid().map(|v| v as isize),
        Syscall::GetGid => kernel.sys_getgid().map(|v| v as isize),
        Syscall::GetEuid => kernel.sys_geteuid().map(|v| v as isize),
        Syscall::GetEgid => kernel.sys_getegid().map(|v| v as isize),
        Syscall::SetUid => kernel.sys_setuid(args[0] as u32).map(|_| 0),
        Syscall::SetGid => kernel.sys_setgid(args[0] as u32).map(|_| 0),
        Syscall::SetPgrp => kernel.sys_setpgrp().map(|v| v as isize),
        Syscall::GetPgrp => kernel.sys_getpgrp().map(|v| v as isize),

        Syscall::Alarm => kernel.alarm_seconds(args[0] as u32).map(|v| v as isize),
        Syscall::Sleep => kernel.sleep_seconds(args[0] as u32).map(|_| 0),
        Syscall::Kill => kernel.sys_kill(args[0] as u32, args[1] as i32).map(|_| 0),
        Syscall::SigAction => kernel
            .sys_sigaction(args[0] as i32, args[1], args[2] as u64, false, false)
            .map(|v| v as isize),
        Syscall::SigProcMask => kernel
            .sys_sigprocmask(args[0] as i32, args[1] as u64)
            .map(|v| v as isize),
        Syscall::SignalNotify => kernel
            .sys_signalnotify(args[0] as i32, args[1] as u64, args[2] as i32)
            .map(|_| 0),

        Syscall::RpiMailbox => kernel
            .sys_rpi_mailbox(args[0] as u32, args[1], args[2], args[3], args[4])
            .map(|_| 0),
        Syscall::SysConf => kernel.sys_sysconf(args[0] as i32).map(|v| v as isize),
        Syscall::ShutdownOs => kernel.sys_shutdown_os(args[0] as i32).map(|_| 0),
    };

    let outcome = encode(result);
    if !matches!(outcome, SyscallOutcome::Parked) {
        // Signal delivery happens on every return to user mode.
        let _ = kernel.deliver_signals();
    }
    outcome
}

impl Kernel {
    /// Copy a path from user memory and run `f` on it.
    fn with_user_path<R>(
        &mut self,
        path_uaddr: usize,
        f: impl FnOnce(&mut Self, &str) -> KernelResult<R>,
    ) -> KernelResult<R> {
        let pid = self.current_proc()?;
        let pmap = self.procs.get(pid)?.pmap.ok_or(KernelError::BadAddress)?;
        let path = mm::copy_in_str(
            &mut self.pmaps,
            &mut self.frames,
            self.hal,
            pmap,
            path_uaddr,
            crate::fs::PATH_MAX,
        )?;
        f(self, &path)
    }

    fn with_user_two_paths<R>(
        &mut self,
        a_uaddr: usize,
        b_uaddr: usize,
        f: impl FnOnce(&mut Self, &str, &str) -> KernelResult<R>,
    ) -> KernelResult<R> {
        let pid = self.current_proc()?;
        let pmap = self.procs.get(pid)?.pmap.ok_or(KernelError::BadAddress)?;
        let a = mm::copy_in_str(
            &mut self.pmaps,
            &mut self.frames,
            self.hal,
            pmap,
            a_uaddr,
            crate::fs::PATH_MAX,
        )?;
        let b = mm::copy_in_str(
            &mut self.pmaps,
            &mut self.frames,
            self.hal,
            pmap,
            b_uaddr,
            crate::fs::PATH_MAX,
        )?;
        f(self, &a, &b)
    }

    /// `sys_mknod` with user pointers: the stat block (mode word
    /// first) is copied in before the path walk; a bad pointer is
    /// `-EFAULT`.
    fn sys_mknod_user(
        &mut self,
        path_uaddr: usize,
        flags: u32,
        stat_uaddr: usize,
    ) -> KernelResult<()> {
        let pid = self.current_proc()?;
        let pmap = self.procs.get(pid)?.pmap.ok_or(KernelError::BadAddress)?;
        let mut raw = [0u8; 4];
        mm::copy_in(
            &mut self.pmaps,
            &mut self.frames,
            self.hal,
            pmap,
            &mut raw,
            stat_uaddr,
        )?;
        let mode = u32::from_le_bytes(raw);
        self.with_user_path(path_uaddr, |k, path| k.sys_mknod(path, flags, mode))
    }

    /// `sys_readlink` with user buffers.
    fn sys_readlink_user(
        &mut self,
        path_uaddr: usize,
        link_uaddr: usize,
        link_sz: usize,
    ) -> KernelResult<isize> {
        let target =
            self.with_user_path(path_uaddr, |k, path| k.sys_readlink(path, link_sz))?;
        let pid = self.current_proc()?;
        let pmap = self.procs.get(pid)?.pmap.ok_or(KernelError::BadAddress)?;
        mm::copy_out(
            &mut self.pmaps,
            &mut self.frames,
            self.hal,
            pmap,
            link_uaddr,
            &target,
        )?;
        Ok(target.len() as isize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot_info::BootInfo;
    use crate::hal::NullHal;
    use crate::proc::thread::SchedPolicy as Policy;

    static TEST_HAL: NullHal = NullHal::new();

    fn boot_with_user() -> (Kernel, crate::proc::thread::ThreadId) {
        let mut k = Kernel::new(&BootInfo::hosted(8 * 1024 * 1024), &TEST_HAL).unwrap();
        let root = k.proc_create("root", None).unwrap();
        let tid = k.thread_create(root, Policy::Other, 10).unwrap();
        k.sched.adopt(&mut k.threads, tid).unwrap();
        (k, tid)
    }

    #[test]
    fn sysconf_reports_page_size_and_process_max() {
        let (k, _) = boot_with_user();
        assert_eq!(k.sys_sysconf(SC_PAGE_SIZE).unwrap(), PAGE_SIZE);
        assert_eq!(k.sys_sysconf(SC_PROCESS_MAX).unwrap(), NR_PROCESS);
        assert_eq!(k.sys_sysconf(99).unwrap_err(), KernelError::NoSys);
    }

    #[test]
    fn setschedparams_validates_and_requires_privilege() {
        let (mut k, tid) = boot_with_user();
        // Out-of-range priorities.
        assert!(k.sys_thread_setschedparams(0, 16).is_err());
        assert!(k.sys_thread_setschedparams(1, 10).is_err());
        assert!(k.sys_thread_setschedparams(7, 10).is_err());

        // Allowed: the root process holds all privileges.
        k.sys_thread_setschedparams(1, 20).unwrap();
        assert_eq!(k.threads.get(tid).unwrap().priority, 20);
        assert_eq!(k.threads.get(tid).unwrap().sched_policy, Policy::Rr);

        // Drop the scheduling privileges and try again.
        let pid = k.current_proc().unwrap();
        k.procs
            .get_mut(pid)
            .unwrap()
            .privileges
            .restrict(PrivWhen::Now, Priv::IO);
        assert_eq!(
            k.sys_thread_setschedparams(2, 25).unwrap_err(),
            KernelError::PermissionDenied
        );
    }

    #[test]
    fn identity_calls_track_credentials() {
        let (mut k, _) = boot_with_user();
        assert_eq!(k.sys_getuid().unwrap(), 0);
        k.sys_setuid(100).unwrap();
        assert_eq!(k.sys_getuid().unwrap(), 100);
        assert_eq!(k.sys_geteuid().unwrap(), 100);
        // No longer root: further setuid refused.
        assert!(k.sys_setuid(0).is_err());
        let pgrp = k.sys_setpgrp().unwrap();
        assert_eq!(k.sys_getpgrp().unwrap(), pgrp);
    }

    #[test]
    fn set_privileges_narrows_monotonically() {
        let (mut k, _) = boot_with_user();
        let left = k
            .sys_set_privileges(0, (Priv::SCHED | Priv::IO).bits())
            .unwrap();
        assert_eq!(left, (Priv::SCHED | Priv::IO).bits());
        let left = k.sys_set_privileges(0, Priv::all().bits()).unwrap();
        assert_eq!(left, (Priv::SCHED | Priv::IO).bits());
        assert!(k.sys_set_privileges(5, 0).is_err());
    }

    #[test]
    fn shutdown_requires_privilege() {
        let (mut k, _) = boot_with_user();
        let pid = k.current_proc().unwrap();
        k.procs
            .get_mut(pid)
            .unwrap()
            .privileges
            .restrict(PrivWhen::Now, Priv::IO);
        assert_eq!(
            k.sys_shutdown_os(0).unwrap_err(),
            KernelError::PermissionDenied
        );
    }

    #[test]
    fn signalnotify_is_enosys() {
        let (mut k, _) = boot_with_user();
        assert_eq!(
            k.sys_signalnotify(0, 0, 9).unwrap_err(),
            KernelError::NoSys
        );
    }
}
