//! Interrupt subsystem
//!
//! Two layers. The top half runs with interrupts disabled: it reads the
//! pending registers through the HAL, reprograms and accounts the timer
//! tick, and for every other pending line masks the IRQ at the
//! controller and queues it for the DPC thread. The DPC (deferred
//! procedure call) thread runs with interrupts enabled and performs the
//! actual fanout: each registered user-mode interrupt server gets its
//! event bit set on its owner thread, and sleeping owners are woken
//! through the event path.
//!
//! Masking is reference-counted: delivery masks the line once per
//! notified handler, and every handler must re-unmask with
//! `sys_unmaskinterrupt` after servicing; the line opens again when the
//! count returns to zero. This keeps at most one delivery pending per
//! (IRQ, handler) between mask and unmask.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::arena::Arena;
use crate::define_id;
use crate::error::{KernelError, KernelResult};
use crate::hal::{Hal, NR_IRQ};
use crate::proc::thread::{Intr, ThreadId, ThreadTable, WakeReason};
use crate::sched::Scheduler;
use crate::sync::rendez::{self, Rendez};
use crate::timer::TimerWheel;

/// IRQ line of the system timer compare used for the jiffy tick.
pub const TIMER_IRQ: u32 = 1;

/// Maximum number of registered interrupt servers.
pub const NR_ISR_HANDLER: usize = 64;

define_id! {
    /// Handle into the interrupt-server table.
    IsrId
}

/// A user-mode interrupt server registration.
pub struct IsrHandler {
    pub irq: u32,
    /// Event bit (0..31) posted to the owner thread on delivery.
    pub event: u32,
    pub thread: ThreadId,
    /// Deliveries not yet re-unmasked by the owner.
    pending_unmask: u32,
}

/// What the top half found, for the caller to act on.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TopHalfOutcome {
    /// The timer line fired; the caller runs the clock tick.
    pub timer_tick: bool,
    /// Work was queued for the DPC thread.
    pub dpc_work: bool,
}

/// The interrupt-server registry and DPC queue.
pub struct InterruptTable {
    handlers: Arena<IsrHandler>,
    /// Registered handlers per IRQ line.
    irq_handlers: Vec<Vec<IsrId>>,
    /// Reference-counted controller masks per IRQ line.
    mask_cnt: Vec<u32>,
    /// IRQs awaiting DPC fanout.
    pending_dpc: VecDeque<u32>,
    /// The DPC kernel thread blocks here.
    pub dpc_rendez: Rendez,
}

impl InterruptTable {
    pub fn new() -> Self {
        let mut irq_handlers = Vec::with_capacity(NR_IRQ as usize);
        irq_handlers.resize_with(NR_IRQ as usize, Vec::new);
        Self {
            handlers: Arena::new("isr_handler", NR_ISR_HANDLER),
            irq_handlers,
            mask_cnt: alloc::vec![0; NR_IRQ as usize],
            pending_dpc: VecDeque::new(),
            dpc_rendez: Rendez::new(),
        }
    }

    fn check_irq(irq: u32) -> KernelResult<usize> {
        if irq < NR_IRQ && irq != TIMER_IRQ {
            Ok(irq as usize)
        } else {
            Err(KernelError::InvalidArgument)
        }
    }

    /// `sys_addinterruptserver`: register a server for an IRQ.
    /// Multiple servers may share one line. The line is enabled at the
    /// controller on its first registration.
    pub fn add_server(
        &mut self,
        threads: &mut ThreadTable,
        hal: &dyn Hal,
        tid: ThreadId,
        irq: u32,
        event: u32,
    ) -> KernelResult<IsrId> {
        let line = Self::check_irq(irq)?;
        if event >= 32 {
            return Err(KernelError::InvalidArgument);
        }
        let id = self
            .handlers
            .insert(IsrHandler {
                irq,
                event,
                thread: tid,
                pending_unmask: 0,
            })
            .map(IsrId)
            .map_err(|_| KernelError::ResourceExhausted {
                resource: "isr_handler",
            })?;
        let first = self.irq_handlers[line].is_empty();
        self.irq_handlers[line].push(id);
        threads.get_mut(tid)?.isr_handlers.push(id);
        if first && self.mask_cnt[line] == 0 {
            hal.enable_irq(irq);
        }
        Ok(id)
    }

    /// `sys_reminterruptserver`: drop a registration. Outstanding
    /// deliveries the owner never re-unmasked are credited back so the
    /// line is not wedged.
    pub fn remove_server(
        &mut self,
        threads: &mut ThreadTable,
        hal: &dyn Hal,
        id: IsrId,
    ) -> KernelResult<()> {
        let handler = self.handlers.remove(id.0).ok_or(KernelError::NotFound)?;
        let line = handler.irq as usize;
        if let Some(pos) = self.irq_handlers[line].iter().position(|&h| h == id) {
            self.irq_handlers[line].swap_remove(pos);
        }
        if let Ok(thread) = threads.get_mut(handler.thread) {
            if let Some(pos) = thread.isr_handlers.iter().position(|&h| h == id) {
                thread.isr_handlers.swap_remove(pos);
            }
        }
        for _ in 0..handler.pending_unmask {
            self.unmask_line(hal, handler.irq);
        }
        if self.irq_handlers[line].is_empty() {
            hal.disable_irq(handler.irq);
        }
        Ok(())
    }

    /// `do_free_all_isrhandlers`: called on thread exit.
    pub fn free_thread_handlers(
        &mut self,
        threads: &mut ThreadTable,
        hal: &dyn Hal,
        tid: ThreadId,
    ) -> KernelResult<()> {
        let ids: Vec<IsrId> = match threads.get(tid) {
            Ok(t) => t.isr_handlers.clone(),
            Err(_) => Vec::new(),
        };
        for id in ids {
            self.remove_server(threads, hal, id)?;
        }
        Ok(())
    }

    /// `sys_maskinterrupt`: mask a line, reference-counted.
    pub fn mask(&mut self, hal: &dyn Hal, irq: u32) -> KernelResult<()> {
        let line = Self::check_irq(irq)?;
        self.mask_cnt[line] += 1;
        if self.mask_cnt[line] == 1 {
            hal.disable_irq(irq);
        }
        Ok(())
    }

    /// `sys_unmaskinterrupt`: undo one mask; the line reopens at zero.
    /// The calling thread's oldest pending delivery on this line is
    /// considered serviced.
    pub fn unmask(&mut self, hal: &dyn Hal, tid: ThreadId, irq: u32) -> KernelResult<()> {
        let line = Self::check_irq(irq)?;
        if self.mask_cnt[line] == 0 {
            return Err(KernelError::InvalidArgument);
        }
        // Credit the caller's handler on this line, if any.
        for &id in &self.irq_handlers[line] {
            if let Some(handler) = self.handlers.get_mut(id.0) {
                if handler.thread == tid && handler.pending_unmask > 0 {
                    handler.pending_unmask -= 1;
                    break;
                }
            }
        }
        self.unmask_line(hal, irq);
        Ok(())
    }

    fn unmask_line(&mut self, hal: &dyn Hal, irq: u32) {
        let line = irq as usize;
        if self.mask_cnt[line] > 0 {
            self.mask_cnt[line] -= 1;
            if self.mask_cnt[line] == 0 {
                hal.enable_irq(irq);
            }
        }
    }

    pub fn mask_count(&self, irq: u32) -> u32 {
        self.mask_cnt[irq as usize]
    }

    /// Thread owning a registration.
    pub fn owner_of(&self, id: IsrId) -> Option<ThreadId> {
        self.handlers.get(id.0).map(|h| h.thread)
    }

    pub fn handlers_on(&self, irq: u32) -> usize {
        self.irq_handlers[irq as usize].len()
    }

    /// Interrupt top half. Runs with interrupts disabled; takes no
    /// blocking action. Reads the pending lines, hands the timer line
    /// back to the caller, and for every other line auto-masks it (once
    /// per registered handler) and queues DPC fanout work.
    pub fn top_half(&mut self, hal: &dyn Hal) -> TopHalfOutcome {
        let mut outcome = TopHalfOutcome::default();
        let pending = hal.read_pending_irqs();
        for irq in 0..NR_IRQ {
            if pending & (1 << irq) == 0 {
                continue;
            }
            if irq == TIMER_IRQ {
                hal.timer_reprogram_compare();
                outcome.timer_tick = true;
                continue;
            }
            let line = irq as usize;
            let nhandlers = self.irq_handlers[line].len() as u32;
            if nhandlers == 0 {
                // Spurious: mask the line and drop it.
                hal.disable_irq(irq);
                continue;
            }
            // Auto-mask: one reference per handler to notify; each is
            // repaid by that handler's unmaskinterrupt.
            if self.mask_cnt[line] == 0 {
                hal.disable_irq(irq);
            }
            self.mask_cnt[line] += nhandlers;
            for &id in &self.irq_handlers[line] {
                if let Some(handler) = self.handlers.get_mut(id.0) {
                    handler.pending_unmask += 1;
                }
            }
            if !self.pending_dpc.contains(&irq) {
                self.pending_dpc.push_back(irq);
            }
            outcome.dpc_work = true;
        }
        outcome
    }

    /// Whether DPC work is queued.
    pub fn dpc_pending(&self) -> bool {
        !self.pending_dpc.is_empty()
    }

    /// One pass of the DPC thread body: fan pending IRQs out to their
    /// interrupt servers. Runs in thread context with interrupts
    /// enabled. Each server's owner gets the event bit set and, if
    /// sleeping interruptibly on events, is woken.
    pub fn run_dpc_once(
        &mut self,
        threads: &mut ThreadTable,
        sched: &mut Scheduler,
        timers: &mut TimerWheel,
    ) -> KernelResult<usize> {
        let mut delivered = 0;
        while let Some(irq) = self.pending_dpc.pop_front() {
            let ids = self.irq_handlers[irq as usize].clone();
            for id in ids {
                let (tid, event) = match self.handlers.get(id.0) {
                    Some(h) => (h.thread, h.event),
                    None => continue,
                };
                if let Ok(thread) = threads.get_mut(tid) {
                    thread.pending_events |= 1 << event;
                }
                rendez::interrupt_sleep(
                    threads,
                    sched,
                    timers,
                    tid,
                    Intr::EVENT,
                    WakeReason::Event,
                )?;
                delivered += 1;
            }
        }
        Ok(delivered)
    }
}

impl Default for InterruptTable {
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
        irqs: InterruptTable,
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
            irqs: InterruptTable::new(),
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

    #[test]
    fn registration_enables_line() {
        let mut w = setup();
        let t = spawn(&mut w);
        assert!(w.hal.irq_masked(29));
        w.irqs
            .add_server(&mut w.threads, &w.hal, t, 29, 1)
            .unwrap();
        assert!(!w.hal.irq_masked(29));
        assert_eq!(w.irqs.handlers_on(29), 1);
    }

    #[test]
    fn invalid_registrations_rejected() {
        let mut w = setup();
        let t = spawn(&mut w);
        assert!(w.irqs.add_server(&mut w.threads, &w.hal, t, NR_IRQ, 1).is_err());
        assert!(w
            .irqs
            .add_server(&mut w.threads, &w.hal, t, TIMER_IRQ, 1)
            .is_err());
        assert!(w.irqs.add_server(&mut w.threads, &w.hal, t, 29, 32).is_err());
    }

    #[test]
    fn timer_line_reported_to_caller() {
        let mut w = setup();
        w.hal.enable_irq(TIMER_IRQ);
        w.hal.raise_irq(TIMER_IRQ);
        let outcome = w.irqs.top_half(&w.hal);
        assert!(outcome.timer_tick);
        assert!(!outcome.dpc_work);
    }

    #[test]
    fn fanout_delivers_events_and_automasks() {
        let mut w = setup();
        let a = spawn(&mut w);
        let b = spawn(&mut w);
        w.irqs.add_server(&mut w.threads, &w.hal, a, 29, 1).unwrap();
        w.irqs.add_server(&mut w.threads, &w.hal, b, 29, 2).unwrap();

        w.hal.raise_irq(29);
        let outcome = w.irqs.top_half(&w.hal);
        assert!(outcome.dpc_work);
        assert!(w.hal.irq_masked(29));
        assert_eq!(w.irqs.mask_count(29), 2);

        w.irqs
            .run_dpc_once(&mut w.threads, &mut w.sched, &mut w.timers)
            .unwrap();
        assert_eq!(w.threads.get(a).unwrap().pending_events, 1 << 1);
        assert_eq!(w.threads.get(b).unwrap().pending_events, 1 << 2);

        // The line stays masked until both servers unmask.
        w.irqs.unmask(&w.hal, a, 29).unwrap();
        assert!(w.hal.irq_masked(29));
        w.irqs.unmask(&w.hal, b, 29).unwrap();
        assert!(!w.hal.irq_masked(29));
    }

    #[test]
    fn sleeping_server_is_woken_by_event() {
        let mut w = setup();
        let t = spawn(&mut w);
        w.irqs.add_server(&mut w.threads, &w.hal, t, 29, 3).unwrap();

        // Server parks waiting for events.
        w.sched.adopt(&mut w.threads, t).unwrap();
        let mut event_rendez = Rendez::new();
        let _ = rendez::task_sleep_interruptible(
            &mut w.threads,
            &mut w.sched,
            &w.hal,
            &mut event_rendez,
            Intr::EVENT,
            Intr::NONE,
        );
        assert_eq!(w.threads.get(t).unwrap().state, ThreadState::Sleeping);

        w.hal.raise_irq(29);
        w.irqs.top_half(&w.hal);
        w.irqs
            .run_dpc_once(&mut w.threads, &mut w.sched, &mut w.timers)
            .unwrap();
        assert_eq!(w.threads.get(t).unwrap().state, ThreadState::Ready);
        assert_eq!(
            w.threads.get_mut(t).unwrap().take_wake_reason(),
            Some(WakeReason::Event)
        );
    }

    #[test]
    fn mask_unmask_reference_counted() {
        let mut w = setup();
        let t = spawn(&mut w);
        w.irqs.add_server(&mut w.threads, &w.hal, t, 29, 1).unwrap();
        w.irqs.mask(&w.hal, 29).unwrap();
        w.irqs.mask(&w.hal, 29).unwrap();
        assert!(w.hal.irq_masked(29));
        w.irqs.unmask(&w.hal, t, 29).unwrap();
        assert!(w.hal.irq_masked(29));
        w.irqs.unmask(&w.hal, t, 29).unwrap();
        assert!(!w.hal.irq_masked(29));
        assert!(w.irqs.unmask(&w.hal, t, 29).is_err());
    }

    #[test]
    fn thread_exit_frees_handlers_and_unwedges_line() {
        let mut w = setup();
        let t = spawn(&mut w);
        w.irqs.add_server(&mut w.threads, &w.hal, t, 29, 1).unwrap();
        w.hal.raise_irq(29);
        w.irqs.top_half(&w.hal);
        assert_eq!(w.irqs.mask_count(29), 1);

        // Owner dies without unmasking; its mask references unwind.
        w.irqs
            .free_thread_handlers(&mut w.threads, &w.hal, t)
            .unwrap();
        assert_eq!(w.irqs.handlers_on(29), 0);
        assert_eq!(w.irqs.mask_count(29), 0);
        assert!(w.hal.irq_masked(29));
    }
}
