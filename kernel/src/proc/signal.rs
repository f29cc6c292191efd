//! Per-process signal state
//!
//! The disposition table, mask and pending set live with the process;
//! delivery happens at syscall return and at selected preemption
//! points, never from interrupt context and never inside an
//! exclusively-held lock. SIGKILL and SIGSTOP can be neither caught,
//! ignored nor masked.

use crate::error::{KernelError, KernelResult};

/// Number of signals.
pub const NSIG: usize = 32;

pub const SIGHUP: i32 = 1;
pub const SIGINT: i32 = 2;
pub const SIGQUIT: i32 = 3;
pub const SIGILL: i32 = 4;
pub const SIGTRAP: i32 = 5;
pub const SIGABRT: i32 = 6;
pub const SIGBUS: i32 = 7;
pub const SIGFPE: i32 = 8;
pub const SIGKILL: i32 = 9;
pub const SIGUSR1: i32 = 10;
pub const SIGSEGV: i32 = 11;
pub const SIGUSR2: i32 = 12;
pub const SIGPIPE: i32 = 13;
pub const SIGALRM: i32 = 14;
pub const SIGTERM: i32 = 15;
pub const SIGCHLD: i32 = 17;
pub const SIGCONT: i32 = 18;
pub const SIGSTOP: i32 = 19;
pub const SIGTSTP: i32 = 20;

/// Bit for a signal number.
pub const fn sigbit(sig: i32) -> u64 {
    1 << (sig - 1)
}

/// Signals that can never be caught or masked.
pub const SIG_CANT_MASK: u64 = sigbit(SIGKILL) | sigbit(SIGSTOP);

/// Signals whose default action stops the process.
const STOP_SIG_MASK: u64 = sigbit(SIGSTOP) | sigbit(SIGTSTP);

/// Signals ignored by default.
const IGNORE_SIG_MASK: u64 = sigbit(SIGCHLD) | sigbit(SIGCONT);

/// How a caught signal is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigDisposition {
    Default,
    Ignore,
    /// User handler entry point (virtual address of the handler; the
    /// trampoline installed by the runtime performs sigreturn).
    Handler(usize),
}

/// `sigprocmask` operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigMaskHow {
    Block,
    Unblock,
    SetMask,
}

/// What the kernel does with a delivered signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigAction {
    /// Invoke the user handler at this address with this added mask.
    Handler { entry: usize, add_mask: u64 },
    /// Default action: terminate the process.
    Terminate,
    /// Default action: stop the process.
    Stop,
    /// Continue a stopped process.
    Continue,
    /// Nothing to do.
    Ignore,
}

/// Signal state of one process.
#[derive(Debug, Clone)]
pub struct SignalState {
    handlers: [SigDisposition; NSIG],
    handler_mask: [u64; NSIG],
    /// Currently blocked signals.
    pub sig_mask: u64,
    /// Signals awaiting delivery.
    pub sig_pending: u64,
    /// Handlers reset to default on delivery (SA_RESETHAND).
    pub sig_resethand: u64,
    /// Delivered signal not added to the mask (SA_NODEFER).
    pub sig_nodefer: u64,
    /// Fault address recorded for SIGSEGV.
    pub sigsegv_addr: usize,
}

impl SignalState {
    pub fn new() -> Self {
        Self {
            handlers: [SigDisposition::Default; NSIG],
            handler_mask: [0; NSIG],
            sig_mask: 0,
            sig_pending: 0,
            sig_resethand: 0,
            sig_nodefer: 0,
            sigsegv_addr: 0,
        }
    }

    /// State a forked child starts with: dispositions and mask are
    /// inherited, pending signals are not.
    pub fn for_child(&self) -> Self {
        let mut child = self.clone();
        child.sig_pending = 0;
        child
    }

    fn valid(sig: i32) -> KernelResult<usize> {
        if (1..NSIG as i32).contains(&sig) {
            Ok((sig - 1) as usize)
        } else {
            Err(KernelError::InvalidArgument)
        }
    }

    /// Post a signal. Ignored dispositions discard it immediately
    /// (except the unmaskable pair, which always stay pending).
    pub fn raise(&mut self, sig: i32) -> KernelResult<()> {
        let idx = Self::valid(sig)?;
        let bit = sigbit(sig);
        if bit & SIG_CANT_MASK == 0 {
            match self.handlers[idx] {
                SigDisposition::Ignore => return Ok(()),
                SigDisposition::Default if IGNORE_SIG_MASK & bit != 0 => return Ok(()),
                _ => {}
            }
        }
        self.sig_pending |= bit;
        Ok(())
    }

    /// Whether any signal is deliverable (pending and not masked).
    pub fn deliverable(&self) -> bool {
        self.sig_pending & !(self.sig_mask & !SIG_CANT_MASK) != 0
    }

    /// Lowest-numbered deliverable signal, if any, without consuming
    /// it.
    pub fn next_deliverable(&self) -> Option<i32> {
        let ready = self.sig_pending & !(self.sig_mask & !SIG_CANT_MASK);
        if ready == 0 {
            None
        } else {
            Some(ready.trailing_zeros() as i32 + 1)
        }
    }

    /// Consume the next deliverable signal and decide its action.
    pub fn deliver(&mut self) -> Option<(i32, SigAction)> {
        let sig = self.next_deliverable()?;
        let idx = (sig - 1) as usize;
        let bit = sigbit(sig);
        self.sig_pending &= !bit;

        let action = match self.handlers[idx] {
            SigDisposition::Handler(entry) if bit & SIG_CANT_MASK == 0 => {
                let mut add_mask = self.handler_mask[idx];
                if self.sig_nodefer & bit == 0 {
                    add_mask |= bit;
                }
                if self.sig_resethand & bit != 0 {
                    self.handlers[idx] = SigDisposition::Default;
                }
                SigAction::Handler { entry, add_mask }
            }
            SigDisposition::Ignore if bit & SIG_CANT_MASK == 0 => SigAction::Ignore,
            _ => {
                // Default actions.
                if bit & STOP_SIG_MASK != 0 {
                    SigAction::Stop
                } else if sig == SIGCONT {
                    SigAction::Continue
                } else if bit & IGNORE_SIG_MASK != 0 {
                    SigAction::Ignore
                } else {
                    SigAction::Terminate
                }
            }
        };
        Some((sig, action))
    }

    /// `sigaction`: install a disposition. SIGKILL and SIGSTOP refuse.
    pub fn set_action(
        &mut self,
        sig: i32,
        disposition: SigDisposition,
        mask: u64,
        resethand: bool,
        nodefer: bool,
    ) -> KernelResult<SigDisposition> {
        let idx = Self::valid(sig)?;
        let bit = sigbit(sig);
        if bit & SIG_CANT_MASK != 0 {
            return Err(KernelError::InvalidArgument);
        }
        let old = self.handlers[idx];
        self.handlers[idx] = disposition;
        self.handler_mask[idx] = mask & !SIG_CANT_MASK;
        if resethand {
            self.sig_resethand |= bit;
        } else {
            self.sig_resethand &= !bit;
        }
        if nodefer {
            self.sig_nodefer |= bit;
        } else {
            self.sig_nodefer &= !bit;
        }
        Ok(old)
    }

    /// `sigprocmask`: adjust the blocked set. The unmaskable pair is
    /// silently excluded. Returns the old mask.
    pub fn set_mask(&mut self, how: SigMaskHow, set: u64) -> u64 {
        let old = self.sig_mask;
        let set = set & !SIG_CANT_MASK;
        self.sig_mask = match how {
            SigMaskHow::Block => self.sig_mask | set,
            SigMaskHow::Unblock => self.sig_mask & !set,
            SigMaskHow::SetMask => set,
        };
        old
    }
}

impl Default for SignalState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raise_and_deliver_in_number_order() {
        let mut s = SignalState::new();
        s.raise(SIGTERM).unwrap();
        s.raise(SIGHUP).unwrap();
        let (sig, action) = s.deliver().unwrap();
        assert_eq!(sig, SIGHUP);
        assert_eq!(action, SigAction::Terminate);
        let (sig, _) = s.deliver().unwrap();
        assert_eq!(sig, SIGTERM);
        assert!(s.deliver().is_none());
    }

    #[test]
    fn masked_signal_stays_pending() {
        let mut s = SignalState::new();
        s.set_mask(SigMaskHow::Block, sigbit(SIGUSR1));
        s.raise(SIGUSR1).unwrap();
        assert!(!s.deliverable());
        assert!(s.deliver().is_none());
        assert_ne!(s.sig_pending & sigbit(SIGUSR1), 0);
        s.set_mask(SigMaskHow::Unblock, sigbit(SIGUSR1));
        assert_eq!(s.deliver().unwrap().0, SIGUSR1);
    }

    #[test]
    fn sigkill_cannot_be_caught_or_masked() {
        let mut s = SignalState::new();
        assert!(s
            .set_action(SIGKILL, SigDisposition::Ignore, 0, false, false)
            .is_err());
        s.set_mask(SigMaskHow::Block, sigbit(SIGKILL));
        s.raise(SIGKILL).unwrap();
        assert_eq!(s.deliver().unwrap(), (SIGKILL, SigAction::Terminate));
    }

    #[test]
    fn handler_disposition_reports_entry_and_mask() {
        let mut s = SignalState::new();
        s.set_action(SIGUSR1, SigDisposition::Handler(0x4000), sigbit(SIGUSR2), false, false)
            .unwrap();
        s.raise(SIGUSR1).unwrap();
        let (sig, action) = s.deliver().unwrap();
        assert_eq!(sig, SIGUSR1);
        assert_eq!(
            action,
            SigAction::Handler {
                entry: 0x4000,
                add_mask: sigbit(SIGUSR2) | sigbit(SIGUSR1),
            }
        );
    }

    #[test]
    fn resethand_restores_default_after_delivery() {
        let mut s = SignalState::new();
        s.set_action(SIGUSR1, SigDisposition::Handler(0x4000), 0, true, false)
            .unwrap();
        s.raise(SIGUSR1).unwrap();
        assert!(matches!(s.deliver().unwrap().1, SigAction::Handler { .. }));
        s.raise(SIGUSR1).unwrap();
        assert_eq!(s.deliver().unwrap().1, SigAction::Terminate);
    }

    #[test]
    fn ignored_signal_is_discarded_at_raise() {
        let mut s = SignalState::new();
        s.set_action(SIGPIPE, SigDisposition::Ignore, 0, false, false)
            .unwrap();
        s.raise(SIGPIPE).unwrap();
        assert_eq!(s.sig_pending, 0);
    }

    #[test]
    fn child_inherits_dispositions_not_pending() {
        let mut s = SignalState::new();
        s.set_action(SIGUSR1, SigDisposition::Handler(0x4000), 0, false, false)
            .unwrap();
        s.raise(SIGTERM).unwrap();
        let child = s.for_child();
        assert_eq!(child.sig_pending, 0);
        assert_eq!(child.handlers[(SIGUSR1 - 1) as usize], SigDisposition::Handler(0x4000));
    }
}
