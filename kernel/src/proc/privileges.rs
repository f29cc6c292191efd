//! Process privilege bitmaps
//!
//! A process carries three bitmaps: `now` (checked on every privileged
//! operation), `after_fork` (installed as the child's `now`) and
//! `after_exec` (installed across exec). Privileges only narrow: each
//! `set_privileges` call intersects the chosen bitmap with the given
//! mask, so a dropped privilege can never come back.

use bitflags::bitflags;

use crate::error::{KernelError, KernelResult};

bitflags! {
    /// Privileged operations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Priv: u64 {
        /// Change scheduling parameters within SCHED_OTHER.
        const SCHED       = 1 << 0;
        /// Use the real-time policies SCHED_RR and SCHED_FIFO.
        const SCHED_RR    = 1 << 1;
        /// Register user-mode interrupt servers.
        const INTERRUPT   = 1 << 2;
        /// Perform raw I/O and mailbox requests.
        const IO          = 1 << 3;
        /// Mount and unmount filesystems.
        const MOUNT       = 1 << 4;
        /// Create device nodes.
        const MKNOD       = 1 << 5;
        /// Shut down or reboot the machine.
        const SHUTDOWN    = 1 << 6;
        /// Send signals across process-group boundaries.
        const KILL        = 1 << 7;
    }
}

/// Which bitmap a `set_privileges` call narrows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivWhen {
    Now,
    AfterFork,
    AfterExec,
}

impl PrivWhen {
    pub fn from_raw(when: i32) -> KernelResult<Self> {
        match when {
            0 => Ok(Self::Now),
            1 => Ok(Self::AfterFork),
            2 => Ok(Self::AfterExec),
            _ => Err(KernelError::InvalidArgument),
        }
    }
}

/// The three privilege bitmaps of a process.
#[derive(Debug, Clone, Copy)]
pub struct Privileges {
    pub now: Priv,
    pub after_fork: Priv,
    pub after_exec: Priv,
}

impl Privileges {
    /// Full privileges (the root process starts with everything).
    pub fn full() -> Self {
        Self {
            now: Priv::all(),
            after_fork: Priv::all(),
            after_exec: Priv::all(),
        }
    }

    /// Whether any of `wanted` is held right now.
    pub fn check(&self, wanted: Priv) -> KernelResult<()> {
        if self.now.intersects(wanted) {
            Ok(())
        } else {
            Err(KernelError::PermissionDenied)
        }
    }

    /// Narrow one bitmap by intersection; returns the resulting bitmap.
    pub fn restrict(&mut self, when: PrivWhen, set: Priv) -> Priv {
        match when {
            PrivWhen::Now => {
                self.now &= set;
                self.now
            }
            PrivWhen::AfterFork => {
                self.after_fork &= set;
                self.after_fork
            }
            PrivWhen::AfterExec => {
                self.after_exec &= set;
                self.after_exec
            }
        }
    }

    /// Bitmaps a forked child starts with: `after_fork` becomes the
    /// child's `now`; the deferred bitmaps are inherited as-is.
    pub fn for_child(&self) -> Self {
        Self {
            now: self.after_fork,
            after_fork: self.after_fork,
            after_exec: self.after_exec,
        }
    }

    /// Bitmaps after exec: `after_exec` becomes `now`.
    pub fn for_exec(&self) -> Self {
        Self {
            now: self.after_exec,
            after_fork: self.after_fork,
            after_exec: self.after_exec,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restrict_only_narrows() {
        let mut p = Privileges::full();
        p.restrict(PrivWhen::Now, Priv::SCHED | Priv::IO);
        assert!(p.check(Priv::SCHED).is_ok());
        assert!(p.check(Priv::SHUTDOWN).is_err());
        // Widening back has no effect.
        p.restrict(PrivWhen::Now, Priv::all());
        assert!(p.check(Priv::SHUTDOWN).is_err());
    }

    #[test]
    fn check_accepts_any_of_wanted() {
        let mut p = Privileges::full();
        p.restrict(PrivWhen::Now, Priv::SCHED);
        assert!(p.check(Priv::SCHED | Priv::SCHED_RR).is_ok());
    }

    #[test]
    fn fork_and_exec_install_deferred_bitmaps() {
        let mut p = Privileges::full();
        p.restrict(PrivWhen::AfterFork, Priv::SCHED);
        p.restrict(PrivWhen::AfterExec, Priv::IO);
        let child = p.for_child();
        assert_eq!(child.now, Priv::SCHED);
        assert_eq!(child.after_fork, Priv::SCHED);
        // Independent narrowing composes by intersection.
        let execed = child.for_exec();
        assert_eq!(execed.now, Priv::IO);
    }
}
