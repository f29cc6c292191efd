//! Processes
//!
//! A process is a protection domain: a page-table root, an open-file
//! table of bounded size, credentials, the three privilege bitmaps, a
//! parent back-reference, a signal-disposition table and a set of
//! threads. Created by fork, mutated by its own threads and by the
//! reaping parent on exit, destroyed when the last thread has exited
//! and the parent has waited.

pub mod privileges;
pub mod signal;
pub mod thread;

use alloc::string::String;
use alloc::vec::Vec;

use crate::arena::Arena;
use crate::define_id;
use crate::error::{KernelError, KernelResult};
use crate::fs::filp::FilpId;
use crate::mm::PmapId;
use crate::proc::privileges::Privileges;
use crate::proc::signal::SignalState;
use crate::proc::thread::ThreadId;
use crate::sync::rendez::Rendez;
use crate::timer::TimerId;

define_id! {
    /// Handle into the process table.
    ProcId
}

/// Per-process descriptor table size.
pub const NR_FD: usize = 32;

/// Maximum number of processes.
pub const NR_PROCESS: usize = 64;

/// Process lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Alive,
    /// Exited; awaiting the parent's wait.
    Zombie,
}

/// User and group credentials.
#[derive(Debug, Clone, Copy)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
    pub euid: u32,
    pub egid: u32,
    pub pgrp: u32,
}

impl Credentials {
    pub fn root() -> Self {
        Self {
            uid: 0,
            gid: 0,
            euid: 0,
            egid: 0,
            pgrp: 0,
        }
    }

    /// Whether the process may override ownership checks.
    pub fn is_superuser(&self) -> bool {
        self.euid == 0
    }
}

/// A protection domain.
pub struct Process {
    pub name: String,
    pub state: ProcState,
    /// Address space; `None` for pure kernel processes.
    pub pmap: Option<PmapId>,
    /// Open-file table: fd index to filp handle.
    pub fds: [Option<FilpId>; NR_FD],
    pub cred: Credentials,
    pub privileges: Privileges,
    pub parent: Option<ProcId>,
    pub children: Vec<ProcId>,
    pub threads: Vec<ThreadId>,
    pub signals: SignalState,
    /// Armed `alarm()` timer.
    pub alarm: Option<TimerId>,
    /// Parent sleeps here waiting for a child to exit.
    pub wait_rendez: Rendez,
    pub exit_status: i32,
}

impl Process {
    pub fn new(name: String, parent: Option<ProcId>) -> Self {
        Self {
            name,
            state: ProcState::Alive,
            pmap: None,
            fds: [None; NR_FD],
            cred: Credentials::root(),
            privileges: Privileges::full(),
            parent,
            children: Vec::new(),
            threads: Vec::new(),
            signals: SignalState::new(),
            alarm: None,
            wait_rendez: Rendez::new(),
            exit_status: 0,
        }
    }

    /// Lowest free descriptor slot.
    pub fn alloc_fd(&mut self, filp: FilpId) -> KernelResult<usize> {
        for (fd, slot) in self.fds.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(filp);
                return Ok(fd);
            }
        }
        Err(crate::error::FsError::TooManyOpenFiles.into())
    }

    /// Filp behind a descriptor.
    pub fn fd(&self, fd: i32) -> KernelResult<FilpId> {
        if !(0..NR_FD as i32).contains(&fd) {
            return Err(crate::error::FsError::BadDescriptor.into());
        }
        self.fds[fd as usize].ok_or(crate::error::FsError::BadDescriptor.into())
    }

    /// Free a descriptor slot. The slot is freed even when the
    /// underlying close fails.
    pub fn free_fd(&mut self, fd: i32) -> KernelResult<FilpId> {
        if !(0..NR_FD as i32).contains(&fd) {
            return Err(crate::error::FsError::BadDescriptor.into());
        }
        self.fds[fd as usize]
            .take()
            .ok_or(crate::error::FsError::BadDescriptor.into())
    }
}

/// The process table.
pub struct ProcessTable {
    procs: Arena<Process>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self {
            procs: Arena::new("process", NR_PROCESS),
        }
    }

    pub fn capacity(&self) -> usize {
        self.procs.capacity()
    }

    pub fn len(&self) -> usize {
        self.procs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }

    pub fn insert(&mut self, proc: Process) -> KernelResult<ProcId> {
        self.procs
            .insert(proc)
            .map(ProcId)
            .map_err(|_| KernelError::ResourceExhausted {
                resource: "process",
            })
    }

    pub fn remove(&mut self, pid: ProcId) -> Option<Process> {
        self.procs.remove(pid.0)
    }

    pub fn get(&self, pid: ProcId) -> KernelResult<&Process> {
        self.procs.get(pid.0).ok_or(KernelError::NotFound)
    }

    pub fn get_mut(&mut self, pid: ProcId) -> KernelResult<&mut Process> {
        self.procs.get_mut(pid.0).ok_or(KernelError::NotFound)
    }

    pub fn contains(&self, pid: ProcId) -> bool {
        self.procs.get(pid.0).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ProcId, &Process)> {
        self.procs.iter().map(|(h, p)| (ProcId(h), p))
    }

    pub fn handles(&self) -> Vec<ProcId> {
        self.procs.handles().into_iter().map(ProcId).collect()
    }

    /// Create a child process: credentials and dispositions inherited,
    /// pending signals not, privileges narrowed through `after_fork`.
    /// The caller clones the address space and descriptor table.
    pub fn fork_from(&mut self, parent: ProcId, name: String) -> KernelResult<ProcId> {
        let (cred, privileges, signals) = {
            let p = self.get(parent)?;
            (p.cred, p.privileges.for_child(), p.signals.for_child())
        };
        let mut child = Process::new(name, Some(parent));
        child.cred = cred;
        child.privileges = privileges;
        child.signals = signals;
        let pid = self.insert(child)?;
        self.get_mut(parent)?.children.push(pid);
        Ok(pid)
    }

    /// First zombie child of `parent`, if any.
    pub fn find_zombie_child(&self, parent: ProcId) -> Option<ProcId> {
        let p = self.procs.get(parent.0)?;
        p.children
            .iter()
            .copied()
            .find(|&c| matches!(self.procs.get(c.0), Some(child) if child.state == ProcState::Zombie))
    }

    /// Reap a zombie child: unlink from the parent and drop the table
    /// entry. Returns its exit status.
    pub fn reap(&mut self, parent: ProcId, child: ProcId) -> KernelResult<i32> {
        let status = {
            let c = self.get(child)?;
            if c.state != ProcState::Zombie {
                return Err(KernelError::InvalidArgument);
            }
            c.exit_status
        };
        if let Ok(p) = self.get_mut(parent) {
            if let Some(pos) = p.children.iter().position(|&c| c == child) {
                p.children.swap_remove(pos);
            }
        }
        self.procs.remove(child.0);
        Ok(status)
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}
