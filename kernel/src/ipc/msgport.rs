//! Message ports: the VFS transport
//!
//! Filesystem servers run in user mode, each serving one port bound to
//! a mounted superblock. The kernel translates vnode operations into
//! tagged `iorequest` records, queues them FIFO on the port, and puts
//! the calling thread to sleep on a per-request Rendez. The server
//! dequeues with a receive call, processes, and replies; the reply
//! wakes the caller. Delivery is exactly-once by construction; the
//! kernel never retries a request.
//!
//! A caller cancelled by a signal marks its request abandoned. The
//! request stays allocated so the port's FIFO is undisturbed; when the
//! server later replies (or the receive path encounters the corpse),
//! the reply is discarded and the request freed.

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec::Vec;

use crate::arena::Arena;
use crate::define_id;
use crate::error::{IpcError, KernelError, KernelResult};
use crate::hal::Hal;
use crate::proc::thread::{Intr, ThreadId, ThreadTable, WakeReason};
use crate::sched::Scheduler;
use crate::sync::rendez::{self, Rendez};
use crate::timer::TimerWheel;

/// Maximum number of message ports (mounted filesystems plus device
/// servers).
pub const NR_MSGPORT: usize = 16;

/// Maximum number of in-flight requests across all ports.
pub const NR_IOREQ: usize = 128;

define_id! {
    /// Handle to a message port.
    PortId
}

define_id! {
    /// Handle to an in-flight iorequest.
    ReqId
}

/// File attributes carried in lookup and mknod replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeAttr {
    pub ino: u64,
    /// Mode bits in the usual S_IF* + permission layout.
    pub mode: u32,
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
}

/// Operation tag and payload of an iorequest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoOp {
    /// Resolve one path component under a directory.
    Lookup { dir_ino: u64, name: String },
    /// Read file or device data.
    Read { ino: u64, offset: u64, len: usize },
    /// Write file or device data.
    Write { ino: u64, offset: u64, data: Vec<u8> },
    /// Write back one cache cluster (buffer reclaim).
    Strategy { ino: u64, offset: u64, data: Vec<u8> },
    /// Create a node under a directory.
    Mknod { dir_ino: u64, name: String, mode: u32 },
    /// Remove a directory entry.
    Unlink { dir_ino: u64, name: String },
    /// Resize a file.
    Truncate { ino: u64, size: u64 },
    /// Read a symbolic link's target.
    Readlink { ino: u64 },
    /// Create a symbolic link.
    Symlink { dir_ino: u64, name: String, target: String },
}

/// Server answer to an iorequest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoReply {
    /// Bytes transferred or 0, negative errno on failure.
    pub status: i64,
    /// Read/readlink payload.
    pub data: Vec<u8>,
    /// Attributes for lookup/mknod.
    pub attr: Option<NodeAttr>,
}

impl IoReply {
    pub fn ok() -> Self {
        Self {
            status: 0,
            data: Vec::new(),
            attr: None,
        }
    }

    pub fn error(errno: i64) -> Self {
        Self {
            status: errno,
            data: Vec::new(),
            attr: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReqState {
    /// Queued on the port, not yet seen by the server.
    Queued,
    /// Handed to the server, reply outstanding.
    Received,
    /// Replied; the client consumes the reply on its retry.
    Replied,
    /// Client gave up; the late reply is discarded.
    Abandoned,
}

struct IoRequest {
    port: PortId,
    op: IoOp,
    client: ThreadId,
    state: ReqState,
    reply: Option<IoReply>,
    rendez: Rendez,
}

struct MsgPort {
    /// FIFO of queued requests.
    queue: VecDeque<ReqId>,
    /// The server blocks here between requests.
    receiver_rendez: Rendez,
}

/// All message ports and in-flight requests.
pub struct MsgPortTable {
    ports: Arena<MsgPort>,
    reqs: Arena<IoRequest>,
}

impl MsgPortTable {
    pub fn new() -> Self {
        Self {
            ports: Arena::new("msgport", NR_MSGPORT),
            reqs: Arena::new("ioreq", NR_IOREQ),
        }
    }

    /// Create a port (one per mount).
    pub fn create_port(&mut self) -> KernelResult<PortId> {
        self.ports
            .insert(MsgPort {
                queue: VecDeque::new(),
                receiver_rendez: Rendez::new(),
            })
            .map(PortId)
            .map_err(|_| KernelError::ResourceExhausted { resource: "msgport" })
    }

    /// Tear down a port, failing every in-flight request with `EIO`.
    pub fn close_port(
        &mut self,
        threads: &mut ThreadTable,
        sched: &mut Scheduler,
        timers: &mut TimerWheel,
        port: PortId,
    ) -> KernelResult<()> {
        self.ports.remove(port.0).ok_or(IpcError::PortNotFound)?;
        let dead: Vec<ReqId> = self
            .reqs
            .iter()
            .filter(|(_, r)| r.port == port)
            .map(|(h, _)| ReqId(h))
            .collect();
        for id in dead {
            let req = self.reqs.get_mut(id.0).unwrap();
            match req.state {
                ReqState::Abandoned => {
                    self.reqs.remove(id.0);
                }
                _ => {
                    req.state = ReqState::Replied;
                    req.reply = Some(IoReply::error(-(crate::error::Errno::EIO as i32 as i64)));
                    let client = req.client;
                    let mut rendez = core::mem::replace(&mut req.rendez, Rendez::new());
                    rendez::task_wakeup_specific(
                        threads,
                        sched,
                        timers,
                        &mut rendez,
                        client,
                        WakeReason::Normal,
                    )?;
                    self.reqs.get_mut(id.0).unwrap().rendez = rendez;
                }
            }
        }
        Ok(())
    }

    pub fn port_exists(&self, port: PortId) -> bool {
        self.ports.get(port.0).is_some()
    }

    /// Requests queued and unserviced on a port.
    pub fn queue_len(&self, port: PortId) -> usize {
        self.ports
            .get(port.0)
            .map(|p| p.queue.len())
            .unwrap_or(0)
    }

    /// Client side: send `op` to `port` and sleep until the reply.
    ///
    /// Returns the reply together with the operation it answers (the
    /// re-issued call after a park consumes the reply of the request
    /// that was actually in flight, which the caller attributes by the
    /// returned op). A sleep interrupted by a signal abandons the
    /// request and reports `-EINTR` without consuming the signal.
    #[allow(clippy::too_many_arguments)]
    pub fn call(
        &mut self,
        threads: &mut ThreadTable,
        sched: &mut Scheduler,
        timers: &mut TimerWheel,
        hal: &dyn Hal,
        port: PortId,
        op: IoOp,
        pending: Intr,
    ) -> KernelResult<(IoOp, IoReply)> {
        let tid = sched.current();

        if let Some(req_id) = threads.get(tid)?.msgreq {
            // Re-issued after the park.
            let stored = self
                .reqs
                .get(req_id.0)
                .ok_or(IpcError::RequestNotFound)?;
            if stored.op != op {
                // An earlier stage of a multi-call operation running
                // again on the retry path. Every successful earlier
                // answer was materialized into a cache, so the only
                // answer that can legitimately be asked for twice is a
                // failed lookup; reproduce it without touching the
                // in-flight request. Anything else means a cache entry
                // was recycled mid-operation; back off and let the
                // trampoline retry once the in-flight reply lands.
                if matches!(op, IoOp::Lookup { .. }) {
                    return Ok((
                        op,
                        IoReply::error(-(crate::error::Errno::ENOENT as i32 as i64)),
                    ));
                }
                log::warn!("msgport: stage re-asked {:?} while {:?} in flight", op, stored.op);
                return Err(KernelError::TryAgain);
            }
            let reason = threads.get_mut(tid)?.take_wake_reason();
            let state = self
                .reqs
                .get(req_id.0)
                .map(|r| r.state)
                .ok_or(IpcError::RequestNotFound)?;
            match state {
                ReqState::Replied => {
                    let req = self.reqs.remove(req_id.0).unwrap();
                    threads.get_mut(tid)?.msgreq = None;
                    return Ok((req.op, req.reply.unwrap_or_else(IoReply::ok)));
                }
                ReqState::Queued | ReqState::Received => {
                    // An interrupted sleep never consumes its cause, so
                    // the cause is still pending even if an inner
                    // retried acquisition swallowed the wake reason.
                    let interrupted = matches!(
                        reason,
                        Some(WakeReason::Signal) | Some(WakeReason::Cancel)
                    ) || !(pending & (Intr::SIGNAL | Intr::CANCEL)).is_empty();
                    if interrupted {
                        // Cancellation: abandon, the reply (if it ever
                        // comes) is discarded.
                        self.reqs.get_mut(req_id.0).unwrap().state = ReqState::Abandoned;
                        threads.get_mut(tid)?.msgreq = None;
                        return Err(KernelError::Interrupted);
                    }
                    // Spurious wake: park again on the request.
                    let req = self.reqs.get_mut(req_id.0).unwrap();
                    let mut rendez = core::mem::replace(&mut req.rendez, Rendez::new());
                    let parked = rendez::task_sleep_interruptible(
                        threads,
                        sched,
                        hal,
                        &mut rendez,
                        Intr::SIGNAL | Intr::CANCEL,
                        pending,
                    );
                    self.reqs.get_mut(req_id.0).unwrap().rendez = rendez;
                    return parked.map(|_| unreachable!("sleep always parks"));
                }
                ReqState::Abandoned => {
                    threads.get_mut(tid)?.msgreq = None;
                    return Err(KernelError::Interrupted);
                }
            }
        }

        // Fresh send.
        if !self.port_exists(port) {
            return Err(IpcError::PortNotFound.into());
        }
        let req_id = self
            .reqs
            .insert(IoRequest {
                port,
                op,
                client: tid,
                state: ReqState::Queued,
                reply: None,
                rendez: Rendez::new(),
            })
            .map(ReqId)
            .map_err(|_| KernelError::ResourceExhausted { resource: "ioreq" })?;

        let p = self.ports.get_mut(port.0).unwrap();
        p.queue.push_back(req_id);
        let mut receiver = core::mem::replace(&mut p.receiver_rendez, Rendez::new());
        rendez::task_wakeup(threads, sched, timers, &mut receiver)?;
        self.ports.get_mut(port.0).unwrap().receiver_rendez = receiver;

        threads.get_mut(tid)?.msgreq = Some(req_id);
        let req = self.reqs.get_mut(req_id.0).unwrap();
        let mut rendez = core::mem::replace(&mut req.rendez, Rendez::new());
        let parked = rendez::task_sleep_interruptible(
            threads,
            sched,
            hal,
            &mut rendez,
            Intr::SIGNAL | Intr::CANCEL,
            pending,
        );
        self.reqs.get_mut(req_id.0).unwrap().rendez = rendez;
        match parked {
            Err(KernelError::Interrupted) => {
                // A cause was already pending; the request is queued
                // but the caller is gone, so mark it abandoned.
                self.reqs.get_mut(req_id.0).unwrap().state = ReqState::Abandoned;
                threads.get_mut(tid)?.msgreq = None;
                Err(KernelError::Interrupted)
            }
            other => other.map(|_| unreachable!("sleep always parks")),
        }
    }

    /// Server side: dequeue the next request on `port`, FIFO. Parks the
    /// server when the queue is empty. Abandoned corpses found at the
    /// head are freed and skipped.
    pub fn receive(
        &mut self,
        threads: &mut ThreadTable,
        sched: &mut Scheduler,
        hal: &dyn Hal,
        port: PortId,
    ) -> KernelResult<(ReqId, IoOp)> {
        let tid = sched.current();
        let _ = threads.get_mut(tid)?.take_wake_reason();
        loop {
            let head = {
                let p = self.ports.get_mut(port.0).ok_or(IpcError::PortNotFound)?;
                p.queue.pop_front()
            };
            match head {
                Some(req_id) => {
                    let state = match self.reqs.get(req_id.0) {
                        Some(r) => r.state,
                        None => continue,
                    };
                    match state {
                        ReqState::Abandoned => {
                            self.reqs.remove(req_id.0);
                            continue;
                        }
                        _ => {
                            let req = self.reqs.get_mut(req_id.0).unwrap();
                            req.state = ReqState::Received;
                            return Ok((req_id, req.op.clone()));
                        }
                    }
                }
                None => {
                    let p = self.ports.get_mut(port.0).unwrap();
                    let mut receiver = core::mem::replace(&mut p.receiver_rendez, Rendez::new());
                    let parked = rendez::task_sleep(threads, sched, hal, &mut receiver);
                    self.ports.get_mut(port.0).unwrap().receiver_rendez = receiver;
                    return parked.map(|_| unreachable!("sleep always parks"));
                }
            }
        }
    }

    /// Server side: answer a received request. An abandoned request's
    /// reply is discarded and its resources freed.
    pub fn reply(
        &mut self,
        threads: &mut ThreadTable,
        sched: &mut Scheduler,
        timers: &mut TimerWheel,
        req_id: ReqId,
        reply: IoReply,
    ) -> KernelResult<()> {
        let state = self
            .reqs
            .get(req_id.0)
            .map(|r| r.state)
            .ok_or(IpcError::RequestNotFound)?;
        match state {
            ReqState::Abandoned => {
                self.reqs.remove(req_id.0);
                Ok(())
            }
            ReqState::Received | ReqState::Queued => {
                let req = self.reqs.get_mut(req_id.0).unwrap();
                req.state = ReqState::Replied;
                req.reply = Some(reply);
                let client = req.client;
                let mut rendez = core::mem::replace(&mut req.rendez, Rendez::new());
                let woke = rendez::task_wakeup_specific(
                    threads,
                    sched,
                    timers,
                    &mut rendez,
                    client,
                    WakeReason::Normal,
                );
                self.reqs.get_mut(req_id.0).unwrap().rendez = rendez;
                woke
            }
            ReqState::Replied => Err(IpcError::RequestNotFound.into()),
        }
    }

    /// Abandon a request on behalf of a dying client thread: a reply
    /// already present is discarded, otherwise the server's eventual
    /// reply will be.
    pub fn abandon(&mut self, req_id: ReqId) {
        match self.reqs.get(req_id.0).map(|r| r.state) {
            Some(ReqState::Replied) => {
                self.reqs.remove(req_id.0);
            }
            Some(_) => {
                self.reqs.get_mut(req_id.0).unwrap().state = ReqState::Abandoned;
            }
            None => {}
        }
    }

    /// In-flight request count (diagnostics and tests).
    pub fn inflight(&self) -> usize {
        self.reqs.len()
    }
}

impl Default for MsgPortTable {
    fn default() -> Self {
        Self::new()
    }
}
