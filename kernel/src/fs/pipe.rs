//! Pipes
//!
//! Fixed-capacity byte rings backing FIFO vnodes. Writers block while
//! the ring is full and readers exist; a write with no reader left
//! raises SIGPIPE in the caller and fails with `-EPIPE` (the kernel
//! layer does both). Readers block while the ring is empty and writers
//! exist; end-of-file is an empty ring with no writer.

use alloc::collections::VecDeque;

use crate::arena::Arena;
use crate::define_id;
use crate::error::{KernelError, KernelResult};
use crate::sync::rendez::Rendez;

define_id! {
    /// Handle into the pipe table.
    PipeId
}

/// Maximum number of pipes.
pub const NR_PIPE: usize = 32;

/// Ring capacity in bytes.
pub const PIPE_BUF_SZ: usize = 4096;

/// A pipe ring and its two wait channels.
pub struct Pipe {
    data: VecDeque<u8>,
    pub readers: u32,
    pub writers: u32,
    /// Readers wait here for data.
    pub read_rendez: Rendez,
    /// Writers wait here for space.
    pub write_rendez: Rendez,
}

/// What a ring operation managed to move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeXfer {
    /// Bytes moved.
    Done(usize),
    /// Nothing to move and the peer side is still open; wait.
    WouldWait,
    /// No reader remains (writes) or no writer remains (reads: EOF).
    PeerGone,
}

impl Pipe {
    fn new() -> Self {
        Self {
            data: VecDeque::with_capacity(PIPE_BUF_SZ),
            readers: 1,
            writers: 1,
            read_rendez: Rendez::new(),
            write_rendez: Rendez::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn space(&self) -> usize {
        PIPE_BUF_SZ - self.data.len()
    }

    /// Append as much of `src` as fits.
    pub fn write(&mut self, src: &[u8]) -> PipeXfer {
        if self.readers == 0 {
            return PipeXfer::PeerGone;
        }
        let n = src.len().min(self.space());
        if n == 0 {
            return PipeXfer::WouldWait;
        }
        self.data.extend(src[..n].iter().copied());
        PipeXfer::Done(n)
    }

    /// Take up to `dst.len()` bytes.
    pub fn read(&mut self, dst: &mut [u8]) -> PipeXfer {
        let n = dst.len().min(self.data.len());
        if n == 0 {
            if self.writers == 0 {
                return PipeXfer::PeerGone;
            }
            if dst.is_empty() {
                return PipeXfer::Done(0);
            }
            return PipeXfer::WouldWait;
        }
        for slot in dst[..n].iter_mut() {
            *slot = self.data.pop_front().unwrap();
        }
        PipeXfer::Done(n)
    }
}

/// The pipe table.
pub struct PipeTable {
    pipes: Arena<Pipe>,
}

impl PipeTable {
    pub fn new() -> Self {
        Self {
            pipes: Arena::new("pipe", NR_PIPE),
        }
    }

    pub fn create(&mut self) -> KernelResult<PipeId> {
        self.pipes
            .insert(Pipe::new())
            .map(PipeId)
            .map_err(|_| KernelError::ResourceExhausted { resource: "pipe" })
    }

    pub fn remove(&mut self, id: PipeId) -> Option<Pipe> {
        self.pipes.remove(id.0)
    }

    pub fn get(&self, id: PipeId) -> KernelResult<&Pipe> {
        self.pipes.get(id.0).ok_or(KernelError::NotFound)
    }

    pub fn get_mut(&mut self, id: PipeId) -> KernelResult<&mut Pipe> {
        self.pipes.get_mut(id.0).ok_or(KernelError::NotFound)
    }
}

impl Default for PipeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_roundtrip() {
        let mut pipe = Pipe::new();
        assert_eq!(pipe.write(b"hello"), PipeXfer::Done(5));
        let mut out = [0u8; 8];
        assert_eq!(pipe.read(&mut out), PipeXfer::Done(5));
        assert_eq!(&out[..5], b"hello");
    }

    #[test]
    fn full_ring_reports_wait() {
        let mut pipe = Pipe::new();
        let big = alloc::vec![7u8; PIPE_BUF_SZ + 100];
        assert_eq!(pipe.write(&big), PipeXfer::Done(PIPE_BUF_SZ));
        assert_eq!(pipe.write(b"x"), PipeXfer::WouldWait);
    }

    #[test]
    fn no_reader_reports_peer_gone() {
        let mut pipe = Pipe::new();
        pipe.readers = 0;
        assert_eq!(pipe.write(b"x"), PipeXfer::PeerGone);
    }

    #[test]
    fn empty_ring_distinguishes_eof_from_wait() {
        let mut pipe = Pipe::new();
        let mut out = [0u8; 4];
        assert_eq!(pipe.read(&mut out), PipeXfer::WouldWait);
        pipe.writers = 0;
        assert_eq!(pipe.read(&mut out), PipeXfer::PeerGone);
    }
}
