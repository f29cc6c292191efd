//! Kernel log sink
//!
//! A fixed-size ring buffer behind the `log` facade. Kernel code logs
//! through the ordinary `log::info!`/`log::warn!`/`log::error!` macros;
//! the boot path installs this sink once, and the debug transport (out
//! of scope here) drains it. When no sink is installed the macros are
//! no-ops, which is how the test suite runs.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::Write as _;

use log::{LevelFilter, Log, Metadata, Record};
use spin::Mutex;

/// Capacity of the message ring.
const KLOG_CAPACITY: usize = 256;

struct Ring {
    lines: Vec<String>,
    head: usize,
}

/// Ring-buffer logger.
pub struct KernelLog {
    ring: Mutex<Ring>,
}

impl KernelLog {
    pub const fn new() -> Self {
        Self {
            ring: Mutex::new(Ring {
                lines: Vec::new(),
                head: 0,
            }),
        }
    }

    /// Snapshot the buffered lines, oldest first.
    pub fn drain(&self) -> Vec<String> {
        let mut ring = self.ring.lock();
        let mut out = Vec::with_capacity(ring.lines.len());
        let head = ring.head;
        for i in 0..ring.lines.len() {
            out.push(ring.lines[(head + i) % ring.lines.len()].clone());
        }
        ring.lines.clear();
        ring.head = 0;
        out
    }
}

impl Default for KernelLog {
    fn default() -> Self {
        Self::new()
    }
}

impl Log for KernelLog {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        let mut line = String::new();
        let _ = write!(line, "[{}] {}", record.level(), record.args());
        let mut ring = self.ring.lock();
        if ring.lines.len() < KLOG_CAPACITY {
            ring.lines.push(line);
        } else {
            let head = ring.head;
            ring.lines[head] = line;
            ring.head = (head + 1) % KLOG_CAPACITY;
        }
    }

    fn flush(&self) {}
}

static KLOG: KernelLog = KernelLog::new();

/// Install the ring-buffer sink as the global logger. Called once from
/// the boot path; later calls are ignored.
pub fn init(max_level: LevelFilter) {
    if log::set_logger(&KLOG).is_ok() {
        log::set_max_level(max_level);
    }
}

/// Access the global sink (for the debug transport).
pub fn global() -> &'static KernelLog {
    &KLOG
}
