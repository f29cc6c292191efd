//! Hardware abstraction layer
//!
//! The board collaborator consumed by the core: MMIO access, barriers,
//! mailbox communication, the context-switch primitive, TLB and cache
//! maintenance keyed by ASID, the interrupt controller, and the timer
//! compare register. The core never pokes registers directly.
//!
//! [`NullHal`] is a full no-op implementation backing hosted builds and
//! the test suite; it additionally lets tests raise interrupt lines so
//! the top half can be driven deterministically.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Number of IRQ lines on the BCM283x/BCM2711 legacy controller.
pub const NR_IRQ: u32 = 64;

/// Opaque token returned by [`Hal::disable_interrupts`] and consumed by
/// [`Hal::restore_interrupts`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntState(pub u32);

/// Saved register block for a kernel or user thread.
///
/// The layout mirrors what the AArch64 context-switch stub saves:
/// callee-saved registers, stack pointer, program counter and saved
/// program status.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Context {
    pub regs: [u64; 13],
    pub sp: u64,
    pub pc: u64,
    pub spsr: u64,
}

/// How [`Hal::shutdown`] should halt the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownHow {
    Halt,
    Reboot,
    PowerOff,
}

/// Board services consumed by the kernel core.
pub trait Hal: Send + Sync {
    /// Read a device register. Carries an implicit read barrier.
    fn mmio_read(&self, reg: usize) -> u32;

    /// Write a device register. Carries an implicit write barrier.
    fn mmio_write(&self, reg: usize, val: u32);

    /// Data synchronization barrier.
    fn dsb(&self);

    /// Instruction synchronization barrier.
    fn isb(&self);

    /// Post a physical address to a VideoCore mailbox channel.
    fn mbox_write(&self, channel: u8, pa: u32);

    /// Read the next response word from a mailbox channel.
    fn mbox_read(&self, channel: u8) -> u32;

    /// Switch from `prev`'s register state to `next`'s. Returns in the
    /// context of `next`; `prev` resumes here when it is switched back
    /// to.
    fn switch_context(&self, prev: &mut Context, next: &Context);

    /// Invalidate the TLB entry for one page of one address space.
    fn tlb_invalidate_page(&self, asid: u16, va: usize);

    /// Invalidate all TLB entries for one address space.
    fn tlb_invalidate_asid(&self, asid: u16);

    /// Bitmap of pending IRQ lines, read from the controller's pending
    /// registers.
    fn read_pending_irqs(&self) -> u64;

    /// Unmask an IRQ line at the controller.
    fn enable_irq(&self, irq: u32);

    /// Mask an IRQ line at the controller.
    fn disable_irq(&self, irq: u32);

    /// Program the next timer compare value one jiffy ahead.
    fn timer_reprogram_compare(&self);

    /// Disable CPU interrupt delivery, returning the previous state.
    fn disable_interrupts(&self) -> IntState;

    /// Restore interrupt delivery to a state previously captured by
    /// [`Hal::disable_interrupts`].
    fn restore_interrupts(&self, state: IntState);

    /// Halt, reboot or power off the board.
    fn shutdown(&self, how: ShutdownHow);
}

/// No-op HAL for hosted builds and tests.
///
/// Interrupt lines can be raised with [`NullHal::raise_irq`]; the top
/// half then observes them through [`Hal::read_pending_irqs`]. Masking
/// state is tracked so tests can assert the auto-mask contract.
#[derive(Default)]
pub struct NullHal {
    pending: AtomicU64,
    masked: AtomicU64,
    mbox_last: AtomicU32,
    int_depth: AtomicU32,
}

impl NullHal {
    pub const fn new() -> Self {
        Self {
            pending: AtomicU64::new(0),
            masked: AtomicU64::new(!0),
            mbox_last: AtomicU32::new(0),
            int_depth: AtomicU32::new(0),
        }
    }

    /// Assert an interrupt line, as a device would.
    pub fn raise_irq(&self, irq: u32) {
        self.pending.fetch_or(1 << irq, Ordering::SeqCst);
    }

    /// Deassert an interrupt line.
    pub fn clear_irq(&self, irq: u32) {
        self.pending.fetch_and(!(1 << irq), Ordering::SeqCst);
    }

    /// Whether the controller currently masks `irq`.
    pub fn irq_masked(&self, irq: u32) -> bool {
        self.masked.load(Ordering::SeqCst) & (1 << irq) != 0
    }
}

impl Hal for NullHal {
    fn mmio_read(&self, _reg: usize) -> u32 {
        0
    }

    fn mmio_write(&self, _reg: usize, _val: u32) {}

    fn dsb(&self) {}

    fn isb(&self) {}

    fn mbox_write(&self, _channel: u8, pa: u32) {
        self.mbox_last.store(pa, Ordering::SeqCst);
    }

    fn mbox_read(&self, _channel: u8) -> u32 {
        self.mbox_last.load(Ordering::SeqCst)
    }

    fn switch_context(&self, _prev: &mut Context, _next: &Context) {}

    fn tlb_invalidate_page(&self, _asid: u16, _va: usize) {}

    fn tlb_invalidate_asid(&self, _asid: u16) {}

    fn read_pending_irqs(&self) -> u64 {
        // Masked lines do not reach the pending registers.
        self.pending.load(Ordering::SeqCst) & !self.masked.load(Ordering::SeqCst)
    }

    fn enable_irq(&self, irq: u32) {
        self.masked.fetch_and(!(1 << irq), Ordering::SeqCst);
    }

    fn disable_irq(&self, irq: u32) {
        self.masked.fetch_or(1 << irq, Ordering::SeqCst);
    }

    fn timer_reprogram_compare(&self) {}

    fn disable_interrupts(&self) -> IntState {
        IntState(self.int_depth.fetch_add(1, Ordering::SeqCst))
    }

    fn restore_interrupts(&self, _state: IntState) {
        self.int_depth.fetch_sub(1, Ordering::SeqCst);
    }

    fn shutdown(&self, _how: ShutdownHow) {}
}

/// Barriers for the real board, available when building for AArch64.
#[cfg(target_arch = "aarch64")]
pub mod aarch64 {
    use cortex_a::asm::barrier;

    #[inline(always)]
    pub fn dsb() {
        // SAFETY: a full-system data synchronization barrier only
        // orders memory accesses; it touches no memory and no
        // registers beyond the pipeline, so it is safe to issue
        // unconditionally from any context.
        unsafe { barrier::dsb(barrier::SY) };
    }

    #[inline(always)]
    pub fn isb() {
        // SAFETY: an instruction synchronization barrier only flushes
        // the pipeline; it has no memory or register side effects, so
        // it is safe to issue unconditionally from any context.
        unsafe { barrier::isb(barrier::SY) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raised_irq_visible_until_masked() {
        let hal = NullHal::new();
        hal.enable_irq(29);
        hal.raise_irq(29);
        assert_eq!(hal.read_pending_irqs() & (1 << 29), 1 << 29);
        hal.disable_irq(29);
        assert_eq!(hal.read_pending_irqs() & (1 << 29), 0);
        assert!(hal.irq_masked(29));
    }

    #[test]
    fn mailbox_roundtrip() {
        let hal = NullHal::new();
        hal.mbox_write(8, 0xdead_beef);
        assert_eq!(hal.mbox_read(8), 0xdead_beef);
    }
}
