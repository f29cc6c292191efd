//! Bootloader handoff block
//!
//! The bootloader describes the machine to the kernel with one
//! structure: where the kernel image sits, where the page-table arena
//! and RAM end, the framebuffer, and the initial-filesystem image.

/// Physical address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysRange {
    pub base: usize,
    pub len: usize,
}

impl PhysRange {
    pub const fn new(base: usize, len: usize) -> Self {
        Self { base, len }
    }

    pub const fn end(&self) -> usize {
        self.base + self.len
    }
}

/// Machine description handed over by the bootloader.
#[derive(Debug, Clone)]
pub struct BootInfo {
    /// Root page directory installed by the bootloader.
    pub root_pagedir: usize,
    /// Kernel image placement.
    pub kernel_image: PhysRange,
    /// Arena reserved for page tables.
    pub pagetable_arena: PhysRange,
    /// Total RAM size in bytes.
    pub ram_size: usize,
    /// Framebuffer placement, if the firmware configured one.
    pub framebuffer: Option<PhysRange>,
    /// Initial-filesystem image placement.
    pub ifs_image: Option<PhysRange>,
}

impl BootInfo {
    /// A minimal description for hosted runs: `ram_size` bytes of RAM
    /// and nothing else.
    pub fn hosted(ram_size: usize) -> Self {
        Self {
            root_pagedir: 0,
            kernel_image: PhysRange::new(0, 0),
            pagetable_arena: PhysRange::new(0, 0),
            ram_size,
            framebuffer: None,
            ifs_image: None,
        }
    }
}
