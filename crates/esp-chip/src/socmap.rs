//! Platform address map.
//!
//! Constants for the Xilinx VC707 (xc7vx485t) FPGA prototype, plus the
//! bus and scatter-gather geometry the host needs to plan DMA buffers.
//!
//! ```text
//! BOOTROM   0x0000_0000
//! DRAM      0x4000_0000
//! ESPLINK   0x8000_0400   debug link
//! ```

use crate::regs::WINDOW_BYTES;

/// Ethernet debug link IP address.
pub const EDCL_IP: &str = "192.168.1.7";
/// SoC base clock in Hz.
pub const BASE_FREQ: u32 = 50_000_000;
/// Boot ROM base address.
pub const BOOTROM_BASE_ADDR: u64 = 0x0;
/// Main memory base address.
pub const DRAM_BASE_ADDR: u64 = 0x4000_0000;
/// Debug link base address.
pub const ESPLINK_BASE_ADDR: u64 = 0x8000_0400;

/// Default scatter-gather chunk shift (1 MiB chunks).
pub const CHUNK_SHIFT: u32 = 20;

/// Byte order of the host processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// Least significant byte first.
    Little,
    /// Most significant byte first.
    Big,
}

/// Platform geometry consumed by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformDescriptor {
    /// Human-readable platform name.
    pub name: &'static str,
    /// Start of physical DRAM.
    pub dram_base: u64,
    /// Native bus width (and pointer width) in bytes.
    pub bus_width_bytes: usize,
    /// Scatter-gather chunk shift the accelerators are configured with.
    pub chunk_shift: u32,
    /// Per-tile register window in bytes.
    pub register_window: usize,
    /// Host byte order, used for page-table entries.
    pub byte_order: ByteOrder,
}

impl PlatformDescriptor {
    /// VC707 with 64-bit RISC-V (Ariane) cores.
    pub const VC707_ARIANE: Self = Self {
        name: "xilinx-vc707-xc7vx485t (ariane)",
        dram_base: DRAM_BASE_ADDR,
        bus_width_bytes: 8,
        chunk_shift: CHUNK_SHIFT,
        register_window: WINDOW_BYTES,
        byte_order: ByteOrder::Little,
    };

    /// VC707 with 32-bit SPARC (Leon3) cores.
    pub const VC707_LEON3: Self = Self {
        name: "xilinx-vc707-xc7vx485t (leon3)",
        dram_base: DRAM_BASE_ADDR,
        bus_width_bytes: 4,
        chunk_shift: CHUNK_SHIFT,
        register_window: WINDOW_BYTES,
        byte_order: ByteOrder::Big,
    };

    /// Kernel elements of `element_size` bytes per DMA beat.
    ///
    /// Zero when an element is wider than the bus.
    #[must_use]
    pub const fn words_per_beat(&self, element_size: usize) -> usize {
        if element_size == 0 {
            return 0;
        }
        self.bus_width_bytes / element_size
    }

    /// Scatter-gather chunk size in bytes.
    #[must_use]
    pub const fn chunk_size(&self) -> usize {
        1 << self.chunk_shift
    }
}

impl Default for PlatformDescriptor {
    fn default() -> Self {
        Self::VC707_ARIANE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ariane_geometry() {
        let p = PlatformDescriptor::default();
        assert_eq!(p.words_per_beat(4), 2);
        assert_eq!(p.chunk_size(), 1 << 20);
        assert_eq!(p.dram_base, 0x4000_0000);
    }

    #[test]
    fn wide_elements_need_no_rounding() {
        let p = PlatformDescriptor::VC707_LEON3;
        assert_eq!(p.words_per_beat(4), 1);
        assert_eq!(p.words_per_beat(8), 0);
    }
}
