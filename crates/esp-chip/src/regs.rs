//! Accelerator socket register map.
//!
//! Every accelerator tile of this platform generation exposes the same
//! 256-byte APB window. The first 64 bytes hold the common socket
//! registers; kernel-specific configuration registers follow as a contiguous
//! block of 32-bit slots starting at [`USER_BASE`].
//!
//! ```text
//! 0x00  CMD            bit 0 = start
//! 0x04  STATUS         bit 0 = done
//! 0x08  SELECT         write back the DEVID value to claim the tile
//! 0x0c  DEVID          read-only
//! 0x10  PT_ADDRESS     page-table base (physical, 32-bit)
//! 0x14  PT_NCHUNK      page-table entry count
//! 0x18  PT_SHIFT       log2(chunk size)
//! 0x1c  PT_NCHUNK_MAX  read-only, 0 = scatter-gather disabled
//! 0x20  COHERENCE
//! 0x24  P2P
//! 0x30  SRC_OFFSET     byte offset of the input region
//! 0x34  DST_OFFSET     byte offset of the output region
//! 0x40+ user block     one slot per kernel parameter
//! ```

use std::fmt;

/// Offset of the first kernel-specific configuration slot.
pub const USER_BASE: usize = 0x40;

/// Width of one register slot in bytes.
pub const SLOT_BYTES: usize = 4;

/// Size of the per-tile register window in bytes.
pub const WINDOW_BYTES: usize = 0x100;

/// Number of user slots that fit in the window.
pub const USER_SLOTS: usize = (WINDOW_BYTES - USER_BASE) / SLOT_BYTES;

/// Command register bit definitions.
pub mod command {
    /// Start the accelerator.
    pub const START: u32 = 1 << 0;
    /// Idle value written to complete an invocation.
    pub const CLEAR: u32 = 0;
}

/// Status register bit definitions.
pub mod status {
    /// The accelerator finished the invocation.
    pub const DONE: u32 = 1 << 0;
}

/// Named register of the accelerator socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Register {
    /// Command register.
    Command,
    /// Status register.
    Status,
    /// Tile select.
    Select,
    /// Device identity (read-only).
    DeviceId,
    /// Page-table base address.
    PtAddress,
    /// Page-table entry count.
    PtNchunk,
    /// Chunk-size shift.
    PtShift,
    /// Maximum supported page-table entries (read-only).
    PtNchunkMax,
    /// Coherence mode.
    Coherence,
    /// Peer-to-peer configuration.
    P2p,
    /// Source byte offset.
    SrcOffset,
    /// Destination byte offset.
    DstOffset,
    /// Kernel-specific configuration slot, numbered from [`USER_BASE`].
    User(u8),
}

impl Register {
    /// All fixed socket registers, in offset order.
    pub const SOCKET: [Self; 12] = [
        Self::Command,
        Self::Status,
        Self::Select,
        Self::DeviceId,
        Self::PtAddress,
        Self::PtNchunk,
        Self::PtShift,
        Self::PtNchunkMax,
        Self::Coherence,
        Self::P2p,
        Self::SrcOffset,
        Self::DstOffset,
    ];

    /// Byte offset within the tile window.
    #[must_use]
    pub const fn offset(self) -> usize {
        match self {
            Self::Command => 0x00,
            Self::Status => 0x04,
            Self::Select => 0x08,
            Self::DeviceId => 0x0C,
            Self::PtAddress => 0x10,
            Self::PtNchunk => 0x14,
            Self::PtShift => 0x18,
            Self::PtNchunkMax => 0x1C,
            Self::Coherence => 0x20,
            Self::P2p => 0x24,
            Self::SrcOffset => 0x30,
            Self::DstOffset => 0x34,
            Self::User(slot) => USER_BASE + (slot as usize) * SLOT_BYTES,
        }
    }

    /// Reverse lookup from a byte offset.
    #[must_use]
    pub fn from_offset(offset: usize) -> Option<Self> {
        if offset >= USER_BASE {
            let slot = (offset - USER_BASE) / SLOT_BYTES;
            let aligned = (offset - USER_BASE) % SLOT_BYTES == 0;
            return (aligned && slot < USER_SLOTS)
                .then(|| u8::try_from(slot).ok().map(Self::User))
                .flatten();
        }
        Self::SOCKET.into_iter().find(|r| r.offset() == offset)
    }

    /// Whether the host may write this register.
    #[must_use]
    pub const fn is_writable(self) -> bool {
        !matches!(self, Self::DeviceId | Self::PtNchunkMax)
    }

    /// Whether writing this register is part of the configure step.
    ///
    /// Command and status form the synchronization state machine and are
    /// excluded.
    #[must_use]
    pub const fn is_config(self) -> bool {
        self.is_writable() && !matches!(self, Self::Command | Self::Status)
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Command => f.write_str("CMD"),
            Self::Status => f.write_str("STATUS"),
            Self::Select => f.write_str("SELECT"),
            Self::DeviceId => f.write_str("DEVID"),
            Self::PtAddress => f.write_str("PT_ADDRESS"),
            Self::PtNchunk => f.write_str("PT_NCHUNK"),
            Self::PtShift => f.write_str("PT_SHIFT"),
            Self::PtNchunkMax => f.write_str("PT_NCHUNK_MAX"),
            Self::Coherence => f.write_str("COHERENCE"),
            Self::P2p => f.write_str("P2P"),
            Self::SrcOffset => f.write_str("SRC_OFFSET"),
            Self::DstOffset => f.write_str("DST_OFFSET"),
            Self::User(slot) => write!(f, "USER[{slot}]@{:#04x}", self.offset()),
        }
    }
}

/// Register map validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterMapError {
    /// Two registers share an offset.
    Overlap {
        /// First register.
        a: Register,
        /// Second register.
        b: Register,
    },
    /// A register lies outside the platform's register window.
    OutOfWindow {
        /// Offending register.
        register: Register,
        /// Window size in bytes.
        window: usize,
    },
    /// A kernel declares more parameters than the user block holds.
    TooManyFields {
        /// Requested field count.
        fields: usize,
        /// Available slots.
        slots: usize,
    },
}

impl fmt::Display for RegisterMapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Overlap { a, b } => write!(f, "registers {a} and {b} overlap"),
            Self::OutOfWindow { register, window } => {
                write!(f, "register {register} outside {window:#x}-byte window")
            }
            Self::TooManyFields { fields, slots } => {
                write!(f, "{fields} kernel fields exceed {slots} user slots")
            }
        }
    }
}

impl std::error::Error for RegisterMapError {}

/// Register map checked against a platform register window.
///
/// Construction validates that the socket registers are distinct, slot
/// aligned, below [`USER_BASE`], and that `user_fields` slots fit the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterMap {
    window: usize,
    user_fields: usize,
}

impl RegisterMap {
    /// Validate the map for a window of `window` bytes and a kernel with
    /// `user_fields` configuration parameters.
    ///
    /// # Errors
    ///
    /// Returns the first inconsistency found.
    pub fn validate(window: usize, user_fields: usize) -> Result<Self, RegisterMapError> {
        for (i, a) in Register::SOCKET.iter().enumerate() {
            if a.offset() + SLOT_BYTES > USER_BASE.min(window) {
                return Err(RegisterMapError::OutOfWindow { register: *a, window });
            }
            if let Some(b) = Register::SOCKET[i + 1..]
                .iter()
                .find(|b| b.offset() == a.offset())
            {
                return Err(RegisterMapError::Overlap { a: *a, b: *b });
            }
        }

        let slots = window.saturating_sub(USER_BASE) / SLOT_BYTES;
        if user_fields > slots.min(USER_SLOTS) {
            return Err(RegisterMapError::TooManyFields {
                fields: user_fields,
                slots: slots.min(USER_SLOTS),
            });
        }

        Ok(Self { window, user_fields })
    }

    /// Register holding kernel field `index`, if the map covers it.
    #[must_use]
    pub fn user(&self, index: usize) -> Option<Register> {
        if index >= self.user_fields {
            return None;
        }
        u8::try_from(index).ok().map(Register::User)
    }

    /// Window size this map was validated against.
    #[must_use]
    pub const fn window(&self) -> usize {
        self.window
    }

    /// Number of kernel fields covered.
    #[must_use]
    pub const fn user_fields(&self) -> usize {
        self.user_fields
    }
}
