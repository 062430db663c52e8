//! Accelerator identifiers.
//!
//! Each accelerator kind has a device ID reported through plug-and-play, a
//! device-tree compatible string used by Linux (UIO `name`), and an ordered
//! list of kernel parameters that occupy the user register block.

use std::fmt;
use std::str::FromStr;

/// Vendor ID of the System Level Design group accelerators.
pub const SLD_VENDOR_ID: u32 = 0xEB;

/// Multiply-accumulate accelerator device ID.
pub const SLD_MAC: u32 = 0x053;

/// Accelerator kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum AcceleratorKind {
    /// Batched multiply-accumulate over vectors.
    Mac,
}

impl AcceleratorKind {
    /// Every supported kind.
    pub const ALL: [Self; 1] = [Self::Mac];

    /// Plug-and-play device ID.
    #[must_use]
    pub const fn device_id(self) -> u32 {
        match self {
            Self::Mac => SLD_MAC,
        }
    }

    /// Device-tree compatible string.
    #[must_use]
    pub const fn compatible(self) -> &'static str {
        match self {
            Self::Mac => "sld,mac",
        }
    }

    /// Short name used for instance names (`mac.0`, `mac.1`, ...).
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Mac => "mac",
        }
    }

    /// Kernel parameters in user-register order (slot 0 first).
    #[must_use]
    pub const fn user_fields(self) -> &'static [&'static str] {
        match self {
            Self::Mac => &["mac_len", "mac_vec", "mac_n"],
        }
    }

    /// Look up a kind by device ID.
    #[must_use]
    pub const fn from_device_id(id: u32) -> Option<Self> {
        match id {
            SLD_MAC => Some(Self::Mac),
            _ => None,
        }
    }

    /// Whether a UIO/device-tree name refers to this kind, either by
    /// compatible string or by instance name.
    #[must_use]
    pub fn matches_name(self, name: &str) -> bool {
        let name = name.trim();
        name == self.compatible()
            || name == self.name()
            || name
                .strip_prefix(self.name())
                .and_then(|rest| rest.strip_prefix('.'))
                .is_some_and(|idx| idx.parse::<u32>().is_ok())
    }
}

impl fmt::Display for AcceleratorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AcceleratorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "mac" | "sld,mac" => Ok(Self::Mac),
            other => Err(format!("unknown accelerator kind '{other}'")),
        }
    }
}
