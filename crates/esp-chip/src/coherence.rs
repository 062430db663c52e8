//! Accelerator coherence modes.
//!
//! The value written to the COHERENCE register selects how the accelerator's
//! DMA interacts with the cache hierarchy. Modes that bypass some level of
//! the hierarchy require the host to write back that level before start.
//!
//! ```text
//! mode    register  host flush before start
//! ─────── ───────── ─────────────────────────────
//! none    0         private caches + LLC
//! llc     1         private caches
//! recall  2         nothing (LLC recalls lines)
//! full    3         nothing (fully coherent)
//! ```

use std::fmt;
use std::str::FromStr;

/// Coherence mode programmed into the accelerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum CoherenceMode {
    /// Non-coherent DMA to main memory.
    #[default]
    None = 0,
    /// DMA coherent with the last-level cache.
    Llc = 1,
    /// Coherent DMA with LLC recalls.
    Recall = 2,
    /// Fully coherent accelerator cache.
    Full = 3,
}

/// Cache maintenance the host performs before the device reads host data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlushAction {
    /// Hardware keeps host and device coherent.
    Nothing,
    /// Write back the CPU's private caches.
    PrivateCaches,
    /// Write back the private caches and the last-level cache.
    PrivateCachesAndLlc,
}

impl CoherenceMode {
    /// Value for the COHERENCE register.
    #[must_use]
    pub const fn register_value(self) -> u32 {
        self as u32
    }

    /// Decode a COHERENCE register value.
    #[must_use]
    pub const fn from_register(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Llc),
            2 => Some(Self::Recall),
            3 => Some(Self::Full),
            _ => None,
        }
    }

    /// Flush required before start under this mode.
    #[must_use]
    pub const fn flush_action(self) -> FlushAction {
        match self {
            Self::None => FlushAction::PrivateCachesAndLlc,
            Self::Llc => FlushAction::PrivateCaches,
            Self::Recall | Self::Full => FlushAction::Nothing,
        }
    }
}

impl fmt::Display for CoherenceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Llc => "llc",
            Self::Recall => "recall",
            Self::Full => "full",
        };
        f.write_str(s)
    }
}

/// Unknown coherence mode name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseCoherenceError(String);

impl fmt::Display for ParseCoherenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown coherence mode '{}' (none|llc|recall|full)", self.0)
    }
}

impl std::error::Error for ParseCoherenceError {}

impl FromStr for CoherenceMode {
    type Err = ParseCoherenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "none" | "non-coherent" => Ok(Self::None),
            "llc" | "llc-coherent" => Ok(Self::Llc),
            "recall" | "coh-dma" => Ok(Self::Recall),
            "full" | "coherent" => Ok(Self::Full),
            other => Err(ParseCoherenceError(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_values_round_trip() {
        for mode in [
            CoherenceMode::None,
            CoherenceMode::Llc,
            CoherenceMode::Recall,
            CoherenceMode::Full,
        ] {
            assert_eq!(CoherenceMode::from_register(mode.register_value()), Some(mode));
            assert_eq!(mode.to_string().parse::<CoherenceMode>(), Ok(mode));
        }
        assert_eq!(CoherenceMode::from_register(4), None);
    }

    #[test]
    fn flush_depends_on_mode() {
        assert_eq!(CoherenceMode::None.flush_action(), FlushAction::PrivateCachesAndLlc);
        assert_eq!(CoherenceMode::Llc.flush_action(), FlushAction::PrivateCaches);
        assert_eq!(CoherenceMode::Full.flush_action(), FlushAction::Nothing);
    }

    #[test]
    fn unknown_mode_rejected() {
        assert!("auto".parse::<CoherenceMode>().is_err());
    }
}
