//! Per-kernel configuration
//!
//! One variant per accelerator kind, each carrying its own typed record.
//! The protocol driver dispatches on the variant to learn which values go
//! into the user register block and in which slot order.

use crate::error::{AcceleratorError, Result};
use crate::layout::KernelDimensions;
use esp_chip::devices::AcceleratorKind;

/// Kernel element type.
pub type Token = i32;

/// Size of one kernel element in bytes.
pub const TOKEN_BYTES: usize = std::mem::size_of::<Token>();

/// Multiply-accumulate kernel parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacConfig {
    /// Batch count (`mac_n`)
    pub batches: u32,
    /// Vectors per batch (`mac_vec`)
    pub vectors: u32,
    /// Elements per vector (`mac_len`)
    pub length: u32,
    /// Input region byte offset within the buffer
    pub src_offset: u32,
    /// Output region byte offset added past the input region
    pub dst_offset: u32,
}

impl MacConfig {
    /// Reference problem: 16 batches of 100 vectors × 64 elements.
    pub const REFERENCE: Self = Self {
        batches: 16,
        vectors: 100,
        length: 64,
        src_offset: 0,
        dst_offset: 0,
    };

    /// Config with zero offsets.
    pub const fn new(batches: u32, vectors: u32, length: u32) -> Self {
        Self {
            batches,
            vectors,
            length,
            src_offset: 0,
            dst_offset: 0,
        }
    }
}

impl Default for MacConfig {
    fn default() -> Self {
        Self::REFERENCE
    }
}

/// Kernel configuration tagged by accelerator kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum KernelConfig {
    /// Multiply-accumulate accelerator
    Mac(MacConfig),
}

impl KernelConfig {
    /// Accelerator kind this configuration targets.
    pub const fn kind(&self) -> AcceleratorKind {
        match self {
            Self::Mac(_) => AcceleratorKind::Mac,
        }
    }

    /// Problem shape.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if any extent is zero.
    pub fn dimensions(&self) -> Result<KernelDimensions> {
        match self {
            Self::Mac(c) => {
                KernelDimensions::new(c.batches as usize, c.vectors as usize, c.length as usize)
            }
        }
    }

    /// Values for the user register block, slot 0 first.
    pub fn register_fields(&self) -> Vec<u32> {
        match self {
            Self::Mac(c) => vec![c.length, c.vectors, c.batches],
        }
    }

    /// Input region byte offset.
    pub const fn src_offset(&self) -> u32 {
        match self {
            Self::Mac(c) => c.src_offset,
        }
    }

    /// Output region byte offset.
    pub const fn dst_offset(&self) -> u32 {
        match self {
            Self::Mac(c) => c.dst_offset,
        }
    }

    /// Element size in bytes.
    pub const fn element_size(&self) -> usize {
        match self {
            Self::Mac(_) => TOKEN_BYTES,
        }
    }

    /// Rebuild a configuration from the registers a device latched.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if too few user fields were supplied.
    pub fn from_registers(
        kind: AcceleratorKind,
        fields: &[u32],
        src_offset: u32,
        dst_offset: u32,
    ) -> Result<Self> {
        let expected = kind.user_fields().len();
        if fields.len() < expected {
            return Err(AcceleratorError::configuration(format!(
                "{kind} needs {expected} user fields, got {}",
                fields.len()
            )));
        }
        match kind {
            AcceleratorKind::Mac => Ok(Self::Mac(MacConfig {
                length: fields[0],
                vectors: fields[1],
                batches: fields[2],
                src_offset,
                dst_offset,
            })),
            other => Err(AcceleratorError::configuration(format!(
                "no kernel configuration for {other}"
            ))),
        }
    }
}

impl From<MacConfig> for KernelConfig {
    fn from(c: MacConfig) -> Self {
        Self::Mac(c)
    }
}
