//! Register-access abstraction for accelerator backends
//!
//! Every backend exposes one accelerator socket as a [`RegisterIo`]: 32-bit
//! reads and writes addressed by [`Register`], plus the cache flush the
//! coherence mode asks for. The invocation protocol is written once against
//! this trait and runs unchanged over MMIO, the software model, or a
//! recording wrapper.

use crate::error::Result;
use esp_chip::coherence::FlushAction;
use esp_chip::regs::Register;
use std::fmt::Debug;
use std::sync::atomic::{fence, Ordering};

/// One accelerator's register window.
pub trait RegisterIo: Debug + Send {
    /// Read a 32-bit register.
    ///
    /// # Errors
    ///
    /// Returns error if the register cannot be read.
    fn read_register(&mut self, reg: Register) -> Result<u32>;

    /// Write a 32-bit register.
    ///
    /// # Errors
    ///
    /// Returns error if the register cannot be written.
    fn write_register(&mut self, reg: Register, value: u32) -> Result<()>;

    /// Make host writes visible to the accelerator.
    ///
    /// The default orders prior stores; backends with real caches override it.
    ///
    /// # Errors
    ///
    /// Returns error if the flush fails.
    fn flush(&mut self, action: FlushAction) -> Result<()> {
        if action != FlushAction::Nothing {
            fence(Ordering::SeqCst);
        }
        Ok(())
    }

    /// Backend type for debugging
    fn backend_type(&self) -> BackendType;
}

impl<T: RegisterIo + ?Sized> RegisterIo for Box<T> {
    fn read_register(&mut self, reg: Register) -> Result<u32> {
        (**self).read_register(reg)
    }

    fn write_register(&mut self, reg: Register, value: u32) -> Result<()> {
        (**self).write_register(reg, value)
    }

    fn flush(&mut self, action: FlushAction) -> Result<()> {
        (**self).flush(action)
    }

    fn backend_type(&self) -> BackendType {
        (**self).backend_type()
    }
}

/// Backend type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    /// UIO register window mapped into the process
    Mmio,

    /// Software accelerator model, no hardware required
    Software,

    /// Wrapper that records every access
    Recording,
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mmio => write!(f, "MMIO (UIO)"),
            Self::Software => write!(f, "Software (model)"),
            Self::Recording => write!(f, "Recording"),
        }
    }
}
