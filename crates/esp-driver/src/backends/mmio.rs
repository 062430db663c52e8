//! UIO register-window backend
//!
//! Maps `map0` of a `/dev/uioN` node and performs volatile 32-bit accesses
//! at the socket register offsets. Cache maintenance is delegated to the
//! `u-dma-buf` pool that holds the invocation's buffers, when one is set.

use crate::backend::{BackendType, RegisterIo};
use crate::error::{AcceleratorError, Result};
use crate::mmio::MappedRegion;
use crate::udmabuf::UdmaBuf;
use esp_chip::coherence::FlushAction;
use esp_chip::regs::Register;
use std::path::Path;
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

/// Accelerator tile reached through a UIO mapping.
#[derive(Debug)]
pub struct MmioDevice {
    region: MappedRegion,
    flush_target: Option<Arc<UdmaBuf>>,
}

impl MmioDevice {
    /// Map the first `map_size` bytes of `node`.
    ///
    /// # Errors
    ///
    /// Returns error if the node cannot be mapped.
    pub fn open(node: &Path, map_size: usize) -> Result<Self> {
        let region = MappedRegion::open(node, 0, map_size)?;
        tracing::info!("Opened {} ({map_size:#x}-byte register window)", node.display());
        Ok(Self {
            region,
            flush_target: None,
        })
    }

    /// Sync this `u-dma-buf` whenever a flush is required.
    #[must_use]
    pub fn with_flush_target(mut self, udmabuf: Arc<UdmaBuf>) -> Self {
        self.flush_target = Some(udmabuf);
        self
    }

    fn offset(&self, reg: Register) -> Result<usize> {
        let offset = reg.offset();
        if offset + 4 > self.region.size() {
            return Err(AcceleratorError::transfer(format!(
                "{reg} outside the {:#x}-byte register window",
                self.region.size()
            )));
        }
        Ok(offset)
    }
}

impl RegisterIo for MmioDevice {
    fn read_register(&mut self, reg: Register) -> Result<u32> {
        let offset = self.offset(reg)?;
        self.region.read_u32(offset)
    }

    fn write_register(&mut self, reg: Register, value: u32) -> Result<()> {
        let offset = self.offset(reg)?;
        self.region.write_u32(offset, value)
    }

    fn flush(&mut self, action: FlushAction) -> Result<()> {
        fence(Ordering::SeqCst);
        if action == FlushAction::Nothing {
            return Ok(());
        }
        match &self.flush_target {
            Some(udmabuf) => udmabuf.sync_for_device(),
            None => {
                tracing::debug!("No u-dma-buf flush target; relying on a store fence for {action:?}");
                Ok(())
            }
        }
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Mmio
    }
}
