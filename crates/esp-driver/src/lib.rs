//! Host-side driver for ESP loosely-coupled accelerators.
//!
//! This crate plans DMA buffers, builds scatter-gather page tables, runs the
//! register protocol against an accelerator tile, and contains the
//! device-side streaming pipeline used by the software tile model.
//!
//! # Invocation flow
//!
//! ```text
//! KernelConfig ──▶ BufferLayout::plan ──▶ DmaBuffer::alloc ──▶ PageTable::build
//!                                                                   │ install
//!                                                                   ▼
//!            Accelerator::invoke: check → capability → configure → flush
//!                                 → START → poll DONE → CMD = 0
//! ```
//!
//! # Backends
//!
//! ```text
//! MmioDevice           UIO register window (ESP on FPGA / silicon)
//! SoftwareAccelerator  register file + streaming pipeline over SimMemory
//! RecordingDevice      wraps either, logs every access
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use esp_driver::prelude::*;
//! use std::sync::Arc;
//!
//! # fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
//! let platform = PlatformDescriptor::default();
//! let memory = SimMemory::at_dram(&platform, 1 << 20).shared();
//! let pool: Arc<dyn DmaPool> = memory.clone();
//!
//! let tile = SoftwareAccelerator::new(AcceleratorKind::Mac, memory, platform);
//! let mut acc = Accelerator::new("mac.0", AcceleratorKind::Mac, platform, Box::new(tile))?;
//!
//! let entry = ThreadInfo::reference("mac.0");
//! let report = invoke_entry(&mut acc, &pool, &entry, ComputeKind::Passthrough, &InvokeOptions::default())?;
//! assert!(report.validation.passed());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]

mod backend;
pub mod backends;
mod config;
mod discovery;
mod error;
pub mod harness;
mod kernel;
mod layout;
mod memory;
pub mod mmio;
mod page_table;
pub mod pipeline;
mod protocol;
pub mod runner;
mod udmabuf;

/// Silicon model constants (re-exported from esp-chip).
pub mod chip {
    pub use esp_chip::coherence::{CoherenceMode, FlushAction};
    pub use esp_chip::devices::{AcceleratorKind, SLD_MAC, SLD_VENDOR_ID};
    pub use esp_chip::regs::{command, status, Register, RegisterMap};
    pub use esp_chip::socmap::{ByteOrder, PlatformDescriptor};
}

pub use backend::{BackendType, RegisterIo};
pub use backends::{Completion, MmioDevice, RecordingDevice, SoftwareAccelerator};
pub use config::{
    CancelToken, InvokeOptions, P2pConfig, PollConfig, ThreadInfo, ENV_POLL_INTERVAL_US,
    ENV_POLL_TIMEOUT_MS, MAX_P2P_SOURCES,
};
pub use discovery::{DeviceInfo, DeviceManager, DeviceSource};
pub use error::{AcceleratorError, Result};
pub use kernel::{KernelConfig, MacConfig, Token, TOKEN_BYTES};
pub use layout::{BufferLayout, DmaGranularity, KernelDimensions};
pub use memory::{DmaBuffer, DmaPool, SimMemory, DMA_ALIGN};
pub use page_table::{decode_entry, ChunkSize, PageTable, ResidentPageTable};
pub use pipeline::{ComputeKind, ComputeStage, DeviceStage, StreamingPipeline};
pub use protocol::{Accelerator, DeviceProbe, InvocationReport};
pub use runner::{invoke_entry, run_table, EntryReport, RunOutcome};
pub use udmabuf::UdmaBuf;

/// Commonly used types.
pub mod prelude {
    pub use crate::chip::{AcceleratorKind, CoherenceMode, PlatformDescriptor};
    pub use crate::{
        invoke_entry, run_table, Accelerator, AcceleratorError, BufferLayout, ChunkSize,
        ComputeKind, DeviceManager, DeviceStage, DmaBuffer, DmaGranularity, DmaPool,
        InvokeOptions, KernelConfig, KernelDimensions, MacConfig, PageTable, Result, SimMemory,
        SoftwareAccelerator, ThreadInfo,
    };
}
