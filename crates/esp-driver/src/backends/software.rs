//! Software accelerator model
//!
//! Implements [`RegisterIo`] with a register file and a device-side engine
//! that behaves like an ESP loosely-coupled tile:
//!
//! 1. The host programs the socket registers and writes `CMD = START`.
//! 2. The model fetches the page table from [`SimMemory`] at `PT_ADDRESS`,
//!    rebuilds the kernel configuration from the user registers, and runs
//!    the [`StreamingPipeline`] over a scatter-gather stream that translates
//!    every beat through the page table.
//! 3. `STATUS.DONE` is raised; `CMD = 0` returns the tile to idle.
//!
//! This lets the complete protocol run in CI without an FPGA. Faults
//! (missing scatter-gather, a tile that never completes, slow completion)
//! are configured on construction.

use crate::backend::{BackendType, RegisterIo};
use crate::error::{AcceleratorError, Result};
use crate::kernel::{KernelConfig, Token};
use crate::layout::DmaGranularity;
use crate::memory::{DmaPool, SimMemory};
use crate::page_table::decode_entry;
use crate::pipeline::{ComputeKind, DmaStream, PipelinePlan, StreamingPipeline};
use esp_chip::coherence::{CoherenceMode, FlushAction};
use esp_chip::devices::AcceleratorKind;
use esp_chip::regs::{command, status, Register};
use esp_chip::socmap::PlatformDescriptor;
use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Page-table capacity reported by default.
pub const DEFAULT_MAX_CHUNKS: u32 = 1024;

/// When the model raises DONE after a start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Completion {
    /// DONE is visible on the first STATUS read
    #[default]
    Immediate,
    /// DONE becomes visible after this many STATUS reads
    AfterPolls(u32),
    /// The tile accepts START and never completes
    Never,
}

/// Activity counters, shared so they stay readable after the model is boxed.
#[derive(Debug, Default)]
pub struct DeviceCounters {
    starts: AtomicU64,
    clears: AtomicU64,
    flushes: AtomicU64,
    completed: AtomicU64,
}

impl DeviceCounters {
    /// START commands received.
    pub fn starts(&self) -> u64 {
        self.starts.load(Ordering::Relaxed)
    }

    /// Clear commands received.
    pub fn clears(&self) -> u64 {
        self.clears.load(Ordering::Relaxed)
    }

    /// Flushes that required cache maintenance.
    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    /// Pipeline passes run to completion.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }
}

/// Software model of one accelerator tile.
#[derive(Debug)]
pub struct SoftwareAccelerator {
    kind: AcceleratorKind,
    platform: PlatformDescriptor,
    memory: Arc<SimMemory>,
    regs: Vec<u32>,
    max_chunks: u32,
    compute: ComputeKind,
    slots: usize,
    chunks_per_batch: usize,
    completion: Completion,
    pending_polls: u32,
    counters: Arc<DeviceCounters>,
}

impl SoftwareAccelerator {
    /// Tile of `kind` sharing `memory` with the host.
    pub fn new(kind: AcceleratorKind, memory: Arc<SimMemory>, platform: PlatformDescriptor) -> Self {
        Self {
            kind,
            platform,
            memory,
            regs: vec![0; platform.register_window / 4],
            max_chunks: DEFAULT_MAX_CHUNKS,
            compute: ComputeKind::default(),
            slots: 1,
            chunks_per_batch: 1,
            completion: Completion::default(),
            pending_polls: 0,
            counters: Arc::new(DeviceCounters::default()),
        }
    }

    /// Report `max_chunks` in PT_NCHUNK_MAX; zero disables scatter-gather.
    #[must_use]
    pub fn with_max_chunks(mut self, max_chunks: u32) -> Self {
        self.max_chunks = max_chunks;
        self
    }

    /// Select the compute stage.
    #[must_use]
    pub fn with_compute(mut self, compute: ComputeKind) -> Self {
        self.compute = compute;
        self
    }

    /// On-chip buffer slots for load-ahead (1 = strictly sequential).
    #[must_use]
    pub fn with_slots(mut self, slots: usize) -> Self {
        self.slots = slots;
        self
    }

    /// Split each batch into `chunks` pipeline units.
    #[must_use]
    pub fn with_chunks_per_batch(mut self, chunks: usize) -> Self {
        self.chunks_per_batch = chunks;
        self
    }

    /// Completion behaviour after START.
    #[must_use]
    pub fn with_completion(mut self, completion: Completion) -> Self {
        self.completion = completion;
        self
    }

    /// Shared activity counters.
    pub fn counters(&self) -> Arc<DeviceCounters> {
        Arc::clone(&self.counters)
    }

    /// Accelerator kind modelled.
    pub const fn kind(&self) -> AcceleratorKind {
        self.kind
    }

    /// Compute stage in use.
    pub const fn compute(&self) -> ComputeKind {
        self.compute
    }

    fn slot(&self, reg: Register) -> Result<usize> {
        let index = reg.offset() / 4;
        if index >= self.regs.len() {
            return Err(AcceleratorError::transfer(format!(
                "{reg} outside the {:#x}-byte register window",
                self.platform.register_window
            )));
        }
        Ok(index)
    }

    fn reg(&self, reg: Register) -> Result<u32> {
        Ok(self.regs[self.slot(reg)?])
    }

    fn set(&mut self, reg: Register, value: u32) -> Result<()> {
        let index = self.slot(reg)?;
        self.regs[index] = value;
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.counters.starts.fetch_add(1, Ordering::Relaxed);
        if self.completion == Completion::Never {
            debug!("Software {}: START accepted, completion disabled", self.kind);
            return Ok(());
        }

        self.execute()?;
        self.counters.completed.fetch_add(1, Ordering::Relaxed);
        if let Completion::AfterPolls(n) = self.completion {
            self.pending_polls = n;
        }
        self.set(Register::Status, status::DONE)
    }

    /// One pass of the device-side kernel shell.
    fn execute(&mut self) -> Result<()> {
        let coherence = self.reg(Register::Coherence)?;
        let coherence = CoherenceMode::from_register(coherence).ok_or_else(|| {
            AcceleratorError::transfer(format!("invalid coherence value {coherence}"))
        })?;

        let nchunk = self.reg(Register::PtNchunk)?;
        if nchunk > self.max_chunks {
            return Err(AcceleratorError::transfer(format!(
                "PT_NCHUNK {nchunk} exceeds device capacity {}",
                self.max_chunks
            )));
        }
        let shift = self.reg(Register::PtShift)?;
        let entries = self.fetch_page_table(self.reg(Register::PtAddress)?, nchunk)?;

        let field_count = self.kind.user_fields().len();
        let mut fields = Vec::with_capacity(field_count);
        for slot in 0..field_count {
            let slot = u8::try_from(slot)
                .map_err(|_| AcceleratorError::transfer("user field index overflow"))?;
            fields.push(self.reg(Register::User(slot))?);
        }
        let kernel = KernelConfig::from_registers(
            self.kind,
            &fields,
            self.reg(Register::SrcOffset)?,
            self.reg(Register::DstOffset)?,
        )?;

        let element_size = kernel.element_size();
        let granularity = DmaGranularity::from_bus(self.platform.bus_width_bytes, element_size);
        let plan = PipelinePlan::new(kernel.dimensions()?, granularity, self.chunks_per_batch)?;
        let pipeline = StreamingPipeline::new(plan, self.compute);

        let mut stream = ScatterGatherStream {
            memory: &self.memory,
            entries,
            shift,
            beat_bytes: plan.words_per_beat() * element_size,
            src_offset: u64::from(kernel.src_offset()),
            dst_offset: u64::from(kernel.dst_offset()),
        };
        let stats = pipeline.run_buffered(&mut stream, self.slots)?;

        info!(
            "Software {}: {} unit(s), {} beats in, {} beats out ({coherence})",
            self.kind, stats.units, stats.beats_loaded, stats.beats_stored
        );
        Ok(())
    }

    fn fetch_page_table(&self, address: u32, nchunk: u32) -> Result<Vec<u64>> {
        let width = self.platform.bus_width_bytes;
        let mut raw = vec![0u8; width * nchunk as usize];
        self.memory.read(u64::from(address), &mut raw)?;
        raw.chunks_exact(width)
            .map(|entry| {
                decode_entry(entry, self.platform.byte_order).ok_or_else(|| {
                    AcceleratorError::transfer(format!("undecodable {width}-byte page-table entry"))
                })
            })
            .collect()
    }
}

impl RegisterIo for SoftwareAccelerator {
    fn read_register(&mut self, reg: Register) -> Result<u32> {
        match reg {
            Register::DeviceId => Ok(self.kind.device_id()),
            Register::PtNchunkMax => Ok(self.max_chunks),
            Register::Status if self.pending_polls > 0 => {
                self.pending_polls -= 1;
                Ok(0)
            }
            other => self.reg(other),
        }
    }

    fn write_register(&mut self, reg: Register, value: u32) -> Result<()> {
        if !reg.is_writable() {
            return Err(AcceleratorError::transfer(format!("{reg} is read-only")));
        }
        self.set(reg, value)?;
        if reg != Register::Command {
            return Ok(());
        }

        if value & command::START != 0 {
            self.start()
        } else {
            self.counters.clears.fetch_add(1, Ordering::Relaxed);
            self.pending_polls = 0;
            self.set(Register::Status, 0)
        }
    }

    fn flush(&mut self, action: FlushAction) -> Result<()> {
        if action != FlushAction::Nothing {
            self.counters.flushes.fetch_add(1, Ordering::Relaxed);
        }
        fence(Ordering::SeqCst);
        Ok(())
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Software
    }
}

/// DMA stream whose beats are translated through the page table.
struct ScatterGatherStream<'a> {
    memory: &'a SimMemory,
    entries: Vec<u64>,
    shift: u32,
    beat_bytes: usize,
    src_offset: u64,
    dst_offset: u64,
}

impl ScatterGatherStream<'_> {
    /// Split `[logical, logical + len)` at chunk boundaries and hand each
    /// piece to `f` as (physical address, range within the beat).
    fn segments(
        &self,
        logical: u64,
        len: usize,
        mut f: impl FnMut(u64, std::ops::Range<usize>) -> Result<()>,
    ) -> Result<()> {
        let chunk = 1u64 << self.shift;
        let mut done = 0;
        while done < len {
            let addr = logical + done as u64;
            let base = usize::try_from(addr >> self.shift)
                .ok()
                .and_then(|index| self.entries.get(index))
                .ok_or_else(|| {
                    AcceleratorError::transfer(format!("DMA offset {addr:#x} beyond page table"))
                })?;
            let within = addr & (chunk - 1);
            let take = usize::try_from(chunk - within).map_or(len - done, |n| n.min(len - done));
            f(base + within, done..done + take)?;
            done += take;
        }
        Ok(())
    }
}

impl DmaStream for ScatterGatherStream<'_> {
    fn read_beat(&mut self, beat: usize, word: &mut [Token]) -> Result<()> {
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(word);
        let logical = self.src_offset + (beat * self.beat_bytes) as u64;
        let memory = self.memory;
        self.segments(logical, bytes.len(), |phys, range| memory.read(phys, &mut bytes[range]))
    }

    fn write_beat(&mut self, beat: usize, word: &[Token]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(word);
        let logical = self.dst_offset + (beat * self.beat_bytes) as u64;
        let memory = self.memory;
        self.segments(logical, bytes.len(), |phys, range| memory.write(phys, &bytes[range]))
    }
}
