//! Accelerator register protocol
//!
//! One invocation walks a fixed state machine over the socket registers:
//!
//! ```text
//!   check     pure validation of layout, page table, offsets   (no I/O)
//!   probe     read PT_NCHUNK_MAX, DEVID                         (reads only)
//!   configure SELECT, COHERENCE, PT_*, P2P, SRC/DST_OFFSET, USER[i]
//!   flush     cache maintenance for the coherence mode
//!   start     CMD = START
//!   poll      STATUS until DONE   (bounded, cancellable)
//!   clear     CMD = 0             (on every exit path after start)
//! ```
//!
//! `invoke` takes `&mut self`, so one [`Accelerator`] can never have two
//! invocations in flight.

use crate::backend::{BackendType, RegisterIo};
use crate::config::InvokeOptions;
use crate::error::{AcceleratorError, Result};
use crate::kernel::KernelConfig;
use crate::layout::{BufferLayout, DmaGranularity};
use crate::page_table::ResidentPageTable;
use esp_chip::coherence::CoherenceMode;
use esp_chip::devices::AcceleratorKind;
use esp_chip::regs::{command, status, Register, RegisterMap};
use esp_chip::socmap::PlatformDescriptor;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Outcome of a completed invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvocationReport {
    /// STATUS reads until DONE was observed
    pub polls: u64,
    /// Time from start to done
    pub elapsed: Duration,
}

/// Read-only identity of an accelerator socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceProbe {
    /// Value of DEVID
    pub device_id: u32,
    /// Value of PT_NCHUNK_MAX; zero means no scatter-gather
    pub max_chunks: u32,
}

/// Register values derived from one request, computed before any I/O.
#[derive(Debug)]
struct Programming {
    pt_address: u32,
    pt_nchunk: u32,
    pt_shift: u32,
    src_offset: u32,
    dst_offset: u32,
    fields: Vec<u32>,
}

/// One accelerator instance with exclusive access to its registers.
#[derive(Debug)]
pub struct Accelerator {
    name: String,
    kind: AcceleratorKind,
    platform: PlatformDescriptor,
    map: RegisterMap,
    io: Box<dyn RegisterIo>,
}

impl Accelerator {
    /// Bind a register transport to a named instance.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the register map does not fit the
    /// platform window.
    pub fn new(
        name: impl Into<String>,
        kind: AcceleratorKind,
        platform: PlatformDescriptor,
        io: Box<dyn RegisterIo>,
    ) -> Result<Self> {
        let map = RegisterMap::validate(platform.register_window, kind.user_fields().len())
            .map_err(|e| AcceleratorError::configuration(e.to_string()))?;
        Ok(Self {
            name: name.into(),
            kind,
            platform,
            map,
            io,
        })
    }

    /// Instance name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Accelerator kind.
    pub const fn kind(&self) -> AcceleratorKind {
        self.kind
    }

    /// Platform geometry.
    pub const fn platform(&self) -> &PlatformDescriptor {
        &self.platform
    }

    /// Transport type.
    pub fn backend_type(&self) -> BackendType {
        self.io.backend_type()
    }

    /// Read the identity registers without touching configuration.
    ///
    /// # Errors
    ///
    /// Returns error if a register read fails.
    pub fn probe(&mut self) -> Result<DeviceProbe> {
        Ok(DeviceProbe {
            device_id: self.io.read_register(Register::DeviceId)?,
            max_chunks: self.io.read_register(Register::PtNchunkMax)?,
        })
    }

    /// Run one invocation to completion.
    ///
    /// # Errors
    ///
    /// - `Configuration` if the request is inconsistent (no register written)
    /// - `Capability` if the device cannot hold the page table (no register written)
    /// - `Timeout` / `Cancelled` if DONE is not observed in time (CMD still cleared)
    /// - transport errors from register access
    pub fn invoke(
        &mut self,
        layout: &BufferLayout,
        page_table: &ResidentPageTable,
        coherence: CoherenceMode,
        kernel: &KernelConfig,
        options: &InvokeOptions,
    ) -> Result<InvocationReport> {
        let prog = self.check(layout, page_table, kernel)?;

        info!(
            "{}: invoking ({} chunk(s), coherence {coherence}, {})",
            self.name,
            prog.pt_nchunk,
            self.io.backend_type()
        );

        // Capability: reads only.
        let max_chunks = self.io.read_register(Register::PtNchunkMax)?;
        if max_chunks == 0 {
            return Err(AcceleratorError::capability(format!(
                "{}: scatter-gather not supported",
                self.name
            )));
        }
        if max_chunks < prog.pt_nchunk {
            return Err(AcceleratorError::capability(format!(
                "{}: page table needs {} chunks, device holds {max_chunks}",
                self.name, prog.pt_nchunk
            )));
        }
        let device_id = self.io.read_register(Register::DeviceId)?;
        if AcceleratorKind::from_device_id(device_id) != Some(self.kind) {
            return Err(AcceleratorError::capability(format!(
                "{}: device id {device_id:#x} is not a {}",
                self.name, self.kind
            )));
        }

        // Configure.
        let mut writes = vec![
            (Register::Select, device_id),
            (Register::Coherence, coherence.register_value()),
            (Register::PtAddress, prog.pt_address),
            (Register::PtNchunk, prog.pt_nchunk),
            (Register::PtShift, prog.pt_shift),
            (Register::P2p, 0),
            (Register::SrcOffset, prog.src_offset),
            (Register::DstOffset, prog.dst_offset),
        ];
        for (i, &value) in prog.fields.iter().enumerate() {
            let reg = self.map.user(i).ok_or_else(|| {
                AcceleratorError::configuration(format!("no user register for field {i}"))
            })?;
            writes.push((reg, value));
        }
        for (reg, value) in writes {
            debug!("{}: {reg} <- {value:#x}", self.name);
            self.io.write_register(reg, value)?;
        }

        self.io.flush(coherence.flush_action())?;

        // Armed before START: a failed START write is cleared too.
        let mut guard = ClearGuard::new(&mut *self.io, &self.name);
        guard.io().write_register(Register::Command, command::START)?;
        let report = poll_done(guard.io(), options, &self.name)?;
        guard.clear()?;

        info!(
            "{}: done after {} poll(s) in {:?}",
            self.name, report.polls, report.elapsed
        );
        Ok(report)
    }

    /// Pure validation of one request.
    fn check(
        &self,
        layout: &BufferLayout,
        page_table: &ResidentPageTable,
        kernel: &KernelConfig,
    ) -> Result<Programming> {
        if kernel.kind() != self.kind {
            return Err(AcceleratorError::configuration(format!(
                "{}: {} configuration sent to a {} accelerator",
                self.name,
                kernel.kind(),
                self.kind
            )));
        }

        let element_size = kernel.element_size();
        let granularity = DmaGranularity::from_bus(self.platform.bus_width_bytes, element_size);
        let expected = BufferLayout::plan(&kernel.dimensions()?, granularity, element_size);
        if *layout != expected {
            return Err(AcceleratorError::configuration(format!(
                "{}: layout does not match kernel dimensions on {}",
                self.name, self.platform.name
            )));
        }

        let table = page_table.table();
        let shift = table.chunk_size().shift();
        if shift != self.platform.chunk_shift {
            return Err(AcceleratorError::configuration(format!(
                "chunk shift {shift} does not match platform shift {}",
                self.platform.chunk_shift
            )));
        }
        if table.total_bytes() < layout.total_size_bytes {
            return Err(AcceleratorError::configuration(format!(
                "page table covers {} bytes, layout needs {}",
                table.total_bytes(),
                layout.total_size_bytes
            )));
        }
        let pt_address = u32::try_from(page_table.address()).map_err(|_| {
            AcceleratorError::configuration(format!(
                "page table at {:#x} outside 32-bit address space",
                page_table.address()
            ))
        })?;
        if let Some(entry) = table.entries().iter().find(|&&e| u32::try_from(e).is_err()) {
            return Err(AcceleratorError::configuration(format!(
                "chunk at {entry:#x} outside 32-bit address space"
            )));
        }
        let pt_nchunk = u32::try_from(table.len())
            .map_err(|_| AcceleratorError::configuration("page table too long"))?;

        let beat_bytes = (granularity.words().max(1) * element_size) as u64;
        let src_offset = kernel.src_offset();
        let dst_offset = kernel.dst_offset();
        if u64::from(src_offset) % beat_bytes != 0 || u64::from(dst_offset) % beat_bytes != 0 {
            return Err(AcceleratorError::configuration(format!(
                "offsets ({src_offset:#x}, {dst_offset:#x}) not aligned to {beat_bytes}-byte beats"
            )));
        }
        let covered = table.total_bytes() as u64;
        let input_end = u64::from(src_offset) + layout.in_size_bytes as u64;
        let output_end = u64::from(dst_offset) + layout.total_size_bytes as u64;
        if input_end > covered || output_end > covered {
            return Err(AcceleratorError::configuration(format!(
                "offsets ({src_offset:#x}, {dst_offset:#x}) exceed the {covered}-byte buffer"
            )));
        }

        let fields = kernel.register_fields();
        if fields.len() != self.map.user_fields() {
            return Err(AcceleratorError::configuration(format!(
                "{} fields for a map of {}",
                fields.len(),
                self.map.user_fields()
            )));
        }

        Ok(Programming {
            pt_address,
            pt_nchunk,
            pt_shift: shift,
            src_offset,
            dst_offset,
            fields,
        })
    }
}

/// Bounded, cancellable wait for STATUS.DONE.
fn poll_done(io: &mut dyn RegisterIo, options: &InvokeOptions, name: &str) -> Result<InvocationReport> {
    let started = Instant::now();
    let mut polls = 0u64;
    loop {
        if options.cancel.is_cancelled() {
            warn!("{name}: cancelled after {polls} poll(s)");
            return Err(AcceleratorError::Cancelled);
        }
        let value = io.read_register(Register::Status)?;
        polls += 1;
        if value & status::DONE != 0 {
            return Ok(InvocationReport {
                polls,
                elapsed: started.elapsed(),
            });
        }
        if started.elapsed() >= options.poll.timeout {
            let duration_ms = u64::try_from(options.poll.timeout.as_millis()).unwrap_or(u64::MAX);
            warn!("{name}: no completion within {duration_ms}ms");
            return Err(AcceleratorError::Timeout { duration_ms });
        }
        if options.poll.interval.is_zero() {
            std::hint::spin_loop();
        } else {
            std::thread::sleep(options.poll.interval);
        }
    }
}

/// Writes CMD = 0 when dropped unless [`ClearGuard::clear`] already did.
struct ClearGuard<'a> {
    io: &'a mut dyn RegisterIo,
    name: &'a str,
    armed: bool,
}

impl<'a> ClearGuard<'a> {
    fn new(io: &'a mut dyn RegisterIo, name: &'a str) -> Self {
        Self {
            io,
            name,
            armed: true,
        }
    }

    fn io(&mut self) -> &mut dyn RegisterIo {
        &mut *self.io
    }

    fn clear(mut self) -> Result<()> {
        self.armed = false;
        self.io.write_register(Register::Command, command::CLEAR)
    }
}

impl Drop for ClearGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.io.write_register(Register::Command, command::CLEAR) {
                warn!("{}: failed to clear command register: {e}", self.name);
            }
        }
    }
}
