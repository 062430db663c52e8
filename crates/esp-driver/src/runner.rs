//! Configuration-table runner
//!
//! Drives every enabled [`ThreadInfo`] entry end to end: plan the layout,
//! allocate and fill the buffer, install the page table, invoke, read back
//! and validate. Entries naming the same device run in table order on one
//! thread; distinct devices run concurrently on scoped threads.

use crate::config::{InvokeOptions, ThreadInfo};
use crate::error::{AcceleratorError, Result};
use crate::harness::{self, ValidationReport};
use crate::kernel::Token;
use crate::layout::{BufferLayout, DmaGranularity};
use crate::memory::{DmaBuffer, DmaPool};
use crate::page_table::{ChunkSize, PageTable};
use crate::pipeline::DeviceStage;
use crate::protocol::{Accelerator, InvocationReport};
use std::sync::Arc;

/// Successful run of one table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryReport {
    /// Protocol outcome
    pub invocation: InvocationReport,
    /// Output check
    pub validation: ValidationReport,
}

/// Outcome of one table entry.
#[derive(Debug)]
pub struct RunOutcome {
    /// Index in the configuration table
    pub entry: usize,
    /// Device the entry ran on
    pub device: String,
    /// Report, or the error that stopped the entry
    pub result: Result<EntryReport>,
}

impl RunOutcome {
    /// Ran to completion with matching output.
    pub fn passed(&self) -> bool {
        self.result.as_ref().is_ok_and(|r| r.validation.passed())
    }
}

/// Run one entry on `acc`, with `stage` naming what the device pipeline runs.
///
/// # Errors
///
/// Returns the first allocation, protocol, or readback error. Mismatching
/// output is reported in the [`ValidationReport`], not as an error.
pub fn invoke_entry(
    acc: &mut Accelerator,
    pool: &Arc<dyn DmaPool>,
    info: &ThreadInfo,
    stage: impl Into<DeviceStage>,
    options: &InvokeOptions,
) -> Result<EntryReport> {
    info.validate()?;
    let platform = *acc.platform();
    let kernel = &info.kernel;
    let dims = kernel.dimensions()?;
    let element_size = kernel.element_size();
    let layout = BufferLayout::plan(
        &dims,
        DmaGranularity::from_bus(platform.bus_width_bytes, element_size),
        element_size,
    );

    let src = kernel.src_offset() as usize;
    let dst = kernel.dst_offset() as usize;
    let alloc_size = layout.total_size_bytes + src.max(dst);

    let mut buffer = DmaBuffer::alloc(pool, alloc_size)?;
    let bufs = harness::init_buffers(&dims, &layout, stage);
    buffer.write_tokens(src / element_size, &bufs.input)?;

    let table = PageTable::build(
        buffer.base_address(),
        alloc_size,
        ChunkSize::from_shift(platform.chunk_shift),
    )
    .install(pool, &platform)?;

    let invocation = acc.invoke(&layout, &table, info.coherence, kernel, options)?;

    let output: Vec<Token> = buffer.read_tokens(
        (dst + layout.out_offset_bytes()) / element_size,
        layout.out_length,
    )?;
    let validation = harness::validate(&output, &bufs.gold, &dims, &layout);

    tracing::info!(
        "{}: {} of {} element(s) correct",
        acc.name(),
        validation.checked - validation.errors,
        validation.checked
    );
    Ok(EntryReport {
        invocation,
        validation,
    })
}

/// Run every enabled entry of `table` on the matching accelerator.
///
/// # Errors
///
/// Returns `Configuration` or `DeviceNotFound` before anything runs if an
/// enabled entry is invalid or names no accelerator in `accelerators`.
/// Per-entry failures are reported in the outcomes.
pub fn run_table(
    accelerators: &mut [Accelerator],
    pool: &Arc<dyn DmaPool>,
    table: &[ThreadInfo],
    stage: impl Into<DeviceStage>,
    options: &InvokeOptions,
) -> Result<Vec<RunOutcome>> {
    let stage = stage.into();
    for info in table.iter().filter(|i| i.run) {
        info.validate()?;
        if !accelerators.iter().any(|a| a.name() == info.device_name) {
            return Err(AcceleratorError::device_not_found(&info.device_name));
        }
    }

    let mut outcomes: Vec<RunOutcome> = std::thread::scope(|s| {
        let handles: Vec<_> = accelerators
            .iter_mut()
            .filter_map(|acc| {
                let entries: Vec<(usize, &ThreadInfo)> = table
                    .iter()
                    .enumerate()
                    .filter(|(_, info)| info.run && info.device_name == acc.name())
                    .collect();
                if entries.is_empty() {
                    return None;
                }
                let device = acc.name().to_string();
                let handle = s.spawn(move || {
                    entries
                        .into_iter()
                        .map(|(entry, info)| RunOutcome {
                            entry,
                            device: info.device_name.clone(),
                            result: invoke_entry(acc, pool, info, stage, options),
                        })
                        .collect::<Vec<_>>()
                });
                Some((device, handle))
            })
            .collect();

        handles
            .into_iter()
            .flat_map(|(device, handle)| {
                handle.join().unwrap_or_else(|_| {
                    vec![RunOutcome {
                        entry: usize::MAX,
                        device: device.clone(),
                        result: Err(AcceleratorError::transfer(format!(
                            "{device}: runner thread panicked"
                        ))),
                    }]
                })
            })
            .collect()
    });

    outcomes.sort_by_key(|o| o.entry);
    Ok(outcomes)
}
