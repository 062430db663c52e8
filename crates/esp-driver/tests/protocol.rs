//! Register protocol against the software tile model.

use esp_driver::backends::{Access, AccessLog, Completion, RecordingDevice};
use esp_driver::chip::{command, status, AcceleratorKind, CoherenceMode, FlushAction, PlatformDescriptor, Register};
use esp_driver::{
    invoke_entry, Accelerator, AcceleratorError, BufferLayout, ChunkSize, ComputeKind, DeviceStage,
    DmaBuffer, DmaGranularity, DmaPool, InvokeOptions, KernelConfig, MacConfig, PageTable, ResidentPageTable,
    SimMemory, SoftwareAccelerator, ThreadInfo, Token,
};
use std::sync::Arc;
use std::time::Duration;

struct Rig {
    platform: PlatformDescriptor,
    memory: Arc<SimMemory>,
    pool: Arc<dyn DmaPool>,
}

impl Rig {
    fn new(platform: PlatformDescriptor) -> Self {
        let memory = SimMemory::at_dram(&platform, 4 << 20).shared();
        let pool: Arc<dyn DmaPool> = memory.clone();
        Self {
            platform,
            memory,
            pool,
        }
    }

    fn tile(&self) -> SoftwareAccelerator {
        SoftwareAccelerator::new(AcceleratorKind::Mac, Arc::clone(&self.memory), self.platform)
    }

    fn recorded(&self, tile: SoftwareAccelerator) -> (Accelerator, AccessLog) {
        let dev = RecordingDevice::new(tile);
        let log = dev.log();
        let acc = Accelerator::new("mac.0", AcceleratorKind::Mac, self.platform, Box::new(dev)).unwrap();
        (acc, log)
    }

    fn layout(&self, kernel: &KernelConfig) -> BufferLayout {
        BufferLayout::plan(
            &kernel.dimensions().unwrap(),
            DmaGranularity::from_bus(self.platform.bus_width_bytes, kernel.element_size()),
            kernel.element_size(),
        )
    }

    /// Ramp input written, page table installed with `shift`.
    fn prepare(&self, layout: &BufferLayout, shift: u32) -> (DmaBuffer, ResidentPageTable) {
        let mut buffer = DmaBuffer::alloc(&self.pool, layout.total_size_bytes).unwrap();
        let mut input = vec![0 as Token; layout.in_length];
        for b in 0..layout.batches {
            for j in 0..layout.in_words_adjusted {
                input[b * layout.in_words_adjusted + j] = j as Token;
            }
        }
        buffer.write_tokens(0, &input).unwrap();
        let table = PageTable::build(buffer.base_address(), layout.total_size_bytes, ChunkSize::from_shift(shift))
            .install(&self.pool, &self.platform)
            .unwrap();
        (buffer, table)
    }
}

fn position(ops: &[Access], want: impl Fn(&Access) -> bool) -> usize {
    ops.iter().position(want).unwrap()
}

fn fast_options() -> InvokeOptions {
    InvokeOptions::default().with_interval(Duration::from_micros(10))
}

#[test]
fn reference_scenario_end_to_end() {
    let rig = Rig::new(PlatformDescriptor::VC707_ARIANE);
    let (mut acc, log) = rig.recorded(rig.tile());
    let kernel = KernelConfig::Mac(MacConfig::REFERENCE);
    let layout = rig.layout(&kernel);
    assert_eq!(layout.in_length, 102_400);
    assert_eq!(layout.out_length, 1600);
    assert_eq!(layout.total_size_bytes, 416_000);

    let (buffer, table) = rig.prepare(&layout, rig.platform.chunk_shift);
    assert_eq!(table.table().len(), 1);

    let report = acc
        .invoke(&layout, &table, CoherenceMode::None, &kernel, &fast_options())
        .unwrap();
    assert_eq!(report.polls, 1);

    let out: Vec<Token> = buffer.read_tokens(layout.out_offset_words, layout.out_length).unwrap();
    for b in 0..16 {
        for v in 0..100 {
            assert_eq!(out[b * layout.out_words_adjusted + v], v as Token);
        }
    }

    let writes = log.writes();
    assert!(writes.contains(&(Register::PtNchunk, 1)));
    assert!(writes.contains(&(Register::PtShift, 20)));
    assert!(writes.contains(&(Register::Select, 0x053)));
    assert!(writes.contains(&(Register::PtAddress, table.address() as u32)));
    assert!(writes.contains(&(Register::User(0), 64)));
    assert!(writes.contains(&(Register::User(1), 100)));
    assert!(writes.contains(&(Register::User(2), 16)));
}

#[test]
fn protocol_ordering() {
    let rig = Rig::new(PlatformDescriptor::VC707_ARIANE);
    let (mut acc, log) = rig.recorded(rig.tile().with_completion(Completion::AfterPolls(3)));
    let kernel = KernelConfig::Mac(MacConfig::new(2, 8, 4));
    let layout = rig.layout(&kernel);
    let (_buffer, table) = rig.prepare(&layout, rig.platform.chunk_shift);

    let report = acc
        .invoke(&layout, &table, CoherenceMode::Llc, &kernel, &fast_options())
        .unwrap();
    assert_eq!(report.polls, 4);

    let ops = log.snapshot();
    let capability = position(&ops, |a| matches!(a, Access::Read(Register::PtNchunkMax, _)));
    let first_write = position(&ops, |a| matches!(a, Access::Write(..)));
    let flush = position(&ops, |a| matches!(a, Access::Flush(_)));
    let start = position(&ops, |a| *a == Access::Write(Register::Command, command::START));
    let done = position(&ops, |a| {
        matches!(a, Access::Read(Register::Status, v) if v & status::DONE != 0)
    });
    let clear = position(&ops, |a| *a == Access::Write(Register::Command, command::CLEAR));

    assert!(capability < first_write);
    let last_config = ops
        .iter()
        .rposition(|a| matches!(a, Access::Write(reg, _) if reg.is_config()))
        .unwrap();
    assert!(last_config < start);
    assert!(flush < start);
    assert!(done < clear);
    assert_eq!(clear, ops.len() - 1);
    assert_eq!(ops[flush], Access::Flush(FlushAction::PrivateCaches));

    // Each configuration register is written exactly once.
    let config: Vec<_> = log.writes().into_iter().filter(|(r, _)| r.is_config()).collect();
    let mut regs: Vec<_> = config.iter().map(|(r, _)| *r).collect();
    regs.sort();
    regs.dedup();
    assert_eq!(regs.len(), config.len());
}

#[test]
fn capability_rejection_writes_nothing() {
    let rig = Rig::new(PlatformDescriptor::VC707_ARIANE);
    let tile = rig.tile().with_max_chunks(0);
    let counters = tile.counters();
    let (mut acc, log) = rig.recorded(tile);
    let kernel = KernelConfig::Mac(MacConfig::REFERENCE);
    let layout = rig.layout(&kernel);
    let (_buffer, table) = rig.prepare(&layout, rig.platform.chunk_shift);

    let err = acc
        .invoke(&layout, &table, CoherenceMode::None, &kernel, &fast_options())
        .unwrap_err();
    assert!(matches!(err, AcceleratorError::Capability { .. }));
    assert!(log.writes().is_empty());
    assert_eq!(counters.starts(), 0);
}

#[test]
fn too_small_page_table_capacity_rejected() {
    let mut platform = PlatformDescriptor::VC707_ARIANE;
    platform.chunk_shift = 12;
    let rig = Rig::new(platform);
    let (mut acc, log) = rig.recorded(rig.tile().with_max_chunks(50));
    let kernel = KernelConfig::Mac(MacConfig::REFERENCE);
    let layout = rig.layout(&kernel);
    let (_buffer, table) = rig.prepare(&layout, 12);
    assert_eq!(table.table().len(), 102);

    let err = acc
        .invoke(&layout, &table, CoherenceMode::None, &kernel, &fast_options())
        .unwrap_err();
    assert!(matches!(err, AcceleratorError::Capability { .. }));
    assert!(log.writes().is_empty());
}

#[test]
fn timeout_still_clears_command() {
    let rig = Rig::new(PlatformDescriptor::VC707_ARIANE);
    let tile = rig.tile().with_completion(Completion::Never);
    let counters = tile.counters();
    let (mut acc, log) = rig.recorded(tile);
    let kernel = KernelConfig::Mac(MacConfig::new(1, 2, 2));
    let layout = rig.layout(&kernel);
    let (_buffer, table) = rig.prepare(&layout, rig.platform.chunk_shift);

    let options = InvokeOptions::default()
        .with_timeout(Duration::from_millis(100))
        .with_interval(Duration::from_millis(1));
    let started = std::time::Instant::now();
    let err = acc
        .invoke(&layout, &table, CoherenceMode::None, &kernel, &options)
        .unwrap_err();

    assert!(matches!(err, AcceleratorError::Timeout { duration_ms: 100 }));
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(
        log.snapshot().last(),
        Some(&Access::Write(Register::Command, command::CLEAR))
    );
    assert_eq!(counters.clears(), 1);
}

#[test]
fn failed_start_still_clears_command() {
    let rig = Rig::new(PlatformDescriptor::VC707_ARIANE);
    // The tile rejects the pipeline configuration when START arrives.
    let tile = rig.tile().with_slots(5);
    let counters = tile.counters();
    let (mut acc, log) = rig.recorded(tile);
    let kernel = KernelConfig::Mac(MacConfig::new(2, 4, 4));
    let layout = rig.layout(&kernel);
    let (_buffer, table) = rig.prepare(&layout, rig.platform.chunk_shift);

    let err = acc
        .invoke(&layout, &table, CoherenceMode::None, &kernel, &fast_options())
        .unwrap_err();
    assert!(matches!(err, AcceleratorError::Configuration { .. }));

    let ops = log.snapshot();
    assert_eq!(ops.last(), Some(&Access::Write(Register::Command, command::CLEAR)));
    assert!(!ops.iter().any(|a| matches!(a, Access::Read(Register::Status, _))));
    assert_eq!(counters.starts(), 1);
    assert_eq!(counters.clears(), 1);
    assert_eq!(counters.completed(), 0);
}

#[test]
fn uneven_chunking_on_device_still_clears_command() {
    let rig = Rig::new(PlatformDescriptor::VC707_ARIANE);
    let tile = rig.tile().with_chunks_per_batch(3);
    let counters = tile.counters();
    let (mut acc, log) = rig.recorded(tile);
    let kernel = KernelConfig::Mac(MacConfig::new(2, 4, 4));
    let layout = rig.layout(&kernel);
    let (_buffer, table) = rig.prepare(&layout, rig.platform.chunk_shift);

    assert!(acc
        .invoke(&layout, &table, CoherenceMode::None, &kernel, &fast_options())
        .is_err());
    assert_eq!(
        log.snapshot().last(),
        Some(&Access::Write(Register::Command, command::CLEAR))
    );
    assert_eq!(counters.clears(), 1);
}

#[test]
fn cancellation_stops_polling_and_clears() {
    let rig = Rig::new(PlatformDescriptor::VC707_ARIANE);
    let (mut acc, log) = rig.recorded(rig.tile().with_completion(Completion::Never));
    let kernel = KernelConfig::Mac(MacConfig::new(1, 2, 2));
    let layout = rig.layout(&kernel);
    let (_buffer, table) = rig.prepare(&layout, rig.platform.chunk_shift);

    let options = InvokeOptions::default().with_interval(Duration::from_millis(1));
    let cancel = options.cancel.clone();
    let canceller = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        cancel.cancel();
    });
    let err = acc
        .invoke(&layout, &table, CoherenceMode::None, &kernel, &options)
        .unwrap_err();
    canceller.join().unwrap();

    assert!(matches!(err, AcceleratorError::Cancelled));
    assert_eq!(
        log.snapshot().last(),
        Some(&Access::Write(Register::Command, command::CLEAR))
    );
}

#[test]
fn mismatched_configuration_rejected_before_io() {
    let rig = Rig::new(PlatformDescriptor::VC707_ARIANE);
    let (mut acc, log) = rig.recorded(rig.tile());
    let kernel = KernelConfig::Mac(MacConfig::new(2, 4, 4));
    let layout = rig.layout(&kernel);

    // Chunk shift differs from the platform's.
    let (_b1, wrong_shift) = rig.prepare(&layout, 12);
    let err = acc
        .invoke(&layout, &wrong_shift, CoherenceMode::None, &kernel, &fast_options())
        .unwrap_err();
    assert!(matches!(err, AcceleratorError::Configuration { .. }));

    // Layout planned for other dimensions.
    let (_b2, table) = rig.prepare(&layout, rig.platform.chunk_shift);
    let other = KernelConfig::Mac(MacConfig::new(3, 4, 4));
    let err = acc
        .invoke(&layout, &table, CoherenceMode::None, &other, &fast_options())
        .unwrap_err();
    assert!(matches!(err, AcceleratorError::Configuration { .. }));

    // Offsets not aligned to a beat.
    let unaligned = KernelConfig::Mac(MacConfig {
        src_offset: 4,
        ..MacConfig::new(2, 4, 4)
    });
    let err = acc
        .invoke(&layout, &table, CoherenceMode::None, &unaligned, &fast_options())
        .unwrap_err();
    assert!(matches!(err, AcceleratorError::Configuration { .. }));

    assert!(log.snapshot().is_empty());
}

#[test]
fn repeated_invocations_are_identical() {
    let rig = Rig::new(PlatformDescriptor::VC707_ARIANE);
    let (mut acc, _log) = rig.recorded(rig.tile().with_compute(ComputeKind::MultiplyAccumulate));
    let kernel = KernelConfig::Mac(MacConfig::new(4, 10, 8));
    let layout = rig.layout(&kernel);
    let (mut buffer, table) = rig.prepare(&layout, rig.platform.chunk_shift);

    acc.invoke(&layout, &table, CoherenceMode::Full, &kernel, &fast_options()).unwrap();
    let first: Vec<Token> = buffer.read_tokens(layout.out_offset_words, layout.out_length).unwrap();

    buffer
        .write_tokens(layout.out_offset_words, &vec![0 as Token; layout.out_length])
        .unwrap();
    acc.invoke(&layout, &table, CoherenceMode::Full, &kernel, &fast_options()).unwrap();
    let second: Vec<Token> = buffer.read_tokens(layout.out_offset_words, layout.out_length).unwrap();

    assert_eq!(first, second);
    assert!(first.iter().any(|&w| w != 0));
}

#[test]
fn multi_chunk_table_with_buffered_pipeline() {
    let mut platform = PlatformDescriptor::VC707_ARIANE;
    platform.chunk_shift = 12;
    let rig = Rig::new(platform);
    let tile = rig
        .tile()
        .with_compute(ComputeKind::MultiplyAccumulate)
        .with_chunks_per_batch(2)
        .with_slots(3);
    let mut acc = Accelerator::new("mac.0", AcceleratorKind::Mac, platform, Box::new(tile)).unwrap();

    let entry = ThreadInfo::reference("mac.0");
    let report = invoke_entry(&mut acc, &rig.pool, &entry, ComputeKind::MultiplyAccumulate, &fast_options())
        .unwrap();
    assert_eq!(report.validation.errors, 0);
    assert_eq!(report.validation.checked, 1600);
}

#[test]
fn chunked_passthrough_validates_against_unit_split() {
    let rig = Rig::new(PlatformDescriptor::VC707_ARIANE);
    let tile = rig.tile().with_chunks_per_batch(2);
    let mut acc = Accelerator::new("mac.0", AcceleratorKind::Mac, rig.platform, Box::new(tile)).unwrap();
    let entry = ThreadInfo::reference("mac.0");

    let stage = DeviceStage::new(ComputeKind::Passthrough).with_chunks_per_batch(2);
    let report = invoke_entry(&mut acc, &rig.pool, &entry, stage, &fast_options()).unwrap();
    assert_eq!(report.validation.errors, 0);
    assert_eq!(report.validation.checked, 1600);

    // Gold for a single unit per batch disagrees with the split device.
    let report = invoke_entry(&mut acc, &rig.pool, &entry, ComputeKind::Passthrough, &fast_options()).unwrap();
    assert!(!report.validation.passed());
}

#[test]
fn nonzero_offsets_shift_both_regions() {
    let rig = Rig::new(PlatformDescriptor::VC707_ARIANE);
    let mut acc =
        Accelerator::new("mac.0", AcceleratorKind::Mac, rig.platform, Box::new(rig.tile())).unwrap();
    let entry = ThreadInfo::new(
        "mac.0",
        MacConfig {
            src_offset: 64,
            dst_offset: 256,
            ..MacConfig::new(3, 6, 5)
        },
    );
    let report = invoke_entry(&mut acc, &rig.pool, &entry, ComputeKind::Passthrough, &fast_options()).unwrap();
    assert!(report.validation.passed());
}

#[test]
fn big_endian_32_bit_platform() {
    let rig = Rig::new(PlatformDescriptor::VC707_LEON3);
    let mut acc =
        Accelerator::new("mac.0", AcceleratorKind::Mac, rig.platform, Box::new(rig.tile())).unwrap();
    let entry = ThreadInfo::reference("mac.0");
    let report = invoke_entry(&mut acc, &rig.pool, &entry, ComputeKind::Passthrough, &fast_options()).unwrap();
    assert!(report.validation.passed());
}

#[test]
fn buffers_released_after_entry() {
    let rig = Rig::new(PlatformDescriptor::VC707_ARIANE);
    let mut acc =
        Accelerator::new("mac.0", AcceleratorKind::Mac, rig.platform, Box::new(rig.tile())).unwrap();
    invoke_entry(
        &mut acc,
        &rig.pool,
        &ThreadInfo::reference("mac.0"),
        ComputeKind::Passthrough,
        &fast_options(),
    )
    .unwrap();
    assert_eq!(rig.memory.live_allocations(), 0);
}
