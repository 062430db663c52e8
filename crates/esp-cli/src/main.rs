//! `esp`: command-line interface for ESP loosely-coupled accelerators.
//!
//! ```text
//! USAGE:
//!   esp plan                         Print buffer layout and page table size
//!   esp probe                        List UIO accelerators and their capability
//!   esp run                          Run the thread table on software tiles
//!   esp run --uio --udmabuf udmabuf0 Run on hardware with a reserved DMA region
//! ```

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use esp_chip::coherence::CoherenceMode;
use esp_chip::devices::AcceleratorKind;
use esp_chip::socmap::PlatformDescriptor;
use esp_driver::{
    run_table, Accelerator, AcceleratorError, BufferLayout, ChunkSize, ComputeKind,
    DeviceManager, DeviceSource, DeviceStage, DmaGranularity, DmaPool, InvokeOptions,
    KernelConfig, MacConfig, SimMemory, SoftwareAccelerator, ThreadInfo, UdmaBuf,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "esp", about = "ESP accelerator invocation CLI", version)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Target platform.
    #[arg(long, value_enum, default_value_t = Platform::Ariane, global = true)]
    platform: Platform,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Clone, Copy, ValueEnum)]
enum Platform {
    /// VC707 with 64-bit Ariane cores
    Ariane,
    /// VC707 with 32-bit Leon3 cores
    Leon3,
}

impl Platform {
    const fn descriptor(self) -> PlatformDescriptor {
        match self {
            Self::Ariane => PlatformDescriptor::VC707_ARIANE,
            Self::Leon3 => PlatformDescriptor::VC707_LEON3,
        }
    }
}

#[derive(Args)]
struct KernelArgs {
    /// Batches (`mac_n`).
    #[arg(long, default_value_t = MacConfig::REFERENCE.batches)]
    batches: u32,
    /// Vectors per batch (`mac_vec`).
    #[arg(long, default_value_t = MacConfig::REFERENCE.vectors)]
    vectors: u32,
    /// Elements per vector (`mac_len`).
    #[arg(long, default_value_t = MacConfig::REFERENCE.length)]
    length: u32,
}

impl KernelArgs {
    const fn config(&self) -> MacConfig {
        MacConfig::new(self.batches, self.vectors, self.length)
    }
}

#[derive(Subcommand)]
enum Cmd {
    /// Print the buffer layout and page table for a kernel shape.
    Plan {
        #[command(flatten)]
        kernel: KernelArgs,
    },
    /// List UIO-exported accelerators and read their capability registers.
    Probe {
        /// sysfs root to scan.
        #[arg(long, default_value = "/sys")]
        sysfs: PathBuf,
        /// Directory holding the uio device nodes.
        #[arg(long, default_value = "/dev")]
        dev: PathBuf,
    },
    /// Run one invocation per device and validate the output.
    Run {
        #[command(flatten)]
        kernel: KernelArgs,
        /// Software tiles to instantiate.
        #[arg(long, default_value_t = 1)]
        devices: usize,
        /// Use UIO hardware instead of software tiles.
        #[arg(long)]
        uio: bool,
        /// `u-dma-buf` device providing DMA memory for hardware runs.
        #[arg(long, requires = "uio")]
        udmabuf: Option<String>,
        /// Device compute stage (passthrough | mac).
        #[arg(long, default_value = "passthrough")]
        compute: ComputeKind,
        /// Coherence mode (none | llc | recall | full).
        #[arg(long, default_value = "none")]
        coherence: CoherenceMode,
        /// Poll timeout in milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Poll interval in microseconds (0 spins).
        #[arg(long)]
        interval_us: Option<u64>,
        /// Load-ahead slots in the software pipeline (1-3).
        #[arg(long, default_value_t = 2)]
        slots: usize,
        /// Chunks each batch is split into by the software pipeline.
        #[arg(long, default_value_t = 1)]
        chunks_per_batch: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()))
        .init();

    let platform = cli.platform.descriptor();
    match cli.command {
        Cmd::Plan { kernel } => cmd_plan(platform, &kernel)?,
        Cmd::Probe { sysfs, dev } => cmd_probe(platform, &sysfs, &dev)?,
        Cmd::Run {
            kernel,
            devices,
            uio,
            udmabuf,
            compute,
            coherence,
            timeout_ms,
            interval_us,
            slots,
            chunks_per_batch,
        } => {
            let mut options = InvokeOptions::from_env();
            if let Some(ms) = timeout_ms {
                options = options.with_timeout(Duration::from_millis(ms));
            }
            if let Some(us) = interval_us {
                options = options.with_interval(Duration::from_micros(us));
            }
            let target = if uio {
                let name = udmabuf.context("--udmabuf is required for hardware runs")?;
                Target::Hardware { udmabuf: name }
            } else {
                Target::Software {
                    devices,
                    slots,
                    chunks_per_batch,
                }
            };
            cmd_run(platform, &kernel, &target, compute, coherence, &options)?;
        }
    }

    Ok(())
}

fn cmd_plan(platform: PlatformDescriptor, kernel: &KernelArgs) -> Result<()> {
    let config = KernelConfig::Mac(kernel.config());
    let dims = config.dimensions()?;
    let element_size = config.element_size();
    let granularity = DmaGranularity::from_bus(platform.bus_width_bytes, element_size);
    let layout = BufferLayout::plan(&dims, granularity, element_size);
    let chunk = ChunkSize::from_shift(platform.chunk_shift);

    println!("Platform     : {}", platform.name);
    println!(
        "Kernel       : {} batches x {} vectors x {} elements",
        dims.batches, dims.vectors, dims.elements
    );
    println!("Granularity  : {} word(s) per beat", granularity.words());
    println!(
        "Input        : {} words ({} per batch), {} bytes",
        layout.in_length, layout.in_words_adjusted, layout.in_size_bytes
    );
    println!(
        "Output       : {} words ({} per batch), {} bytes at word {}",
        layout.out_length, layout.out_words_adjusted, layout.out_size_bytes, layout.out_offset_words
    );
    println!("Total        : {} bytes", layout.total_size_bytes);
    println!(
        "Page table   : {} chunk(s) of {} bytes",
        chunk.count_for(layout.total_size_bytes),
        chunk.bytes()
    );
    Ok(())
}

fn cmd_probe(platform: PlatformDescriptor, sysfs: &std::path::Path, dev: &std::path::Path) -> Result<()> {
    let mut mgr = DeviceManager::discover_uio(sysfs, dev, platform)?;

    println!("ESP accelerators: {}", mgr.device_count());
    println!();

    let devices = mgr.devices().to_vec();
    for info in devices {
        match &info.source {
            DeviceSource::Uio {
                node,
                map_addr,
                map_size,
            } => println!(
                "[{}] {} ({}) @ {map_addr:#x} +{map_size:#x}  {}",
                info.index,
                info.name,
                info.kind.compatible(),
                node.display()
            ),
            DeviceSource::Software => println!("[{}] {} (software)", info.index, info.name),
        }

        match mgr.open(&info.name).and_then(|mut acc| acc.probe()) {
            Ok(p) => println!(
                "     DEVID {:#05x}  PT_NCHUNK_MAX {}",
                p.device_id, p.max_chunks
            ),
            Err(e) => println!("     (probe failed: {e})"),
        }
    }

    Ok(())
}

enum Target {
    Software {
        devices: usize,
        slots: usize,
        chunks_per_batch: usize,
    },
    Hardware {
        udmabuf: String,
    },
}

fn cmd_run(
    platform: PlatformDescriptor,
    kernel: &KernelArgs,
    target: &Target,
    compute: ComputeKind,
    coherence: CoherenceMode,
    options: &InvokeOptions,
) -> Result<()> {
    let config = kernel.config();
    let mut stage = DeviceStage::new(compute);
    let (mut accelerators, pool) = match target {
        Target::Software {
            devices,
            slots,
            chunks_per_batch,
        } => {
            stage = stage.with_chunks_per_batch(*chunks_per_batch);
            software_tiles(platform, &config, *devices, compute, *slots, *chunks_per_batch)?
        }
        Target::Hardware { udmabuf } => hardware(platform, udmabuf)?,
    };
    if accelerators.is_empty() {
        bail!("No accelerators to run on");
    }

    let table: Vec<ThreadInfo> = accelerators
        .iter()
        .map(|acc| ThreadInfo::new(acc.name(), config).with_coherence(coherence))
        .collect();

    tracing::info!(
        "Running {} entr(ies) on {}, compute {compute:?}, {} chunk(s) per batch",
        table.len(),
        platform.name,
        stage.chunks_per_batch
    );
    let outcomes = run_table(&mut accelerators, &pool, &table, stage, options)?;

    let mut failed = 0;
    for outcome in &outcomes {
        match &outcome.result {
            Ok(report) if report.validation.passed() => println!(
                "{}: PASS ({} element(s), {} poll(s), {:?})",
                outcome.device,
                report.validation.checked,
                report.invocation.polls,
                report.invocation.elapsed
            ),
            Ok(report) => {
                failed += 1;
                println!(
                    "{}: FAIL ({} of {} element(s) wrong)",
                    outcome.device, report.validation.errors, report.validation.checked
                );
            }
            Err(e) => {
                failed += 1;
                println!("{}", error_line(&outcome.device, e));
            }
        }
    }

    if failed > 0 {
        bail!("{failed} of {} invocation(s) failed", outcomes.len());
    }
    Ok(())
}

/// Report line for an entry that stopped with `e`.
fn error_line(device: &str, e: &AcceleratorError) -> String {
    let hint = if e.is_transient() { "; retry may succeed" } else { "" };
    format!("{device}: ERROR ({e}{hint})")
}

fn software_tiles(
    platform: PlatformDescriptor,
    config: &MacConfig,
    devices: usize,
    compute: ComputeKind,
    slots: usize,
    chunks_per_batch: usize,
) -> Result<(Vec<Accelerator>, Arc<dyn DmaPool>)> {
    let kernel = KernelConfig::Mac(*config);
    let element_size = kernel.element_size();
    let layout = BufferLayout::plan(
        &kernel.dimensions()?,
        DmaGranularity::from_bus(platform.bus_width_bytes, element_size),
        element_size,
    );
    // Each device holds one buffer plus its page table.
    let per_device = layout.total_size_bytes + (1 << 16);
    let capacity = devices
        .checked_mul(per_device)
        .context("problem size overflows the simulated DMA window")?;

    let memory = SimMemory::at_dram(&platform, capacity).shared();
    let pool: Arc<dyn DmaPool> = memory.clone();

    let mut mgr = DeviceManager::software(
        platform,
        (0..devices).map(|i| {
            let tile = SoftwareAccelerator::new(AcceleratorKind::Mac, Arc::clone(&memory), platform)
                .with_compute(compute)
                .with_slots(slots)
                .with_chunks_per_batch(chunks_per_batch);
            (format!("{}.{i}", AcceleratorKind::Mac.name()), tile)
        }),
    );

    let names: Vec<String> = mgr.devices().iter().map(|d| d.name.clone()).collect();
    let accelerators = names
        .iter()
        .map(|name| mgr.open(name).with_context(|| format!("Opening {name}")))
        .collect::<Result<Vec<_>>>()?;
    Ok((accelerators, pool))
}

fn hardware(platform: PlatformDescriptor, udmabuf: &str) -> Result<(Vec<Accelerator>, Arc<dyn DmaPool>)> {
    let region = Arc::new(UdmaBuf::open(udmabuf).with_context(|| format!("Opening {udmabuf}"))?);
    println!(
        "DMA region   : {udmabuf} @ {:#x} ({} bytes)",
        region.phys_addr(),
        region.size()
    );

    let mut mgr = DeviceManager::discover(platform)?.with_flush_target(Arc::clone(&region));
    let names: Vec<String> = mgr
        .select(AcceleratorKind::Mac, "*")
        .into_iter()
        .map(|d| d.name.clone())
        .collect();
    let accelerators = names
        .iter()
        .map(|name| mgr.open(name).with_context(|| format!("Opening {name}")))
        .collect::<Result<Vec<_>>>()?;

    let pool: Arc<dyn DmaPool> = region;
    Ok((accelerators, pool))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_line_marks_transient_failures() {
        let timeout = AcceleratorError::Timeout { duration_ms: 5 };
        assert!(error_line("mac.0", &timeout).ends_with("; retry may succeed)"));
        assert!(error_line("mac.0", &AcceleratorError::Cancelled).contains("retry"));

        let config = AcceleratorError::configuration("bad layout");
        let line = error_line("mac.1", &config);
        assert!(line.starts_with("mac.1: ERROR ("));
        assert!(!line.contains("retry"));
    }
}
