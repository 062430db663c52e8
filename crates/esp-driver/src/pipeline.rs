//! Device-side streaming pipeline
//!
//! The accelerator never holds the whole dataset on chip. It walks the
//! problem as an outer loop over batches and an inner loop over chunks, and
//! for every `(batch, chunk)` unit runs three stages:
//!
//! ```text
//!   load     DMA stream ──▶ on-chip input buffer
//!   compute  on-chip input ──▶ on-chip output      (kernel-specific)
//!   store    on-chip output ──▶ DMA stream (past the input region)
//! ```
//!
//! Load and store are the same for every kernel; only [`ComputeStage`]
//! changes. Within one unit the three stages are strictly ordered. Units with
//! their own on-chip slots may overlap, which [`StreamingPipeline::run_buffered`]
//! uses to load ahead while earlier units compute and store.

use crate::error::{AcceleratorError, Result};
use crate::kernel::{Token, TOKEN_BYTES};
use crate::layout::{DmaGranularity, KernelDimensions};
use std::collections::VecDeque;
use std::fmt::Debug;
use std::str::FromStr;

/// Maximum on-chip buffer slots for load-ahead.
pub const MAX_SLOTS: usize = 3;

/// Which words of the DMA stream a load or store transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaDescriptor {
    /// First beat
    pub index: usize,
    /// Number of beats
    pub length: usize,
    /// Element size in bytes
    pub element_size: usize,
}

/// Beat-addressed view of the DMA-visible memory.
pub trait DmaStream {
    /// Read beat `beat` into `word` (one beat worth of elements).
    ///
    /// # Errors
    ///
    /// Returns error if the beat cannot be fetched.
    fn read_beat(&mut self, beat: usize, word: &mut [Token]) -> Result<()>;

    /// Write `word` to beat `beat`.
    ///
    /// # Errors
    ///
    /// Returns error if the beat cannot be written.
    fn write_beat(&mut self, beat: usize, word: &[Token]) -> Result<()>;
}

/// Contiguous stream over a token slice.
#[derive(Debug)]
pub struct SliceStream<'a> {
    words: &'a mut [Token],
    words_per_beat: usize,
}

impl<'a> SliceStream<'a> {
    /// Wrap `words`, transferring `words_per_beat` elements per beat.
    pub fn new(words: &'a mut [Token], words_per_beat: usize) -> Self {
        Self {
            words,
            words_per_beat: words_per_beat.max(1),
        }
    }

    fn span(&self, beat: usize) -> Result<std::ops::Range<usize>> {
        let start = beat * self.words_per_beat;
        let end = start + self.words_per_beat;
        if end > self.words.len() {
            return Err(AcceleratorError::transfer(format!(
                "beat {beat} outside {}-word stream",
                self.words.len()
            )));
        }
        Ok(start..end)
    }
}

impl DmaStream for SliceStream<'_> {
    fn read_beat(&mut self, beat: usize, word: &mut [Token]) -> Result<()> {
        let span = self.span(beat)?;
        word.copy_from_slice(&self.words[span]);
        Ok(())
    }

    fn write_beat(&mut self, beat: usize, word: &[Token]) -> Result<()> {
        let span = self.span(beat)?;
        self.words[span].copy_from_slice(word);
        Ok(())
    }
}

/// Shape of the data one unit operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitShape {
    /// Vectors in the unit
    pub vectors: usize,
    /// Elements per vector
    pub elements: usize,
}

/// Kernel-specific transformation of one unit.
pub trait ComputeStage: Debug + Send + Sync {
    /// Transform `input` into `output`. `output` arrives zeroed.
    fn compute(&self, shape: &UnitShape, input: &[Token], output: &mut [Token]);
}

/// Reference kernel: copies the leading input words to the output.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl ComputeStage for Passthrough {
    fn compute(&self, _shape: &UnitShape, input: &[Token], output: &mut [Token]) {
        let n = input.len().min(output.len());
        output[..n].copy_from_slice(&input[..n]);
    }
}

/// Sum of squares per vector, wrapping on overflow.
#[derive(Debug, Clone, Copy, Default)]
pub struct MultiplyAccumulate;

impl ComputeStage for MultiplyAccumulate {
    fn compute(&self, shape: &UnitShape, input: &[Token], output: &mut [Token]) {
        for (v, out) in output.iter_mut().take(shape.vectors).enumerate() {
            let row = &input[v * shape.elements..(v + 1) * shape.elements];
            *out = row
                .iter()
                .fold(0, |acc: Token, &x| acc.wrapping_add(x.wrapping_mul(x)));
        }
    }
}

/// Compute stage selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ComputeKind {
    /// [`Passthrough`]
    #[default]
    Passthrough,
    /// [`MultiplyAccumulate`]
    MultiplyAccumulate,
}

impl ComputeStage for ComputeKind {
    fn compute(&self, shape: &UnitShape, input: &[Token], output: &mut [Token]) {
        match self {
            Self::Passthrough => Passthrough.compute(shape, input, output),
            Self::MultiplyAccumulate => MultiplyAccumulate.compute(shape, input, output),
        }
    }
}

impl FromStr for ComputeKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "passthrough" | "identity" => Ok(Self::Passthrough),
            "mac" | "multiply-accumulate" => Ok(Self::MultiplyAccumulate),
            other => Err(format!("unknown compute stage '{other}' (passthrough|mac)")),
        }
    }
}

/// What the device pipeline runs: the compute stage and how each batch is
/// split into units. Host-side gold output depends on both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceStage {
    /// Compute stage
    pub compute: ComputeKind,
    /// Units per batch
    pub chunks_per_batch: usize,
}

impl DeviceStage {
    /// `compute` over one unit per batch.
    pub const fn new(compute: ComputeKind) -> Self {
        Self {
            compute,
            chunks_per_batch: 1,
        }
    }

    /// Split each batch into `chunks` units.
    #[must_use]
    pub fn with_chunks_per_batch(mut self, chunks: usize) -> Self {
        self.chunks_per_batch = chunks;
        self
    }
}

impl Default for DeviceStage {
    fn default() -> Self {
        Self::new(ComputeKind::default())
    }
}

impl From<ComputeKind> for DeviceStage {
    fn from(compute: ComputeKind) -> Self {
        Self::new(compute)
    }
}

/// Counters for one pipeline pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// `(batch, chunk)` units processed
    pub units: usize,
    /// Beats read from the stream
    pub beats_loaded: usize,
    /// Beats written to the stream
    pub beats_stored: usize,
}

/// Descriptor arithmetic for one kernel shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelinePlan {
    dims: KernelDimensions,
    words_per_beat: usize,
    chunks_per_batch: usize,
    in_unit_words: usize,
    out_unit_words: usize,
    store_offset: usize,
}

impl PipelinePlan {
    /// Plan the pass for `dims`, split into `chunks_per_batch` units per batch.
    ///
    /// A zero granularity transfers one element per beat.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the chunk count does not split the batch
    /// into beat-aligned units.
    pub fn new(
        dims: KernelDimensions,
        granularity: DmaGranularity,
        chunks_per_batch: usize,
    ) -> Result<Self> {
        let words = granularity.words().max(1);
        let wpb = DmaGranularity::new(words);
        if chunks_per_batch == 0 {
            return Err(AcceleratorError::configuration("chunks per batch must be positive"));
        }

        let in_adjusted = wpb.round_up(dims.raw_in_words());
        let out_adjusted = wpb.round_up(dims.raw_out_words());

        if chunks_per_batch > 1 {
            let step = chunks_per_batch * words;
            if dims.vectors % chunks_per_batch != 0
                || dims.raw_in_words() % step != 0
                || dims.raw_out_words() % step != 0
            {
                return Err(AcceleratorError::configuration(format!(
                    "{chunks_per_batch} chunks do not split {} vectors into {words}-word beats",
                    dims.vectors
                )));
            }
        }

        Ok(Self {
            dims,
            words_per_beat: words,
            chunks_per_batch,
            in_unit_words: in_adjusted / chunks_per_batch,
            out_unit_words: out_adjusted / chunks_per_batch,
            store_offset: in_adjusted * dims.batches,
        })
    }

    /// Elements per beat.
    pub const fn words_per_beat(&self) -> usize {
        self.words_per_beat
    }

    /// Units per batch.
    pub const fn chunks_per_batch(&self) -> usize {
        self.chunks_per_batch
    }

    /// Input words of one unit.
    pub const fn in_unit_words(&self) -> usize {
        self.in_unit_words
    }

    /// Output words of one unit.
    pub const fn out_unit_words(&self) -> usize {
        self.out_unit_words
    }

    /// Word offset of the output region.
    pub const fn store_offset(&self) -> usize {
        self.store_offset
    }

    /// Total units in the pass.
    pub const fn units(&self) -> usize {
        self.dims.batches * self.chunks_per_batch
    }

    /// Data shape of one unit.
    pub const fn unit_shape(&self) -> UnitShape {
        UnitShape {
            vectors: self.dims.vectors / self.chunks_per_batch,
            elements: self.dims.elements,
        }
    }

    /// Descriptor for the load stage of `(batch, chunk)`.
    pub const fn load_descriptor(&self, batch: usize, chunk: usize) -> DmaDescriptor {
        let length = self.in_unit_words;
        let index = length * (batch * self.chunks_per_batch + chunk);
        DmaDescriptor {
            index: index / self.words_per_beat,
            length: length / self.words_per_beat,
            element_size: TOKEN_BYTES,
        }
    }

    /// Descriptor for the store stage of `(batch, chunk)`.
    pub const fn store_descriptor(&self, batch: usize, chunk: usize) -> DmaDescriptor {
        let length = self.out_unit_words;
        let index = self.store_offset + length * (batch * self.chunks_per_batch + chunk);
        DmaDescriptor {
            index: index / self.words_per_beat,
            length: length / self.words_per_beat,
            element_size: TOKEN_BYTES,
        }
    }
}

/// One logical compute pass.
#[derive(Debug)]
pub struct StreamingPipeline<C: ComputeStage> {
    plan: PipelinePlan,
    compute: C,
}

/// On-chip buffer pair for one in-flight unit.
struct Slot {
    batch: usize,
    chunk: usize,
    input: Vec<Token>,
    output: Vec<Token>,
}

impl<C: ComputeStage> StreamingPipeline<C> {
    /// Create a pipeline running `compute` over `plan`.
    pub const fn new(plan: PipelinePlan, compute: C) -> Self {
        Self { plan, compute }
    }

    /// Descriptor arithmetic in use.
    pub const fn plan(&self) -> &PipelinePlan {
        &self.plan
    }

    /// Load stage: stream → `inbuf`.
    ///
    /// # Errors
    ///
    /// Returns error if the stream rejects a beat.
    pub fn load(
        &self,
        stream: &mut impl DmaStream,
        batch: usize,
        chunk: usize,
        inbuf: &mut [Token],
    ) -> Result<DmaDescriptor> {
        let desc = self.plan.load_descriptor(batch, chunk);
        let wpb = self.plan.words_per_beat;
        for (i, word) in inbuf.chunks_exact_mut(wpb).take(desc.length).enumerate() {
            stream.read_beat(desc.index + i, word)?;
        }
        Ok(desc)
    }

    /// Compute stage: `inbuf` → `outbuf`.
    pub fn compute(&self, inbuf: &[Token], outbuf: &mut [Token]) {
        outbuf.fill(0);
        self.compute.compute(&self.plan.unit_shape(), inbuf, outbuf);
    }

    /// Store stage: `outbuf` → stream.
    ///
    /// # Errors
    ///
    /// Returns error if the stream rejects a beat.
    pub fn store(
        &self,
        stream: &mut impl DmaStream,
        batch: usize,
        chunk: usize,
        outbuf: &[Token],
    ) -> Result<DmaDescriptor> {
        let desc = self.plan.store_descriptor(batch, chunk);
        let wpb = self.plan.words_per_beat;
        for (i, word) in outbuf.chunks_exact(wpb).take(desc.length).enumerate() {
            stream.write_beat(desc.index + i, word)?;
        }
        Ok(desc)
    }

    /// Run every unit strictly in sequence.
    ///
    /// # Errors
    ///
    /// Returns the first stream error.
    pub fn run(&self, stream: &mut impl DmaStream) -> Result<PipelineStats> {
        self.run_buffered(stream, 1)
    }

    /// Run with up to `slots` units in flight.
    ///
    /// The next units are loaded before the oldest one computes and stores.
    /// Output is identical to [`StreamingPipeline::run`] because the store
    /// region never overlaps the input region.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` for a slot count outside `1..=MAX_SLOTS`,
    /// otherwise the first stream error.
    pub fn run_buffered(&self, stream: &mut impl DmaStream, slots: usize) -> Result<PipelineStats> {
        if !(1..=MAX_SLOTS).contains(&slots) {
            return Err(AcceleratorError::configuration(format!(
                "{slots} on-chip slots requested, 1..={MAX_SLOTS} available"
            )));
        }

        let chunks = self.plan.chunks_per_batch;
        let mut pending = (0..self.plan.dims.batches)
            .flat_map(|b| (0..chunks).map(move |c| (b, c)));
        let mut free: Vec<Slot> = (0..slots)
            .map(|_| Slot {
                batch: 0,
                chunk: 0,
                input: vec![0; self.plan.in_unit_words],
                output: vec![0; self.plan.out_unit_words],
            })
            .collect();
        let mut in_flight: VecDeque<Slot> = VecDeque::with_capacity(slots);
        let mut stats = PipelineStats::default();

        loop {
            while let Some(mut slot) = free.pop() {
                let Some((batch, chunk)) = pending.next() else {
                    free.push(slot);
                    break;
                };
                let desc = self.load(stream, batch, chunk, &mut slot.input)?;
                tracing::trace!("load  b={batch} c={chunk} idx={} len={}", desc.index, desc.length);
                stats.beats_loaded += desc.length;
                slot.batch = batch;
                slot.chunk = chunk;
                in_flight.push_back(slot);
            }

            let Some(mut slot) = in_flight.pop_front() else {
                break;
            };
            self.compute(&slot.input, &mut slot.output);
            let desc = self.store(stream, slot.batch, slot.chunk, &slot.output)?;
            tracing::trace!(
                "store b={} c={} idx={} len={}",
                slot.batch,
                slot.chunk,
                desc.index,
                desc.length
            );
            stats.beats_stored += desc.length;
            stats.units += 1;
            free.push(slot);
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::BufferLayout;

    fn reference_dims() -> KernelDimensions {
        KernelDimensions::new(16, 100, 64).unwrap()
    }

    /// Testbench-style memory: input ramp per batch, zeroed output.
    fn ramp_memory(dims: &KernelDimensions, g: DmaGranularity) -> (BufferLayout, Vec<Token>) {
        let layout = BufferLayout::plan(dims, g, TOKEN_BYTES);
        let mut mem = vec![0; layout.total_words()];
        for b in 0..dims.batches {
            for j in 0..dims.raw_in_words() {
                mem[b * layout.in_words_adjusted + j] = j as Token;
            }
        }
        (layout, mem)
    }

    #[test]
    fn descriptors_match_layout() {
        let plan = PipelinePlan::new(reference_dims(), DmaGranularity::new(2), 1).unwrap();
        let load = plan.load_descriptor(3, 0);
        assert_eq!(load.length, 3200);
        assert_eq!(load.index, 3 * 3200);

        let store = plan.store_descriptor(3, 0);
        assert_eq!(plan.store_offset(), 102_400);
        assert_eq!(store.length, 50);
        assert_eq!(store.index, (102_400 + 3 * 100) / 2);
    }

    #[test]
    fn passthrough_reproduces_reference_output() {
        let dims = reference_dims();
        let g = DmaGranularity::new(2);
        let (layout, mut mem) = ramp_memory(&dims, g);

        let pipe = StreamingPipeline::new(PipelinePlan::new(dims, g, 1).unwrap(), Passthrough);
        let stats = pipe.run(&mut SliceStream::new(&mut mem, 2)).unwrap();
        assert_eq!(stats.units, 16);

        let out = &mem[layout.out_offset_words..];
        for b in 0..dims.batches {
            for v in 0..dims.vectors {
                assert_eq!(out[b * layout.out_words_adjusted + v], v as Token);
            }
        }
        // Input untouched.
        assert_eq!(mem[6399], 6399);
    }

    #[test]
    fn buffered_matches_sequential() {
        let dims = KernelDimensions::new(5, 6, 3).unwrap();
        let g = DmaGranularity::new(2);
        let plan = PipelinePlan::new(dims, g, 1).unwrap();
        let pipe = StreamingPipeline::new(plan, MultiplyAccumulate);

        let (_, mut sequential) = ramp_memory(&dims, g);
        pipe.run(&mut SliceStream::new(&mut sequential, 2)).unwrap();

        for slots in 2..=MAX_SLOTS {
            let (_, mut buffered) = ramp_memory(&dims, g);
            let stats = pipe
                .run_buffered(&mut SliceStream::new(&mut buffered, 2), slots)
                .unwrap();
            assert_eq!(stats.units, 5);
            assert_eq!(buffered, sequential);
        }
        assert!(pipe.run_buffered(&mut SliceStream::new(&mut sequential, 2), 0).is_err());
        assert!(pipe.run_buffered(&mut SliceStream::new(&mut sequential, 2), 4).is_err());
    }

    #[test]
    fn multiply_accumulate_sums_squares() {
        let shape = UnitShape { vectors: 2, elements: 3 };
        let input = [1, 2, 3, 4, 5, 6];
        let mut output = [0; 4];
        MultiplyAccumulate.compute(&shape, &input, &mut output);
        assert_eq!(output, [14, 77, 0, 0]);
    }

    #[test]
    fn chunked_batches_split_evenly() {
        let dims = KernelDimensions::new(3, 8, 4).unwrap();
        let g = DmaGranularity::new(2);
        let single = StreamingPipeline::new(PipelinePlan::new(dims, g, 1).unwrap(), MultiplyAccumulate);
        let quad = StreamingPipeline::new(PipelinePlan::new(dims, g, 4).unwrap(), MultiplyAccumulate);
        assert_eq!(quad.plan().units(), 12);
        assert_eq!(quad.plan().unit_shape().vectors, 2);

        let (_, mut a) = ramp_memory(&dims, g);
        let (_, mut b) = ramp_memory(&dims, g);
        single.run(&mut SliceStream::new(&mut a, 2)).unwrap();
        quad.run(&mut SliceStream::new(&mut b, 2)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn uneven_chunking_rejected() {
        let dims = KernelDimensions::new(1, 6, 3).unwrap();
        assert!(PipelinePlan::new(dims, DmaGranularity::new(2), 4).is_err());
        assert!(PipelinePlan::new(dims, DmaGranularity::new(2), 0).is_err());
    }

    #[test]
    fn zero_granularity_moves_single_words() {
        let dims = KernelDimensions::new(2, 3, 3).unwrap();
        let plan = PipelinePlan::new(dims, DmaGranularity::NONE, 1).unwrap();
        assert_eq!(plan.words_per_beat(), 1);
        assert_eq!(plan.load_descriptor(1, 0).index, 9);
    }

    #[test]
    fn short_stream_reports_transfer_error() {
        let dims = KernelDimensions::new(2, 2, 2).unwrap();
        let pipe = StreamingPipeline::new(
            PipelinePlan::new(dims, DmaGranularity::new(2), 1).unwrap(),
            Passthrough,
        );
        let mut mem = vec![0; 4];
        let err = pipe.run(&mut SliceStream::new(&mut mem, 2)).unwrap_err();
        assert!(matches!(err, AcceleratorError::Transfer { .. }));
    }
}
