//! Buffer layout planning
//!
//! Computes DMA-beat-aligned sizes and offsets for one invocation. Input and
//! output share a single allocation: the input region comes first and the
//! output region starts at `out_offset_words`.
//!
//! ```text
//! ┌──────────────────────────────┬──────────────────┐
//! │ input: batches × in_adjusted │ output           │
//! └──────────────────────────────┴──────────────────┘
//! 0                         out_offset_words   total_size_bytes
//! ```

use crate::error::{AcceleratorError, Result};

/// Problem shape of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelDimensions {
    /// Number of batches
    pub batches: usize,
    /// Vectors per batch
    pub vectors: usize,
    /// Elements per vector
    pub elements: usize,
}

impl KernelDimensions {
    /// Create dimensions, rejecting zero extents.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if any extent is zero.
    pub fn new(batches: usize, vectors: usize, elements: usize) -> Result<Self> {
        if batches == 0 || vectors == 0 || elements == 0 {
            return Err(AcceleratorError::configuration(format!(
                "kernel dimensions must be positive (batches={batches}, vectors={vectors}, elements={elements})"
            )));
        }
        Ok(Self {
            batches,
            vectors,
            elements,
        })
    }

    /// Unrounded input words per batch.
    pub const fn raw_in_words(&self) -> usize {
        self.vectors * self.elements
    }

    /// Unrounded output words per batch.
    pub const fn raw_out_words(&self) -> usize {
        self.vectors
    }
}

/// Kernel elements per DMA beat.
///
/// Zero means no rounding applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DmaGranularity(usize);

impl DmaGranularity {
    /// No rounding.
    pub const NONE: Self = Self(0);

    /// Granularity of `words` elements per beat.
    pub const fn new(words: usize) -> Self {
        Self(words)
    }

    /// Derive from the bus width and element size, both in bytes.
    pub const fn from_bus(bus_width_bytes: usize, element_size: usize) -> Self {
        if element_size == 0 {
            return Self::NONE;
        }
        Self(bus_width_bytes / element_size)
    }

    /// Elements per beat (0 = no rounding).
    pub const fn words(self) -> usize {
        self.0
    }

    /// Round `raw` up to a multiple of the granularity.
    pub const fn round_up(self, raw: usize) -> usize {
        if self.0 == 0 {
            raw
        } else {
            raw.div_ceil(self.0) * self.0
        }
    }
}

/// Word-aligned layout of the shared input/output allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLayout {
    /// Input words per batch, rounded to the granularity
    pub in_words_adjusted: usize,
    /// Output words per batch, rounded to the granularity
    pub out_words_adjusted: usize,
    /// Total input words
    pub in_length: usize,
    /// Total output words
    pub out_length: usize,
    /// Input region size in bytes
    pub in_size_bytes: usize,
    /// Output region size in bytes
    pub out_size_bytes: usize,
    /// Offset of the output region in words
    pub out_offset_words: usize,
    /// Size of the whole allocation in bytes
    pub total_size_bytes: usize,
    /// Element size in bytes
    pub element_size: usize,
    /// Granularity the layout was planned with
    pub granularity: DmaGranularity,
    /// Batch count the layout was planned for
    pub batches: usize,
}

impl BufferLayout {
    /// Plan the layout for `dims` with elements of `element_size` bytes.
    pub fn plan(dims: &KernelDimensions, granularity: DmaGranularity, element_size: usize) -> Self {
        let in_words_adjusted = granularity.round_up(dims.raw_in_words());
        let out_words_adjusted = granularity.round_up(dims.raw_out_words());

        let in_length = in_words_adjusted * dims.batches;
        let out_length = out_words_adjusted * dims.batches;
        let in_size_bytes = in_length * element_size;
        let out_size_bytes = out_length * element_size;
        let out_offset_words = in_length;
        let total_size_bytes = out_offset_words * element_size + out_size_bytes;

        tracing::debug!(
            "Layout: in_adj={in_words_adjusted} out_adj={out_words_adjusted} in_len={in_length} \
             out_len={out_length} total={total_size_bytes}B (granularity {})",
            granularity.words()
        );

        Self {
            in_words_adjusted,
            out_words_adjusted,
            in_length,
            out_length,
            in_size_bytes,
            out_size_bytes,
            out_offset_words,
            total_size_bytes,
            element_size,
            granularity,
            batches: dims.batches,
        }
    }

    /// Byte offset of the output region.
    pub const fn out_offset_bytes(&self) -> usize {
        self.out_offset_words * self.element_size
    }

    /// Total words in the allocation.
    pub const fn total_words(&self) -> usize {
        self.in_length + self.out_length
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_scenario() {
        let dims = KernelDimensions::new(16, 100, 64).unwrap();
        let layout = BufferLayout::plan(&dims, DmaGranularity::new(2), 4);

        assert_eq!(layout.in_words_adjusted, 6400);
        assert_eq!(layout.out_words_adjusted, 100);
        assert_eq!(layout.in_length, 102_400);
        assert_eq!(layout.out_length, 1600);
        assert_eq!(layout.out_offset_words, 102_400);
        assert_eq!(layout.total_size_bytes, 416_000);
    }

    #[test]
    fn adjusted_sizes_are_multiples() {
        for g in 1..=8 {
            for vectors in 1..=9 {
                for elements in 1..=7 {
                    let dims = KernelDimensions::new(3, vectors, elements).unwrap();
                    let l = BufferLayout::plan(&dims, DmaGranularity::new(g), 4);
                    assert_eq!(l.in_words_adjusted % g, 0);
                    assert_eq!(l.out_words_adjusted % g, 0);
                    assert!(l.in_words_adjusted >= dims.raw_in_words());
                    assert!(l.out_words_adjusted >= dims.raw_out_words());
                    assert!(l.in_words_adjusted < dims.raw_in_words() + g);
                    assert_eq!(l.out_offset_words, l.in_length);
                    assert_eq!(
                        l.total_size_bytes,
                        l.out_offset_words * l.element_size + l.out_size_bytes
                    );
                }
            }
        }
    }

    #[test]
    fn zero_granularity_keeps_raw_sizes() {
        let dims = KernelDimensions::new(5, 7, 3).unwrap();
        let l = BufferLayout::plan(&dims, DmaGranularity::NONE, 4);
        assert_eq!(l.in_words_adjusted, 21);
        assert_eq!(l.out_words_adjusted, 7);
        assert_eq!(DmaGranularity::from_bus(4, 8), DmaGranularity::NONE);
    }

    #[test]
    fn zero_dimension_rejected() {
        assert!(KernelDimensions::new(0, 1, 1).is_err());
        assert!(KernelDimensions::new(1, 0, 1).is_err());
        assert!(KernelDimensions::new(1, 1, 0).is_err());
    }
}
