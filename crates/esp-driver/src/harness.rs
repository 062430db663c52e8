//! Validation harness
//!
//! Deterministic input generation and an independently derived expected
//! output for each compute stage, so that results can be checked without
//! trusting the pipeline that produced them.

use crate::error::{AcceleratorError, Result};
use crate::kernel::Token;
use crate::layout::{BufferLayout, KernelDimensions};
use crate::pipeline::{ComputeKind, DeviceStage};

/// Mismatches logged individually before the rest are only counted.
const REPORTED_MISMATCHES: usize = 8;

/// Host-side input and expected output for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestBuffers {
    /// Input region, `layout.in_length` words
    pub input: Vec<Token>,
    /// Expected output region, `layout.out_length` words
    pub gold: Vec<Token>,
}

/// Generate `in[b*in_adj + j] = j` and the matching gold output.
///
/// Gold values are computed in closed form, not by running a compute stage.
/// Passthrough gold follows the unit split: output unit `c` of a batch
/// carries the leading words of input unit `c`.
pub fn init_buffers(
    dims: &KernelDimensions,
    layout: &BufferLayout,
    stage: impl Into<DeviceStage>,
) -> TestBuffers {
    let stage = stage.into();
    let mut input = vec![0; layout.in_length];
    for b in 0..dims.batches {
        let row = &mut input[b * layout.in_words_adjusted..][..dims.raw_in_words()];
        for (j, word) in row.iter_mut().enumerate() {
            *word = j as Token;
        }
    }

    let mut gold = vec![0; layout.out_length];
    for b in 0..dims.batches {
        for v in 0..dims.vectors {
            gold[b * layout.out_words_adjusted + v] = expected(&stage, dims, layout, v);
        }
    }

    TestBuffers { input, gold }
}

/// Expected output word `v` of a batch.
fn expected(stage: &DeviceStage, dims: &KernelDimensions, layout: &BufferLayout, v: usize) -> Token {
    match stage.compute {
        ComputeKind::Passthrough => {
            let chunks = stage.chunks_per_batch.max(1);
            let in_unit = layout.in_words_adjusted / chunks;
            let out_unit = (layout.out_words_adjusted / chunks).max(1);
            let (chunk, k) = (v / out_unit, v % out_unit);
            let j = chunk * in_unit + k;
            if k < in_unit && j < dims.raw_in_words() {
                j as Token
            } else {
                0
            }
        }
        ComputeKind::MultiplyAccumulate => {
            // Vector v holds the ramp [v*e, (v+1)*e); sum_{i<n} i^2 = n(n-1)(2n-1)/6.
            let squares_below = |n: i128| n * (n - 1) * (2 * n - 1) / 6;
            let lo = (v * dims.elements) as i128;
            let hi = lo + dims.elements as i128;
            (squares_below(hi) - squares_below(lo)) as Token
        }
    }
}

/// Result of comparing device output against gold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationReport {
    /// Mismatching elements
    pub errors: usize,
    /// Elements compared
    pub checked: usize,
}

impl ValidationReport {
    /// Whether every element matched.
    pub const fn passed(&self) -> bool {
        self.errors == 0
    }

    /// Turn mismatches into an error.
    ///
    /// # Errors
    ///
    /// Returns `ValidationMismatch` if any element differed.
    pub fn into_result(self) -> Result<Self> {
        if self.errors == 0 {
            Ok(self)
        } else {
            Err(AcceleratorError::ValidationMismatch { errors: self.errors })
        }
    }
}

/// Count mismatches between `output` and `gold` over the meaningful words.
///
/// Padding words past `vectors` in each batch are not compared.
pub fn validate(
    output: &[Token],
    gold: &[Token],
    dims: &KernelDimensions,
    layout: &BufferLayout,
) -> ValidationReport {
    let mut errors = 0;
    let mut checked = 0;
    for b in 0..dims.batches {
        for v in 0..dims.vectors {
            let index = b * layout.out_words_adjusted + v;
            checked += 1;
            let (got, want) = (output.get(index), gold.get(index));
            if got != want {
                if errors < REPORTED_MISMATCHES {
                    tracing::debug!("[{b}, {v}]: {got:?} != {want:?}");
                }
                errors += 1;
            }
        }
    }
    if errors > 0 {
        tracing::warn!("Validation: {errors} of {checked} element(s) mismatched");
    }
    ValidationReport { errors, checked }
}
