//! Host allocation for DMA-visible buffers
//!
//! The accelerator addresses host memory physically, so every buffer it
//! touches must come from a [`DmaPool`] that can hand out physically
//! contiguous ranges and report their base address. [`DmaBuffer`] is the
//! RAII handle: dropping it releases the range back to its pool.
//!
//! Two pools are provided:
//! - [`SimMemory`]: a simulated DRAM window shared with the software
//!   accelerator (tests, CI, `esp run` without hardware)
//! - [`crate::udmabuf::UdmaBuf`]: a `u-dma-buf` reserved region on real
//!   hardware

use crate::error::{AcceleratorError, Result};
use bytemuck::Pod;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex, MutexGuard};

/// Default alignment for DMA allocations.
pub const DMA_ALIGN: usize = 4096;

/// Source of physically contiguous, DMA-visible memory.
pub trait DmaPool: Debug + Send + Sync {
    /// Reserve `size` bytes aligned to `align`, returning the physical base.
    ///
    /// The range is zero-filled.
    ///
    /// # Errors
    ///
    /// Returns error if no contiguous range is available.
    fn reserve(&self, size: usize, align: usize) -> Result<u64>;

    /// Return a range obtained from [`DmaPool::reserve`].
    fn release(&self, base: u64);

    /// Copy `buf.len()` bytes starting at physical address `addr`.
    ///
    /// # Errors
    ///
    /// Returns error if the range is outside the pool.
    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<()>;

    /// Copy `data` to physical address `addr`.
    ///
    /// # Errors
    ///
    /// Returns error if the range is outside the pool.
    fn write(&self, addr: u64, data: &[u8]) -> Result<()>;
}

/// Physically contiguous buffer owned by one invocation.
#[derive(Debug)]
pub struct DmaBuffer {
    pool: Arc<dyn DmaPool>,
    base: u64,
    size: usize,
}

impl DmaBuffer {
    /// Allocate `size` bytes from `pool`.
    ///
    /// # Errors
    ///
    /// Returns error if the pool cannot satisfy the request.
    pub fn alloc(pool: &Arc<dyn DmaPool>, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(AcceleratorError::configuration("zero-sized DMA buffer"));
        }
        let base = pool.reserve(size, DMA_ALIGN)?;
        tracing::debug!("Allocated DMA buffer: base={base:#x}, size={size:#x}");
        Ok(Self {
            pool: Arc::clone(pool),
            base,
            size,
        })
    }

    /// Physical base address.
    pub const fn base_address(&self) -> u64 {
        self.base
    }

    /// Size in bytes.
    pub const fn len(&self) -> usize {
        self.size
    }

    /// Whether the buffer is empty (never true for an allocated buffer).
    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        if offset.checked_add(len).is_none_or(|end| end > self.size) {
            return Err(AcceleratorError::transfer(format!(
                "access [{offset:#x}, +{len:#x}) outside {:#x}-byte buffer",
                self.size
            )));
        }
        Ok(())
    }

    /// Read bytes at `offset`.
    ///
    /// # Errors
    ///
    /// Returns error if the range exceeds the buffer.
    pub fn read_bytes(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check(offset, buf.len())?;
        self.pool.read(self.base + offset as u64, buf)
    }

    /// Write bytes at `offset`.
    ///
    /// # Errors
    ///
    /// Returns error if the range exceeds the buffer.
    pub fn write_bytes(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        self.check(offset, data.len())?;
        self.pool.write(self.base + offset as u64, data)
    }

    /// Read `count` elements starting at element index `word_offset`.
    ///
    /// # Errors
    ///
    /// Returns error if the range exceeds the buffer.
    pub fn read_tokens<T: Pod>(&self, word_offset: usize, count: usize) -> Result<Vec<T>> {
        let mut out = vec![T::zeroed(); count];
        self.read_bytes(
            word_offset * std::mem::size_of::<T>(),
            bytemuck::cast_slice_mut(&mut out),
        )?;
        Ok(out)
    }

    /// Write elements starting at element index `word_offset`.
    ///
    /// # Errors
    ///
    /// Returns error if the range exceeds the buffer.
    pub fn write_tokens<T: Pod>(&mut self, word_offset: usize, tokens: &[T]) -> Result<()> {
        self.write_bytes(
            word_offset * std::mem::size_of::<T>(),
            bytemuck::cast_slice(tokens),
        )
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        self.pool.release(self.base);
        tracing::debug!("Released DMA buffer at {:#x}", self.base);
    }
}

/// Simulated physical memory window.
///
/// A first-fit allocator over a zero-initialised byte array mapped at
/// `base`. Host code and the software accelerator share one instance
/// through `Arc`, so the accelerator sees exactly what the host wrote.
#[derive(Debug)]
pub struct SimMemory {
    base: u64,
    inner: Mutex<SimInner>,
}

#[derive(Debug)]
struct SimInner {
    bytes: Vec<u8>,
    ranges: RangeAllocator,
}

/// First-fit allocator over a physical address window.
#[derive(Debug)]
pub(crate) struct RangeAllocator {
    base: u64,
    capacity: usize,
    /// Live allocations: base address → size.
    live: BTreeMap<u64, usize>,
}

impl RangeAllocator {
    pub(crate) const fn new(base: u64, capacity: usize) -> Self {
        Self {
            base,
            capacity,
            live: BTreeMap::new(),
        }
    }

    /// Lowest aligned gap that fits `size` bytes.
    pub(crate) fn reserve(&mut self, size: usize, align: usize) -> Result<u64> {
        let align = align.max(1) as u64;
        let size = size as u64;
        let end = self.base + self.capacity as u64;

        let mut cursor = self.base;
        let mut found = None;
        for (&start, &len) in &self.live {
            let candidate = cursor.div_ceil(align) * align;
            if candidate + size <= start {
                found = Some(candidate);
                break;
            }
            cursor = start + len as u64;
        }

        let base = match found {
            Some(base) => base,
            None => {
                let candidate = cursor.div_ceil(align) * align;
                if candidate + size > end {
                    return Err(AcceleratorError::transfer(format!(
                        "DMA window exhausted: need {size:#x} bytes"
                    )));
                }
                candidate
            }
        };
        self.live.insert(base, size as usize);
        Ok(base)
    }

    /// Returns false if `base` was not allocated.
    pub(crate) fn release(&mut self, base: u64) -> bool {
        self.live.remove(&base).is_some()
    }

    pub(crate) fn live(&self) -> usize {
        self.live.len()
    }
}

impl SimMemory {
    /// Create a window of `capacity` bytes at physical address `base`.
    pub fn new(base: u64, capacity: usize) -> Self {
        Self {
            base,
            inner: Mutex::new(SimInner {
                bytes: vec![0u8; capacity],
                ranges: RangeAllocator::new(base, capacity),
            }),
        }
    }

    /// Create a window at the platform's DRAM base.
    pub fn at_dram(platform: &esp_chip::socmap::PlatformDescriptor, capacity: usize) -> Self {
        Self::new(platform.dram_base, capacity)
    }

    /// Shared handle usable as a [`DmaPool`].
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Physical base of the window.
    pub const fn base(&self) -> u64 {
        self.base
    }

    /// Number of allocations not yet released.
    pub fn live_allocations(&self) -> usize {
        self.lock().map_or(0, |inner| inner.ranges.live())
    }

    fn lock(&self) -> Result<MutexGuard<'_, SimInner>> {
        self.inner
            .lock()
            .map_err(|_| AcceleratorError::transfer("simulated memory lock poisoned"))
    }

    fn range(&self, inner: &SimInner, addr: u64, len: usize) -> Result<std::ops::Range<usize>> {
        let start = addr
            .checked_sub(self.base)
            .and_then(|off| usize::try_from(off).ok())
            .ok_or_else(|| {
                AcceleratorError::transfer(format!("address {addr:#x} below memory base"))
            })?;
        let end = start
            .checked_add(len)
            .filter(|&end| end <= inner.bytes.len())
            .ok_or_else(|| {
                AcceleratorError::transfer(format!(
                    "access [{addr:#x}, +{len:#x}) outside simulated memory"
                ))
            })?;
        Ok(start..end)
    }
}

impl DmaPool for SimMemory {
    fn reserve(&self, size: usize, align: usize) -> Result<u64> {
        let mut inner = self.lock()?;
        let base = inner.ranges.reserve(size, align)?;
        let range = self.range(&inner, base, size)?;
        inner.bytes[range].fill(0);
        Ok(base)
    }

    fn release(&self, base: u64) {
        if let Ok(mut inner) = self.lock() {
            if !inner.ranges.release(base) {
                tracing::warn!("Release of unknown allocation {base:#x}");
            }
        }
    }

    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let inner = self.lock()?;
        let range = self.range(&inner, addr, buf.len())?;
        buf.copy_from_slice(&inner.bytes[range]);
        Ok(())
    }

    fn write(&self, addr: u64, data: &[u8]) -> Result<()> {
        let mut inner = self.lock()?;
        let range = self.range(&inner, addr, data.len())?;
        inner.bytes[range].copy_from_slice(data);
        Ok(())
    }
}
