//! Scatter-gather page table
//!
//! The accelerator translates a DMA byte offset into a physical address by
//! splitting it into a chunk index (`offset >> shift`) and an in-chunk
//! offset. The page table is the ordered array of chunk base addresses for
//! one logically contiguous buffer.
//!
//! ```text
//! logical buffer   [ chunk 0 | chunk 1 | chunk 2 ... ]
//! page table       [ base+0  | base+C  | base+2C ... ]   C = 1 << shift
//! ```

use crate::error::{AcceleratorError, Result};
use crate::memory::{DmaBuffer, DmaPool};
use esp_chip::socmap::{ByteOrder, PlatformDescriptor};
use std::sync::Arc;

/// Power-of-two scatter-gather chunk size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkSize {
    shift: u32,
}

impl ChunkSize {
    /// Chunk size of `bytes`.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if `bytes` is not a power of two.
    pub fn new(bytes: usize) -> Result<Self> {
        if !bytes.is_power_of_two() {
            return Err(AcceleratorError::configuration(format!(
                "chunk size {bytes} is not a power of two"
            )));
        }
        Ok(Self {
            shift: bytes.trailing_zeros(),
        })
    }

    /// Chunk size of `1 << shift` bytes.
    pub const fn from_shift(shift: u32) -> Self {
        Self { shift }
    }

    /// Size in bytes.
    pub const fn bytes(self) -> usize {
        1 << self.shift
    }

    /// Shift value programmed into PT_SHIFT.
    pub const fn shift(self) -> u32 {
        self.shift
    }

    /// Number of chunks needed to cover `total_bytes`.
    pub const fn count_for(self, total_bytes: usize) -> usize {
        total_bytes.div_ceil(self.bytes())
    }
}

/// Ordered chunk base addresses of one buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageTable {
    chunk: ChunkSize,
    total_bytes: usize,
    entries: Vec<u64>,
}

impl PageTable {
    /// Slice the contiguous region at `base_address` into chunks.
    pub fn build(base_address: u64, total_size_bytes: usize, chunk: ChunkSize) -> Self {
        let nchunk = chunk.count_for(total_size_bytes);
        let entries = (0..nchunk as u64)
            .map(|i| base_address + i * chunk.bytes() as u64)
            .collect();

        tracing::debug!(
            "Page table: base={base_address:#x}, {total_size_bytes} bytes, {nchunk} chunk(s) of {} bytes",
            chunk.bytes()
        );

        Self {
            chunk,
            total_bytes: total_size_bytes,
            entries,
        }
    }

    /// Chunk base addresses.
    pub fn entries(&self) -> &[u64] {
        &self.entries
    }

    /// Number of chunks.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table has no chunks.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Chunk size.
    pub const fn chunk_size(&self) -> ChunkSize {
        self.chunk
    }

    /// Bytes the table was built for.
    pub const fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Bytes addressable through the table.
    pub fn covered_bytes(&self) -> usize {
        self.entries.len() * self.chunk.bytes()
    }

    /// Physical address of logical byte `offset`.
    pub fn translate(&self, offset: usize) -> Option<u64> {
        let index = offset >> self.chunk.shift();
        let within = offset & (self.chunk.bytes() - 1);
        self.entries.get(index).map(|base| base + within as u64)
    }

    /// Serialize entries with the platform's pointer width and byte order.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if an entry does not fit the pointer width.
    pub fn encode(&self, platform: &PlatformDescriptor) -> Result<Vec<u8>> {
        let width = platform.bus_width_bytes;
        if !matches!(width, 4 | 8) {
            return Err(AcceleratorError::configuration(format!(
                "unsupported page-table entry width {width}"
            )));
        }

        let mut out = Vec::with_capacity(self.entries.len() * width);
        for &entry in &self.entries {
            match width {
                4 => {
                    let v = u32::try_from(entry).map_err(|_| {
                        AcceleratorError::configuration(format!(
                            "chunk address {entry:#x} exceeds 32-bit entries"
                        ))
                    })?;
                    match platform.byte_order {
                        ByteOrder::Little => out.extend_from_slice(&v.to_le_bytes()),
                        ByteOrder::Big => out.extend_from_slice(&v.to_be_bytes()),
                    }
                }
                _ => match platform.byte_order {
                    ByteOrder::Little => out.extend_from_slice(&entry.to_le_bytes()),
                    ByteOrder::Big => out.extend_from_slice(&entry.to_be_bytes()),
                },
            }
        }
        Ok(out)
    }

    /// Write the table into DMA memory so the device can dereference it.
    ///
    /// # Errors
    ///
    /// Returns error if allocation fails or an entry cannot be encoded.
    pub fn install(
        self,
        pool: &Arc<dyn DmaPool>,
        platform: &PlatformDescriptor,
    ) -> Result<ResidentPageTable> {
        let encoded = self.encode(platform)?;
        let mut buffer = DmaBuffer::alloc(pool, encoded.len().max(platform.bus_width_bytes))?;
        buffer.write_bytes(0, &encoded)?;

        tracing::debug!(
            "Installed page table at {:#x} ({} entries)",
            buffer.base_address(),
            self.len()
        );

        Ok(ResidentPageTable {
            table: self,
            buffer,
        })
    }
}

/// Decode one page-table entry as the device reads it.
pub fn decode_entry(bytes: &[u8], byte_order: ByteOrder) -> Option<u64> {
    match (bytes.len(), byte_order) {
        (4, ByteOrder::Little) => bytes.try_into().ok().map(|b| u64::from(u32::from_le_bytes(b))),
        (4, ByteOrder::Big) => bytes.try_into().ok().map(|b| u64::from(u32::from_be_bytes(b))),
        (8, ByteOrder::Little) => bytes.try_into().ok().map(u64::from_le_bytes),
        (8, ByteOrder::Big) => bytes.try_into().ok().map(u64::from_be_bytes),
        _ => None,
    }
}

/// Page table resident in DMA memory.
///
/// Owns both the table description and the buffer holding its entries; the
/// buffer is released when this value is dropped.
#[derive(Debug)]
pub struct ResidentPageTable {
    table: PageTable,
    buffer: DmaBuffer,
}

impl ResidentPageTable {
    /// Physical address of the first entry.
    pub const fn address(&self) -> u64 {
        self.buffer.base_address()
    }

    /// Table description.
    pub const fn table(&self) -> &PageTable {
        &self.table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::SimMemory;

    #[test]
    fn chunk_count_and_stride() {
        for shift in [4u32, 8, 12, 20] {
            let chunk = ChunkSize::from_shift(shift);
            for total in [0usize, 1, 15, 16, 17, 4095, 4096, 4097, 416_000] {
                let pt = PageTable::build(0x4000_0000, total, chunk);
                assert_eq!(pt.len(), total.div_ceil(chunk.bytes()));
                for pair in pt.entries().windows(2) {
                    assert_eq!(pair[1] - pair[0], chunk.bytes() as u64);
                }
                if let Some(first) = pt.entries().first() {
                    assert_eq!(*first, 0x4000_0000);
                }
                assert!(pt.covered_bytes() >= total);
            }
        }
    }

    #[test]
    fn reference_scenario_fits_one_chunk() {
        let pt = PageTable::build(0x4000_0000, 416_000, ChunkSize::new(1 << 20).unwrap());
        assert_eq!(pt.len(), 1);
    }

    #[test]
    fn non_power_of_two_rejected() {
        assert!(ChunkSize::new(3000).is_err());
        assert!(ChunkSize::new(0).is_err());
        assert_eq!(ChunkSize::new(4096).unwrap().shift(), 12);
    }

    #[test]
    fn translate_follows_chunks() {
        let pt = PageTable::build(0x1000, 100, ChunkSize::from_shift(5));
        assert_eq!(pt.len(), 4);
        assert_eq!(pt.translate(0), Some(0x1000));
        assert_eq!(pt.translate(33), Some(0x1000 + 33));
        assert_eq!(pt.translate(128), None);
    }

    #[test]
    fn encode_respects_platform() {
        let pt = PageTable::build(0x4000_0000, 32, ChunkSize::from_shift(4));
        let le = pt.encode(&PlatformDescriptor::VC707_ARIANE).unwrap();
        assert_eq!(le.len(), 16);
        assert_eq!(decode_entry(&le[8..16], ByteOrder::Little), Some(0x4000_0010));

        let be = pt.encode(&PlatformDescriptor::VC707_LEON3).unwrap();
        assert_eq!(be.len(), 8);
        assert_eq!(&be[0..4], &[0x40, 0, 0, 0]);

        let high = PageTable::build(0x1_0000_0000, 16, ChunkSize::from_shift(4));
        assert!(high.encode(&PlatformDescriptor::VC707_LEON3).is_err());
    }

    #[test]
    fn install_writes_entries() {
        let mem = SimMemory::new(0x4000_0000, 1 << 16).shared();
        let pool: Arc<dyn DmaPool> = mem.clone();
        let platform = PlatformDescriptor::default();
        let pt = PageTable::build(0x4000_2000, 48, ChunkSize::from_shift(4));
        let resident = pt.install(&pool, &platform).unwrap();

        let mut raw = [0u8; 24];
        mem.read(resident.address(), &mut raw).unwrap();
        assert_eq!(decode_entry(&raw[16..24], ByteOrder::Little), Some(0x4000_2020));
        assert_eq!(resident.table().len(), 3);
    }
}
