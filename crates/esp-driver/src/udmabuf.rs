//! `u-dma-buf` reserved-memory pool
//!
//! The `u-dma-buf` kernel module reserves a physically contiguous region at
//! boot and exposes it as `/dev/udmabufN`, with its physical address and
//! size published under `/sys/class/u-dma-buf/udmabufN/`. The whole region
//! is mapped once and sub-allocated first-fit, so every [`DmaBuffer`]
//! carved from it is contiguous in physical memory.
//!
//! [`DmaBuffer`]: crate::memory::DmaBuffer

use crate::discovery::read_sysfs_u64;
use crate::error::{AcceleratorError, Result};
use crate::memory::{DmaPool, RangeAllocator};
use crate::mmio::MappedRegion;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Default sysfs class directory of the `u-dma-buf` module.
pub const SYSFS_CLASS: &str = "/sys/class/u-dma-buf";

/// Physically contiguous pool backed by one `u-dma-buf` device.
#[derive(Debug)]
pub struct UdmaBuf {
    phys_addr: u64,
    size: usize,
    sysfs_dir: PathBuf,
    inner: Mutex<UdmaInner>,
}

#[derive(Debug)]
struct UdmaInner {
    region: MappedRegion,
    ranges: RangeAllocator,
}

impl UdmaBuf {
    /// Open `/dev/<name>` using the standard sysfs class directory.
    ///
    /// # Errors
    ///
    /// Returns error if the device or its sysfs attributes are missing.
    pub fn open(name: &str) -> Result<Self> {
        Self::open_at(&Path::new("/dev").join(name), &Path::new(SYSFS_CLASS).join(name))
    }

    /// Open a device node with an explicit sysfs attribute directory.
    ///
    /// # Errors
    ///
    /// Returns error if the attributes cannot be read or the mapping fails.
    pub fn open_at(dev_path: &Path, sysfs_dir: &Path) -> Result<Self> {
        let phys_addr = read_sysfs_u64(&sysfs_dir.join("phys_addr"))?;
        let size = usize::try_from(read_sysfs_u64(&sysfs_dir.join("size"))?).map_err(|_| {
            AcceleratorError::configuration(format!("{}: size exceeds usize", dev_path.display()))
        })?;

        let mut region = MappedRegion::open(dev_path, 0, size)?;
        if let Err(e) = region.lock_resident() {
            tracing::warn!("{e}; continuing with an unlocked mapping");
        }

        tracing::info!(
            "Opened {} (phys {phys_addr:#x}, {} KiB)",
            dev_path.display(),
            size / 1024
        );

        Ok(Self {
            phys_addr,
            size,
            sysfs_dir: sysfs_dir.to_path_buf(),
            inner: Mutex::new(UdmaInner {
                region,
                ranges: RangeAllocator::new(phys_addr, size),
            }),
        })
    }

    /// Physical base of the reserved region.
    pub const fn phys_addr(&self) -> u64 {
        self.phys_addr
    }

    /// Size of the reserved region in bytes.
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Write back CPU caches over the whole region.
    ///
    /// # Errors
    ///
    /// Returns error if the sysfs attribute cannot be written.
    pub fn sync_for_device(&self) -> Result<()> {
        std::fs::write(self.sysfs_dir.join("sync_for_device"), "1")?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, UdmaInner>> {
        self.inner
            .lock()
            .map_err(|_| AcceleratorError::transfer("u-dma-buf lock poisoned"))
    }

    fn offset_of(&self, addr: u64) -> Result<usize> {
        addr.checked_sub(self.phys_addr)
            .and_then(|off| usize::try_from(off).ok())
            .ok_or_else(|| {
                AcceleratorError::transfer(format!(
                    "address {addr:#x} below u-dma-buf base {:#x}",
                    self.phys_addr
                ))
            })
    }
}

impl DmaPool for UdmaBuf {
    fn reserve(&self, size: usize, align: usize) -> Result<u64> {
        let mut inner = self.lock()?;
        let base = inner.ranges.reserve(size, align)?;
        let offset = self.offset_of(base)?;
        inner.region.write_bytes(offset, &vec![0u8; size])?;
        Ok(base)
    }

    fn release(&self, base: u64) {
        if let Ok(mut inner) = self.lock() {
            if !inner.ranges.release(base) {
                tracing::warn!("Release of unknown u-dma-buf range {base:#x}");
            }
        }
    }

    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let offset = self.offset_of(addr)?;
        self.lock()?.region.read_bytes(offset, buf)
    }

    fn write(&self, addr: u64, data: &[u8]) -> Result<()> {
        let offset = self.offset_of(addr)?;
        self.lock()?.region.write_bytes(offset, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::DmaBuffer;
    use std::sync::Arc;

    /// Fake `/dev/udmabuf0` (a plain file) plus its sysfs attributes.
    fn fake_udmabuf(size: usize) -> (tempfile::TempDir, PathBuf, PathBuf) {
        let root = tempfile::tempdir().unwrap();
        let dev = root.path().join("udmabuf0");
        std::fs::write(&dev, vec![0xAAu8; size]).unwrap();
        let sysfs = root.path().join("sys/udmabuf0");
        std::fs::create_dir_all(&sysfs).unwrap();
        std::fs::write(sysfs.join("phys_addr"), "0x50000000\n").unwrap();
        std::fs::write(sysfs.join("size"), format!("{size}\n")).unwrap();
        std::fs::write(sysfs.join("sync_for_device"), "0").unwrap();
        (root, dev, sysfs)
    }

    #[test]
    fn pool_reports_sysfs_geometry() {
        let (_root, dev, sysfs) = fake_udmabuf(64 * 1024);
        let buf = UdmaBuf::open_at(&dev, &sysfs).unwrap();
        assert_eq!(buf.phys_addr(), 0x5000_0000);
        assert_eq!(buf.size(), 64 * 1024);
    }

    #[test]
    fn allocations_are_zeroed_and_addressable() {
        let (_root, dev, sysfs) = fake_udmabuf(64 * 1024);
        let pool: Arc<dyn DmaPool> = Arc::new(UdmaBuf::open_at(&dev, &sysfs).unwrap());
        let mut buf = DmaBuffer::alloc(&pool, 256).unwrap();
        assert_eq!(buf.base_address(), 0x5000_0000);
        assert_eq!(buf.read_tokens::<u32>(0, 4).unwrap(), vec![0; 4]);

        buf.write_tokens(1, &[42u32]).unwrap();
        let second = DmaBuffer::alloc(&pool, 16).unwrap();
        assert!(second.base_address() >= buf.base_address() + 4096);
        assert_eq!(buf.read_tokens::<u32>(1, 1).unwrap(), vec![42]);
    }

    #[test]
    fn sync_writes_attribute() {
        let (_root, dev, sysfs) = fake_udmabuf(4096);
        let buf = UdmaBuf::open_at(&dev, &sysfs).unwrap();
        buf.sync_for_device().unwrap();
        assert_eq!(std::fs::read_to_string(sysfs.join("sync_for_device")).unwrap(), "1");
    }

    #[test]
    fn missing_attributes_rejected() {
        let root = tempfile::tempdir().unwrap();
        let dev = root.path().join("udmabuf0");
        std::fs::write(&dev, vec![0u8; 4096]).unwrap();
        assert!(UdmaBuf::open_at(&dev, root.path()).is_err());
    }
}
