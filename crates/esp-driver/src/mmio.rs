//! Memory-mapped register and buffer regions
//!
//! Wraps a shared `mmap` of a device file (a UIO map or a `u-dma-buf`
//! node). All accesses are bounds-checked and return `Result`; the unsafe
//! pointer work stays inside this module.

// Register offsets are 4-byte aligned by construction; mapping bases are
// page aligned.
#![allow(clippy::cast_ptr_alignment)]

use crate::error::{AcceleratorError, Result};
use rustix::mm::{mlock, mmap, munlock, munmap, MapFlags, ProtFlags};
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsFd;
use std::path::Path;
use std::ptr::NonNull;

/// Shared mapping of part of a device file
pub struct MappedRegion {
    ptr: NonNull<u8>,
    size: usize,
    locked: bool,
    _file: File,
    label: String,
}

impl std::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion")
            .field("ptr", &format_args!("{:p}", self.ptr))
            .field("size", &self.size)
            .field("locked", &self.locked)
            .field("label", &self.label)
            .finish()
    }
}

// SAFETY: Send - the region owns its mapping exclusively and holds no
// thread-local state; the mapping is process-wide.
unsafe impl Send for MappedRegion {}

// SAFETY: Sync - shared accesses are bounds-checked volatile reads; every
// write path takes &mut self.
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Map `size` bytes of `path` starting at file offset `offset`.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be opened or mapped, or `size` is 0.
    pub fn open(path: &Path, offset: u64, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(AcceleratorError::configuration(format!(
                "zero-sized mapping of {}",
                path.display()
            )));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| {
                AcceleratorError::transfer(format!("Cannot open {}: {e}", path.display()))
            })?;

        // SAFETY: mmap preconditions hold:
        // - file descriptor is valid (just opened, kept alive in the struct)
        // - size is non-zero (checked above)
        // - MAP_SHARED with READ|WRITE is the mode UIO and u-dma-buf expose
        // - rustix reports failure as Err
        // The mapping is released exactly once in Drop.
        let addr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                file.as_fd(),
                offset,
            )
        }
        .map_err(|e| AcceleratorError::transfer(format!("mmap of {} failed: {e}", path.display())))?;

        let ptr = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| AcceleratorError::transfer("mmap returned a null mapping"))?;

        tracing::debug!("Mapped {} (+{offset:#x}, {size:#x} bytes) at {ptr:p}", path.display());

        Ok(Self {
            ptr,
            size,
            locked: false,
            _file: file,
            label: path.display().to_string(),
        })
    }

    /// Pin the mapping in RAM.
    ///
    /// # Errors
    ///
    /// Returns error if `mlock` fails (usually `RLIMIT_MEMLOCK`).
    pub fn lock_resident(&mut self) -> Result<()> {
        if self.locked {
            return Ok(());
        }
        // SAFETY: [ptr, ptr+size) is exactly the live mapping created in open().
        unsafe { mlock(self.ptr.as_ptr().cast(), self.size) }
            .map_err(|e| AcceleratorError::transfer(format!("mlock of {} failed: {e}", self.label)))?;
        self.locked = true;
        Ok(())
    }

    /// Mapping size in bytes.
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Base pointer of the mapping.
    pub const fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        if offset.checked_add(len).is_none_or(|end| end > self.size) {
            return Err(AcceleratorError::transfer(format!(
                "{}: access [{offset:#x}, +{len}) outside {:#x}-byte mapping",
                self.label, self.size
            )));
        }
        Ok(())
    }

    /// Volatile 32-bit read.
    ///
    /// # Errors
    ///
    /// Returns error if the offset is out of bounds or unaligned.
    pub fn read_u32(&self, offset: usize) -> Result<u32> {
        self.check(offset, 4)?;
        if offset % 4 != 0 {
            return Err(AcceleratorError::transfer(format!("unaligned register offset {offset:#x}")));
        }
        // SAFETY: offset+4 <= size and offset is 4-aligned on a page-aligned
        // base, so the pointer is valid and aligned for u32.
        Ok(unsafe { std::ptr::read_volatile(self.ptr.as_ptr().add(offset).cast::<u32>()) })
    }

    /// Volatile 32-bit write.
    ///
    /// # Errors
    ///
    /// Returns error if the offset is out of bounds or unaligned.
    pub fn write_u32(&mut self, offset: usize, value: u32) -> Result<()> {
        self.check(offset, 4)?;
        if offset % 4 != 0 {
            return Err(AcceleratorError::transfer(format!("unaligned register offset {offset:#x}")));
        }
        // SAFETY: same bounds and alignment argument as read_u32; &mut self
        // gives exclusive access.
        unsafe { std::ptr::write_volatile(self.ptr.as_ptr().add(offset).cast::<u32>(), value) };
        Ok(())
    }

    /// Copy bytes out of the mapping.
    ///
    /// # Errors
    ///
    /// Returns error if the range is out of bounds.
    pub fn read_bytes(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check(offset, buf.len())?;
        // SAFETY: source range checked above; destination is a distinct
        // Rust slice, so the regions cannot overlap.
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    /// Copy bytes into the mapping.
    ///
    /// # Errors
    ///
    /// Returns error if the range is out of bounds.
    pub fn write_bytes(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        self.check(offset, data.len())?;
        // SAFETY: destination range checked above and exclusively borrowed.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len());
        }
        Ok(())
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        if self.locked {
            // SAFETY: the range was locked by lock_resident() and is still mapped.
            let _ = unsafe { munlock(self.ptr.as_ptr().cast(), self.size) };
        }
        // SAFETY: ptr/size come from the successful mmap in open(); Drop runs
        // once and no references into the mapping outlive self.
        if let Err(e) = unsafe { munmap(self.ptr.as_ptr().cast(), self.size) } {
            tracing::warn!("munmap of {} failed: {e}", self.label);
        }
        tracing::debug!("Unmapped {}", self.label);
    }
}
