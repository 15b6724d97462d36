//! Code Region - Executable Memory Capability
//!
//! All code bytes live in a [`CodeRegion`], an anonymous mapping created
//! through memmap2. Nothing outside this type writes to code memory: the
//! installer copies whole methods in before they are published, and the
//! guard patcher goes through the atomic accessors below, followed by
//! instruction-cache maintenance when the patched word sits in the
//! instruction stream.
//!
//! The region never moves and is unmapped only when the last
//! [`CompiledMethod`](super::CompiledMethod) referencing it is dropped.

use crate::error::{BarrierError, Result};
use memmap2::{MmapMut, MmapOptions};
use std::sync::atomic::{AtomicU32, Ordering};

/// Anonymous, fixed-address memory holding compiled code
pub struct CodeRegion {
    /// Keeps the mapping alive; never accessed through a reference after
    /// creation so concurrent raw accesses do not alias a `&mut`.
    _mmap: MmapMut,
    base: usize,
    size: usize,
}

impl CodeRegion {
    /// Map a zeroed region of at least `size` bytes, rounded up to pages
    pub fn anonymous(size: usize) -> Result<Self> {
        let page = page_size::get();
        let aligned_size = size
            .max(1)
            .checked_add(page - 1)
            .map(|s| s & !(page - 1))
            .ok_or_else(|| BarrierError::VirtualMemory(format!("size {} overflows", size)))?;

        let mut mmap = MmapOptions::new()
            .len(aligned_size)
            .map_anon()
            .map_err(|e| {
                BarrierError::VirtualMemory(format!("Failed to map code region: {}", e))
            })?;

        let base = mmap.as_mut_ptr() as usize;

        log::debug!("mapped code region {:#x}..{:#x}", base, base + aligned_size);

        Ok(Self {
            _mmap: mmap,
            base,
            size: aligned_size,
        })
    }

    /// First address of the region
    pub fn base(&self) -> usize {
        self.base
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Check if `addr..addr + len` lies inside the region
    pub fn contains(&self, addr: usize, len: usize) -> bool {
        addr >= self.base
            && addr
                .checked_add(len)
                .map_or(false, |end| end <= self.base + self.size)
    }

    fn check(&self, addr: usize, len: usize) -> Result<()> {
        if self.contains(addr, len) {
            Ok(())
        } else {
            Err(BarrierError::OutOfBounds { address: addr, len })
        }
    }

    fn check_word(&self, addr: usize) -> Result<()> {
        self.check(addr, 4)?;
        if addr % 4 != 0 {
            return Err(BarrierError::Internal(format!(
                "guard word {:#x} is not 4-byte aligned",
                addr
            )));
        }
        Ok(())
    }

    /// Copy raw bytes into the region
    ///
    /// # Safety
    ///
    /// No other thread may execute, read or patch `addr..addr + bytes.len()`
    /// while the copy runs. Used to install methods before publication.
    pub unsafe fn write_bytes(&self, addr: usize, bytes: &[u8]) -> Result<()> {
        self.check(addr, bytes.len())?;
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len());
        Ok(())
    }

    /// Read raw bytes from the region
    ///
    /// Byte-wise volatile reads; a concurrently patched guard may be seen
    /// torn, which verification tolerates because it ignores guard fields.
    pub fn read_bytes(&self, addr: usize, len: usize) -> Result<Vec<u8>> {
        self.check(addr, len)?;
        let mut out = Vec::with_capacity(len);
        for i in 0..len {
            // SAFETY: bounds checked above, the mapping lives as long as self.
            out.push(unsafe { ((addr + i) as *const u8).read_volatile() });
        }
        Ok(out)
    }

    /// Read a little-endian instruction word without ordering
    pub fn read_u32(&self, addr: usize) -> Result<u32> {
        let bytes = self.read_bytes(addr, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn word(&self, addr: usize) -> Result<&AtomicU32> {
        self.check_word(addr)?;
        // SAFETY: in bounds, 4-byte aligned, and every concurrent access to
        // guard words goes through atomics.
        Ok(unsafe { AtomicU32::from_ptr(addr as *mut u32) })
    }

    /// Load a guard word with acquire ordering
    pub fn load_acquire(&self, addr: usize) -> Result<u32> {
        Ok(self.word(addr)?.load(Ordering::Acquire))
    }

    /// Load a guard word without ordering
    pub fn load_relaxed(&self, addr: usize) -> Result<u32> {
        Ok(self.word(addr)?.load(Ordering::Relaxed))
    }

    /// Compare-and-swap a guard word, release on success
    ///
    /// Returns the value observed: `Ok(current)` when the exchange
    /// happened, `Err(actual)` otherwise.
    pub fn compare_exchange(
        &self,
        addr: usize,
        current: u32,
        new: u32,
    ) -> Result<std::result::Result<u32, u32>> {
        Ok(self
            .word(addr)?
            .compare_exchange(current, new, Ordering::Release, Ordering::Relaxed))
    }

    /// Synchronize the instruction cache after patching `addr..addr + len`
    pub fn sync_icache(&self, addr: usize, len: usize) -> Result<()> {
        self.check(addr, len)?;
        // SAFETY: range checked to be inside this live mapping.
        unsafe { crate::sync::clear_icache(addr, len) };
        Ok(())
    }
}

impl std::fmt::Debug for CodeRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeRegion")
            .field("base", &format_args!("{:#x}", self.base))
            .field("size", &self.size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anonymous_rounds_to_page() {
        let region = CodeRegion::anonymous(100).expect("mapping should succeed");
        assert_eq!(region.size(), page_size::get());
        assert_eq!(region.base() % page_size::get(), 0);
    }

    #[test]
    fn test_bounds() {
        let region = CodeRegion::anonymous(4096).expect("mapping should succeed");
        let base = region.base();
        assert!(region.contains(base, 4));
        assert!(!region.contains(base + region.size() - 2, 4));
        assert!(region.read_bytes(base + region.size(), 1).is_err());
    }

    #[test]
    fn test_word_access() {
        let region = CodeRegion::anonymous(4096).expect("mapping should succeed");
        let addr = region.base() + 16;

        assert_eq!(region.compare_exchange(addr, 0, 0x1234).unwrap(), Ok(0));
        assert_eq!(region.load_acquire(addr).unwrap(), 0x1234);
        assert_eq!(region.read_u32(addr).unwrap(), 0x1234);

        assert_eq!(region.compare_exchange(addr, 0x1234, 7).unwrap(), Ok(0x1234));
        assert_eq!(region.compare_exchange(addr, 0x1234, 8).unwrap(), Err(7));
    }

    #[test]
    fn test_misaligned_word_rejected() {
        let region = CodeRegion::anonymous(4096).expect("mapping should succeed");
        assert!(region.load_acquire(region.base() + 2).is_err());
    }

    #[test]
    fn test_write_and_read_bytes() {
        let region = CodeRegion::anonymous(4096).expect("mapping should succeed");
        let addr = region.base() + 3;
        unsafe { region.write_bytes(addr, &[0x41, 0x81, 0x7f]).unwrap() };
        assert_eq!(region.read_bytes(addr, 3).unwrap(), vec![0x41, 0x81, 0x7f]);
    }
}
