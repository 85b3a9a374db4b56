// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Guest-physical-address accessor for the single contiguous RAM region.
//!
//! This is the only guest-to-host translation in the VMM: `ram_host + (gpa -
//! B_RAM)`, defined only for `gpa` inside `[base, base + size)`. Everything
//! that reads or writes guest structures (virtqueue rings, descriptors, GPU
//! command/response buffers, backing pages, the faulting instruction) goes
//! through it.

use vm_memory::{Bytes, GuestAddress, GuestMemory as _, GuestMemoryMmap};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to allocate {size} bytes of guest memory: {0}", size = .1)]
    Alloc(vm_memory::mmap::Error, usize),
    #[error("guest-physical address {0:#x} is outside RAM [{1:#x}, {2:#x})")]
    OutOfRange(u64, u64, u64),
    #[error("guest memory access failed: {0}")]
    Access(vm_memory::GuestMemoryError),
    #[error("failed to read kernel image: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Owns the guest's single RAM region and bounds every access to it.
pub struct GuestMemory {
    mem: GuestMemoryMmap,
    base: u64,
    size: usize,
}

impl GuestMemory {
    /// Allocate a fresh, zeroed RAM region of `size` bytes at guest-physical `base`.
    pub fn new(base: u64, size: usize) -> Result<Self> {
        let mem = GuestMemoryMmap::from_ranges(&[(GuestAddress(base), size)])
            .map_err(|e| Error::Alloc(e, size))?;
        Ok(GuestMemory { mem, base, size })
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Host pointer backing the whole region, for handing to the hypervisor's
    /// `vm_map` primitive. Valid for the lifetime of `self`.
    pub fn host_ptr(&self) -> Result<*mut u8> {
        self.mem
            .get_host_address(GuestAddress(self.base))
            .map_err(Error::Access)
    }

    fn check_range(&self, gpa: u64, len: usize) -> Result<()> {
        let end = self.base.saturating_add(self.size as u64);
        let access_end = gpa.checked_add(len as u64).ok_or(Error::OutOfRange(gpa, self.base, end))?;
        if gpa < self.base || access_end > end {
            return Err(Error::OutOfRange(gpa, self.base, end));
        }
        Ok(())
    }

    /// Copy a flat kernel image to the start of RAM.
    pub fn load_kernel_image(&self, image: &[u8]) -> Result<()> {
        self.write_bytes(self.base, image)
    }

    pub fn read_bytes(&self, gpa: u64, buf: &mut [u8]) -> Result<()> {
        self.check_range(gpa, buf.len())?;
        self.mem
            .read_slice(buf, GuestAddress(gpa))
            .map_err(Error::Access)
    }

    pub fn write_bytes(&self, gpa: u64, buf: &[u8]) -> Result<()> {
        self.check_range(gpa, buf.len())?;
        self.mem
            .write_slice(buf, GuestAddress(gpa))
            .map_err(Error::Access)
    }

    pub fn read_u16(&self, gpa: u64) -> Result<u16> {
        self.check_range(gpa, 2)?;
        self.mem.read_obj(GuestAddress(gpa)).map_err(Error::Access)
    }

    pub fn write_u16(&self, gpa: u64, val: u16) -> Result<()> {
        self.check_range(gpa, 2)?;
        self.mem
            .write_obj(val, GuestAddress(gpa))
            .map_err(Error::Access)
    }

    pub fn read_u32(&self, gpa: u64) -> Result<u32> {
        self.check_range(gpa, 4)?;
        self.mem.read_obj(GuestAddress(gpa)).map_err(Error::Access)
    }

    pub fn write_u32(&self, gpa: u64, val: u32) -> Result<()> {
        self.check_range(gpa, 4)?;
        self.mem
            .write_obj(val, GuestAddress(gpa))
            .map_err(Error::Access)
    }

    pub fn read_u64(&self, gpa: u64) -> Result<u64> {
        self.check_range(gpa, 8)?;
        self.mem.read_obj(GuestAddress(gpa)).map_err(Error::Access)
    }

    pub fn write_u64(&self, gpa: u64, val: u64) -> Result<()> {
        self.check_range(gpa, 8)?;
        self.mem
            .write_obj(val, GuestAddress(gpa))
            .map_err(Error::Access)
    }

    /// Whether `gpa` falls inside the RAM region (for dispatch/debug use; actual
    /// accesses are always bounds-checked independently).
    pub fn contains(&self, gpa: u64) -> bool {
        gpa >= self.base && gpa < self.base + self.size as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_access_outside_ram() {
        let mem = GuestMemory::new(0x1000, 0x10).unwrap();
        assert!(mem.read_u32(0x0ffc).is_err());
        assert!(mem.read_u32(0x1010).is_err());
        assert!(mem.read_u32(0x1000).is_ok());
    }

    #[test]
    fn round_trips_values() {
        let mem = GuestMemory::new(0x1000, 0x100).unwrap();
        mem.write_u32(0x1010, 0xdead_beef).unwrap();
        assert_eq!(mem.read_u32(0x1010).unwrap(), 0xdead_beef);

        mem.write_u16(0x1020, 0xabcd).unwrap();
        assert_eq!(mem.read_u16(0x1020).unwrap(), 0xabcd);

        let pattern = [1u8, 2, 3, 4, 5, 6, 7, 8];
        mem.write_bytes(0x1030, &pattern).unwrap();
        let mut out = [0u8; 8];
        mem.read_bytes(0x1030, &mut out).unwrap();
        assert_eq!(out, pattern);
    }

    #[test]
    fn loads_kernel_image_at_base() {
        let mem = GuestMemory::new(0x7000_0000, 0x1000).unwrap();
        let image = vec![0xaa; 64];
        mem.load_kernel_image(&image).unwrap();
        let mut out = vec![0u8; 64];
        mem.read_bytes(0x7000_0000, &mut out).unwrap();
        assert_eq!(out, image);
    }
}
