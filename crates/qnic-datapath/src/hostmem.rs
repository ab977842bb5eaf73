//! Host Memory
//!
//! Byte-addressable host memory as seen by the NIC's DMA engines.
//! Rings, descriptors, completion records and packet buffers all live here.

use parking_lot::RwLock;
use qnic_common::{DatapathError, DatapathResult};

/// DMA view of host memory
pub trait HostMemory: Send + Sync {
    /// Copy `buf.len()` bytes starting at `addr` into `buf`
    fn read(&self, addr: u64, buf: &mut [u8]) -> DatapathResult<()>;

    /// Copy `data` to host memory at `addr`
    fn write(&self, addr: u64, data: &[u8]) -> DatapathResult<()>;

    /// Region size in bytes
    fn size(&self) -> u64;

    /// Whether `[addr, addr + len)` lies inside the region
    #[inline]
    fn contains(&self, addr: u64, len: u64) -> bool {
        addr.checked_add(len).map_or(false, |end| end <= self.size())
    }
}

/// Contiguous host memory region backed by a heap buffer
pub struct DmaRegion {
    mem: RwLock<Vec<u8>>,
    size: u64,
}

impl DmaRegion {
    /// Create a zeroed region of `size` bytes
    pub fn new(size: usize) -> Self {
        Self {
            mem: RwLock::new(vec![0; size]),
            size: size as u64,
        }
    }

    fn range(&self, addr: u64, len: usize) -> DatapathResult<std::ops::Range<usize>> {
        if !self.contains(addr, len as u64) {
            return Err(DatapathError::HostMemory { addr, len });
        }
        let start = addr as usize;
        Ok(start..start + len)
    }

    /// Read a little-endian u32
    pub fn read_u32(&self, addr: u64) -> DatapathResult<u32> {
        let mut raw = [0u8; 4];
        self.read(addr, &mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    /// Fill a range with one byte value
    pub fn fill(&self, addr: u64, len: usize, value: u8) -> DatapathResult<()> {
        let range = self.range(addr, len)?;
        self.mem.write()[range].fill(value);
        Ok(())
    }
}

impl HostMemory for DmaRegion {
    fn read(&self, addr: u64, buf: &mut [u8]) -> DatapathResult<()> {
        let range = self.range(addr, buf.len())?;
        buf.copy_from_slice(&self.mem.read()[range]);
        Ok(())
    }

    fn write(&self, addr: u64, data: &[u8]) -> DatapathResult<()> {
        let range = self.range(addr, data.len())?;
        self.mem.write()[range].copy_from_slice(data);
        Ok(())
    }

    fn size(&self) -> u64 {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write() {
        let mem = DmaRegion::new(4096);
        mem.write(100, &[1, 2, 3, 4]).unwrap();

        let mut buf = [0u8; 4];
        mem.read(100, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
        assert_eq!(mem.read_u32(100).unwrap(), 0x0403_0201);
    }

    #[test]
    fn test_out_of_range() {
        let mem = DmaRegion::new(64);
        assert!(mem.write(62, &[0; 4]).is_err());
        assert!(mem.contains(60, 4));
        assert!(!mem.contains(u64::MAX, 2));

        let mut buf = [0u8; 8];
        assert!(matches!(
            mem.read(60, &mut buf),
            Err(DatapathError::HostMemory { addr: 60, len: 8 })
        ));
    }

    #[test]
    fn test_fill() {
        let mem = DmaRegion::new(32);
        mem.fill(8, 8, 0xAA).unwrap();
        let mut buf = [0u8; 10];
        mem.read(7, &mut buf).unwrap();
        assert_eq!(buf[0], 0);
        assert!(buf[1..9].iter().all(|&b| b == 0xAA));
        assert_eq!(buf[9], 0);
    }
}
