//! RAM-backed reference disk driver.
//!
//! `MemDisk` simulates a sector-addressable device in memory. It is the
//! driver the test suite mounts over, and doubles as a ramdisk for hosts
//! that want a scratch file system.

use spin::Mutex;

use crate::drivers::DiskDriver;
use crate::errors::{CanFail, FsError};

/// Default sector size, matching the common 512-byte logical sector.
pub const DEFAULT_SECTOR_SIZE: usize = 512;

/// An in-memory disk of `sector_count` sectors.
///
/// The whole device is one flat buffer behind a lock; a `MemDisk` can be
/// shared across threads behind an `Arc`.
pub struct MemDisk {
    sector_size: usize,
    sector_count: u64,
    sectors: Mutex<Vec<u8>>,
}

impl MemDisk {
    /// Creates a zero-filled disk with 512-byte sectors.
    pub fn new(sector_count: u64) -> Self {
        Self::with_sector_size(sector_count, DEFAULT_SECTOR_SIZE)
    }

    /// Creates a zero-filled disk with the given sector size.
    pub fn with_sector_size(sector_count: u64, sector_size: usize) -> Self {
        let bytes = usize::try_from(sector_count).expect("disk too large for memory")
            * sector_size;

        Self {
            sector_size,
            sector_count,
            sectors: Mutex::new(vec![0u8; bytes]),
        }
    }
}

impl DiskDriver for MemDisk {
    fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn sector_count(&self) -> u64 {
        self.sector_count
    }

    fn read_sector(&self, index: u64, buf: &mut [u8]) -> CanFail<FsError> {
        if index >= self.sector_count {
            return Err(FsError::OutOfRange);
        }
        if buf.len() != self.sector_size {
            return Err(FsError::Io);
        }

        let sectors = self.sectors.lock();
        let start = index as usize * self.sector_size;
        buf.copy_from_slice(&sectors[start..start + self.sector_size]);

        Ok(())
    }

    fn write_sector(&self, index: u64, buf: &[u8]) -> CanFail<FsError> {
        if index >= self.sector_count {
            return Err(FsError::OutOfRange);
        }
        if buf.len() != self.sector_size {
            return Err(FsError::Io);
        }

        let mut sectors = self.sectors.lock();
        let start = index as usize * self.sector_size;
        sectors[start..start + self.sector_size].copy_from_slice(buf);

        Ok(())
    }

    fn flush(&self) -> CanFail<FsError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sector_roundtrip() {
        let disk = MemDisk::new(16);
        let data = [0xA5u8; DEFAULT_SECTOR_SIZE];

        disk.write_sector(3, &data).unwrap();

        let mut back = [0u8; DEFAULT_SECTOR_SIZE];
        disk.read_sector(3, &mut back).unwrap();
        assert_eq!(back, data);

        disk.read_sector(0, &mut back).unwrap();
        assert_eq!(back, [0u8; DEFAULT_SECTOR_SIZE]);
    }

    #[test]
    fn out_of_range_sector_is_rejected() {
        let disk = MemDisk::new(4);
        let mut buf = [0u8; DEFAULT_SECTOR_SIZE];

        assert_eq!(disk.read_sector(4, &mut buf), Err(FsError::OutOfRange));
        assert_eq!(disk.write_sector(9, &buf), Err(FsError::OutOfRange));
    }

    #[test]
    fn mismatched_buffer_is_rejected() {
        let disk = MemDisk::new(4);
        let mut small = [0u8; 100];

        assert_eq!(disk.read_sector(0, &mut small), Err(FsError::Io));
    }
}
