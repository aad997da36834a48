//! Standard API to interact with disk devices, regardless of where their
//! sectors actually live (RAM, an image file, real hardware).
//!
//! The `DiskDriver` trait specifies the blocking, sector-granular methods the
//! engine is built on. The engine itself never addresses a whole disk: it is
//! handed a [`Partition`] descriptor and stays inside it.

use crate::errors::{CanFail, FsError, FsResult};

pub mod memdisk;

pub use memdisk::MemDisk;

/// Blocking, sector-granular access to a disk device.
///
/// Implementations handle their own interior locking; every method takes
/// `&self` so a driver can be shared behind an `Arc` by the block layer and
/// by partition tooling at the same time.
pub trait DiskDriver: Send + Sync {
    /// Returns the number of bytes per logical sector.
    fn sector_size(&self) -> usize;

    /// Returns the number of user-addressable sectors on the device.
    fn sector_count(&self) -> u64;

    /// Reads the sector at `index` into `buf`.
    ///
    /// `buf` must be exactly [`sector_size`](DiskDriver::sector_size) bytes.
    ///
    /// # Errors
    ///
    /// Fails with [`FsError::OutOfRange`] if `index` is past the device, and
    /// with [`FsError::Io`] on a transfer failure.
    fn read_sector(&self, index: u64, buf: &mut [u8]) -> CanFail<FsError>;

    /// Writes `buf` to the sector at `index`.
    ///
    /// `buf` must be exactly [`sector_size`](DiskDriver::sector_size) bytes.
    ///
    /// # Errors
    ///
    /// Fails with [`FsError::OutOfRange`] if `index` is past the device, and
    /// with [`FsError::Io`] on a transfer failure.
    fn write_sector(&self, index: u64, buf: &[u8]) -> CanFail<FsError>;

    /// Flushes any buffered writes to the backing medium.
    fn flush(&self) -> CanFail<FsError>;
}

/// A contiguous slice of a disk, described in sectors.
///
/// Partition table parsing is a host concern; the engine only needs the
/// resolved bounds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Partition {
    start_sector: u64,
    sector_count: u64,
}

impl Partition {
    /// Builds a partition descriptor after checking it fits on `disk`.
    ///
    /// # Errors
    ///
    /// Fails with [`FsError::OutOfRange`] if the sector range does not fit on
    /// the device.
    pub fn new(disk: &dyn DiskDriver, start_sector: u64, sector_count: u64) -> FsResult<Self> {
        let end = start_sector
            .checked_add(sector_count)
            .ok_or(FsError::OutOfRange)?;

        if end > disk.sector_count() {
            return Err(FsError::OutOfRange);
        }

        Ok(Self {
            start_sector,
            sector_count,
        })
    }

    /// Returns this partition's starting sector.
    pub fn start_sector(&self) -> u64 {
        self.start_sector
    }

    /// Returns the number of sectors in this partition.
    pub fn sector_count(&self) -> u64 {
        self.sector_count
    }
}
