//! Block-granular I/O over a partition.
//!
//! The `BlockStore` turns the sector-level [`DiskDriver`] interface into the
//! 4096-byte blocks every other component works with. Block index `i` spans
//! sectors `[start + i*spb, start + (i+1)*spb)` where `spb` is the number of
//! sectors per block.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use spin::Mutex;

use crate::drivers::{DiskDriver, Partition};
use crate::errors::{CanFail, FsError, FsResult};
use crate::uint_display;

/// Fixed file system block size, in bytes.
pub const BLOCK_SIZE: usize = 4096;

/// One block worth of bytes.
pub type BlockBuf = [u8; BLOCK_SIZE];

/// Index of a block within the partition.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct BlockIndex(pub(crate) u32);

uint_display!(BlockIndex);

impl BlockIndex {
    /// Sentinel for an absent block pointer.
    pub const NULL: Self = Self(u32::MAX);

    /// Checks this index against the [`NULL`](Self::NULL) sentinel.
    pub fn is_null(self) -> bool {
        self == Self::NULL
    }
}

impl From<u32> for BlockIndex {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<BlockIndex> for u32 {
    fn from(value: BlockIndex) -> Self {
        value.0
    }
}

impl From<BlockIndex> for u64 {
    fn from(value: BlockIndex) -> Self {
        u64::from(value.0)
    }
}

impl core::ops::Add<u32> for BlockIndex {
    type Output = BlockIndex;

    fn add(self, rhs: u32) -> Self::Output {
        BlockIndex(self.0 + rhs)
    }
}

/// Serialized 4 KiB block access over one partition.
///
/// All operations funnel through an internal lock, so the store is safe to
/// call from multiple threads but offers no read parallelism. Higher layers
/// that need atomicity across several blocks bring their own lock.
pub struct BlockStore {
    disk: Arc<dyn DiskDriver>,
    partition: Partition,
    sectors_per_block: u64,
    block_count: u32,
    lock: Mutex<()>,
}

impl core::fmt::Debug for BlockStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BlockStore")
            .field("partition", &self.partition)
            .field("sectors_per_block", &self.sectors_per_block)
            .field("block_count", &self.block_count)
            .finish()
    }
}

impl BlockStore {
    /// Builds a store over `partition`.
    ///
    /// # Errors
    ///
    /// Fails with [`FsError::Invalid`] if the driver's sector size does not
    /// divide [`BLOCK_SIZE`].
    pub fn new(disk: Arc<dyn DiskDriver>, partition: Partition) -> FsResult<Self> {
        let sector_size = disk.sector_size();
        if sector_size == 0 || BLOCK_SIZE % sector_size != 0 {
            return Err(FsError::Invalid);
        }

        let sectors_per_block = (BLOCK_SIZE / sector_size) as u64;
        let block_count = u32::try_from(partition.sector_count() / sectors_per_block)
            .map_err(|_| FsError::OutOfRange)?;

        Ok(Self {
            disk,
            partition,
            sectors_per_block,
            block_count,
            lock: Mutex::new(()),
        })
    }

    /// Returns the number of whole blocks the partition holds.
    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    fn first_sector_of(&self, index: BlockIndex) -> FsResult<u64> {
        if index.0 >= self.block_count {
            return Err(FsError::OutOfRange);
        }

        Ok(self.partition.start_sector() + u64::from(index) * self.sectors_per_block)
    }

    /// Reads the block at `index` into `buf`.
    pub fn read_block(&self, index: BlockIndex, buf: &mut BlockBuf) -> CanFail<FsError> {
        let first = self.first_sector_of(index)?;
        let sector_size = self.disk.sector_size();

        let _guard = self.lock.lock();
        for (s, chunk) in buf.chunks_exact_mut(sector_size).enumerate() {
            self.disk.read_sector(first + s as u64, chunk)?;
        }

        Ok(())
    }

    /// Writes `buf` to the block at `index`.
    pub fn write_block(&self, index: BlockIndex, buf: &BlockBuf) -> CanFail<FsError> {
        let first = self.first_sector_of(index)?;
        let sector_size = self.disk.sector_size();

        let _guard = self.lock.lock();
        for (s, chunk) in buf.chunks_exact(sector_size).enumerate() {
            self.disk.write_sector(first + s as u64, chunk)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::MemDisk;

    fn store_over(sectors: u64, start: u64, len: u64) -> BlockStore {
        let disk = Arc::new(MemDisk::new(sectors));
        let partition = Partition::new(disk.as_ref(), start, len).unwrap();
        BlockStore::new(disk, partition).unwrap()
    }

    #[test]
    fn block_roundtrip() {
        let store = store_over(64, 0, 64);
        let mut block = [0u8; BLOCK_SIZE];
        block[0] = 0xDE;
        block[BLOCK_SIZE - 1] = 0xAD;

        store.write_block(BlockIndex(3), &block).unwrap();

        let mut back = [0u8; BLOCK_SIZE];
        store.read_block(BlockIndex(3), &mut back).unwrap();
        assert_eq!(back[0], 0xDE);
        assert_eq!(back[BLOCK_SIZE - 1], 0xAD);
    }

    #[test]
    fn partition_offset_is_honored() {
        let disk = Arc::new(MemDisk::new(64));
        let partition = Partition::new(disk.as_ref(), 16, 48).unwrap();
        let store = BlockStore::new(disk.clone(), partition).unwrap();

        let block = [0x5Au8; BLOCK_SIZE];
        store.write_block(BlockIndex(0), &block).unwrap();

        // Block 0 of the partition starts at sector 16, not sector 0.
        let mut sector = [0u8; 512];
        disk.read_sector(16, &mut sector).unwrap();
        assert_eq!(sector, [0x5Au8; 512]);
        disk.read_sector(0, &mut sector).unwrap();
        assert_eq!(sector, [0u8; 512]);
    }

    #[test]
    fn out_of_range_block_is_rejected() {
        let store = store_over(64, 0, 64);
        let mut buf = [0u8; BLOCK_SIZE];

        // 64 sectors of 512 bytes make exactly 8 blocks.
        assert_eq!(store.block_count(), 8);
        assert_eq!(
            store.read_block(BlockIndex(8), &mut buf),
            Err(FsError::OutOfRange)
        );
        assert_eq!(
            store.write_block(BlockIndex::NULL, &buf),
            Err(FsError::OutOfRange)
        );
    }
}
