//! Persistent allocation bitmaps.
//!
//! One bitmap tracks inode slots, another data blocks. Bit `i` set means the
//! `i`-th unit is allocated. The file system proper only ever sets bits
//! (copy-on-write never reclaims), so a bit transitioning 1→0 outside format
//! or snapshot tooling is a corruption signal.
//!
//! The bitmap caches nothing: each operation reads and writes exactly the
//! affected bitmap block. Allocations are rare next to data I/O and the
//! statelessness keeps the recovery story trivial.
//!
//! Bit order within a byte is MSB-first, the same convention
//! [`Vob::from_bytes`] decodes.

use std::sync::Arc;

use vob::Vob;

use crate::errors::{CanFail, FsError, FsResult};
use crate::fs::block::{BlockIndex, BlockStore, BLOCK_SIZE};

/// Bits held by one bitmap block.
pub const BITS_PER_BLOCK: u32 = (BLOCK_SIZE * 8) as u32;

/// Allocator over a contiguous run of bitmap blocks.
pub struct Bitmap {
    store: Arc<BlockStore>,
    start: BlockIndex,
    num_blocks: u32,
    capacity: u32,
}

impl Bitmap {
    pub fn new(store: Arc<BlockStore>, start: BlockIndex, num_blocks: u32, capacity: u32) -> Self {
        Self {
            store,
            start,
            num_blocks,
            capacity,
        }
    }

    /// Zeroes every bitmap block. Only format (or snapshot tooling) may do
    /// this.
    pub fn initialize(&self) -> CanFail<FsError> {
        let zero = [0u8; BLOCK_SIZE];
        for i in 0..self.num_blocks {
            self.store.write_block(self.start + i, &zero)?;
        }

        Ok(())
    }

    fn locate(&self, index: u32) -> FsResult<(BlockIndex, usize, u8)> {
        if index >= self.capacity {
            return Err(FsError::OutOfRange);
        }

        let block = self.start + index / BITS_PER_BLOCK;
        let bit = index % BITS_PER_BLOCK;
        let byte = bit as usize / 8;
        let mask = 0x80u8 >> (bit % 8);

        Ok((block, byte, mask))
    }

    /// Finds the lowest free index, scanning from bit 0.
    ///
    /// Returns `None` when every unit is allocated.
    pub fn find_next_free(&self) -> FsResult<Option<u32>> {
        let mut buf = [0u8; BLOCK_SIZE];

        for blk in 0..self.num_blocks {
            self.store.read_block(self.start + blk, &mut buf)?;

            let bits = Vob::from_bytes(&buf);
            if let Some(bit) = bits.iter_unset_bits(..).next() {
                let index = blk * BITS_PER_BLOCK + bit as u32;
                if index >= self.capacity {
                    // Trailing bits of the last block sit past the capacity.
                    return Ok(None);
                }
                return Ok(Some(index));
            }
        }

        Ok(None)
    }

    /// Marks `index` allocated.
    pub fn set_allocated(&self, index: u32) -> CanFail<FsError> {
        let (block, byte, mask) = self.locate(index)?;

        let mut buf = [0u8; BLOCK_SIZE];
        self.store.read_block(block, &mut buf)?;
        buf[byte] |= mask;

        self.store.write_block(block, &buf)
    }

    /// Clears `index`. Reserved for format and snapshot tooling.
    pub fn clear(&self, index: u32) -> CanFail<FsError> {
        let (block, byte, mask) = self.locate(index)?;

        let mut buf = [0u8; BLOCK_SIZE];
        self.store.read_block(block, &mut buf)?;
        buf[byte] &= !mask;

        self.store.write_block(block, &buf)
    }

    /// Checks whether `index` is allocated.
    pub fn is_set(&self, index: u32) -> FsResult<bool> {
        let (block, byte, mask) = self.locate(index)?;

        let mut buf = [0u8; BLOCK_SIZE];
        self.store.read_block(block, &mut buf)?;

        Ok(buf[byte] & mask != 0)
    }

    /// Recomputes the number of free units by scanning the whole bitmap.
    ///
    /// The superblock's free counters drift under copy-on-write; this is the
    /// authoritative figure.
    pub fn count_free(&self) -> FsResult<u32> {
        let mut free = 0u32;
        let mut buf = [0u8; BLOCK_SIZE];

        for blk in 0..self.num_blocks {
            self.store.read_block(self.start + blk, &mut buf)?;

            let base = blk * BITS_PER_BLOCK;
            let bits = Vob::from_bytes(&buf);
            for bit in bits.iter_unset_bits(..) {
                // Trailing bits of the last block sit past the capacity.
                if base + (bit as u32) < self.capacity {
                    free += 1;
                }
            }
        }

        Ok(free)
    }

    /// Allocates and returns the lowest free index.
    ///
    /// # Errors
    ///
    /// Fails with [`FsError::Full`] when the bitmap is exhausted.
    pub fn allocate(&self) -> FsResult<u32> {
        let index = self.find_next_free()?.ok_or(FsError::Full)?;
        self.set_allocated(index)?;

        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::{MemDisk, Partition};

    fn bitmap(num_blocks: u32, capacity: u32) -> Bitmap {
        let sectors = u64::from(num_blocks + 1) * 8;
        let disk = Arc::new(MemDisk::new(sectors));
        let partition = Partition::new(disk.as_ref(), 0, sectors).unwrap();
        let store = Arc::new(BlockStore::new(disk, partition).unwrap());
        let bm = Bitmap::new(store, BlockIndex(0), num_blocks, capacity);
        bm.initialize().unwrap();
        bm
    }

    #[test]
    fn lowest_free_wins() {
        let bm = bitmap(1, 100);

        assert_eq!(bm.find_next_free().unwrap(), Some(0));
        bm.set_allocated(0).unwrap();
        bm.set_allocated(1).unwrap();
        bm.set_allocated(3).unwrap();
        assert_eq!(bm.find_next_free().unwrap(), Some(2));
        assert!(bm.is_set(1).unwrap());
        assert!(!bm.is_set(2).unwrap());
    }

    #[test]
    fn clear_releases_a_bit() {
        let bm = bitmap(1, 16);

        for i in 0..4 {
            bm.set_allocated(i).unwrap();
        }
        bm.clear(1).unwrap();
        assert_eq!(bm.find_next_free().unwrap(), Some(1));
    }

    #[test]
    fn scan_crosses_block_boundary() {
        let bm = bitmap(2, BITS_PER_BLOCK + 10);

        // Saturate the first bitmap block wholesale.
        let full = [0xFFu8; BLOCK_SIZE];
        bm.store.write_block(BlockIndex(0), &full).unwrap();

        assert_eq!(bm.find_next_free().unwrap(), Some(BITS_PER_BLOCK));
    }

    #[test]
    fn capacity_bound_is_enforced() {
        let bm = bitmap(1, 8);

        assert_eq!(bm.set_allocated(8), Err(FsError::OutOfRange));
        for i in 0..8 {
            bm.set_allocated(i).unwrap();
        }
        assert_eq!(bm.find_next_free().unwrap(), None);
        assert_eq!(bm.allocate(), Err(FsError::Full));
    }

    #[test]
    fn count_free_tracks_allocations() {
        let bm = bitmap(1, 64);

        assert_eq!(bm.count_free().unwrap(), 64);
        bm.set_allocated(10).unwrap();
        bm.set_allocated(63).unwrap();
        assert_eq!(bm.count_free().unwrap(), 62);
    }
}
