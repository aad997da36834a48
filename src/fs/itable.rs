//! Inode-location indirection table.
//!
//! The table maps inode numbers to the inode-region slot holding their
//! current copy. It is the only persistent structure the engine mutates in
//! place: repointing an entry is what makes a copy-on-write update visible,
//! while every older slot stays reachable from the checkpoints that
//! reference it.
//!
//! A table is either *live* (backed by its on-disk blocks) or a *snapshot*
//! (an in-memory array rebuilt from a checkpoint chain). Snapshot tables
//! never touch the disk; they are separate values, so snapshot state cannot
//! leak into the live instance.

use std::sync::Arc;

use crate::errors::{CanFail, FsError, FsResult};
use crate::fs::block::{BlockIndex, BlockStore, BLOCK_SIZE};
use crate::fs::inode::{InodeNumber, SlotIndex};

/// Table entries per block.
pub const ENTRIES_PER_BLOCK: usize = BLOCK_SIZE / core::mem::size_of::<u32>();

/// Mapping from inode number to inode slot.
#[derive(Debug)]
pub enum InodeLocTable {
    /// Reads and writes persist through the block store.
    Live {
        store: Arc<BlockStore>,
        start: BlockIndex,
        capacity: u32,
    },

    /// In-memory overlay reconstructed from a checkpoint; writes stay in
    /// memory.
    Snapshot { slots: Vec<SlotIndex> },
}

impl InodeLocTable {
    /// Opens the live table stored at `start`.
    pub fn live(store: Arc<BlockStore>, start: BlockIndex, capacity: u32) -> Self {
        Self::Live {
            store,
            start,
            capacity,
        }
    }

    /// Builds a snapshot table over a prefilled slot array.
    pub fn snapshot(slots: Vec<SlotIndex>) -> Self {
        Self::Snapshot { slots }
    }

    /// Number of inode numbers the table covers.
    pub fn capacity(&self) -> u32 {
        match self {
            Self::Live { capacity, .. } => *capacity,
            Self::Snapshot { slots } => slots.len() as u32,
        }
    }

    /// Number of blocks the live table spans.
    pub fn block_span(&self) -> u32 {
        self.capacity().div_ceil(ENTRIES_PER_BLOCK as u32)
    }

    /// Writes every entry of the on-disk table to NULL. Format only.
    pub fn initialize(store: &BlockStore, start: BlockIndex, num_blocks: u32) -> CanFail<FsError> {
        // SlotIndex::NULL is all-ones, so a NULL-filled table block is too.
        let buf = [0xFFu8; BLOCK_SIZE];
        for i in 0..num_blocks {
            store.write_block(start + i, &buf)?;
        }

        Ok(())
    }

    /// Looks up the slot currently mapped to `inode_num`, `None` if the
    /// number is unmapped.
    pub fn get(&self, inode_num: InodeNumber) -> FsResult<Option<SlotIndex>> {
        if inode_num.0 >= self.capacity() {
            return Err(FsError::OutOfRange);
        }

        let slot = match self {
            Self::Live { store, start, .. } => {
                let block = *start + inode_num.0 / ENTRIES_PER_BLOCK as u32;
                let offset = inode_num.0 as usize % ENTRIES_PER_BLOCK * 4;

                let mut buf = [0u8; BLOCK_SIZE];
                store.read_block(block, &mut buf)?;
                SlotIndex(bytemuck::pod_read_unaligned(&buf[offset..offset + 4]))
            }
            Self::Snapshot { slots } => slots[inode_num.0 as usize],
        };

        Ok((!slot.is_null()).then_some(slot))
    }

    /// Points `inode_num` at `slot`.
    pub fn set(&mut self, inode_num: InodeNumber, slot: SlotIndex) -> CanFail<FsError> {
        if inode_num.0 >= self.capacity() {
            return Err(FsError::OutOfRange);
        }

        match self {
            Self::Live { store, start, .. } => {
                let block = *start + inode_num.0 / ENTRIES_PER_BLOCK as u32;
                let offset = inode_num.0 as usize % ENTRIES_PER_BLOCK * 4;

                let mut buf = [0u8; BLOCK_SIZE];
                store.read_block(block, &mut buf)?;
                buf[offset..offset + 4].copy_from_slice(&slot.0.to_le_bytes());
                store.write_block(block, &buf)?;
            }
            Self::Snapshot { slots } => slots[inode_num.0 as usize] = slot,
        }

        Ok(())
    }

    /// Unmaps `inode_num`.
    pub fn clear(&mut self, inode_num: InodeNumber) -> CanFail<FsError> {
        self.set(inode_num, SlotIndex::NULL)
    }

    /// Finds the lowest unmapped inode number.
    pub fn find_free_number(&self) -> FsResult<Option<InodeNumber>> {
        match self {
            Self::Live {
                store,
                start,
                capacity,
            } => {
                let mut buf = [0u8; BLOCK_SIZE];
                for blk in 0..self.block_span() {
                    store.read_block(*start + blk, &mut buf)?;
                    for entry in 0..ENTRIES_PER_BLOCK {
                        let num = blk * ENTRIES_PER_BLOCK as u32 + entry as u32;
                        if num >= *capacity {
                            return Ok(None);
                        }
                        let raw: u32 =
                            bytemuck::pod_read_unaligned(&buf[entry * 4..entry * 4 + 4]);
                        if SlotIndex(raw).is_null() {
                            return Ok(Some(InodeNumber(num)));
                        }
                    }
                }

                Ok(None)
            }
            Self::Snapshot { slots } => Ok(slots
                .iter()
                .position(|s| s.is_null())
                .map(|n| InodeNumber(n as u32))),
        }
    }

    /// Walks every live mapping in inode-number order, one table block at a
    /// time.
    pub fn for_each_mapping(
        &self,
        mut f: impl FnMut(InodeNumber, SlotIndex) -> CanFail<FsError>,
    ) -> CanFail<FsError> {
        match self {
            Self::Live {
                store,
                start,
                capacity,
            } => {
                let mut buf = [0u8; BLOCK_SIZE];
                for blk in 0..self.block_span() {
                    store.read_block(*start + blk, &mut buf)?;
                    for entry in 0..ENTRIES_PER_BLOCK {
                        let num = blk * ENTRIES_PER_BLOCK as u32 + entry as u32;
                        if num >= *capacity {
                            break;
                        }
                        let raw: u32 =
                            bytemuck::pod_read_unaligned(&buf[entry * 4..entry * 4 + 4]);
                        let slot = SlotIndex(raw);
                        if !slot.is_null() {
                            f(InodeNumber(num), slot)?;
                        }
                    }
                }

                Ok(())
            }
            Self::Snapshot { slots } => {
                for (num, slot) in slots.iter().enumerate() {
                    if !slot.is_null() {
                        f(InodeNumber(num as u32), *slot)?;
                    }
                }

                Ok(())
            }
        }
    }
}
