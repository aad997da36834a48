//! Superblock: the root of the on-disk layout.
//!
//! Block 0 holds the superblock. It records the region layout (regions are
//! contiguous, in the order inode-bitmap, inode-loc-table, data-bitmap,
//! inode-region, data-region, log-area), the latest committed log sequence,
//! and the checkpoint directory. It is the single point at which visibility
//! becomes durable: a mutation exists once its log record is on disk and
//! `latest_log_seq` covers it.
//!
//! A freshly formatted disk has an all-zero block 0; the magic probe failing
//! is what triggers a format, not an error.

use bytemuck::{Pod, Zeroable};

use crate::errors::{CanFail, FsError, FsResult};
use crate::fs::block::{BlockIndex, BlockStore, BLOCK_SIZE};
use crate::fs::inode::INODES_PER_BLOCK;
use crate::fs::itable::ENTRIES_PER_BLOCK;
use crate::fs::journal::LogSequence;
use crate::uint_display;

/// Magic constant identifying a glacierfs superblock.
pub const SUPERBLOCK_MAGIC: u64 = 0xCA5C_ADED_BA5E_BA11;

/// On-disk format version.
pub const SUPERBLOCK_VERSION: u32 = 1;

/// Fixed capacity of the checkpoint directory.
pub const CHECKPOINT_DIR_CAPACITY: usize = 128;

/// Identifier of a checkpoint, assigned sequentially from 1.
///
/// Id 0 is reserved by the mount API to mean "return to the live state".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct CheckpointId(pub(crate) u32);

uint_display!(CheckpointId);

impl CheckpointId {
    /// The reserved "live state" id.
    pub const LIVE: Self = Self(0);
}

impl From<u32> for CheckpointId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<CheckpointId> for u32 {
    fn from(value: CheckpointId) -> Self {
        value.0
    }
}

/// One checkpoint-directory slot: a checkpoint id and the first block of its
/// chain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct CheckpointDirEntry {
    pub id: CheckpointId,
    pub first_block: BlockIndex,
}

/// The superblock. 1120 bytes of payload in block 0, little-endian, no
/// implicit padding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct Superblock {
    /// [`SUPERBLOCK_MAGIC`].
    pub magic: u64,

    /// [`SUPERBLOCK_VERSION`].
    pub version: u32,

    /// Usable blocks in the partition, excluding block 0.
    pub total_blocks: u32,

    /// Blocks in the data region.
    pub data_blocks: u32,

    /// Inode numbers (and slots) the file system can hold.
    pub inode_count: u32,

    /// Free data blocks at format time. Informational: never decremented by
    /// the copy-on-write path.
    pub free_data_blocks: u32,

    /// Free inode slots at format time. Informational, like
    /// `free_data_blocks`.
    pub free_inodes: u32,

    pub inode_bitmap_start: BlockIndex,
    pub inode_bitmap_blocks: u32,
    pub table_start: BlockIndex,
    pub table_blocks: u32,
    pub data_bitmap_start: BlockIndex,
    pub data_bitmap_blocks: u32,
    pub inode_region_start: BlockIndex,
    pub inode_region_blocks: u32,
    pub data_region_start: BlockIndex,
    pub log_start: BlockIndex,
    pub log_blocks: u32,

    /// Non-zero while a snapshot is mounted.
    pub read_only: u32,

    /// Highest log sequence whose record has been committed.
    pub latest_log_seq: LogSequence,

    /// Number of live entries in `checkpoints`.
    pub checkpoint_count: u32,

    _pad: u32,

    /// Checkpoint directory, filled front to back.
    pub checkpoints: [CheckpointDirEntry; CHECKPOINT_DIR_CAPACITY],
}

const _: () = assert!(core::mem::size_of::<Superblock>() <= BLOCK_SIZE);

impl Superblock {
    /// Computes a fresh layout for a partition of `num_blocks` blocks with a
    /// `log_blocks`-block log area.
    ///
    /// Regions are carved in the fixed order starting at block 1; the data
    /// region absorbs everything the metadata and the log do not claim.
    ///
    /// # Errors
    ///
    /// Fails with [`FsError::Full`] if the partition cannot hold the
    /// metadata, a non-empty data region and the log area.
    pub fn format_layout(num_blocks: u32, log_blocks: u32) -> FsResult<Self> {
        let total_blocks = num_blocks.checked_sub(1).ok_or(FsError::Full)?;
        let inode_count = total_blocks / 4;
        if inode_count == 0 {
            return Err(FsError::Full);
        }

        let inode_bitmap_blocks = inode_count.div_ceil(8).div_ceil(BLOCK_SIZE as u32);
        let table_blocks = inode_count.div_ceil(ENTRIES_PER_BLOCK as u32);
        let inode_region_blocks = inode_count.div_ceil(INODES_PER_BLOCK as u32);

        let remaining = total_blocks
            .checked_sub(inode_bitmap_blocks + table_blocks + inode_region_blocks)
            .ok_or(FsError::Full)?;
        let data_bitmap_blocks = remaining.div_ceil(8).div_ceil(BLOCK_SIZE as u32);

        if remaining < data_bitmap_blocks + log_blocks + 1 {
            return Err(FsError::Full);
        }
        let data_blocks = remaining - data_bitmap_blocks - log_blocks;

        let inode_bitmap_start = BlockIndex(1);
        let table_start = inode_bitmap_start + inode_bitmap_blocks;
        let data_bitmap_start = table_start + table_blocks;
        let inode_region_start = data_bitmap_start + data_bitmap_blocks;
        let data_region_start = inode_region_start + inode_region_blocks;
        let log_start = data_region_start + data_blocks;

        Ok(Self {
            magic: SUPERBLOCK_MAGIC,
            version: SUPERBLOCK_VERSION,
            total_blocks,
            data_blocks,
            inode_count,
            free_data_blocks: data_blocks,
            free_inodes: inode_count,
            inode_bitmap_start,
            inode_bitmap_blocks,
            table_start,
            table_blocks,
            data_bitmap_start,
            data_bitmap_blocks,
            inode_region_start,
            inode_region_blocks,
            data_region_start,
            log_start,
            log_blocks,
            read_only: 0,
            latest_log_seq: LogSequence(0),
            checkpoint_count: 0,
            _pad: 0,
            checkpoints: [CheckpointDirEntry::default(); CHECKPOINT_DIR_CAPACITY],
        })
    }

    /// Reads block 0 and parses it.
    ///
    /// Returns `None` when the magic does not match: the signal to format,
    /// not an error.
    ///
    /// # Errors
    ///
    /// A matching magic with an unsupported version is a corrupt superblock:
    /// [`FsError::Invalid`].
    pub fn probe(store: &BlockStore) -> FsResult<Option<Self>> {
        let mut buf = [0u8; BLOCK_SIZE];
        store.read_block(BlockIndex(0), &mut buf)?;

        let sb: Superblock =
            bytemuck::pod_read_unaligned(&buf[..core::mem::size_of::<Superblock>()]);
        if sb.magic != SUPERBLOCK_MAGIC {
            return Ok(None);
        }
        if sb.version != SUPERBLOCK_VERSION {
            return Err(FsError::Invalid);
        }

        Ok(Some(sb))
    }

    /// Persists the superblock to block 0.
    pub fn write_to(&self, store: &BlockStore) -> CanFail<FsError> {
        let mut buf = [0u8; BLOCK_SIZE];
        buf[..core::mem::size_of::<Superblock>()].copy_from_slice(bytemuck::bytes_of(self));

        store.write_block(BlockIndex(0), &buf)
    }

    /// Checks the read-only flag.
    pub fn is_read_only(&self) -> bool {
        self.read_only != 0
    }

    /// Sets or clears the read-only flag (in memory; callers persist).
    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = u32::from(read_only);
    }

    /// The id the next checkpoint will receive.
    pub fn next_checkpoint_id(&self) -> CheckpointId {
        CheckpointId(self.checkpoint_count + 1)
    }

    /// Appends a checkpoint to the directory.
    ///
    /// # Errors
    ///
    /// Fails with [`FsError::Full`] once all directory slots are taken.
    pub fn push_checkpoint(&mut self, id: CheckpointId, first_block: BlockIndex) -> CanFail<FsError> {
        let count = self.checkpoint_count as usize;
        if count >= CHECKPOINT_DIR_CAPACITY {
            return Err(FsError::Full);
        }

        self.checkpoints[count] = CheckpointDirEntry { id, first_block };
        self.checkpoint_count += 1;

        Ok(())
    }

    /// Looks up a checkpoint's first chain block by id.
    pub fn find_checkpoint(&self, id: CheckpointId) -> Option<BlockIndex> {
        self.directory()
            .iter()
            .find(|entry| entry.id == id)
            .map(|entry| entry.first_block)
    }

    /// The most recent checkpoint, if any.
    pub fn latest_checkpoint(&self) -> Option<CheckpointDirEntry> {
        self.directory().last().copied()
    }

    /// The live slice of the checkpoint directory.
    pub fn directory(&self) -> &[CheckpointDirEntry] {
        &self.checkpoints[..self.checkpoint_count as usize]
    }
}
