//! Inode structure and the packed on-disk inode region.
//!
//! An inode is addressed two ways: by its *inode number*, the stable
//! identifier directories reference, and by its *slot*, the physical
//! position its current copy occupies in the inode region. The
//! [`crate::fs::itable::InodeLocTable`] maps one to the other; copy-on-write
//! updates write a new slot and repoint the table, never touching the old
//! copy.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use crate::errors::{CanFail, FsError, FsResult};
use crate::fs::block::{BlockIndex, BlockStore, BLOCK_SIZE};
use crate::uint_display;

/// Direct block pointers per inode.
pub const NUM_DIRECT: usize = 15;

/// Indirect block pointers per inode.
pub const NUM_INDIRECT: usize = 10;

/// Double-indirect block pointers per inode.
pub const NUM_DOUBLE_INDIRECT: usize = 2;

/// Block pointers held by one indirect block.
pub const POINTERS_PER_BLOCK: usize = BLOCK_SIZE / 4;

/// Packed inodes per inode-region block.
pub const INODES_PER_BLOCK: usize = BLOCK_SIZE / core::mem::size_of::<Inode>();

/// Stable identifier of a file or directory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct InodeNumber(pub(crate) u32);

uint_display!(InodeNumber);

impl InodeNumber {
    /// Inode 0 is reserved for the root directory.
    pub const ROOT: Self = Self(0);

    /// Sentinel for an absent inode reference.
    pub const NULL: Self = Self(u32::MAX);

    /// Checks this number against the [`NULL`](Self::NULL) sentinel.
    pub fn is_null(self) -> bool {
        self == Self::NULL
    }
}

impl From<u32> for InodeNumber {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<InodeNumber> for u32 {
    fn from(value: InodeNumber) -> Self {
        value.0
    }
}

/// Physical position of an inode copy within the inode region.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct SlotIndex(pub(crate) u32);

uint_display!(SlotIndex);

impl SlotIndex {
    /// Sentinel for an unmapped table entry.
    pub const NULL: Self = Self(u32::MAX);

    /// Checks this slot against the [`NULL`](Self::NULL) sentinel.
    pub fn is_null(self) -> bool {
        self == Self::NULL
    }
}

impl From<u32> for SlotIndex {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<SlotIndex> for u32 {
    fn from(value: SlotIndex) -> Self {
        value.0
    }
}

/// File mode word stored in the inode.
///
/// Permission bits are stored but never enforced by the engine; the one bit
/// it interprets is [`FileMode::DIRECTORY`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct FileMode(pub u16);

impl FileMode {
    /// Empty mode word.
    pub const EMPTY: Self = Self(0);

    /// Distinguishes directories from regular files.
    pub const DIRECTORY: Self = Self(1 << 9);

    /// Checks whether every bit of `mode` is set in `self`.
    pub fn contains(self, mode: FileMode) -> bool {
        self.0 & mode.0 == mode.0 && mode != Self::EMPTY
    }
}

impl core::ops::BitOr for FileMode {
    type Output = FileMode;

    fn bitor(self, rhs: Self) -> Self::Output {
        FileMode(self.0 | rhs.0)
    }
}

impl core::ops::BitAnd for FileMode {
    type Output = FileMode;

    fn bitand(self, rhs: Self) -> Self::Output {
        FileMode(self.0 & rhs.0)
    }
}

/// On-disk inode: 128 bytes, 32 per block.
///
/// `block_count` is the number of logical blocks currently addressed; the
/// address map has no holes, so logical blocks `0..block_count` all resolve.
/// Unused pointers hold [`BlockIndex::NULL`]. `num_files` is meaningful only
/// for directories.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct Inode {
    /// File size in bytes.
    pub size: u64,

    /// Number of logical blocks addressed by this inode.
    pub block_count: u32,

    /// Owner user id (stored, not enforced).
    pub uid: u16,

    /// Owner group id (stored, not enforced).
    pub gid: u16,

    /// Mode word; bit 9 marks a directory.
    pub permissions: FileMode,

    /// Number of live directory entries (directories only).
    pub num_files: u16,

    /// Direct block pointers, logical blocks `0..15`.
    pub direct: [BlockIndex; NUM_DIRECT],

    /// Indirect block pointers, each covering 1024 logical blocks.
    pub indirect: [BlockIndex; NUM_INDIRECT],

    /// Double-indirect block pointers, each covering 1024 indirect blocks.
    pub double_indirect: [BlockIndex; NUM_DOUBLE_INDIRECT],
}

impl Inode {
    /// A zero-length inode with the given mode and no blocks mapped.
    pub fn empty(permissions: FileMode) -> Self {
        Self {
            size: 0,
            block_count: 0,
            uid: 0,
            gid: 0,
            permissions,
            num_files: 0,
            direct: [BlockIndex::NULL; NUM_DIRECT],
            indirect: [BlockIndex::NULL; NUM_INDIRECT],
            double_indirect: [BlockIndex::NULL; NUM_DOUBLE_INDIRECT],
        }
    }

    /// Checks the directory bit of the mode word.
    pub fn is_directory(&self) -> bool {
        self.permissions.contains(FileMode::DIRECTORY)
    }
}

/// Per-slot access to the packed inode region.
///
/// The region never allocates or frees slots; that is the inode bitmap's
/// job. Writes are read-modify-write on the containing block so sibling
/// slots survive verbatim.
pub struct InodeRegion {
    store: Arc<BlockStore>,
    start: BlockIndex,
}

impl InodeRegion {
    pub fn new(store: Arc<BlockStore>, start: BlockIndex) -> Self {
        Self { store, start }
    }

    fn locate(&self, slot: SlotIndex) -> (BlockIndex, usize) {
        let block = self.start + slot.0 / INODES_PER_BLOCK as u32;
        let offset = slot.0 as usize % INODES_PER_BLOCK * core::mem::size_of::<Inode>();
        (block, offset)
    }

    /// Reads the inode stored at `slot`.
    pub fn read_inode(&self, slot: SlotIndex) -> FsResult<Inode> {
        let (block, offset) = self.locate(slot);

        let mut buf = [0u8; BLOCK_SIZE];
        self.store.read_block(block, &mut buf)?;

        Ok(bytemuck::pod_read_unaligned(
            &buf[offset..offset + core::mem::size_of::<Inode>()],
        ))
    }

    /// Writes `inode` into `slot`, preserving the other slots of the block.
    pub fn write_inode(&self, slot: SlotIndex, inode: &Inode) -> CanFail<FsError> {
        let (block, offset) = self.locate(slot);

        let mut buf = [0u8; BLOCK_SIZE];
        self.store.read_block(block, &mut buf)?;
        buf[offset..offset + core::mem::size_of::<Inode>()]
            .copy_from_slice(bytemuck::bytes_of(inode));

        self.store.write_block(block, &buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::{MemDisk, Partition};

    #[test]
    fn inode_layout_is_exact() {
        assert_eq!(core::mem::size_of::<Inode>(), 128);
        assert_eq!(INODES_PER_BLOCK, 32);
        assert_eq!(POINTERS_PER_BLOCK, 1024);
    }

    #[test]
    fn mode_directory_bit() {
        let dir = FileMode::DIRECTORY | FileMode(0o644);
        assert!(dir.contains(FileMode::DIRECTORY));
        assert!(!FileMode(0o644).contains(FileMode::DIRECTORY));
        assert!(Inode::empty(dir).is_directory());
        assert!(!Inode::empty(FileMode::EMPTY).is_directory());
    }

    #[test]
    fn region_preserves_sibling_slots() {
        let disk = Arc::new(MemDisk::new(256));
        let partition = Partition::new(disk.as_ref(), 0, 256).unwrap();
        let store = Arc::new(BlockStore::new(disk, partition).unwrap());
        let region = InodeRegion::new(store, BlockIndex(0));

        let mut a = Inode::empty(FileMode(0o600));
        a.size = 111;
        let mut b = Inode::empty(FileMode::DIRECTORY);
        b.num_files = 7;

        // Slots 1 and 2 share block 0; slot 33 lands in block 1.
        region.write_inode(SlotIndex(1), &a).unwrap();
        region.write_inode(SlotIndex(2), &b).unwrap();
        region.write_inode(SlotIndex(33), &a).unwrap();

        assert_eq!(region.read_inode(SlotIndex(1)).unwrap(), a);
        assert_eq!(region.read_inode(SlotIndex(2)).unwrap(), b);
        assert_eq!(region.read_inode(SlotIndex(33)).unwrap(), a);
    }
}
