//! Directory entry layout and operations.
//!
//! A directory is an ordinary file whose blocks hold packed 256-byte
//! entries. The inode's `num_files` says how many entries are live; they are
//! kept dense, so removal swaps the last entry into the vacated slot and
//! storage order is not preserved. Directory-ness itself is just the mode
//! word's directory bit; there is no separate directory inode type.

use bytemuck::{Pod, Zeroable};

use crate::errors::{CanFail, FsError, FsResult};
use crate::fs::block::BLOCK_SIZE;
use crate::fs::file;
use crate::fs::inode::{Inode, InodeNumber};
use crate::fs::journal::{LogOpKind, LogPayload};
use crate::fs::FsState;

/// Bytes reserved for an entry name, including the NUL terminator.
pub const NAME_FIELD_LEN: usize = 252;

/// Longest permitted name.
pub const MAX_NAME_LEN: usize = NAME_FIELD_LEN - 1;

/// Entries packed into one directory block.
pub const DIR_ENTRIES_PER_BLOCK: usize = BLOCK_SIZE / core::mem::size_of::<DirEntry>();

/// One on-disk directory entry: an inode number and a NUL-terminated name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct DirEntry {
    pub inode_num: InodeNumber,
    pub name: [u8; NAME_FIELD_LEN],
}

const _: () = assert!(core::mem::size_of::<DirEntry>() == 256);

/// Rejects names an entry cannot hold: empty, over [`MAX_NAME_LEN`] bytes,
/// or containing NUL.
pub(crate) fn validate_name(name: &str) -> CanFail<FsError> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() > MAX_NAME_LEN || bytes.contains(&0) {
        return Err(FsError::Invalid);
    }

    Ok(())
}

impl DirEntry {
    fn named(name: &str, inode_num: InodeNumber) -> FsResult<Self> {
        validate_name(name)?;

        let mut field = [0u8; NAME_FIELD_LEN];
        let bytes = name.as_bytes();
        field[..bytes.len()].copy_from_slice(bytes);

        Ok(Self { inode_num, name: field })
    }

    fn matches(&self, name: &str) -> bool {
        let stored = self.name_bytes();
        stored == name.as_bytes()
    }

    fn name_bytes(&self) -> &[u8] {
        let end = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(NAME_FIELD_LEN);
        &self.name[..end]
    }
}

/// One listed entry, as handed back by [`crate::fs::FileSystem::read_dir`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntryInfo {
    pub name: String,
    pub inode_num: InodeNumber,
}

type DirBlock = [DirEntry; DIR_ENTRIES_PER_BLOCK];

fn load_dir_inode(st: &FsState, dir: InodeNumber) -> FsResult<Inode> {
    let inode = file::load_inode(st, dir)?;
    if !inode.is_directory() {
        return Err(FsError::NotDirectory);
    }

    Ok(inode)
}

fn read_dir_block(st: &FsState, inode: &Inode, b: u32) -> FsResult<DirBlock> {
    let location = file::block_location(st, inode, b)?;
    if location.is_null() {
        return Err(FsError::Invalid);
    }

    let mut buf = [0u8; BLOCK_SIZE];
    st.store.read_block(location, &mut buf)?;

    Ok(bytemuck::pod_read_unaligned(&buf))
}

fn serialize(block: &DirBlock) -> [u8; BLOCK_SIZE] {
    let mut buf = [0u8; BLOCK_SIZE];
    buf.copy_from_slice(bytemuck::cast_slice(&block[..]));
    buf
}

/// Number of blocks holding live entries.
fn live_blocks(inode: &Inode) -> u32 {
    u32::from(inode.num_files).div_ceil(DIR_ENTRIES_PER_BLOCK as u32)
}

/// Entries live in block `b`.
fn live_entries_in(inode: &Inode, b: u32) -> usize {
    let total = u32::from(inode.num_files);
    let before = b * DIR_ENTRIES_PER_BLOCK as u32;
    usize::min(
        DIR_ENTRIES_PER_BLOCK,
        total.saturating_sub(before) as usize,
    )
}

fn find_entry(
    st: &FsState,
    inode: &Inode,
    name: &str,
) -> FsResult<Option<(u32, usize, InodeNumber)>> {
    for b in 0..live_blocks(inode) {
        let block = read_dir_block(st, inode, b)?;
        for (i, entry) in block[..live_entries_in(inode, b)].iter().enumerate() {
            if entry.matches(name) {
                return Ok(Some((b, i, entry.inode_num)));
            }
        }
    }

    Ok(None)
}

/// Scans the directory for `name`, first match wins.
pub(crate) fn lookup(st: &FsState, dir: InodeNumber, name: &str) -> FsResult<Option<InodeNumber>> {
    let inode = load_dir_inode(st, dir)?;

    Ok(find_entry(st, &inode, name)?.map(|(_, _, child)| child))
}

/// Appends an entry for `child` under `name`.
///
/// The entry lands at `num_files % 16` of the last directory block, opening
/// a fresh block when that offset is zero. One copy-on-write inode sequence
/// publishes the whole mutation.
pub(crate) fn add_entry(
    st: &mut FsState,
    dir: InodeNumber,
    name: &str,
    child: InodeNumber,
) -> CanFail<FsError> {
    let mut inode = load_dir_inode(st, dir)?;
    let entry = DirEntry::named(name, child)?;

    if find_entry(st, &inode, name)?.is_some() {
        return Err(FsError::Exists);
    }
    if inode.num_files == u16::MAX {
        return Err(FsError::Full);
    }

    let offset = inode.num_files as usize % DIR_ENTRIES_PER_BLOCK;
    let b = u32::from(inode.num_files) / DIR_ENTRIES_PER_BLOCK as u32;

    let mut block: DirBlock = if offset == 0 {
        Zeroable::zeroed()
    } else {
        read_dir_block(st, &inode, b)?
    };
    block[offset] = entry;

    file::cow_update_block(st, &mut inode, b, &serialize(&block))?;
    inode.num_files += 1;
    inode.size = u64::from(inode.block_count) * BLOCK_SIZE as u64;
    file::cow_write_inode(st, dir, &inode, LogOpKind::INODE_UPDATE)?;

    Ok(())
}

/// Removes the entry for `name`, logging an `INODE_DELETE` for the inode it
/// referenced and keeping the entry array dense.
pub(crate) fn remove_entry(st: &mut FsState, dir: InodeNumber, name: &str) -> CanFail<FsError> {
    let mut inode = load_dir_inode(st, dir)?;

    let (b, index, child) = find_entry(st, &inode, name)?.ok_or(FsError::NotFound)?;

    st.journal
        .append(&mut st.sb, LogOpKind::INODE_DELETE, LogPayload::inode_only(child))?;
    st.table.clear(child)?;

    let last = u32::from(inode.num_files) - 1;
    let last_b = last / DIR_ENTRIES_PER_BLOCK as u32;
    let last_index = last as usize % DIR_ENTRIES_PER_BLOCK;

    if (b, index) == (last_b, last_index) {
        let mut block = read_dir_block(st, &inode, b)?;
        block[index] = Zeroable::zeroed();
        file::cow_update_block(st, &mut inode, b, &serialize(&block))?;
    } else if b == last_b {
        let mut block = read_dir_block(st, &inode, b)?;
        block[index] = block[last_index];
        block[last_index] = Zeroable::zeroed();
        file::cow_update_block(st, &mut inode, b, &serialize(&block))?;
    } else {
        let mut block = read_dir_block(st, &inode, b)?;
        let mut last_block = read_dir_block(st, &inode, last_b)?;
        block[index] = last_block[last_index];
        last_block[last_index] = Zeroable::zeroed();
        file::cow_update_block(st, &mut inode, b, &serialize(&block))?;
        file::cow_update_block(st, &mut inode, last_b, &serialize(&last_block))?;
    }

    inode.num_files -= 1;
    file::cow_write_inode(st, dir, &inode, LogOpKind::INODE_UPDATE)?;

    Ok(())
}

/// Lists every live entry in storage order.
pub(crate) fn list(st: &FsState, dir: InodeNumber) -> FsResult<Vec<DirEntryInfo>> {
    let inode = load_dir_inode(st, dir)?;

    let mut entries = Vec::with_capacity(usize::from(inode.num_files));
    for b in 0..live_blocks(&inode) {
        let block = read_dir_block(st, &inode, b)?;
        for entry in &block[..live_entries_in(&inode, b)] {
            entries.push(DirEntryInfo {
                name: String::from_utf8_lossy(entry.name_bytes()).into_owned(),
                inode_num: entry.inode_num,
            });
        }
    }

    Ok(entries)
}
