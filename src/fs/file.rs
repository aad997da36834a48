//! File content paths: block-address map arithmetic, copy-on-write writes,
//! reads.
//!
//! Logical block `b` of a file resolves through the inode's address map:
//! `direct[0..15]`, then ten indirect blocks of 1024 pointers, then two
//! double-indirect blocks. The map has no holes: `block_count` logical
//! blocks resolve, everything past holds NULL.
//!
//! Writes never touch live blocks. Every modified data block, every modified
//! indirect block, and the inode itself get fresh allocations; the mutation
//! becomes visible when the log record lands and the inode-location table is
//! repointed. Old blocks stay allocated forever; checkpoints anchor them.

use log::debug;

use crate::errors::{CanFail, FsError, FsResult};
use crate::fs::block::{BlockIndex, BLOCK_SIZE};
use crate::fs::inode::{
    FileMode, Inode, InodeNumber, SlotIndex, NUM_DIRECT, NUM_DOUBLE_INDIRECT, NUM_INDIRECT,
    POINTERS_PER_BLOCK,
};
use crate::fs::journal::{LogOpKind, LogPayload};
use crate::fs::FsState;

/// Logical blocks reachable through the direct pointers.
const DIRECT_SPAN: u32 = NUM_DIRECT as u32;

/// Logical blocks reachable through one indirect pointer.
const PER_INDIRECT: u32 = POINTERS_PER_BLOCK as u32;

/// Logical blocks reachable through one double-indirect pointer.
const PER_DOUBLE: u32 = PER_INDIRECT * PER_INDIRECT;

/// Largest addressable logical block count.
const MAX_BLOCKS: u64 = DIRECT_SPAN as u64
    + NUM_INDIRECT as u64 * PER_INDIRECT as u64
    + NUM_DOUBLE_INDIRECT as u64 * PER_DOUBLE as u64;

/// One index block: 1024 block pointers.
type IndexBlock = [BlockIndex; POINTERS_PER_BLOCK];

/// Where a logical block lives in the address map.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BlockPos {
    Direct(usize),
    Indirect { group: usize, offset: usize },
    Double { outer: usize, inner: usize, offset: usize },
}

fn position(b: u32) -> FsResult<BlockPos> {
    if b < DIRECT_SPAN {
        return Ok(BlockPos::Direct(b as usize));
    }

    let b = b - DIRECT_SPAN;
    if b < NUM_INDIRECT as u32 * PER_INDIRECT {
        return Ok(BlockPos::Indirect {
            group: (b / PER_INDIRECT) as usize,
            offset: (b % PER_INDIRECT) as usize,
        });
    }

    let b = b - NUM_INDIRECT as u32 * PER_INDIRECT;
    if b < NUM_DOUBLE_INDIRECT as u32 * PER_DOUBLE {
        return Ok(BlockPos::Double {
            outer: (b / PER_DOUBLE) as usize,
            inner: (b % PER_DOUBLE / PER_INDIRECT) as usize,
            offset: (b % PER_INDIRECT) as usize,
        });
    }

    Err(FsError::OutOfRange)
}

fn null_index_block() -> IndexBlock {
    [BlockIndex::NULL; POINTERS_PER_BLOCK]
}

fn read_index_block(st: &FsState, block: BlockIndex) -> FsResult<IndexBlock> {
    let mut buf = [0u8; BLOCK_SIZE];
    st.store.read_block(block, &mut buf)?;

    Ok(bytemuck::pod_read_unaligned(&buf))
}

fn write_index_block(st: &FsState, block: BlockIndex, index: &IndexBlock) -> CanFail<FsError> {
    let mut buf = [0u8; BLOCK_SIZE];
    buf.copy_from_slice(bytemuck::cast_slice(&index[..]));

    st.store.write_block(block, &buf)
}

/// Allocates a fresh block from the data region.
pub(crate) fn alloc_data_block(st: &mut FsState) -> FsResult<BlockIndex> {
    let index = st.data_bitmap.allocate()?;

    Ok(st.sb.data_region_start + index)
}

/// Writes `inode` to a fresh slot, logs it, and repoints the table: the
/// copy-on-write inode sequence every mutation ends with.
pub(crate) fn cow_write_inode(
    st: &mut FsState,
    num: InodeNumber,
    inode: &Inode,
    op: LogOpKind,
) -> FsResult<SlotIndex> {
    let slot = SlotIndex(st.inode_bitmap.allocate()?);
    st.region.write_inode(slot, inode)?;
    st.journal
        .append(&mut st.sb, op, LogPayload::inode_at(num, slot))?;
    st.table.set(num, slot)?;

    Ok(slot)
}

/// Allocates a fresh inode number with a zero-filled inode behind it.
pub(crate) fn create_inode(st: &mut FsState, permissions: FileMode) -> FsResult<InodeNumber> {
    let num = st.table.find_free_number()?.ok_or(FsError::Full)?;
    let inode = Inode::empty(permissions);
    let slot = cow_write_inode(st, num, &inode, LogOpKind::INODE_ADD)?;

    debug!(
        target: "glacierfs::file",
        "created inode {num} (mode {:#06x}) at slot {slot}",
        inode.permissions.0
    );

    Ok(num)
}

/// Loads the current copy of inode `num` through the location table.
pub(crate) fn load_inode(st: &FsState, num: InodeNumber) -> FsResult<Inode> {
    let slot = st.table.get(num)?.ok_or(FsError::NotFound)?;

    st.region.read_inode(slot)
}

/// Resolves logical block `b` through the address map, NULL when `b` is past
/// `block_count` or a chain link is absent.
pub(crate) fn block_location(st: &FsState, inode: &Inode, b: u32) -> FsResult<BlockIndex> {
    if b >= inode.block_count {
        return Ok(BlockIndex::NULL);
    }

    match position(b)? {
        BlockPos::Direct(i) => Ok(inode.direct[i]),
        BlockPos::Indirect { group, offset } => {
            let indirect = inode.indirect[group];
            if indirect.is_null() {
                return Ok(BlockIndex::NULL);
            }

            Ok(read_index_block(st, indirect)?[offset])
        }
        BlockPos::Double {
            outer,
            inner,
            offset,
        } => {
            let double = inode.double_indirect[outer];
            if double.is_null() {
                return Ok(BlockIndex::NULL);
            }

            let indirect = read_index_block(st, double)?[inner];
            if indirect.is_null() {
                return Ok(BlockIndex::NULL);
            }

            Ok(read_index_block(st, indirect)?[offset])
        }
    }
}

/// Reads `buf.len()` bytes at `offset`.
///
/// # Errors
///
/// Fails with [`FsError::Invalid`] if the range reaches past the file size
/// or a covered block does not resolve.
pub(crate) fn read_at(
    st: &FsState,
    inode: &Inode,
    offset: u64,
    buf: &mut [u8],
) -> CanFail<FsError> {
    let end = offset
        .checked_add(buf.len() as u64)
        .ok_or(FsError::Invalid)?;
    if end > inode.size {
        return Err(FsError::Invalid);
    }

    let mut cur = offset;
    let mut block = [0u8; BLOCK_SIZE];
    while cur < end {
        let b = (cur / BLOCK_SIZE as u64) as u32;
        let block_off = (cur % BLOCK_SIZE as u64) as usize;
        let n = usize::min(BLOCK_SIZE - block_off, (end - cur) as usize);

        let location = block_location(st, inode, b)?;
        if location.is_null() {
            return Err(FsError::Invalid);
        }
        st.store.read_block(location, &mut block)?;

        let out = (cur - offset) as usize;
        buf[out..out + n].copy_from_slice(&block[block_off..block_off + n]);
        cur += n as u64;
    }

    Ok(())
}

/// Copy-on-writes one whole block of a file: fresh data block, address map
/// repointed (COWing the indirect chain), `block_count` extended when
/// appending.
///
/// The inode is only changed in memory; callers finish with
/// [`cow_write_inode`].
pub(crate) fn cow_update_block(
    st: &mut FsState,
    inode: &mut Inode,
    b: u32,
    contents: &[u8; BLOCK_SIZE],
) -> CanFail<FsError> {
    let new_block = alloc_data_block(st)?;
    st.store.write_block(new_block, contents)?;

    match position(b)? {
        BlockPos::Direct(i) => inode.direct[i] = new_block,
        BlockPos::Indirect { group, offset } => {
            let mut index = if inode.indirect[group].is_null() {
                null_index_block()
            } else {
                read_index_block(st, inode.indirect[group])?
            };
            index[offset] = new_block;

            let fresh = alloc_data_block(st)?;
            write_index_block(st, fresh, &index)?;
            inode.indirect[group] = fresh;
        }
        BlockPos::Double {
            outer,
            inner,
            offset,
        } => {
            let mut outer_index = if inode.double_indirect[outer].is_null() {
                null_index_block()
            } else {
                read_index_block(st, inode.double_indirect[outer])?
            };
            let mut index = if outer_index[inner].is_null() {
                null_index_block()
            } else {
                read_index_block(st, outer_index[inner])?
            };
            index[offset] = new_block;

            let fresh = alloc_data_block(st)?;
            write_index_block(st, fresh, &index)?;
            outer_index[inner] = fresh;

            let fresh_outer = alloc_data_block(st)?;
            write_index_block(st, fresh_outer, &outer_index)?;
            inode.double_indirect[outer] = fresh_outer;
        }
    }

    if b >= inode.block_count {
        inode.block_count = b + 1;
    }

    Ok(())
}

/// The indirect block currently held in memory by the write loop, and where
/// its pointer lives.
struct IndirectCache {
    parent: IndParent,
    buf: IndexBlock,
    dirty: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum IndParent {
    Inode(usize),
    Double { outer: usize, inner: usize },
}

/// The double-indirect block currently held in memory by the write loop.
struct DoubleCache {
    slot: usize,
    buf: IndexBlock,
    dirty: bool,
}

fn flush_indirect(
    st: &mut FsState,
    inode: &mut Inode,
    ind: &mut Option<IndirectCache>,
    dbl: &mut Option<DoubleCache>,
) -> CanFail<FsError> {
    let Some(cache) = ind.take() else {
        return Ok(());
    };
    if !cache.dirty {
        return Ok(());
    }

    let fresh = alloc_data_block(st)?;
    write_index_block(st, fresh, &cache.buf)?;

    match cache.parent {
        IndParent::Inode(group) => inode.indirect[group] = fresh,
        IndParent::Double { inner, .. } => {
            // The owning double-indirect block is always the loaded one.
            let outer = dbl.as_mut().ok_or(FsError::Invalid)?;
            outer.buf[inner] = fresh;
            outer.dirty = true;
        }
    }

    Ok(())
}

fn flush_double(
    st: &mut FsState,
    inode: &mut Inode,
    dbl: &mut Option<DoubleCache>,
) -> CanFail<FsError> {
    let Some(cache) = dbl.take() else {
        return Ok(());
    };
    if !cache.dirty {
        return Ok(());
    }

    let fresh = alloc_data_block(st)?;
    write_index_block(st, fresh, &cache.buf)?;
    inode.double_indirect[cache.slot] = fresh;

    Ok(())
}

/// Makes the indirect cache hold the group covering `pos`, flushing whatever
/// it held before. Direct positions need no cache.
fn ensure_group(
    st: &mut FsState,
    inode: &mut Inode,
    ind: &mut Option<IndirectCache>,
    dbl: &mut Option<DoubleCache>,
    pos: BlockPos,
) -> CanFail<FsError> {
    let target = match pos {
        BlockPos::Direct(_) => return Ok(()),
        BlockPos::Indirect { group, .. } => IndParent::Inode(group),
        BlockPos::Double { outer, inner, .. } => IndParent::Double { outer, inner },
    };

    if ind.as_ref().is_some_and(|c| c.parent == target) {
        return Ok(());
    }
    flush_indirect(st, inode, ind, dbl)?;

    let source = match target {
        IndParent::Inode(group) => inode.indirect[group],
        IndParent::Double { outer, inner } => {
            if dbl.as_ref().map_or(true, |c| c.slot != outer) {
                flush_double(st, inode, dbl)?;
                let buf = if inode.double_indirect[outer].is_null() {
                    null_index_block()
                } else {
                    read_index_block(st, inode.double_indirect[outer])?
                };
                *dbl = Some(DoubleCache {
                    slot: outer,
                    buf,
                    dirty: false,
                });
            }

            dbl.as_ref().map(|c| c.buf[inner]).ok_or(FsError::Invalid)?
        }
    };

    let buf = if source.is_null() {
        null_index_block()
    } else {
        read_index_block(st, source)?
    };
    *ind = Some(IndirectCache {
        parent: target,
        buf,
        dirty: false,
    });

    Ok(())
}

/// Copy-on-write write path.
///
/// Writes `data` at `offset`, allocating fresh blocks for every touched
/// block. Indirect and double-indirect blocks are rewritten once per group
/// the loop passes through, not once per block. Ends with the copy-on-write
/// inode sequence; returns the number of bytes written.
///
/// # Errors
///
/// Fails with [`FsError::Invalid`] if `offset` is past the end of the file
/// (holes are not permitted).
pub(crate) fn write_at(
    st: &mut FsState,
    num: InodeNumber,
    offset: u64,
    data: &[u8],
) -> FsResult<usize> {
    let mut inode = load_inode(st, num)?;

    if offset > inode.size {
        return Err(FsError::Invalid);
    }
    let end = offset
        .checked_add(data.len() as u64)
        .ok_or(FsError::Invalid)?;
    if end.div_ceil(BLOCK_SIZE as u64) > MAX_BLOCKS {
        return Err(FsError::OutOfRange);
    }
    if data.is_empty() {
        return Ok(0);
    }

    let mut ind: Option<IndirectCache> = None;
    let mut dbl: Option<DoubleCache> = None;
    let mut scratch = [0u8; BLOCK_SIZE];

    let mut cur = offset;
    while cur < end {
        let b = (cur / BLOCK_SIZE as u64) as u32;
        let block_off = (cur % BLOCK_SIZE as u64) as usize;
        let n = usize::min(BLOCK_SIZE - block_off, (end - cur) as usize);
        let pos = position(b)?;

        ensure_group(st, &mut inode, &mut ind, &mut dbl, pos)?;

        if b < inode.block_count {
            // COW of an existing block: splice into its current contents.
            let old = match (pos, &ind) {
                (BlockPos::Direct(i), _) => inode.direct[i],
                (BlockPos::Indirect { offset, .. }, Some(cache))
                | (BlockPos::Double { offset, .. }, Some(cache)) => cache.buf[offset],
                _ => BlockIndex::NULL,
            };
            if old.is_null() {
                return Err(FsError::Invalid);
            }
            st.store.read_block(old, &mut scratch)?;
        } else {
            scratch.fill(0);
        }

        let src = (cur - offset) as usize;
        scratch[block_off..block_off + n].copy_from_slice(&data[src..src + n]);

        let new_block = alloc_data_block(st)?;
        st.store.write_block(new_block, &scratch)?;

        match pos {
            BlockPos::Direct(i) => inode.direct[i] = new_block,
            BlockPos::Indirect { offset, .. } | BlockPos::Double { offset, .. } => {
                let cache = ind.as_mut().ok_or(FsError::Invalid)?;
                cache.buf[offset] = new_block;
                cache.dirty = true;
            }
        }

        if b >= inode.block_count {
            inode.block_count = b + 1;
        }
        cur += n as u64;
    }

    flush_indirect(st, &mut inode, &mut ind, &mut dbl)?;
    flush_double(st, &mut inode, &mut dbl)?;

    inode.size = u64::max(inode.size, end);
    cow_write_inode(st, num, &inode, LogOpKind::INODE_UPDATE)?;

    debug!(
        target: "glacierfs::file",
        "wrote {} byte(s) at offset {offset} of inode {num} (size now {})",
        data.len(),
        inode.size
    );

    Ok(data.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::FsState;
    use std::collections::HashSet;

    fn state() -> FsState {
        FsState::format_for_tests(4096)
    }

    #[test]
    fn hello_roundtrip_in_one_block() {
        let mut st = state();
        let num = create_inode(&mut st, FileMode(0o644)).unwrap();

        assert_eq!(write_at(&mut st, num, 0, b"hello\0").unwrap(), 6);

        let inode = load_inode(&st, num).unwrap();
        assert_eq!(inode.size, 6);
        assert_eq!(inode.block_count, 1);

        let mut back = [0u8; 6];
        read_at(&st, &inode, 0, &mut back).unwrap();
        assert_eq!(&back, b"hello\0");
    }

    #[test]
    fn offset_past_size_is_a_hole() {
        let mut st = state();
        let num = create_inode(&mut st, FileMode(0o644)).unwrap();

        assert_eq!(write_at(&mut st, num, 1, b"x"), Err(FsError::Invalid));
    }

    #[test]
    fn read_past_size_is_invalid() {
        let mut st = state();
        let num = create_inode(&mut st, FileMode(0o644)).unwrap();
        write_at(&mut st, num, 0, b"abc").unwrap();

        let inode = load_inode(&st, num).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(read_at(&st, &inode, 0, &mut buf), Err(FsError::Invalid));
        assert_eq!(read_at(&st, &inode, 2, &mut buf[..2]), Err(FsError::Invalid));
    }

    #[test]
    fn large_write_crosses_into_indirect_blocks() {
        let mut st = state();
        let num = create_inode(&mut st, FileMode(0o644)).unwrap();

        let data = vec![b'e'; 20 * BLOCK_SIZE];
        write_at(&mut st, num, 0, &data).unwrap();

        let inode = load_inode(&st, num).unwrap();
        assert_eq!(inode.block_count, 20);
        assert!(!inode.indirect[0].is_null());

        for probe in [0u64, 10 * BLOCK_SIZE as u64, 20 * BLOCK_SIZE as u64 - 2] {
            let mut byte = [0u8; 1];
            read_at(&st, &inode, probe, &mut byte).unwrap();
            assert_eq!(byte[0], b'e');
        }
    }

    #[test]
    fn address_map_resolves_bijectively() {
        let mut st = state();
        let num = create_inode(&mut st, FileMode(0o644)).unwrap();

        write_at(&mut st, num, 0, &vec![7u8; 40 * BLOCK_SIZE]).unwrap();

        let inode = load_inode(&st, num).unwrap();
        let mut seen = HashSet::new();
        for b in 0..inode.block_count {
            let location = block_location(&st, &inode, b).unwrap();
            assert!(!location.is_null(), "logical block {b} unmapped");
            assert!(seen.insert(location), "logical block {b} duplicated");
        }
        assert!(block_location(&st, &inode, inode.block_count)
            .unwrap()
            .is_null());
    }

    #[test]
    fn overwrite_preserves_the_old_inode_copy() {
        let mut st = state();
        let num = create_inode(&mut st, FileMode(0o644)).unwrap();

        write_at(&mut st, num, 0, b"before").unwrap();
        let old_slot = st.table.get(num).unwrap().unwrap();
        let old_inode = st.region.read_inode(old_slot).unwrap();
        let old_block = old_inode.direct[0];

        write_at(&mut st, num, 0, b"AFTER!").unwrap();

        // The superseded slot still resolves to the pre-write contents, and
        // its block's bitmap bit never transitioned back to free.
        let mut back = [0u8; 6];
        read_at(&st, &old_inode, 0, &mut back).unwrap();
        assert_eq!(&back, b"before");
        let old_rel = u32::from(old_block) - u32::from(st.sb.data_region_start);
        assert!(st.data_bitmap.is_set(old_rel).unwrap());
        assert!(st.inode_bitmap.is_set(u32::from(old_slot)).unwrap());

        let new_inode = load_inode(&st, num).unwrap();
        assert_ne!(st.table.get(num).unwrap().unwrap(), old_slot);
        read_at(&st, &new_inode, 0, &mut back).unwrap();
        assert_eq!(&back, b"AFTER!");
    }

    #[test]
    fn partial_overwrite_splices_within_a_block() {
        let mut st = state();
        let num = create_inode(&mut st, FileMode(0o644)).unwrap();

        write_at(&mut st, num, 0, &[b'a'; 100]).unwrap();
        write_at(&mut st, num, 10, &[b'b'; 5]).unwrap();

        let inode = load_inode(&st, num).unwrap();
        assert_eq!(inode.size, 100);

        let mut back = [0u8; 100];
        read_at(&st, &inode, 0, &mut back).unwrap();
        assert_eq!(&back[..10], &[b'a'; 10]);
        assert_eq!(&back[10..15], &[b'b'; 5]);
        assert_eq!(&back[15..], &[b'a'; 85]);
    }

    #[test]
    fn append_at_exact_size_extends() {
        let mut st = state();
        let num = create_inode(&mut st, FileMode(0o644)).unwrap();

        write_at(&mut st, num, 0, b"abc").unwrap();
        write_at(&mut st, num, 3, b"def").unwrap();

        let inode = load_inode(&st, num).unwrap();
        let mut back = [0u8; 6];
        read_at(&st, &inode, 0, &mut back).unwrap();
        assert_eq!(&back, b"abcdef");
    }

    #[test]
    fn single_block_cow_update_repoints_indirects() {
        let mut st = state();
        let num = create_inode(&mut st, FileMode(0o644)).unwrap();

        // 16 blocks: the last one sits in indirect group 0.
        write_at(&mut st, num, 0, &vec![1u8; 16 * BLOCK_SIZE]).unwrap();
        let mut inode = load_inode(&st, num).unwrap();
        let old_indirect = inode.indirect[0];
        let old_block = block_location(&st, &inode, 15).unwrap();

        cow_update_block(&mut st, &mut inode, 15, &[9u8; BLOCK_SIZE]).unwrap();

        assert_ne!(inode.indirect[0], old_indirect);
        let relocated = block_location(&st, &inode, 15).unwrap();
        assert_ne!(relocated, old_block);

        let mut back = [0u8; BLOCK_SIZE];
        st.store.read_block(relocated, &mut back).unwrap();
        assert_eq!(back, [9u8; BLOCK_SIZE]);
        // The old block still holds the pre-update bytes.
        st.store.read_block(old_block, &mut back).unwrap();
        assert_eq!(back, [1u8; BLOCK_SIZE]);
    }
}
