//! The file system core.
//!
//! [`FileSystem`] owns the block store, both allocation bitmaps, the
//! inode-location table, the inode region and the journal, and exposes the
//! request surface callers talk to. On construction it probes block 0:
//! a matching superblock magic triggers crash recovery, anything else
//! triggers a format.
//!
//! Concurrency model: one mutation lock guards all mutable state. It is
//! coarse on purpose: every mutation already serializes on the journal, so
//! the same lock serves as the journal lock, and reads take it too because
//! they resolve through the inode-location table. Snapshot tables are
//! immutable after construction and never touch the disk.

use std::sync::Arc;

use log::info;
use spin::Mutex;

use crate::drivers::{DiskDriver, Partition};
use crate::errors::{CanFail, FsError, FsResult};
use crate::time::{Clock, SystemClock};

pub mod bitmap;
pub mod block;
pub mod dir;
pub mod file;
pub mod inode;
pub mod itable;
pub mod journal;
pub mod sb;

pub use self::dir::DirEntryInfo;
pub use self::journal::CheckpointInfo;
pub use self::sb::CheckpointId;

use self::bitmap::Bitmap;
use self::block::BlockStore;
use self::dir as dir_ops;
use self::inode::{FileMode, InodeNumber, InodeRegion};
use self::itable::InodeLocTable;
use self::journal::Journal;
use self::sb::Superblock;

/// Default number of blocks reserved for the log area at format time.
pub const DEFAULT_LOG_BLOCKS: u32 = 64;

/// Mount-time knobs.
///
/// `log_blocks` only matters when the mount formats a fresh partition; an
/// existing file system keeps the log area it was formatted with.
pub struct MountOptions {
    pub log_blocks: u32,
    pub clock: Arc<dyn Clock>,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            log_blocks: DEFAULT_LOG_BLOCKS,
            clock: Arc::new(SystemClock),
        }
    }
}

/// Everything behind the mutation lock.
pub(crate) struct FsState {
    pub(crate) store: Arc<BlockStore>,
    pub(crate) sb: Superblock,
    pub(crate) inode_bitmap: Bitmap,
    pub(crate) data_bitmap: Bitmap,
    pub(crate) table: InodeLocTable,
    pub(crate) region: InodeRegion,
    pub(crate) journal: Journal,
}

impl FsState {
    fn bitmaps_and_region(store: &Arc<BlockStore>, sb: &Superblock) -> (Bitmap, Bitmap, InodeRegion) {
        let inode_bitmap = Bitmap::new(
            store.clone(),
            sb.inode_bitmap_start,
            sb.inode_bitmap_blocks,
            sb.inode_count,
        );
        let data_bitmap = Bitmap::new(
            store.clone(),
            sb.data_bitmap_start,
            sb.data_bitmap_blocks,
            sb.data_blocks,
        );
        let region = InodeRegion::new(store.clone(), sb.inode_region_start);

        (inode_bitmap, data_bitmap, region)
    }

    /// Formats the partition and builds the initial state: zeroed bitmaps, a
    /// NULL-initialized table, the root directory at inode 0, and the
    /// anchoring checkpoint every later mount recovers from.
    pub(crate) fn format(
        store: Arc<BlockStore>,
        clock: Arc<dyn Clock>,
        log_blocks: u32,
    ) -> FsResult<Self> {
        let sb = Superblock::format_layout(store.block_count(), log_blocks)?;
        info!(
            target: "glacierfs::fs",
            "formatting: {} total blocks, {} inodes, {} data blocks, {}-block log",
            sb.total_blocks, sb.inode_count, sb.data_blocks, sb.log_blocks
        );

        let (inode_bitmap, data_bitmap, region) = Self::bitmaps_and_region(&store, &sb);
        inode_bitmap.initialize()?;
        data_bitmap.initialize()?;
        InodeLocTable::initialize(&store, sb.table_start, sb.table_blocks)?;
        sb.write_to(&store)?;

        let table = InodeLocTable::live(store.clone(), sb.table_start, sb.inode_count);
        let journal = Journal::fresh(store.clone(), clock, &sb);

        let mut state = Self {
            store,
            sb,
            inode_bitmap,
            data_bitmap,
            table,
            region,
            journal,
        };

        let root = file::create_inode(&mut state, FileMode::DIRECTORY)?;
        if root != InodeNumber::ROOT {
            return Err(FsError::Invalid);
        }
        state
            .journal
            .create_checkpoint(&mut state.sb, &state.table, &state.data_bitmap)?;

        Ok(state)
    }

    /// Opens an existing file system: replays the log over the latest
    /// checkpoint and clears the read-only flag.
    pub(crate) fn open(
        store: Arc<BlockStore>,
        clock: Arc<dyn Clock>,
        sb: Superblock,
    ) -> FsResult<Self> {
        let (inode_bitmap, data_bitmap, region) = Self::bitmaps_and_region(&store, &sb);
        let journal = Journal::open(store.clone(), clock, &sb)?;

        let mut table = InodeLocTable::live(store.clone(), sb.table_start, sb.inode_count);
        journal.recover(&sb, &mut table)?;

        let mut state = Self {
            store,
            sb,
            inode_bitmap,
            data_bitmap,
            table,
            region,
            journal,
        };
        state.sb.set_read_only(false);
        state.sb.write_to(&state.store)?;

        Ok(state)
    }

    fn ensure_writable(&self) -> CanFail<FsError> {
        if self.sb.is_read_only() {
            return Err(FsError::ReadOnly);
        }

        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn format_for_tests(num_blocks: u32) -> Self {
        use crate::drivers::MemDisk;

        let sectors = u64::from(num_blocks) * (block::BLOCK_SIZE as u64 / 512);
        let disk = Arc::new(MemDisk::new(sectors));
        let partition = Partition::new(disk.as_ref(), 0, sectors).unwrap();
        let store = Arc::new(BlockStore::new(disk, partition).unwrap());

        Self::format(store, Arc::new(SystemClock), DEFAULT_LOG_BLOCKS).unwrap()
    }
}

/// Splits and normalizes a path: empty components and `.` vanish, `..` pops
/// one accumulated component.
fn normalize_path(path: &str) -> FsResult<Vec<&str>> {
    if !path.starts_with('/') || path.contains('\0') {
        return Err(FsError::Invalid);
    }

    let mut components = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                components.pop();
            }
            name => components.push(name),
        }
    }

    Ok(components)
}

/// Metadata snapshot of one inode, as returned by [`FileSystem::stat`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    pub block_count: u32,
    pub permissions: FileMode,
    pub uid: u16,
    pub gid: u16,
    /// Live directory entries; zero for regular files.
    pub num_files: u16,
}

/// A mounted glacierfs instance.
///
/// All request methods take `&self`; internal state sits behind the mutation
/// lock, so a `FileSystem` can be shared across threads in an `Arc`.
pub struct FileSystem {
    state: Mutex<FsState>,
    clock: Arc<dyn Clock>,
}

impl FileSystem {
    /// Mounts (or formats) the file system on `partition` with default
    /// options.
    pub fn mount(disk: Arc<dyn DiskDriver>, partition: Partition) -> FsResult<Self> {
        Self::mount_with(disk, partition, MountOptions::default())
    }

    /// Mounts (or formats) with explicit [`MountOptions`].
    pub fn mount_with(
        disk: Arc<dyn DiskDriver>,
        partition: Partition,
        options: MountOptions,
    ) -> FsResult<Self> {
        let store = Arc::new(BlockStore::new(disk, partition)?);

        let state = match Superblock::probe(&store)? {
            Some(sb) => {
                info!(
                    target: "glacierfs::fs",
                    "existing file system: {} total blocks, {} inodes, sequence {}",
                    sb.total_blocks, sb.inode_count, sb.latest_log_seq
                );
                FsState::open(store, options.clock.clone(), sb)?
            }
            None => FsState::format(store, options.clock.clone(), options.log_blocks)?,
        };

        Ok(Self {
            state: Mutex::new(state),
            clock: options.clock,
        })
    }

    /// The root directory's inode number.
    pub fn root_dir(&self) -> InodeNumber {
        InodeNumber::ROOT
    }

    /// Whether a snapshot is currently mounted.
    pub fn is_read_only(&self) -> bool {
        self.state.lock().sb.is_read_only()
    }

    /// Creates a file or directory under `parent` and returns its inode
    /// number.
    pub fn create(
        &self,
        parent: InodeNumber,
        name: &str,
        is_dir: bool,
        permissions: FileMode,
    ) -> FsResult<InodeNumber> {
        let state = &mut *self.state.lock();
        state.ensure_writable()?;

        // The name must be known-good before the inode exists.
        dir_ops::validate_name(name)?;
        if dir_ops::lookup(state, parent, name)?.is_some() {
            return Err(FsError::Exists);
        }

        let mode = if is_dir {
            permissions | FileMode::DIRECTORY
        } else {
            FileMode(permissions.0 & !FileMode::DIRECTORY.0)
        };
        let num = file::create_inode(state, mode)?;
        dir_ops::add_entry(state, parent, name, num)?;

        Ok(num)
    }

    /// Links an existing inode under `parent` as `name`.
    pub fn add_dir_entry(
        &self,
        parent: InodeNumber,
        name: &str,
        child: InodeNumber,
    ) -> CanFail<FsError> {
        let state = &mut *self.state.lock();
        state.ensure_writable()?;

        dir_ops::add_entry(state, parent, name, child)
    }

    /// Removes the entry `name` from `parent`.
    pub fn remove(&self, parent: InodeNumber, name: &str) -> CanFail<FsError> {
        let state = &mut *self.state.lock();
        state.ensure_writable()?;

        dir_ops::remove_entry(state, parent, name)
    }

    /// Lists a directory in storage order.
    pub fn read_dir(&self, dir: InodeNumber) -> FsResult<Vec<DirEntryInfo>> {
        let state = &*self.state.lock();

        dir_ops::list(state, dir)
    }

    /// Resolves a `/`-separated path to an inode number and its mode word.
    pub fn open(&self, path: &str) -> FsResult<(InodeNumber, FileMode)> {
        let state = &*self.state.lock();

        let mut current = InodeNumber::ROOT;
        for component in normalize_path(path)? {
            current = dir_ops::lookup(state, current, component)
                .map_err(|e| match e {
                    // A path walking through a regular file simply misses.
                    FsError::NotDirectory => FsError::NotFound,
                    other => other,
                })?
                .ok_or(FsError::NotFound)?;
        }

        let inode = file::load_inode(state, current)?;
        Ok((current, inode.permissions))
    }

    /// Writes `data` at `offset` of `inode`, returning the bytes written.
    pub fn write(&self, inode: InodeNumber, offset: u64, data: &[u8]) -> FsResult<usize> {
        let state = &mut *self.state.lock();
        state.ensure_writable()?;

        file::write_at(state, inode, offset, data)
    }

    /// Reads `buf.len()` bytes at `offset` of `inode`, returning the bytes
    /// read.
    pub fn read(&self, inode: InodeNumber, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        let state = &*self.state.lock();

        let node = file::load_inode(state, inode)?;
        file::read_at(state, &node, offset, buf)?;

        Ok(buf.len())
    }

    /// Reads the metadata of `inode`.
    pub fn stat(&self, inode: InodeNumber) -> FsResult<FileStat> {
        let state = &*self.state.lock();

        let node = file::load_inode(state, inode)?;
        Ok(FileStat {
            size: node.size,
            block_count: node.block_count,
            permissions: node.permissions,
            uid: node.uid,
            gid: node.gid,
            num_files: if node.is_directory() { node.num_files } else { 0 },
        })
    }

    /// Freezes the current inode-location table into a new checkpoint.
    pub fn create_checkpoint(&self) -> FsResult<CheckpointId> {
        let state = &mut *self.state.lock();
        state.ensure_writable()?;

        state
            .journal
            .create_checkpoint(&mut state.sb, &state.table, &state.data_bitmap)
    }

    /// Lists every checkpoint in creation order.
    pub fn checkpoints(&self) -> FsResult<Vec<CheckpointInfo>> {
        let state = &*self.state.lock();

        state.journal.checkpoints(&state.sb)
    }

    /// Switches to the read-only view captured by checkpoint `id`.
    ///
    /// [`CheckpointId::LIVE`] (id 0) returns to the live state by
    /// re-running recovery over the on-disk superblock.
    pub fn mount_snapshot(&self, id: CheckpointId) -> CanFail<FsError> {
        let state = &mut *self.state.lock();

        if id == CheckpointId::LIVE {
            let sb = Superblock::probe(&state.store)?.ok_or(FsError::Invalid)?;
            let journal = Journal::open(state.store.clone(), self.clock.clone(), &sb)?;
            let mut table =
                InodeLocTable::live(state.store.clone(), sb.table_start, sb.inode_count);
            journal.recover(&sb, &mut table)?;

            state.sb = sb;
            state.sb.set_read_only(false);
            state.sb.write_to(&state.store)?;
            state.table = table;
            state.journal = journal;

            info!(target: "glacierfs::fs", "returned to the live state");
        } else {
            let table = state.journal.build_snapshot_table(&state.sb, id)?;

            state.table = table;
            state.sb.set_read_only(true);
            state.sb.write_to(&state.store)?;

            info!(target: "glacierfs::fs", "mounted read-only snapshot of checkpoint {id}");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::MemDisk;

    fn mounted(num_blocks: u64) -> FileSystem {
        let sectors = num_blocks * 8;
        let disk = Arc::new(MemDisk::new(sectors));
        let partition = Partition::new(disk.as_ref(), 0, sectors).unwrap();
        FileSystem::mount(disk, partition).unwrap()
    }

    #[test]
    fn normalize_path_components() {
        assert_eq!(normalize_path("/").unwrap(), Vec::<&str>::new());
        assert_eq!(normalize_path("/a/b/c").unwrap(), vec!["a", "b", "c"]);
        assert_eq!(normalize_path("//a//b/").unwrap(), vec!["a", "b"]);
        assert_eq!(normalize_path("/a/./b").unwrap(), vec!["a", "b"]);
        assert_eq!(normalize_path("/a/../b").unwrap(), vec!["b"]);
        assert_eq!(normalize_path("/..").unwrap(), Vec::<&str>::new());
        assert_eq!(normalize_path("relative"), Err(FsError::Invalid));
        assert_eq!(normalize_path("/nul\0led"), Err(FsError::Invalid));
    }

    #[test]
    fn fresh_mount_creates_root_and_first_checkpoint() {
        let fs = mounted(1024);

        assert_eq!(fs.root_dir(), InodeNumber::ROOT);
        assert!(!fs.is_read_only());
        assert!(fs.read_dir(fs.root_dir()).unwrap().is_empty());

        let checkpoints = fs.checkpoints().unwrap();
        assert_eq!(checkpoints.len(), 1);
        assert_eq!(checkpoints[0].id, CheckpointId(1));
    }

    #[test]
    fn create_open_and_nested_paths() {
        let fs = mounted(1024);
        let root = fs.root_dir();

        let sub = fs.create(root, "sub", true, FileMode(0o755)).unwrap();
        let f = fs.create(sub, "leaf", false, FileMode(0o644)).unwrap();

        let (found, mode) = fs.open("/sub/leaf").unwrap();
        assert_eq!(found, f);
        assert!(!mode.contains(FileMode::DIRECTORY));

        let (found_dir, dir_mode) = fs.open("/sub").unwrap();
        assert_eq!(found_dir, sub);
        assert!(dir_mode.contains(FileMode::DIRECTORY));

        assert_eq!(fs.open("/sub/../sub/./leaf").unwrap().0, f);
        assert_eq!(fs.open("/").unwrap().0, root);
        assert_eq!(fs.open("/missing"), Err(FsError::NotFound));
        // Walking through a regular file misses.
        assert_eq!(fs.open("/sub/leaf/deeper"), Err(FsError::NotFound));
    }

    #[test]
    fn create_refuses_duplicates() {
        let fs = mounted(1024);
        let root = fs.root_dir();

        fs.create(root, "x", false, FileMode(0o644)).unwrap();
        assert_eq!(
            fs.create(root, "x", false, FileMode(0o644)),
            Err(FsError::Exists)
        );
    }

    #[test]
    fn directory_bit_follows_is_dir_flag() {
        let fs = mounted(1024);
        let root = fs.root_dir();

        // A sneaky directory bit in the permissions of a file is stripped.
        fs.create(root, "f", false, FileMode::DIRECTORY).unwrap();
        let (_, mode) = fs.open("/f").unwrap();
        assert!(!mode.contains(FileMode::DIRECTORY));

        fs.create(root, "d", true, FileMode(0o700)).unwrap();
        let (_, mode) = fs.open("/d").unwrap();
        assert!(mode.contains(FileMode::DIRECTORY));
    }

    #[test]
    fn read_dir_on_file_is_not_directory() {
        let fs = mounted(1024);
        let f = fs
            .create(fs.root_dir(), "plain", false, FileMode(0o644))
            .unwrap();

        assert_eq!(fs.read_dir(f), Err(FsError::NotDirectory));
    }

    #[test]
    fn snapshot_mount_blocks_mutations() {
        let fs = mounted(1024);
        let root = fs.root_dir();
        let f = fs.create(root, "f", false, FileMode(0o644)).unwrap();
        fs.write(f, 0, b"data").unwrap();

        let id = fs.create_checkpoint().unwrap();
        fs.mount_snapshot(id).unwrap();
        assert!(fs.is_read_only());

        assert_eq!(
            fs.create(root, "g", false, FileMode(0o644)),
            Err(FsError::ReadOnly)
        );
        assert_eq!(fs.write(f, 0, b"nope"), Err(FsError::ReadOnly));
        assert_eq!(fs.remove(root, "f"), Err(FsError::ReadOnly));
        assert_eq!(fs.create_checkpoint(), Err(FsError::ReadOnly));
        // Reads still work.
        let mut buf = [0u8; 4];
        fs.read(f, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"data");

        fs.mount_snapshot(CheckpointId::LIVE).unwrap();
        assert!(!fs.is_read_only());
        fs.write(f, 0, b"livE").unwrap();
    }

    #[test]
    fn unknown_snapshot_id_misses() {
        let fs = mounted(1024);

        assert_eq!(
            fs.mount_snapshot(CheckpointId(42)),
            Err(FsError::NotFound)
        );
    }
}
