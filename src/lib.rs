//! glacierfs: a copy-on-write, log-structured file system core.
//!
//! The engine runs over any partitioned block device exposing a blocking
//! sector interface ([`DiskDriver`]) and manages an inode-based namespace in
//! 4096-byte blocks. Every mutation is copy-on-write: data blocks, indirect
//! blocks and inodes are never overwritten in place, a log record publishes
//! each change, and checkpoints freeze the inode-location table so any past
//! checkpoint can be mounted again as a read-only snapshot, or replayed
//! forward to recover the live state after a crash.
//!
//! ```no_run
//! use std::sync::Arc;
//! use glacierfs::{FileMode, FileSystem, MemDisk, Partition};
//!
//! # fn main() -> Result<(), glacierfs::FsError> {
//! let disk = Arc::new(MemDisk::new(8192));
//! let partition = Partition::new(disk.as_ref(), 0, 8192)?;
//! let fs = FileSystem::mount(disk, partition)?;
//!
//! let f = fs.create(fs.root_dir(), "hello.txt", false, FileMode(0o644))?;
//! fs.write(f, 0, b"hello\0")?;
//!
//! let checkpoint = fs.create_checkpoint()?;
//! fs.mount_snapshot(checkpoint)?; // read-only view of this moment
//! # Ok(())
//! # }
//! ```

pub mod drivers;
pub mod errors;
pub mod fs;
pub mod time;

pub use drivers::{DiskDriver, MemDisk, Partition};
pub use errors::{CanFail, FsError, FsResult};
pub use fs::block::{BlockIndex, BLOCK_SIZE};
pub use fs::inode::{FileMode, InodeNumber};
pub use fs::{CheckpointId, CheckpointInfo, DirEntryInfo, FileStat, FileSystem, MountOptions};
pub use time::{Clock, SystemClock};

/// Derives [`core::fmt::Display`] for tuple structs wrapping a single
/// unsigned field.
#[macro_export]
macro_rules! uint_display {
    ($struct_name: tt) => {
        impl core::fmt::Display for $struct_name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_fmt(format_args!("{}", self.0))
            }
        }
    };
}
