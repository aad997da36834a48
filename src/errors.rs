//! Error types shared across the crate.
//!
//! Every persistence function returns a [`FsResult`]; failures propagate with
//! `?` up to the [`crate::fs::FileSystem`] boundary, which is where they
//! become visible to callers.

use core::fmt;

/// `CanFail` is a return type for functions that are allowed to fail, and
/// don't need to return anything.
///
/// Most low-level block and bitmap operations use it: a successful write has
/// nothing to say.
pub type CanFail<E> = Result<(), E>;

/// Standard result alias over [`FsError`].
pub type FsResult<T> = Result<T, FsError>;

/// `FsError` covers every failure the engine can surface.
///
/// The first group comes from the storage stack, the second from namespace
/// operations, the last two from the snapshot / recovery machinery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FsError {
    /// The underlying disk driver failed.
    Io,

    /// A block or inode index fell outside the device or a region bound.
    OutOfRange,

    /// Directory lookup, path resolution or checkpoint-id lookup missed.
    NotFound,

    /// A create would overwrite an existing directory entry.
    Exists,

    /// An allocation bitmap, the log area, or the checkpoint directory is
    /// exhausted.
    Full,

    /// Bad offset, corrupt structure or magic mismatch.
    Invalid,

    /// A directory operation was issued against a regular file.
    NotDirectory,

    /// A mutation was issued against a snapshot-mounted file system.
    ReadOnly,

    /// A log record with a bad magic or an unknown op type was met during
    /// recovery.
    CorruptLog,
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            FsError::Io => "disk driver I/O failure",
            FsError::OutOfRange => "block or inode index out of range",
            FsError::NotFound => "entry not found",
            FsError::Exists => "entry already exists",
            FsError::Full => "storage exhausted",
            FsError::Invalid => "invalid argument or corrupt structure",
            FsError::NotDirectory => "not a directory",
            FsError::ReadOnly => "file system is mounted read-only",
            FsError::CorruptLog => "corrupt log record",
        };

        f.write_str(msg)
    }
}

impl std::error::Error for FsError {}
