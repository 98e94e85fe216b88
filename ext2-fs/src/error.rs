use thiserror::Error;

/// Failure reported by a block device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeviceError {
    /// The requested unit lies past the end of the device
    #[error("unit {0} is out of device range")]
    OutOfRange(usize),
    /// The device could not complete a read
    #[error("device read failed")]
    Read,
    /// The device could not complete a write
    #[error("device write failed")]
    Write,
    /// The device could not flush its caches
    #[error("device sync failed")]
    Sync,
}

/// Errors returned by the filesystem engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Ext2Error {
    /// No free block or inode is left on the volume
    #[error("no space left on volume")]
    NoSpace,
    /// A fixed-size pool (buffers, pages or inodes) is exhausted
    #[error("out of memory in a fixed pool")]
    NoMemory,
    /// A name is longer than a directory entry can hold
    #[error("file name too long")]
    NameTooLong,
    /// A path component does not exist
    #[error("no such file or directory")]
    NotFound,
    /// A directory operation was applied to a non-directory
    #[error("not a directory")]
    NotDir,
    /// A file operation was applied to a directory
    #[error("is a directory")]
    IsDir,
    /// The name already exists in the directory
    #[error("file exists")]
    Exists,
    /// The directory still has entries besides `.` and `..`
    #[error("directory not empty")]
    NotEmpty,
    /// An index or size lies outside what the format can address
    #[error("value out of range")]
    OutOfRange,
    /// A caller passed an argument the operation can't accept
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// The superblock does not carry the ext2 magic number
    #[error("not an ext2 volume")]
    BadMagic,
    /// The volume uses a feature or layout this engine does not support
    #[error("unsupported volume: {0}")]
    Unsupported(&'static str),
    /// The mount is read-only
    #[error("read-only filesystem")]
    ReadOnly,
    /// On-disk state is inconsistent
    #[error("filesystem corrupted: {0}")]
    Corrupted(&'static str),
    /// A buffer or inode handle no longer refers to a live slot
    #[error("stale handle")]
    StaleHandle,
    /// The device is already mounted or inodes are still open
    #[error("resource busy")]
    Busy,
    /// The filesystem has been unmounted
    #[error("filesystem not mounted")]
    NotMounted,
    /// The block device failed
    #[error("I/O error: {0}")]
    Device(#[from] DeviceError),
}

/// Result type used across the crate
pub type Result<T> = core::result::Result<T, Ext2Error>;
