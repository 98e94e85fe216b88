use crate::ErrorPolicy;

/// Default number of inodes that can be open at once
pub const INODE_POOL_SIZE: usize = 16;
/// Default number of block buffers in the pool
///
/// Every open inode may hold one buffer per indirection level, the cached
/// block group holds four more.
pub const BLOCK_POOL_SIZE: usize = INODE_POOL_SIZE * 4 + 8;
/// Default number of pages cached when the device writes in pages
///
/// A held buffer pins the page under it, so every buffer the inode pool and
/// the cached group can hold at once may need a page of its own.
pub const PAGE_POOL_SIZE: usize = BLOCK_POOL_SIZE;

/// Parameters of a mount
#[derive(Debug, Clone, Copy)]
pub struct MountOptions {
    /// Capacity of the block buffer pool
    pub block_buffers: usize,
    /// Capacity of the page cache, unused by the direct transport
    pub pages: usize,
    /// Capacity of the inode pool
    pub inodes: usize,
    /// Refuse every mutation
    pub read_only: bool,
    /// Overrides the error policy stored in the superblock
    pub errors: Option<ErrorPolicy>,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            block_buffers: BLOCK_POOL_SIZE,
            pages: PAGE_POOL_SIZE,
            inodes: INODE_POOL_SIZE,
            read_only: false,
            errors: None,
        }
    }
}

/// Parameters of a freshly formatted volume
#[derive(Debug, Clone, Copy)]
pub struct FormatOptions {
    /// Block size in bytes, a power of two from 1024 to 65536
    pub block_size: usize,
    /// Number of blocks, defaults to whatever fits on the device and in one group
    pub blocks: Option<u32>,
    /// Number of inodes, defaults to one per four blocks
    pub inodes: Option<u32>,
    /// Behaviour recorded in the superblock for detected corruption
    pub errors: ErrorPolicy,
    /// Volume label, NUL padded
    pub label: [u8; 16],
    /// Volume UUID
    pub uuid: [u8; 16],
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            block_size: 1024,
            blocks: None,
            inodes: None,
            errors: ErrorPolicy::Continue,
            label: *b"ext2\0\0\0\0\0\0\0\0\0\0\0\0",
            uuid: [0; 16],
        }
    }
}

impl FormatOptions {
    /// Set the volume label, truncated to 16 bytes
    pub fn with_label(mut self, label: &str) -> Self {
        let bytes = label.as_bytes();
        let len = bytes.len().min(self.label.len());
        self.label = [0; 16];
        self.label[..len].copy_from_slice(&bytes[..len]);
        self
    }
}
