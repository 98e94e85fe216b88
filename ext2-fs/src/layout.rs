use bytemuck::{Pod, Zeroable};
use core::fmt::{Debug, Formatter, Result};

/// Magic number for sanity check
pub(crate) const EXT2_MAGIC: u16 = 0xEF53;
/// The only revision supported, with dynamic inode sizes
pub(crate) const EXT2_DYNAMIC_REV: u32 = 1;
/// Size of an on-disk inode
pub(crate) const INODE_SIZE: usize = 128;
/// First inode that is not reserved
pub(crate) const FIRST_INO: u32 = 11;

/// `state` bit: cleanly unmounted
pub(crate) const STATE_VALID: u16 = 0x0001;
/// `state` bit: errors were detected
pub(crate) const STATE_ERROR: u16 = 0x0002;

/// Number of block addresses in an inode
pub(crate) const BLOCK_PTRS: usize = 15;

pub(crate) const S_IFMT: u16 = 0xF000;
pub(crate) const S_IFLNK: u16 = 0xA000;
pub(crate) const S_IFREG: u16 = 0x8000;
pub(crate) const S_IFDIR: u16 = 0x4000;

bitflags! {
    /// Features a driver must understand to mount the volume at all
    pub struct IncompatFeatures: u32 {
        /// Compression
        const COMPRESSION = 0x0001;
        /// Directory entries carry a file type byte
        const FILETYPE    = 0x0002;
        /// A journal needs recovery
        const RECOVER     = 0x0004;
        /// The volume is an external journal
        const JOURNAL_DEV = 0x0008;
        /// Meta block groups
        const META_BG     = 0x0010;
    }
}

bitflags! {
    /// Features a driver must understand to mount the volume for writing
    pub struct RoCompatFeatures: u32 {
        /// Superblock backups only in some groups
        const SPARSE_SUPER = 0x0001;
        /// Files larger than 2 GiB
        const LARGE_FILE   = 0x0002;
        /// Directories stored as b-trees
        const BTREE_DIR    = 0x0004;
    }
}

/// Incompatible features the engine understands
pub(crate) const SUPPORTED_INCOMPAT: IncompatFeatures = IncompatFeatures::FILETYPE;
/// Read-only compatible features the engine can write with
pub(crate) const SUPPORTED_RO_COMPAT: RoCompatFeatures = RoCompatFeatures::SPARSE_SUPER;

/// Super block of an ext2 volume, the leading part of the 1024-byte region
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct SuperBlock {
    /// Total number of inodes
    pub inodes_count: u32,
    /// Total number of blocks, including the ones before `first_data_block`
    pub blocks_count: u32,
    /// Blocks reserved for the superuser
    pub r_blocks_count: u32,
    /// Free blocks
    pub free_blocks_count: u32,
    /// Free inodes
    pub free_inodes_count: u32,
    /// Block holding the superblock, 1 for 1 KiB blocks and 0 otherwise
    pub first_data_block: u32,
    /// Block size is `1024 << log_block_size`
    pub log_block_size: u32,
    /// Fragment size is `1024 << log_frag_size`
    pub log_frag_size: u32,
    /// Blocks per group
    pub blocks_per_group: u32,
    /// Fragments per group
    pub frags_per_group: u32,
    /// Inodes per group
    pub inodes_per_group: u32,
    /// Last mount time
    pub mtime: u32,
    /// Last write time
    pub wtime: u32,
    /// Mounts since the last check
    pub mnt_count: u16,
    /// Mounts allowed before a check is advised
    pub max_mnt_count: u16,
    /// Magic number, `0xEF53`
    pub magic: u16,
    /// Clean/error state bits
    pub state: u16,
    /// What to do when corruption is detected
    pub errors: u16,
    /// Minor revision
    pub minor_rev_level: u16,
    /// Time of the last check
    pub lastcheck: u32,
    /// Maximum time between checks
    pub checkinterval: u32,
    /// Creator OS
    pub creator_os: u32,
    /// Revision level
    pub rev_level: u32,
    /// Default uid of reserved blocks
    pub def_resuid: u16,
    /// Default gid of reserved blocks
    pub def_resgid: u16,
    /// First non-reserved inode
    pub first_ino: u32,
    /// Size of an on-disk inode
    pub inode_size: u16,
    /// Group holding this superblock copy
    pub block_group_nr: u16,
    /// Compatible features
    pub feature_compat: u32,
    /// Incompatible features
    pub feature_incompat: u32,
    /// Read-only compatible features
    pub feature_ro_compat: u32,
    /// Volume UUID
    pub uuid: [u8; 16],
    /// Volume label
    pub volume_name: [u8; 16],
    /// Directory where the volume was last mounted
    pub last_mounted: [u8; 64],
    /// Compression algorithms
    pub algorithm_usage_bitmap: u32,
    /// Blocks to preallocate for files
    pub prealloc_blocks: u8,
    /// Blocks to preallocate for directories
    pub prealloc_dir_blocks: u8,
    /// Padding
    pub padding1: u16,
    /// Journal UUID
    pub journal_uuid: [u8; 16],
    /// Journal inode
    pub journal_inum: u32,
    /// Journal device
    pub journal_dev: u32,
    /// Head of the orphan inode list
    pub last_orphan: u32,
    /// Directory hash seed
    pub hash_seed: [u32; 4],
    /// Default directory hash
    pub def_hash_version: u8,
    /// Padding
    pub reserved_char_pad: [u8; 3],
    /// Default mount options
    pub default_mount_opts: u32,
    /// First meta block group
    pub first_meta_bg: u32,
}

const _: () = assert!(core::mem::size_of::<SuperBlock>() == 264);

impl Debug for SuperBlock {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        f.debug_struct("SuperBlock")
            .field("inodes_count", &self.inodes_count)
            .field("blocks_count", &self.blocks_count)
            .field("free_blocks_count", &self.free_blocks_count)
            .field("free_inodes_count", &self.free_inodes_count)
            .field("first_data_block", &self.first_data_block)
            .field("block_size", &self.block_size())
            .field("state", &self.state)
            .field("errors", &self.errors)
            .finish()
    }
}

impl SuperBlock {
    /// Check if a super block is valid using the ext2 magic
    pub fn is_valid(&self) -> bool {
        self.magic == EXT2_MAGIC
    }
    /// Block size in bytes
    pub fn block_size(&self) -> usize {
        1024usize << self.log_block_size
    }
    /// Number of block groups on the volume
    pub fn group_count(&self) -> u32 {
        let data_blocks = self.blocks_count - self.first_data_block;
        (data_blocks + self.blocks_per_group - 1) / self.blocks_per_group
    }
}

/// Descriptor of a block group
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct GroupDesc {
    /// Block holding the block bitmap
    pub block_bitmap: u32,
    /// Block holding the inode bitmap
    pub inode_bitmap: u32,
    /// First block of the inode table
    pub inode_table: u32,
    /// Free blocks in the group
    pub free_blocks_count: u16,
    /// Free inodes in the group
    pub free_inodes_count: u16,
    /// Directories in the group
    pub used_dirs_count: u16,
    /// Padding
    pub pad: u16,
    /// Reserved
    pub reserved: [u32; 3],
}

/// An inode as stored in the inode table
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct DiskInode {
    /// File type and permissions
    pub mode: u16,
    /// Owner uid
    pub uid: u16,
    /// Size in bytes
    pub size: u32,
    /// Access time
    pub atime: u32,
    /// Change time
    pub ctime: u32,
    /// Modification time
    pub mtime: u32,
    /// Deletion time
    pub dtime: u32,
    /// Owner gid
    pub gid: u16,
    /// Hard links
    pub links_count: u16,
    /// 512-byte sectors reserved for data
    pub blocks: u32,
    /// Inode flags
    pub flags: u32,
    /// OS dependent
    pub osd1: u32,
    /// 12 direct blocks then the single, double and triple indirect roots
    pub block: [u32; BLOCK_PTRS],
    /// File version
    pub generation: u32,
    /// Extended attribute block
    pub file_acl: u32,
    /// High half of the size for large files
    pub dir_acl: u32,
    /// Fragment address
    pub faddr: u32,
    /// OS dependent
    pub osd2: [u8; 12],
}

const _: () = assert!(core::mem::size_of::<DiskInode>() == INODE_SIZE);

impl DiskInode {
    /// A fresh inode with the given type and permission bits and one link
    pub fn initialize(&mut self, mode: u16) {
        *self = Self::zeroed();
        self.mode = mode;
        self.links_count = 1;
    }
    /// Whether this inode is a directory
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }
    /// Whether this inode is a regular file
    pub fn is_file(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }
    /// Whether this inode is marked as a symbolic link
    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }
    /// Whether every byte of the inode is zero
    pub fn is_zeroed(&self) -> bool {
        bytemuck::bytes_of(self).iter().all(|b| *b == 0)
    }
}

/// Fixed header of a directory record, followed by `name_len` name bytes
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub(crate) struct DirEntryHeader {
    pub inode: u32,
    pub rec_len: u16,
    pub name_len: u8,
    pub file_type: u8,
}

/// Size of a directory record header
pub(crate) const DIRENT_HEADER_SZ: usize = core::mem::size_of::<DirEntryHeader>();
