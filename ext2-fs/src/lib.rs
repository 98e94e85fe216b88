//! An ext2 filesystem engine for hosts with a small, bounded amount of memory
#![cfg_attr(not(test), no_std)]
#![deny(missing_docs)]

// The ext2 format is little-endian and the on-disk records are plain
// `#[repr(C)]` structs read in place.
#[cfg(target_endian = "big")]
compile_error!("ext2-fs only supports little-endian targets");

// ext2-fs talks to storage only through the `BlockDevice` trait, so it can be
// built and tested independently of any kernel or driver.
//
// Layers, bottom up:
// 1. block device interface: `BlockDevice`, one transport per mount
// 2. block buffer pool and page cache: `BlockCache`
// 3. on-disk structures: `layout` and the bit-vector engine in `bitmap`
// 4. block group cache, allocator and indirect block tree
// 5. inode pool, directory entries and the `Inode` surface in `vfs`

extern crate alloc;
#[macro_use]
extern crate bitflags;

pub mod bitmap;
mod allocator;
mod block_cache;
mod block_dev;
mod config;
mod dir;
mod error;
mod format;
mod fs;
mod group;
mod indirect;
mod inode;
mod layout;
mod vfs;

pub use allocator::BitmapUsage;
pub use block_cache::{BlockCache, BlockRef, Transport};
pub use block_dev::BlockDevice;
pub use config::{
    FormatOptions, MountOptions, BLOCK_POOL_SIZE, INODE_POOL_SIZE, PAGE_POOL_SIZE,
};
pub use dir::{DirEntry, FileType};
pub use error::{DeviceError, Ext2Error, Result};
pub use format::format;
pub use fs::{ErrorPolicy, Ext2FileSystem, FsStat, MountState};
pub use indirect::{resolve, BlockPath};
pub use inode::InodeHandle;
pub use layout::{DiskInode, GroupDesc, IncompatFeatures, RoCompatFeatures, SuperBlock};
pub use vfs::{Inode, Stat, StatMode};

/// Size of the fixed superblock region and the smallest supported block size
pub const SUPERBLOCK_SIZE: usize = 1024;
/// Byte offset of the superblock from the start of the volume
pub const SUPERBLOCK_OFFSET: usize = 1024;
/// Inode number of the root directory
pub const ROOT_INO: u32 = 2;
/// Longest name a directory entry can hold
pub const NAME_MAX: usize = 255;
