//! Lay out a fresh single-group volume
//!
//! Layout, in blocks: [boot] superblock, group descriptor table, block
//! bitmap, inode bitmap, inode table, root directory, `lost+found`, free
//! data blocks.

use crate::fs::is_mounted;
use crate::layout::{
    EXT2_DYNAMIC_REV, EXT2_MAGIC, FIRST_INO, INODE_SIZE, S_IFDIR, STATE_VALID, SUPPORTED_INCOMPAT,
};
use crate::{
    bitmap, BlockCache, BlockDevice, DirEntry, DiskInode, Ext2Error, FileType, FormatOptions,
    GroupDesc, Result, SuperBlock, ROOT_INO, SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE,
};
use alloc::sync::Arc;
use bytemuck::Zeroable;
use log::info;

/// Mounts allowed before a check is advised
const MAX_MOUNT_COUNT: u16 = 20;

struct Layout {
    block_size: usize,
    first_data_block: u32,
    blocks: u32,
    inodes: u32,
    gdt: u32,
    block_bitmap: u32,
    inode_bitmap: u32,
    inode_table: u32,
    root_dir: u32,
    lost_found: u32,
}

impl Layout {
    fn new(device: &dyn BlockDevice, options: &FormatOptions) -> Result<Self> {
        let block_size = options.block_size;
        if !block_size.is_power_of_two() || !(SUPERBLOCK_SIZE..=65536).contains(&block_size) {
            return Err(Ext2Error::InvalidArgument("block size"));
        }
        let write_size = device.write_size();
        if write_size == 0 || (block_size % write_size != 0 && write_size % block_size != 0) {
            return Err(Ext2Error::Unsupported("device write size"));
        }
        let first_data_block = if block_size == SUPERBLOCK_SIZE { 1 } else { 0 };
        let bits_per_block = (block_size * 8) as u64;
        let device_blocks = (device.device_size() / block_size as u64).min(u32::MAX as u64) as u32;
        let blocks = match options.blocks {
            Some(blocks) if blocks > device_blocks => {
                return Err(Ext2Error::InvalidArgument("volume larger than device"))
            }
            Some(blocks) => blocks,
            None => device_blocks,
        };
        // a single group covers at most one bitmap block worth of blocks and
        // its descriptor counts them in 16 bits
        let blocks = (blocks as u64)
            .min(first_data_block as u64 + bits_per_block)
            .min(u16::MAX as u64) as u32;

        let inodes_per_block = (block_size / INODE_SIZE) as u32;
        let inodes = match options.inodes {
            Some(inodes) if inodes <= FIRST_INO => {
                return Err(Ext2Error::InvalidArgument("too few inodes"))
            }
            Some(inodes) => inodes,
            None => (blocks / 4).max(16),
        };
        let inodes = ((inodes + inodes_per_block - 1) / inodes_per_block * inodes_per_block)
            .min(bits_per_block.min(u16::MAX as u64) as u32 / inodes_per_block * inodes_per_block);
        let inode_table_blocks = inodes / inodes_per_block;

        let gdt = first_data_block + 1;
        let block_bitmap = gdt + 1;
        let inode_bitmap = gdt + 2;
        let inode_table = gdt + 3;
        let root_dir = inode_table + inode_table_blocks;
        let lost_found = root_dir + 1;
        if lost_found >= blocks {
            return Err(Ext2Error::InvalidArgument("volume too small"));
        }
        Ok(Self {
            block_size,
            first_data_block,
            blocks,
            inodes,
            gdt,
            block_bitmap,
            inode_bitmap,
            inode_table,
            root_dir,
            lost_found,
        })
    }

    /// Blocks in use once formatted, counted from `first_data_block`
    fn used_blocks(&self) -> u32 {
        self.lost_found + 1 - self.first_data_block
    }

    fn superblock(&self, options: &FormatOptions) -> SuperBlock {
        let mut sb = SuperBlock::zeroed();
        sb.inodes_count = self.inodes;
        sb.blocks_count = self.blocks;
        sb.free_blocks_count = self.blocks - self.first_data_block - self.used_blocks();
        sb.free_inodes_count = self.inodes - FIRST_INO;
        sb.first_data_block = self.first_data_block;
        sb.log_block_size = (self.block_size / SUPERBLOCK_SIZE).trailing_zeros();
        sb.log_frag_size = sb.log_block_size;
        sb.blocks_per_group = self.block_size as u32 * 8;
        sb.frags_per_group = sb.blocks_per_group;
        sb.inodes_per_group = self.inodes;
        sb.max_mnt_count = MAX_MOUNT_COUNT;
        sb.magic = EXT2_MAGIC;
        sb.state = STATE_VALID;
        sb.errors = options.errors.as_raw();
        sb.rev_level = EXT2_DYNAMIC_REV;
        sb.first_ino = FIRST_INO;
        sb.inode_size = INODE_SIZE as u16;
        sb.feature_incompat = SUPPORTED_INCOMPAT.bits();
        sb.uuid = options.uuid;
        sb.volume_name = options.label;
        sb
    }

    fn group_desc(&self) -> GroupDesc {
        GroupDesc {
            block_bitmap: self.block_bitmap,
            inode_bitmap: self.inode_bitmap,
            inode_table: self.inode_table,
            free_blocks_count: (self.blocks - self.first_data_block - self.used_blocks()) as u16,
            free_inodes_count: (self.inodes - FIRST_INO) as u16,
            // root and lost+found
            used_dirs_count: 2,
            ..GroupDesc::default()
        }
    }

    fn dir_inode(&self, mode: u16, links: u16, block: u32) -> DiskInode {
        let mut inode = DiskInode::zeroed();
        inode.initialize(S_IFDIR | mode);
        inode.links_count = links;
        inode.size = self.block_size as u32;
        inode.blocks = (self.block_size / 512) as u32;
        inode.block[0] = block;
        inode
    }

    /// Fill block `block_id` of a fresh volume
    fn fill(&self, block_id: u32, bytes: &mut [u8], options: &FormatOptions) -> Result<()> {
        let sb_block = (SUPERBLOCK_OFFSET / self.block_size) as u32;
        if block_id == sb_block {
            let offset = SUPERBLOCK_OFFSET % self.block_size;
            let sb = self.superblock(options);
            bytes[offset..offset + core::mem::size_of::<SuperBlock>()]
                .copy_from_slice(bytemuck::bytes_of(&sb));
        } else if block_id == self.gdt {
            let desc = self.group_desc();
            bytes[..core::mem::size_of::<GroupDesc>()].copy_from_slice(bytemuck::bytes_of(&desc));
        } else if block_id == self.block_bitmap {
            for bit in 0..self.used_blocks() as usize {
                bitmap::set(bytes, bit)?;
            }
            for bit in (self.blocks - self.first_data_block) as usize..self.block_size * 8 {
                bitmap::set(bytes, bit)?;
            }
        } else if block_id == self.inode_bitmap {
            for bit in 0..FIRST_INO as usize {
                bitmap::set(bytes, bit)?;
            }
            for bit in self.inodes as usize..self.block_size * 8 {
                bitmap::set(bytes, bit)?;
            }
        } else if block_id >= self.inode_table && block_id < self.root_dir {
            let first = (block_id - self.inode_table) as usize * self.block_size / INODE_SIZE;
            let last = first + self.block_size / INODE_SIZE;
            for (ino, inode) in [
                (ROOT_INO, self.dir_inode(0o755, 3, self.root_dir)),
                (FIRST_INO, self.dir_inode(0o700, 2, self.lost_found)),
            ] {
                let index = ino as usize - 1;
                if (first..last).contains(&index) {
                    let offset = (index - first) * INODE_SIZE;
                    bytes[offset..offset + INODE_SIZE].copy_from_slice(bytemuck::bytes_of(&inode));
                }
            }
        } else if block_id == self.root_dir {
            let dot = DirEntry::new(".", ROOT_INO, FileType::Directory)?;
            let dotdot = DirEntry::new("..", ROOT_INO, FileType::Directory)?;
            let lost = DirEntry::new("lost+found", FIRST_INO, FileType::Directory)?;
            dot.store(bytes, 0, dot.min_rec_len());
            let at = dot.min_rec_len();
            dotdot.store(bytes, at, dotdot.min_rec_len());
            let at = at + dotdot.min_rec_len();
            lost.store(bytes, at, self.block_size - at);
        } else if block_id == self.lost_found {
            let dot = DirEntry::new(".", FIRST_INO, FileType::Directory)?;
            let dotdot = DirEntry::new("..", ROOT_INO, FileType::Directory)?;
            dot.store(bytes, 0, dot.min_rec_len());
            dotdot.store(bytes, dot.min_rec_len(), self.block_size - dot.min_rec_len());
        }
        Ok(())
    }
}

/// Format `device` as a single-group ext2 volume
///
/// Writes go through a small block pool, so devices that write in pages
/// larger than a block are fine.
pub fn format(device: &Arc<dyn BlockDevice>, options: &FormatOptions) -> Result<()> {
    if is_mounted(device) {
        return Err(Ext2Error::Busy);
    }
    let layout = Layout::new(device.as_ref(), options)?;
    let mut blocks = BlockCache::new(device.clone(), layout.block_size, 4, 2)?;
    // for 1 KiB blocks block 0 is the boot block and stays untouched
    for block_id in layout.first_data_block..=layout.lost_found {
        let buf = blocks.get_empty()?;
        let ret = blocks
            .modify_bytes(&buf, |bytes| layout.fill(block_id, bytes, options))
            .and_then(|filled| filled)
            .and_then(|_| blocks.assign(&buf, block_id))
            .and_then(|_| blocks.write(&buf));
        blocks.release(buf);
        ret?;
    }
    blocks.sync()?;
    info!(
        "ext2: formatted {} blocks of {} bytes, {} inodes",
        layout.blocks, layout.block_size, layout.inodes
    );
    Ok(())
}
