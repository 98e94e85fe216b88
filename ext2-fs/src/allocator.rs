use crate::bitmap;
use crate::group::BitmapKind;
use crate::{BlockRef, DiskInode, Ext2Error, Ext2FileSystem, Result};
use bytemuck::Zeroable;
use log::{debug, trace};

/// Bitmap popcounts next to the free counters stored on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitmapUsage {
    /// Set bits in the block bitmap, padding excluded
    pub blocks_used: u32,
    /// Blocks the bitmap can describe, `blocks_count - first_data_block`
    pub blocks_total: u32,
    /// Free block counter of the superblock
    pub free_blocks: u32,
    /// Set bits in the inode bitmap, padding excluded
    pub inodes_used: u32,
    /// Number of inodes
    pub inodes_total: u32,
    /// Free inode counter of the superblock
    pub free_inodes: u32,
}

impl BitmapUsage {
    /// Whether both bitmaps agree with their free counters
    pub fn is_consistent(&self) -> bool {
        self.free_blocks as u64 + self.blocks_used as u64 == self.blocks_total as u64
            && self.free_inodes as u64 + self.inodes_used as u64 == self.inodes_total as u64
    }
}

impl Ext2FileSystem {
    /// Blocks described by the block bitmap of `group`
    fn blocks_in_group(&self, group: u32) -> usize {
        let data_blocks = self.sb.blocks_count - self.sb.first_data_block;
        let start = group * self.sb.blocks_per_group;
        (data_blocks - start).min(self.sb.blocks_per_group) as usize
    }

    /// Inodes described by the inode bitmap of `group`
    fn inodes_in_group(&self, group: u32) -> usize {
        let start = group * self.sb.inodes_per_group;
        (self.sb.inodes_count - start).min(self.sb.inodes_per_group) as usize
    }

    fn cached_group_num(&self) -> Result<u32> {
        self.group
            .as_ref()
            .map(|group| group.num)
            .ok_or(Ext2Error::NotMounted)
    }

    /// Popcount both bitmaps of group 0
    pub fn bitmap_usage(&mut self) -> Result<BitmapUsage> {
        self.ensure_mounted()?;
        self.fetch_group(0)?;
        let block_limit = self.blocks_in_group(0);
        let inode_limit = self.inodes_in_group(0);
        let blocks_used =
            self.with_bitmap(BitmapKind::Block, |bits| bitmap::count_set(bits, block_limit))?;
        let inodes_used =
            self.with_bitmap(BitmapKind::Inode, |bits| bitmap::count_set(bits, inode_limit))?;
        Ok(BitmapUsage {
            blocks_used: blocks_used as u32,
            blocks_total: self.sb.blocks_count - self.sb.first_data_block,
            free_blocks: self.sb.free_blocks_count,
            inodes_used: inodes_used as u32,
            inodes_total: self.sb.inodes_count,
            free_inodes: self.sb.free_inodes_count,
        })
    }

    /// Cross-check the free block counters against the bitmap of the cached group
    fn check_block_counters(&mut self) -> Result<()> {
        let group = self.cached_group_num()?;
        let limit = self.blocks_in_group(group);
        let used = self.with_bitmap(BitmapKind::Block, |bits| bitmap::count_set(bits, limit))?;
        let group_free = self.group_desc()?.free_blocks_count as usize;
        let total_free = self.sb.free_blocks_count as usize;
        // a single group holds every block
        if group_free + used != limit || total_free != group_free {
            debug!(
                "block counters: group free {}, volume free {}, bitmap used {} of {}",
                group_free, total_free, used, limit
            );
            self.corruption("free block count disagrees with bitmap")?;
        }
        Ok(())
    }

    /// Cross-check the free inode counters against the bitmap of the cached group
    fn check_inode_counters(&mut self) -> Result<()> {
        let group = self.cached_group_num()?;
        let limit = self.inodes_in_group(group);
        let used = self.with_bitmap(BitmapKind::Inode, |bits| bitmap::count_set(bits, limit))?;
        let group_free = self.group_desc()?.free_inodes_count as usize;
        let total_free = self.sb.free_inodes_count as usize;
        if group_free + used != limit || total_free != group_free {
            debug!(
                "inode counters: group free {}, volume free {}, bitmap used {} of {}",
                group_free, total_free, used, limit
            );
            self.corruption("free inode count disagrees with bitmap")?;
        }
        Ok(())
    }

    /// Run both counter checks on the cached group
    pub(crate) fn check_counters(&mut self) -> Result<()> {
        self.check_block_counters()?;
        self.check_inode_counters()
    }

    /// Commit superblock, group descriptor and the bitmap, in that order
    fn commit_allocation(&mut self, kind: BitmapKind) -> Result<()> {
        self.commit_superblock()?;
        self.commit_group_desc()?;
        self.commit_bitmap(kind)
    }

    /// Allocate a block, return its number
    pub fn alloc_block(&mut self) -> Result<u32> {
        self.ensure_writable()?;
        let mut group = 0;
        loop {
            if group >= self.sb.group_count() {
                return Err(Ext2Error::NoSpace);
            }
            self.fetch_group(group)?;
            if self.group_desc()?.free_blocks_count > 0 {
                break;
            }
            group += 1;
        }
        let limit = self.blocks_in_group(group);
        let bit = match self.with_bitmap(BitmapKind::Block, |bits| {
            let bit = bitmap::find_first_free(bits)?;
            if bit >= limit {
                return Err(Ext2Error::NoSpace);
            }
            bitmap::set(bits, bit)?;
            Ok(bit)
        })? {
            Ok(bit) => bit,
            Err(Ext2Error::NoSpace) => {
                self.corruption("free blocks counted but the bitmap is full")?;
                return Err(Ext2Error::NoSpace);
            }
            Err(e) => return Err(e),
        };
        let desc = self.group_desc_mut()?;
        desc.free_blocks_count = desc.free_blocks_count.saturating_sub(1);
        self.sb.free_blocks_count = self.sb.free_blocks_count.saturating_sub(1);
        self.check_block_counters()?;
        self.commit_allocation(BitmapKind::Block)?;
        let block_id = group * self.sb.blocks_per_group + bit as u32 + self.sb.first_data_block;
        trace!("alloc block {}", block_id);
        Ok(block_id)
    }

    /// Return block `block_id` to the free pool
    pub fn free_block(&mut self, block_id: u32) -> Result<()> {
        self.ensure_writable()?;
        if block_id < self.sb.first_data_block || block_id >= self.sb.blocks_count {
            self.corruption("freeing a block outside the volume")?;
            return Err(Ext2Error::OutOfRange);
        }
        let rel = block_id - self.sb.first_data_block;
        let group = rel / self.sb.blocks_per_group;
        let bit = (rel % self.sb.blocks_per_group) as usize;
        self.fetch_group(group)?;
        if !self.with_bitmap(BitmapKind::Block, |bits| bitmap::is_set(bits, bit))?? {
            self.corruption("freeing a free block")?;
            return Err(Ext2Error::Corrupted("freeing a free block"));
        }
        self.with_bitmap(BitmapKind::Block, |bits| bitmap::unset(bits, bit))??;
        self.group_desc_mut()?.free_blocks_count += 1;
        self.sb.free_blocks_count += 1;
        self.check_block_counters()?;
        self.commit_allocation(BitmapKind::Block)?;
        trace!("free block {}", block_id);
        Ok(())
    }

    /// Allocate an inode number
    ///
    /// The slot in the inode table must be zeroed.
    pub fn alloc_inode(&mut self) -> Result<u32> {
        self.ensure_writable()?;
        let mut group = 0;
        loop {
            if group >= self.sb.group_count() {
                return Err(Ext2Error::NoSpace);
            }
            self.fetch_group(group)?;
            if self.group_desc()?.free_inodes_count > 0 {
                break;
            }
            group += 1;
        }
        let limit = self.inodes_in_group(group);
        let bit = match self.with_bitmap(BitmapKind::Inode, |bits| {
            bitmap::find_first_free(bits).and_then(|bit| {
                if bit < limit {
                    Ok(bit)
                } else {
                    Err(Ext2Error::NoSpace)
                }
            })
        })? {
            Ok(bit) => bit,
            Err(Ext2Error::NoSpace) => {
                self.corruption("free inodes counted but the bitmap is full")?;
                return Err(Ext2Error::NoSpace);
            }
            Err(e) => return Err(e),
        };
        let ino = group * self.sb.inodes_per_group + bit as u32 + 1;
        if !self.read_disk_inode(ino)?.is_zeroed() {
            self.corruption("free inode has a live inode-table entry")?;
        }
        // reading the inode table may not switch groups in a single-group volume
        self.fetch_group(group)?;
        self.with_bitmap(BitmapKind::Inode, |bits| bitmap::set(bits, bit))??;
        let desc = self.group_desc_mut()?;
        desc.free_inodes_count = desc.free_inodes_count.saturating_sub(1);
        self.sb.free_inodes_count = self.sb.free_inodes_count.saturating_sub(1);
        self.check_inode_counters()?;
        self.commit_allocation(BitmapKind::Inode)?;
        trace!("alloc inode {}", ino);
        Ok(ino)
    }

    /// Return inode `ino` to the free pool, zeroing its inode-table entry
    pub fn free_inode(&mut self, ino: u32) -> Result<()> {
        self.ensure_writable()?;
        if ino == 0 || ino > self.sb.inodes_count {
            self.corruption("freeing an inode outside the volume")?;
            return Err(Ext2Error::OutOfRange);
        }
        let group = (ino - 1) / self.sb.inodes_per_group;
        let bit = ((ino - 1) % self.sb.inodes_per_group) as usize;
        self.fetch_group(group)?;
        if !self.with_bitmap(BitmapKind::Inode, |bits| bitmap::is_set(bits, bit))?? {
            self.corruption("freeing a free inode")?;
            return Err(Ext2Error::Corrupted("freeing a free inode"));
        }
        self.with_bitmap(BitmapKind::Inode, |bits| bitmap::unset(bits, bit))??;
        self.group_desc_mut()?.free_inodes_count += 1;
        self.sb.free_inodes_count += 1;
        self.check_inode_counters()?;
        self.commit_allocation(BitmapKind::Inode)?;
        self.write_disk_inode(ino, &DiskInode::zeroed())?;
        self.blocks.sync()?;
        trace!("free inode {}", ino);
        Ok(())
    }

    /// Add `delta` to the directory count of the cached group
    pub(crate) fn adjust_used_dirs(&mut self, delta: i32) -> Result<()> {
        self.ensure_writable()?;
        self.fetch_group(0)?;
        let desc = self.group_desc_mut()?;
        desc.used_dirs_count = if delta < 0 {
            desc.used_dirs_count.saturating_sub(delta.unsigned_abs() as u16)
        } else {
            desc.used_dirs_count.saturating_add(delta as u16)
        };
        self.commit_group_desc()
    }

    /// Give an unassigned buffer a freshly allocated block number
    pub(crate) fn assign_block_number(&mut self, buf: &BlockRef) -> Result<u32> {
        let block_id = self.alloc_block()?;
        if let Err(e) = self.blocks.assign(buf, block_id) {
            self.free_block(block_id)?;
            return Err(e);
        }
        Ok(block_id)
    }
}
