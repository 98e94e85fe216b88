use crate::layout::INODE_SIZE;
use crate::{BlockCache, BlockRef, DiskInode, Ext2Error, Ext2FileSystem, GroupDesc, Result};
use log::trace;

const GROUP_DESC_SIZE: usize = core::mem::size_of::<GroupDesc>();

/// Which bitmap of the group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BitmapKind {
    Block,
    Inode,
}

/// The cached block group and its metadata blocks
pub(crate) struct BlockGroup {
    pub num: u32,
    /// In-memory copy of the descriptor
    pub desc: GroupDesc,
    desc_block: BlockRef,
    desc_offset: usize,
    /// Inode-table block holding the most recently used inode
    inode_table: Option<BlockRef>,
    block_bitmap: Option<BlockRef>,
    inode_bitmap: Option<BlockRef>,
}

impl BlockGroup {
    fn release(self, blocks: &mut BlockCache) {
        blocks.release(self.desc_block);
        for buf in [self.inode_table, self.block_bitmap, self.inode_bitmap]
            .into_iter()
            .flatten()
        {
            blocks.release(buf);
        }
    }
}

impl Ext2FileSystem {
    /// Make group `num` the cached group
    pub(crate) fn fetch_group(&mut self, num: u32) -> Result<()> {
        if matches!(&self.group, Some(group) if group.num == num) {
            return Ok(());
        }
        self.release_group();
        if num >= self.sb.group_count() {
            return Err(Ext2Error::OutOfRange);
        }
        let block_size = self.block_size();
        let byte = num as usize * GROUP_DESC_SIZE;
        let desc_block_id = self.sb.first_data_block + 1 + (byte / block_size) as u32;
        let desc_offset = byte % block_size;
        let desc_block = self.blocks.get(desc_block_id)?;
        let desc = match self
            .blocks
            .read(&desc_block, desc_offset, |desc: &GroupDesc| *desc)
        {
            Ok(desc) => desc,
            Err(e) => {
                self.blocks.release(desc_block);
                return Err(e);
            }
        };
        trace!("fetch group {}: {:?}", num, desc);
        self.group = Some(BlockGroup {
            num,
            desc,
            desc_block,
            desc_offset,
            inode_table: None,
            block_bitmap: None,
            inode_bitmap: None,
        });
        Ok(())
    }

    /// Drop the cached group and its buffers
    pub(crate) fn release_group(&mut self) {
        if let Some(group) = self.group.take() {
            group.release(&mut self.blocks);
        }
    }

    pub(crate) fn group_desc(&self) -> Result<&GroupDesc> {
        self.group
            .as_ref()
            .map(|group| &group.desc)
            .ok_or(Ext2Error::NotMounted)
    }

    pub(crate) fn group_desc_mut(&mut self) -> Result<&mut GroupDesc> {
        self.group
            .as_mut()
            .map(|group| &mut group.desc)
            .ok_or(Ext2Error::NotMounted)
    }

    /// Write the cached descriptor back
    pub(crate) fn commit_group_desc(&mut self) -> Result<()> {
        let group = self.group.as_ref().ok_or(Ext2Error::NotMounted)?;
        let desc = group.desc;
        self.blocks
            .modify(&group.desc_block, group.desc_offset, |disk: &mut GroupDesc| {
                *disk = desc
            })?;
        self.blocks.write(&group.desc_block)
    }

    /// Call `f` over a bitmap of the cached group, loading it on first use
    pub(crate) fn with_bitmap<V>(
        &mut self,
        kind: BitmapKind,
        f: impl FnOnce(&mut [u8]) -> V,
    ) -> Result<V> {
        let group = self.group.as_mut().ok_or(Ext2Error::NotMounted)?;
        let (slot, block_id) = match kind {
            BitmapKind::Block => (&mut group.block_bitmap, group.desc.block_bitmap),
            BitmapKind::Inode => (&mut group.inode_bitmap, group.desc.inode_bitmap),
        };
        if slot.is_none() {
            *slot = Some(self.blocks.get(block_id)?);
        }
        let buf = slot.as_ref().ok_or(Ext2Error::NotMounted)?;
        self.blocks.modify_bytes(buf, f)
    }

    /// Write a bitmap of the cached group back
    pub(crate) fn commit_bitmap(&mut self, kind: BitmapKind) -> Result<()> {
        let group = self.group.as_ref().ok_or(Ext2Error::NotMounted)?;
        let slot = match kind {
            BitmapKind::Block => &group.block_bitmap,
            BitmapKind::Inode => &group.inode_bitmap,
        };
        match slot {
            Some(buf) => self.blocks.write(buf),
            None => Ok(()),
        }
    }

    /// Locate inode `ino` as (block of the inode table, offset)
    fn inode_location(&mut self, ino: u32) -> Result<(u32, usize)> {
        if ino == 0 || ino > self.sb.inodes_count {
            return Err(Ext2Error::OutOfRange);
        }
        let group = (ino - 1) / self.sb.inodes_per_group;
        let index = ((ino - 1) % self.sb.inodes_per_group) as usize;
        self.fetch_group(group)?;
        let byte = index * INODE_SIZE;
        let block_size = self.block_size();
        let table = self.group_desc()?.inode_table;
        Ok((table + (byte / block_size) as u32, byte % block_size))
    }

    /// Point the inode-table fragment at `block_id`
    fn fetch_inode_table(&mut self, block_id: u32) -> Result<()> {
        let group = self.group.as_mut().ok_or(Ext2Error::NotMounted)?;
        let cached = match &group.inode_table {
            Some(buf) => self.blocks.block_id(buf)? == block_id,
            None => false,
        };
        if !cached {
            if let Some(old) = group.inode_table.take() {
                self.blocks.release(old);
            }
            group.inode_table = Some(self.blocks.get(block_id)?);
        }
        Ok(())
    }

    /// Read inode `ino` from the inode table
    pub(crate) fn read_disk_inode(&mut self, ino: u32) -> Result<DiskInode> {
        let (block_id, offset) = self.inode_location(ino)?;
        self.fetch_inode_table(block_id)?;
        let buf = inode_table_buf(&self.group)?;
        self.blocks.read(buf, offset, |inode: &DiskInode| *inode)
    }

    /// Write inode `ino` to the inode table
    pub(crate) fn write_disk_inode(&mut self, ino: u32, inode: &DiskInode) -> Result<()> {
        let (block_id, offset) = self.inode_location(ino)?;
        self.fetch_inode_table(block_id)?;
        let buf = inode_table_buf(&self.group)?;
        self.blocks
            .modify(buf, offset, |disk: &mut DiskInode| *disk = *inode)?;
        self.blocks.write(buf)
    }
}

fn inode_table_buf(group: &Option<BlockGroup>) -> Result<&BlockRef> {
    group
        .as_ref()
        .and_then(|group| group.inode_table.as_ref())
        .ok_or(Ext2Error::NotMounted)
}
