use crate::indirect::CachedPath;
use crate::{DiskInode, Ext2Error, Ext2FileSystem, Result};
use alloc::vec::Vec;
use bytemuck::Zeroable;
use log::{debug, trace};

/// Handle to an open inode in the inode pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeHandle {
    index: usize,
    gen: u32,
}

/// An open inode
pub(crate) struct MemInode {
    /// Inode number, 0 until a number is allocated
    pub ino: u32,
    pub disk: DiskInode,
    pub refs: u32,
    /// Free the inode when the last handle is dropped
    pub remove_on_close: bool,
    pub path: CachedPath,
}

struct InodeSlot {
    gen: u32,
    inode: Option<MemInode>,
}

/// Fixed-capacity table of open inodes
pub(crate) struct InodePool {
    slots: Vec<InodeSlot>,
}

impl InodePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity)
                .map(|_| InodeSlot {
                    gen: 0,
                    inode: None,
                })
                .collect(),
        }
    }

    /// Number of open inodes
    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.inode.is_some()).count()
    }

    fn find(&self, ino: u32) -> Option<InodeHandle> {
        self.slots.iter().enumerate().find_map(|(index, slot)| match &slot.inode {
            Some(inode) if inode.ino == ino => Some(InodeHandle {
                index,
                gen: slot.gen,
            }),
            _ => None,
        })
    }

    fn is_full(&self) -> bool {
        self.slots.iter().all(|slot| slot.inode.is_some())
    }

    fn insert(&mut self, inode: MemInode) -> Result<InodeHandle> {
        let index = self
            .slots
            .iter()
            .position(|slot| slot.inode.is_none())
            .ok_or(Ext2Error::NoMemory)?;
        let slot = &mut self.slots[index];
        slot.inode = Some(inode);
        Ok(InodeHandle {
            index,
            gen: slot.gen,
        })
    }

    /// Take the inode out and retire the handle
    fn remove(&mut self, h: InodeHandle) -> Result<MemInode> {
        self.get(h)?;
        let slot = &mut self.slots[h.index];
        slot.gen = slot.gen.wrapping_add(1);
        slot.inode.take().ok_or(Ext2Error::StaleHandle)
    }

    pub fn get(&self, h: InodeHandle) -> Result<&MemInode> {
        match self.slots.get(h.index) {
            Some(InodeSlot {
                gen,
                inode: Some(inode),
            }) if *gen == h.gen => Ok(inode),
            _ => Err(Ext2Error::StaleHandle),
        }
    }

    pub fn get_mut(&mut self, h: InodeHandle) -> Result<&mut MemInode> {
        match self.slots.get_mut(h.index) {
            Some(InodeSlot {
                gen,
                inode: Some(inode),
            }) if *gen == h.gen => Ok(inode),
            _ => Err(Ext2Error::StaleHandle),
        }
    }
}

impl Ext2FileSystem {
    /// Open inode `ino`, sharing it if it is already open
    ///
    /// Inode number 0 gives a fresh zeroed inode that is never shared, to be
    /// numbered once allocated.
    pub fn inode_get(&mut self, ino: u32) -> Result<InodeHandle> {
        self.ensure_mounted()?;
        if ino != 0 {
            if let Some(h) = self.inodes.find(ino) {
                self.inodes.get_mut(h)?.refs += 1;
                return Ok(h);
            }
        }
        if self.inodes.is_full() {
            return Err(Ext2Error::NoMemory);
        }
        let disk = if ino == 0 {
            DiskInode::zeroed()
        } else {
            self.read_disk_inode(ino)?
        };
        trace!("open inode {}", ino);
        self.inodes.insert(MemInode {
            ino,
            disk,
            refs: 1,
            remove_on_close: false,
            path: CachedPath::default(),
        })
    }

    /// Drop one reference to an open inode
    ///
    /// The last drop releases the cached block path and, when the inode was
    /// unlinked while open, frees its blocks and its number.
    pub fn inode_drop(&mut self, h: InodeHandle) -> Result<()> {
        let inode = self.inodes.get_mut(h)?;
        inode.refs -= 1;
        if inode.refs > 0 {
            return Ok(());
        }
        inode.path.release(&mut self.blocks);
        let ret = if inode.remove_on_close && inode.ino != 0 {
            self.remove_inode(h)
        } else {
            Ok(())
        };
        let inode = self.inodes.remove(h)?;
        trace!("closed inode {}", inode.ino);
        ret
    }

    fn remove_inode(&mut self, h: InodeHandle) -> Result<()> {
        let (ino, is_dir) = {
            let inode = self.inodes.get(h)?;
            (inode.ino, inode.disk.is_dir())
        };
        debug!("removing inode {}", ino);
        let freed = self.free_inode_blocks(h, 0)?;
        let sectors = freed * self.sectors_per_block();
        let inode = self.inodes.get_mut(h)?;
        inode.disk.blocks = inode.disk.blocks.saturating_sub(sectors);
        if is_dir {
            self.adjust_used_dirs(-1)?;
        }
        self.free_inode(ino)
    }

    /// Inode number of an open inode
    pub fn inode_number(&self, h: InodeHandle) -> Result<u32> {
        Ok(self.inodes.get(h)?.ino)
    }

    /// Copy of the on-disk fields of an open inode
    pub fn inode_disk(&self, h: InodeHandle) -> Result<DiskInode> {
        Ok(self.inodes.get(h)?.disk)
    }

    /// Reference count of an open inode
    pub fn inode_refs(&self, h: InodeHandle) -> Result<u32> {
        Ok(self.inodes.get(h)?.refs)
    }

    /// Free the inode once its last handle is dropped
    pub fn inode_set_remove_on_close(&mut self, h: InodeHandle) -> Result<()> {
        self.inodes.get_mut(h)?.remove_on_close = true;
        Ok(())
    }

    /// Write the in-memory fields back to the inode table
    pub fn inode_commit(&mut self, h: InodeHandle) -> Result<()> {
        let inode = self.inodes.get(h)?;
        if inode.ino == 0 {
            return Ok(());
        }
        let (ino, disk) = (inode.ino, inode.disk);
        self.write_disk_inode(ino, &disk)
    }

    /// Commit the inode and flush the device
    pub fn inode_sync(&mut self, h: InodeHandle) -> Result<()> {
        self.ensure_writable()?;
        self.inode_commit(h)?;
        self.blocks.sync()
    }

    /// Read from `offset` into `buf`, return the number of bytes read
    pub fn inode_read(&mut self, h: InodeHandle, offset: usize, buf: &mut [u8]) -> Result<usize> {
        self.ensure_mounted()?;
        let size = self.inodes.get(h)?.disk.size as usize;
        let block_size = self.block_size();
        let mut start = offset;
        let end = offset.saturating_add(buf.len()).min(size);
        if start >= end {
            return Ok(0);
        }
        let mut read_size = 0usize;
        loop {
            // calculate end of current block
            let mut end_current_block = (start / block_size + 1) * block_size;
            end_current_block = end_current_block.min(end);
            // read and update read size
            let block_read_size = end_current_block - start;
            self.fetch_inode_block(h, (start / block_size) as u64)?;
            let dst = &mut buf[read_size..read_size + block_read_size];
            let inner = start % block_size;
            let data = self.inodes.get(h)?.path.data()?;
            self.blocks.read_bytes(data, |src| {
                dst.copy_from_slice(&src[inner..inner + block_read_size])
            })?;
            read_size += block_read_size;
            // move to next block
            if end_current_block == end {
                break;
            }
            start = end_current_block;
        }
        Ok(read_size)
    }

    /// Write `buf` at `offset`, growing the file as needed
    ///
    /// Returns the number of bytes written. A failure after some bytes made
    /// it to disk is reported as a short write.
    pub fn inode_write(&mut self, h: InodeHandle, offset: usize, buf: &[u8]) -> Result<usize> {
        self.ensure_writable()?;
        if buf.is_empty() {
            return Ok(0);
        }
        let end = offset
            .checked_add(buf.len())
            .filter(|end| *end <= u32::MAX as usize)
            .ok_or(Ext2Error::OutOfRange)?;
        let block_size = self.block_size();
        let mut start = offset;
        let mut write_size = 0usize;
        let mut failure = None;
        loop {
            let mut end_current_block = (start / block_size + 1) * block_size;
            end_current_block = end_current_block.min(end);
            let block_write_size = end_current_block - start;
            let src = &buf[write_size..write_size + block_write_size];
            if let Err(e) = self.write_block_part(h, start, src) {
                failure = Some(e);
                break;
            }
            write_size += block_write_size;
            if end_current_block == end {
                break;
            }
            start = end_current_block;
        }
        if write_size > 0 {
            let inode = self.inodes.get_mut(h)?;
            let written_end = (offset + write_size) as u32;
            if written_end > inode.disk.size {
                inode.disk.size = written_end;
            }
        }
        let committed = self.inode_commit(h);
        match failure {
            Some(e) if write_size == 0 => Err(e),
            Some(e) => {
                debug!("short write of {} bytes: {}", write_size, e);
                Ok(write_size)
            }
            None => committed.map(|_| write_size),
        }
    }

    /// Copy `src` into the block holding byte `start`
    fn write_block_part(&mut self, h: InodeHandle, start: usize, src: &[u8]) -> Result<()> {
        let block_size = self.block_size();
        self.fetch_inode_block(h, (start / block_size) as u64)?;
        self.assign_inode_path(h)?;
        let inner = start % block_size;
        let data = self.inodes.get(h)?.path.data()?;
        self.blocks.modify_bytes(data, |dst| {
            dst[inner..inner + src.len()].copy_from_slice(src)
        })?;
        self.blocks.write(data)
    }

    /// Set the file size to `size`
    ///
    /// Growing leaves a hole, shrinking frees every block past the new end
    /// and zeroes the tail of the last block.
    pub fn inode_truncate(&mut self, h: InodeHandle, size: u64) -> Result<()> {
        self.ensure_writable()?;
        if size > u32::MAX as u64 {
            return Err(Ext2Error::OutOfRange);
        }
        let old = self.inodes.get(h)?.disk.size as u64;
        if size >= old {
            self.inodes.get_mut(h)?.disk.size = size as u32;
            return self.inode_commit(h);
        }
        let block_size = self.block_size() as u64;
        let first = (size + block_size - 1) / block_size;
        let freed = self.free_inode_blocks(h, first);
        let sectors = self.sectors_per_block();
        let inode = self.inodes.get_mut(h)?;
        if let Ok(count) = freed {
            inode.disk.blocks = inode.disk.blocks.saturating_sub(count * sectors);
            inode.disk.size = size as u32;
        }
        self.inode_commit(h)?;
        freed?;
        let tail = (size % block_size) as usize;
        if tail != 0 {
            self.fetch_inode_block(h, size / block_size)?;
            let data = self.inodes.get(h)?.path.data()?;
            if self.blocks.is_assigned(data)? {
                self.blocks.modify_bytes(data, |bytes| bytes[tail..].fill(0))?;
                self.blocks.write(data)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_hands_out_each_slot_once() {
        let mut pool = InodePool::new(2);
        let a = pool
            .insert(MemInode {
                ino: 5,
                disk: DiskInode::zeroed(),
                refs: 1,
                remove_on_close: false,
                path: CachedPath::default(),
            })
            .unwrap();
        assert_eq!(pool.find(5), Some(a));
        assert_eq!(pool.find(6), None);
        assert!(!pool.is_full());
        let removed = pool.remove(a).unwrap();
        assert_eq!(removed.ino, 5);
        assert_eq!(pool.get(a).err(), Some(Ext2Error::StaleHandle));
        assert_eq!(pool.open_count(), 0);
    }

    #[test]
    fn reused_slot_gets_a_new_generation() {
        let mut pool = InodePool::new(1);
        let inode = |ino| MemInode {
            ino,
            disk: DiskInode::zeroed(),
            refs: 1,
            remove_on_close: false,
            path: CachedPath::default(),
        };
        let a = pool.insert(inode(12)).unwrap();
        assert!(pool.is_full());
        assert_eq!(pool.insert(inode(13)).err(), Some(Ext2Error::NoMemory));
        pool.remove(a).unwrap();
        let b = pool.insert(inode(13)).unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.get(b).unwrap().ino, 13);
        assert!(pool.get_mut(a).is_err());
    }
}
