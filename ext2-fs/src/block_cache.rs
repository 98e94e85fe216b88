use super::{BlockDevice, Ext2Error, Result};
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use bytemuck::Pod;
use log::{debug, trace};

/// How buffers reach the device, chosen once per mount
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// The device writes a block at a time; buffers own their memory
    Direct,
    /// The device writes whole pages holding several blocks; buffers point
    /// into cached pages and writes are coalesced until the page is flushed
    Paged {
        /// Device write unit in bytes
        page_size: usize,
    },
}

/// Handle to a live block buffer
///
/// A handle has exactly one owner and is given back with
/// [`BlockCache::release`].
#[derive(Debug, PartialEq, Eq)]
pub struct BlockRef {
    slot: usize,
    gen: u32,
}

/// Where the bytes of a buffer live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backing {
    Own,
    Page { page: usize, offset: usize },
}

struct BufferSlot {
    gen: u32,
    live: bool,
    /// underlying block id, meaningful once assigned
    block_id: u32,
    assigned: bool,
    backing: Backing,
    /// block-sized memory owned by the slot
    scratch: Box<[u8]>,
}

/// One device write unit
struct Page {
    /// page number on the device, `None` while the page holds nothing
    page_id: Option<usize>,
    data: Box<[u8]>,
    dirty: bool,
    /// bit `i` set while block `i` of the page is held by a buffer
    used: u64,
    /// load order, used to pick the oldest victim
    stamp: u64,
}

/// Fixed pool of block buffers over a block device
pub struct BlockCache {
    device: Arc<dyn BlockDevice>,
    block_size: usize,
    transport: Transport,
    slots: Vec<BufferSlot>,
    pages: Vec<Page>,
    clock: u64,
}

impl BlockCache {
    /// Create a pool of `buffers` block buffers and, when the device can't
    /// write single blocks, `pages` cached pages
    pub fn new(
        device: Arc<dyn BlockDevice>,
        block_size: usize,
        buffers: usize,
        pages: usize,
    ) -> Result<Self> {
        if !block_size.is_power_of_two() || block_size < crate::SUPERBLOCK_SIZE {
            return Err(Ext2Error::InvalidArgument("block size"));
        }
        if buffers == 0 {
            return Err(Ext2Error::InvalidArgument("empty buffer pool"));
        }
        let write_size = device.write_size();
        let transport = if write_size == 0 {
            return Err(Ext2Error::Unsupported("device write size"));
        } else if write_size <= block_size {
            if block_size % write_size != 0 {
                return Err(Ext2Error::Unsupported("device write size"));
            }
            Transport::Direct
        } else {
            let per_page = write_size / block_size;
            if write_size % block_size != 0 || per_page > u64::BITS as usize {
                return Err(Ext2Error::Unsupported("device write size"));
            }
            if pages == 0 {
                return Err(Ext2Error::InvalidArgument("empty page cache"));
            }
            Transport::Paged {
                page_size: write_size,
            }
        };
        let slots = (0..buffers)
            .map(|_| BufferSlot {
                gen: 0,
                live: false,
                block_id: 0,
                assigned: false,
                backing: Backing::Own,
                scratch: vec![0u8; block_size].into_boxed_slice(),
            })
            .collect();
        let pages = match transport {
            Transport::Direct => Vec::new(),
            Transport::Paged { page_size } => (0..pages)
                .map(|_| Page {
                    page_id: None,
                    data: vec![0u8; page_size].into_boxed_slice(),
                    dirty: false,
                    used: 0,
                    stamp: 0,
                })
                .collect(),
        };
        debug!(
            "block cache: {} buffers of {} bytes, transport {:?}",
            buffers, block_size, transport
        );
        Ok(Self {
            device,
            block_size,
            transport,
            slots,
            pages,
            clock: 0,
        })
    }

    /// Block size in bytes
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Transport selected for the device
    pub fn transport(&self) -> Transport {
        self.transport
    }

    /// Number of buffers currently handed out
    pub fn live_buffers(&self) -> usize {
        self.slots.iter().filter(|s| s.live).count()
    }

    fn acquire_slot(&mut self) -> Result<usize> {
        let idx = self
            .slots
            .iter()
            .position(|s| !s.live)
            .ok_or(Ext2Error::NoMemory)?;
        let slot = &mut self.slots[idx];
        slot.live = true;
        slot.assigned = false;
        slot.block_id = 0;
        slot.backing = Backing::Own;
        Ok(idx)
    }

    fn free_slot(&mut self, idx: usize) {
        let slot = &mut self.slots[idx];
        slot.live = false;
        slot.gen = slot.gen.wrapping_add(1);
    }

    fn slot_index(&self, buf: &BlockRef) -> Result<usize> {
        match self.slots.get(buf.slot) {
            Some(slot) if slot.live && slot.gen == buf.gen => Ok(buf.slot),
            _ => Err(Ext2Error::StaleHandle),
        }
    }

    fn handle(&self, idx: usize) -> BlockRef {
        BlockRef {
            slot: idx,
            gen: self.slots[idx].gen,
        }
    }

    /// Read block `block_id` into a buffer
    pub fn get(&mut self, block_id: u32) -> Result<BlockRef> {
        debug_assert!(
            !self
                .slots
                .iter()
                .any(|s| s.live && s.assigned && s.block_id == block_id),
            "block {} fetched twice",
            block_id
        );
        let idx = self.acquire_slot()?;
        if let Err(e) = self.load(idx, block_id) {
            self.free_slot(idx);
            return Err(e);
        }
        let slot = &mut self.slots[idx];
        slot.block_id = block_id;
        slot.assigned = true;
        trace!("get block {}", block_id);
        Ok(self.handle(idx))
    }

    fn load(&mut self, idx: usize, block_id: u32) -> Result<()> {
        match self.transport {
            Transport::Direct => {
                self.device
                    .read_block(block_id as usize, &mut self.slots[idx].scratch)?;
            }
            Transport::Paged { .. } => {
                self.slots[idx].backing = self.attach_to_page(block_id)?;
            }
        }
        Ok(())
    }

    /// Get a zero-filled buffer that has no block number yet
    pub fn get_empty(&mut self) -> Result<BlockRef> {
        let idx = self.acquire_slot()?;
        self.slots[idx].scratch.fill(0);
        Ok(self.handle(idx))
    }

    /// Give the buffer block number `block_id`
    ///
    /// With the paged transport the buffer contents move into the page
    /// holding the block.
    pub fn assign(&mut self, buf: &BlockRef, block_id: u32) -> Result<()> {
        let idx = self.slot_index(buf)?;
        if self.slots[idx].assigned {
            return Err(Ext2Error::InvalidArgument("block already has a number"));
        }
        if let Transport::Paged { .. } = self.transport {
            let backing = self.attach_to_page(block_id)?;
            if let Backing::Page { page, offset } = backing {
                let end = offset + self.block_size;
                self.pages[page].data[offset..end].copy_from_slice(&self.slots[idx].scratch);
            }
            self.slots[idx].backing = backing;
        }
        let slot = &mut self.slots[idx];
        slot.block_id = block_id;
        slot.assigned = true;
        trace!("assign block {}", block_id);
        Ok(())
    }

    /// Block number of the buffer
    pub fn block_id(&self, buf: &BlockRef) -> Result<u32> {
        let slot = &self.slots[self.slot_index(buf)?];
        if slot.assigned {
            Ok(slot.block_id)
        } else {
            Err(Ext2Error::InvalidArgument("block has no number"))
        }
    }

    /// Whether the buffer has a block number
    pub fn is_assigned(&self, buf: &BlockRef) -> Result<bool> {
        Ok(self.slots[self.slot_index(buf)?].assigned)
    }

    /// Write the buffer back
    ///
    /// The direct transport writes through; the paged transport marks the
    /// page dirty and leaves the device write to eviction or [`sync`](Self::sync).
    pub fn write(&mut self, buf: &BlockRef) -> Result<()> {
        let idx = self.slot_index(buf)?;
        let slot = &self.slots[idx];
        if !slot.assigned {
            return Err(Ext2Error::InvalidArgument("block has no number"));
        }
        match slot.backing {
            Backing::Own => {
                self.device.write_block(slot.block_id as usize, &slot.scratch)?;
            }
            Backing::Page { page, .. } => {
                self.pages[page].dirty = true;
            }
        }
        trace!("write block {}", slot.block_id);
        Ok(())
    }

    /// Give a buffer back to the pool
    pub fn release(&mut self, buf: BlockRef) {
        let Ok(idx) = self.slot_index(&buf) else {
            debug_assert!(false, "releasing a stale block buffer");
            return;
        };
        if let Backing::Page { page, offset } = self.slots[idx].backing {
            self.pages[page].used &= !(1u64 << (offset / self.block_size));
        }
        self.free_slot(idx);
    }

    /// Get a buffer for `block_id`, run `f` over it and release it
    pub fn with_block<V>(
        &mut self,
        block_id: u32,
        f: impl FnOnce(&mut Self, &BlockRef) -> Result<V>,
    ) -> Result<V> {
        let buf = self.get(block_id)?;
        let ret = f(self, &buf);
        self.release(buf);
        ret
    }

    fn bytes(&self, buf: &BlockRef) -> Result<&[u8]> {
        let idx = self.slot_index(buf)?;
        Ok(match self.slots[idx].backing {
            Backing::Own => &self.slots[idx].scratch,
            Backing::Page { page, offset } => {
                &self.pages[page].data[offset..offset + self.block_size]
            }
        })
    }

    fn bytes_mut(&mut self, buf: &BlockRef) -> Result<&mut [u8]> {
        let idx = self.slot_index(buf)?;
        let block_size = self.block_size;
        Ok(match self.slots[idx].backing {
            Backing::Own => &mut self.slots[idx].scratch,
            Backing::Page { page, offset } => {
                &mut self.pages[page].data[offset..offset + block_size]
            }
        })
    }

    /// Call `f` over the raw bytes of the buffer
    pub fn read_bytes<V>(&self, buf: &BlockRef, f: impl FnOnce(&[u8]) -> V) -> Result<V> {
        Ok(f(self.bytes(buf)?))
    }

    /// Call `f` over the raw bytes of the buffer to modify them
    pub fn modify_bytes<V>(
        &mut self,
        buf: &BlockRef,
        f: impl FnOnce(&mut [u8]) -> V,
    ) -> Result<V> {
        Ok(f(self.bytes_mut(buf)?))
    }

    /// Call `f` over the on-disk structure of type `T` at `offset`
    pub fn read<T: Pod, V>(
        &self,
        buf: &BlockRef,
        offset: usize,
        f: impl FnOnce(&T) -> V,
    ) -> Result<V> {
        let type_size = core::mem::size_of::<T>();
        assert!(offset + type_size <= self.block_size);
        let value: T = bytemuck::pod_read_unaligned(&self.bytes(buf)?[offset..offset + type_size]);
        Ok(f(&value))
    }

    /// Call `f` over the on-disk structure of type `T` at `offset` to modify it
    pub fn modify<T: Pod, V>(
        &mut self,
        buf: &BlockRef,
        offset: usize,
        f: impl FnOnce(&mut T) -> V,
    ) -> Result<V> {
        let type_size = core::mem::size_of::<T>();
        assert!(offset + type_size <= self.block_size);
        let bytes = &mut self.bytes_mut(buf)?[offset..offset + type_size];
        let mut value: T = bytemuck::pod_read_unaligned(bytes);
        let ret = f(&mut value);
        bytes.copy_from_slice(bytemuck::bytes_of(&value));
        Ok(ret)
    }

    /// Flush every dirty page and ask the device to sync
    pub fn sync(&mut self) -> Result<()> {
        for idx in 0..self.pages.len() {
            self.flush_page(idx)?;
        }
        self.device.sync()?;
        Ok(())
    }

    fn flush_page(&mut self, idx: usize) -> Result<()> {
        let page = &mut self.pages[idx];
        if let (true, Some(page_id)) = (page.dirty, page.page_id) {
            self.device.write_block(page_id, &page.data)?;
            page.dirty = false;
            trace!("flush page {}", page_id);
        }
        Ok(())
    }

    /// Mark the block used in its page, loading the page if needed
    fn attach_to_page(&mut self, block_id: u32) -> Result<Backing> {
        let Transport::Paged { page_size } = self.transport else {
            return Ok(Backing::Own);
        };
        let per_page = page_size / self.block_size;
        let page_id = block_id as usize / per_page;
        let inner = block_id as usize % per_page;
        let page = self.fetch_page(page_id)?;
        debug_assert!(
            self.pages[page].used & (1u64 << inner) == 0,
            "block {} fetched twice",
            block_id
        );
        self.pages[page].used |= 1u64 << inner;
        Ok(Backing::Page {
            page,
            offset: inner * self.block_size,
        })
    }

    fn fetch_page(&mut self, page_id: usize) -> Result<usize> {
        if let Some(idx) = self.pages.iter().position(|p| p.page_id == Some(page_id)) {
            return Ok(idx);
        }
        // substitute: empty pages first, then the oldest page nobody holds
        let victim = self
            .pages
            .iter()
            .enumerate()
            .filter(|(_, p)| p.used == 0)
            .min_by_key(|(_, p)| (p.page_id.is_some(), p.stamp))
            .map(|(idx, _)| idx)
            .ok_or(Ext2Error::NoMemory)?;
        self.flush_page(victim)?;
        self.clock += 1;
        let page = &mut self.pages[victim];
        page.page_id = None;
        self.device.read_block(page_id, &mut page.data)?;
        page.page_id = Some(page_id);
        page.stamp = self.clock;
        trace!("load page {} into slot {}", page_id, victim);
        Ok(victim)
    }
}
