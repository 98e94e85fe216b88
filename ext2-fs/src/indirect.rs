//! Logical to physical block translation through the inode's block array
//!
//! Slots 0..12 of the array address data directly, slots 12, 13 and 14 root
//! a single, double and triple indirect tree of block-address arrays.

use crate::inode::InodeHandle;
use crate::{BlockCache, BlockRef, Ext2Error, Ext2FileSystem, Result};
use alloc::vec::Vec;
use core::mem;
use log::trace;

/// Number of direct slots in the inode
pub(crate) const DIRECT_BLOCKS: usize = 12;
/// Deepest indirection level
const MAX_LEVEL: usize = 3;

/// Position of a logical block in the block tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockPath {
    /// 0 for a direct block, 1 to 3 for a block behind that many index blocks
    pub level: usize,
    /// `offsets[0]` is the slot in the inode, `offsets[1..=level]` index the
    /// index blocks from the top
    pub offsets: [usize; MAX_LEVEL + 1],
}

/// Locate logical block `lblock` for blocks holding `ptrs` addresses each
pub fn resolve(lblock: u64, ptrs: u64) -> Result<BlockPath> {
    let mut path = BlockPath::default();
    if lblock < DIRECT_BLOCKS as u64 {
        path.offsets[0] = lblock as usize;
        return Ok(path);
    }
    let mut rel = lblock - DIRECT_BLOCKS as u64;
    let mut span = 1u64;
    for level in 1..=MAX_LEVEL {
        span *= ptrs;
        if rel < span {
            path.level = level;
            path.offsets[0] = DIRECT_BLOCKS + level - 1;
            for depth in (1..=level).rev() {
                path.offsets[depth] = (rel % ptrs) as usize;
                rel /= ptrs;
            }
            return Ok(path);
        }
        rel -= span;
    }
    Err(Ext2Error::OutOfRange)
}

/// Buffers along the path of the last block accessed through an inode
#[derive(Debug, Default)]
pub(crate) struct CachedPath {
    current: Option<u64>,
    path: BlockPath,
    blocks: [Option<BlockRef>; MAX_LEVEL + 1],
}

impl CachedPath {
    /// Release every buffer of the path
    pub fn release(&mut self, cache: &mut BlockCache) {
        for buf in self.blocks.iter_mut() {
            if let Some(buf) = buf.take() {
                cache.release(buf);
            }
        }
        self.current = None;
    }

    /// Buffer of the data block the path leads to
    pub fn data(&self) -> Result<&BlockRef> {
        self.blocks[self.path.level]
            .as_ref()
            .ok_or(Ext2Error::InvalidArgument("no block fetched"))
    }

    /// Logical block the path leads to
    pub fn current(&self) -> Option<u64> {
        self.current
    }

    /// Fetch every level of `path`, keeping the buffers shared with the
    /// cached one
    fn walk(&mut self, cache: &mut BlockCache, roots: &[u32], lblock: u64, path: BlockPath) -> Result<()> {
        let keep = match self.current {
            Some(_) if self.path.level == path.level => (0..=path.level)
                .find(|&depth| self.path.offsets[depth] != path.offsets[depth])
                .unwrap_or(path.level + 1),
            _ => 0,
        };
        for buf in self.blocks[keep..].iter_mut() {
            if let Some(buf) = buf.take() {
                cache.release(buf);
            }
        }
        self.current = None;
        self.path = path;
        for depth in keep..=path.level {
            let block_id = if depth == 0 {
                roots[path.offsets[0]]
            } else {
                let parent = self.blocks[depth - 1]
                    .as_ref()
                    .ok_or(Ext2Error::InvalidArgument("broken block path"))?;
                cache.read(parent, path.offsets[depth] * 4, |ptr: &u32| *ptr)?
            };
            // a zero entry is a hole
            let buf = if block_id == 0 {
                cache.get_empty()?
            } else {
                cache.get(block_id)?
            };
            self.blocks[depth] = Some(buf);
        }
        self.current = Some(lblock);
        Ok(())
    }
}

impl Ext2FileSystem {
    /// Block addresses per block
    pub(crate) fn ptrs_per_block(&self) -> u64 {
        (self.block_size() / 4) as u64
    }

    /// 512-byte sectors per block
    pub(crate) fn sectors_per_block(&self) -> u32 {
        (self.block_size() / 512) as u32
    }

    /// Point the cached path of `h` at logical block `lblock`
    ///
    /// Holes come back as zero-filled unassigned buffers.
    pub(crate) fn fetch_inode_block(&mut self, h: InodeHandle, lblock: u64) -> Result<()> {
        let path = resolve(lblock, self.ptrs_per_block())?;
        let inode = self.inodes.get_mut(h)?;
        if inode.path.current() == Some(lblock) {
            return Ok(());
        }
        let roots = inode.disk.block;
        let mut cached = mem::take(&mut inode.path);
        let ret = cached.walk(&mut self.blocks, &roots, lblock, path);
        if ret.is_err() {
            cached.release(&mut self.blocks);
        }
        self.inodes.get_mut(h)?.path = cached;
        ret
    }

    /// Release the cached path of `h`
    pub(crate) fn release_inode_path(&mut self, h: InodeHandle) -> Result<()> {
        let inode = self.inodes.get_mut(h)?;
        inode.path.release(&mut self.blocks);
        Ok(())
    }

    /// Physical block behind logical block `lblock` of `h`, 0 for a hole
    pub(crate) fn inode_block_id(&mut self, h: InodeHandle, lblock: u64) -> Result<u32> {
        self.fetch_inode_block(h, lblock)?;
        let buf = self.inodes.get(h)?.path.data()?;
        if self.blocks.is_assigned(buf)? {
            self.blocks.block_id(buf)
        } else {
            Ok(0)
        }
    }

    /// Materialize every hole along the cached path of `h`
    ///
    /// Index blocks are written as soon as they get a number, then the
    /// parent entry is updated and the parent written. Only data blocks
    /// count towards `i_blocks`.
    pub(crate) fn assign_inode_path(&mut self, h: InodeHandle) -> Result<()> {
        let mut cached = mem::take(&mut self.inodes.get_mut(h)?.path);
        let ret = self.assign_path(h, &mut cached);
        if ret.is_err() {
            cached.release(&mut self.blocks);
        }
        self.inodes.get_mut(h)?.path = cached;
        ret
    }

    fn assign_path(&mut self, h: InodeHandle, cached: &mut CachedPath) -> Result<()> {
        let level = cached.path.level;
        for depth in 0..=level {
            let buf = cached.blocks[depth]
                .as_ref()
                .ok_or(Ext2Error::InvalidArgument("no block fetched"))?;
            if self.blocks.is_assigned(buf)? {
                continue;
            }
            let block_id = self.assign_block_number(buf)?;
            if depth < level {
                self.blocks.write(buf)?;
            } else {
                let sectors = self.sectors_per_block();
                let inode = self.inodes.get_mut(h)?;
                inode.disk.blocks += sectors;
            }
            let offset = cached.path.offsets[depth];
            if depth == 0 {
                self.inodes.get_mut(h)?.disk.block[offset] = block_id;
            } else {
                let parent = cached.blocks[depth - 1]
                    .as_ref()
                    .ok_or(Ext2Error::InvalidArgument("broken block path"))?;
                self.blocks
                    .modify(parent, offset * 4, |ptr: &mut u32| *ptr = block_id)?;
                self.blocks.write(parent)?;
            }
            trace!("materialized level {} of block path at {}", depth, block_id);
        }
        self.inode_commit(h)
    }

    /// Point logical block `lblock` of `h` at `block_id`
    ///
    /// Used to move directory blocks around. The index blocks on the way must
    /// exist unless `block_id` is 0.
    pub(crate) fn set_inode_block(&mut self, h: InodeHandle, lblock: u64, block_id: u32) -> Result<()> {
        self.release_inode_path(h)?;
        let path = resolve(lblock, self.ptrs_per_block())?;
        if path.level == 0 {
            self.inodes.get_mut(h)?.disk.block[path.offsets[0]] = block_id;
            return self.inode_commit(h);
        }
        let mut index = self.inodes.get(h)?.disk.block[path.offsets[0]];
        for depth in 1..path.level {
            if index == 0 {
                break;
            }
            index = self.read_ptr(index, path.offsets[depth])?;
        }
        if index == 0 {
            return if block_id == 0 {
                Ok(())
            } else {
                Err(Ext2Error::Corrupted("missing index block"))
            };
        }
        let slot = path.offsets[path.level];
        self.blocks.with_block(index, |cache, buf| {
            cache.modify(buf, slot * 4, |ptr: &mut u32| *ptr = block_id)?;
            cache.write(buf)
        })
    }

    fn read_ptr(&mut self, block_id: u32, slot: usize) -> Result<u32> {
        self.blocks
            .with_block(block_id, |cache, buf| cache.read(buf, slot * 4, |ptr: &u32| *ptr))
    }

    /// Copy out every address of index block `block_id`
    fn read_ptrs(&mut self, block_id: u32) -> Result<Vec<u32>> {
        self.blocks.with_block(block_id, |cache, buf| {
            cache.read_bytes(buf, |bytes| {
                bytes
                    .chunks_exact(4)
                    .map(|ptr| u32::from_le_bytes([ptr[0], ptr[1], ptr[2], ptr[3]]))
                    .collect()
            })
        })
    }

    fn write_ptrs(&mut self, block_id: u32, ptrs: &[u32]) -> Result<()> {
        self.blocks.with_block(block_id, |cache, buf| {
            cache.modify_bytes(buf, |bytes| {
                for (dst, ptr) in bytes.chunks_exact_mut(4).zip(ptrs) {
                    dst.copy_from_slice(&ptr.to_le_bytes());
                }
            })?;
            cache.write(buf)
        })
    }

    /// Free every block of `h` from logical block `first` on
    ///
    /// Returns the number of data blocks freed, index blocks are not
    /// counted. The caller adjusts `i_blocks` and commits the inode.
    pub(crate) fn free_inode_blocks(&mut self, h: InodeHandle, first: u64) -> Result<u32> {
        self.release_inode_path(h)?;
        let mut roots = self.inodes.get(h)?.disk.block;
        let ret = self.free_from_roots(&mut roots, first);
        // keep whatever was freed before a failure out of the inode
        self.inodes.get_mut(h)?.disk.block = roots;
        ret
    }

    fn free_from_roots(&mut self, roots: &mut [u32], first: u64) -> Result<u32> {
        let ptrs = self.ptrs_per_block();
        let mut freed = 0;
        for slot in (first.min(DIRECT_BLOCKS as u64) as usize)..DIRECT_BLOCKS {
            if roots[slot] != 0 {
                self.free_block(roots[slot])?;
                roots[slot] = 0;
                freed += 1;
            }
        }
        let mut start = DIRECT_BLOCKS as u64;
        let mut span = 1u64;
        for level in 1..=MAX_LEVEL {
            span *= ptrs;
            let slot = DIRECT_BLOCKS + level - 1;
            let root = roots[slot];
            if root != 0 {
                if first <= start {
                    freed += self.free_subtree(root, level)?;
                    roots[slot] = 0;
                } else if first < start + span {
                    let (count, empty) = self.truncate_subtree(root, level, first - start)?;
                    freed += count;
                    if empty {
                        self.free_block(root)?;
                        roots[slot] = 0;
                    }
                }
            }
            start += span;
        }
        Ok(freed)
    }

    /// Free index block `block_id` of depth `depth` with everything below it
    fn free_subtree(&mut self, block_id: u32, depth: usize) -> Result<u32> {
        let ptrs = self.read_ptrs(block_id)?;
        let mut freed = 0;
        for ptr in ptrs.into_iter().filter(|ptr| *ptr != 0) {
            if depth == 1 {
                self.free_block(ptr)?;
                freed += 1;
            } else {
                freed += self.free_subtree(ptr, depth - 1)?;
            }
        }
        self.free_block(block_id)?;
        Ok(freed)
    }

    /// Free the part of the subtree under `block_id` from relative index `rel` on
    ///
    /// Returns the data blocks freed and whether the index block is left
    /// without any live entry, in which case the caller frees it.
    fn truncate_subtree(&mut self, block_id: u32, depth: usize, rel: u64) -> Result<(u32, bool)> {
        let mut ptrs = self.read_ptrs(block_id)?;
        let child_span = self.ptrs_per_block().pow(depth as u32 - 1);
        let first = (rel / child_span) as usize;
        let partial = rel % child_span;
        let mut freed = 0;
        let mut changed = false;
        for idx in first..ptrs.len() {
            let ptr = ptrs[idx];
            if ptr == 0 {
                continue;
            }
            if depth == 1 {
                self.free_block(ptr)?;
                freed += 1;
            } else if idx == first && partial > 0 {
                let (count, empty) = self.truncate_subtree(ptr, depth - 1, partial)?;
                freed += count;
                if !empty {
                    continue;
                }
                self.free_block(ptr)?;
            } else {
                freed += self.free_subtree(ptr, depth - 1)?;
            }
            ptrs[idx] = 0;
            changed = true;
        }
        let empty = ptrs.iter().all(|ptr| *ptr == 0);
        if changed && !empty {
            self.write_ptrs(block_id, &ptrs)?;
        }
        Ok((freed, empty))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn direct_blocks() {
        let path = resolve(11, 256).unwrap();
        assert_eq!(path.level, 0);
        assert_eq!(path.offsets[0], 11);
    }

    #[test]
    fn first_indirect_block() {
        let path = resolve(12, 256).unwrap();
        assert_eq!(path.level, 1);
        assert_eq!(&path.offsets[..2], &[12, 0]);
        let path = resolve(12 + 255, 256).unwrap();
        assert_eq!(&path.offsets[..2], &[12, 255]);
    }

    #[test]
    fn single_indirect_rolls_into_double() {
        let path = resolve(12 + 256, 256).unwrap();
        assert_eq!(path.level, 2);
        assert_eq!(&path.offsets[..3], &[13, 0, 0]);
    }

    #[test]
    fn double_indirect_boundary() {
        let last = 12 + 256 + 256 * 256 - 1;
        let path = resolve(last, 256).unwrap();
        assert_eq!(path.level, 2);
        assert_eq!(&path.offsets[..3], &[13, 255, 255]);
        let path = resolve(last + 1, 256).unwrap();
        assert_eq!(path.level, 3);
        assert_eq!(path.offsets, [14, 0, 0, 0]);
    }

    #[test]
    fn past_triple_indirect_is_out_of_range() {
        let end = 12 + 256 + 256 * 256 + 256 * 256 * 256;
        assert_eq!(resolve(end - 1, 256).unwrap().offsets, [14, 255, 255, 255]);
        assert_eq!(resolve(end, 256), Err(Ext2Error::OutOfRange));
    }

    proptest! {
        #[test]
        fn offsets_stay_within_block(lblock in 0u64..(12 + 1024 + 1024 * 1024), shift in 0u32..3) {
            let ptrs = 256u64 << shift;
            let path = resolve(lblock, ptrs).unwrap();
            prop_assert!(path.offsets[0] < 15);
            for depth in 1..=path.level {
                prop_assert!((path.offsets[depth] as u64) < ptrs);
            }
            // the digits reassemble to the logical index
            if path.level > 0 {
                let mut rel = 0u64;
                for depth in 1..=path.level {
                    rel = rel * ptrs + path.offsets[depth] as u64;
                }
                let below: u64 = (1..path.level as u32).map(|l| ptrs.pow(l)).sum();
                prop_assert_eq!(12 + below + rel, lblock);
            }
        }
    }
}
