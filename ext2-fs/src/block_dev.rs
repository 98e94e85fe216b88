use crate::{DeviceError, SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE};
use core::any::Any;

/// Trait for block devices
/// which reads and writes data in the unit of `buf.len()` bytes
///
/// `read_block(id, buf)` transfers the bytes at offset `id * buf.len()`. The
/// filesystem calls it with one block worth of bytes, or one page when the
/// device can't write anything smaller than a page.
pub trait BlockDevice: Send + Sync + Any {
    /// Size of the device in bytes
    fn device_size(&self) -> u64;
    /// Smallest number of bytes the device can write at once
    fn write_size(&self) -> usize;
    /// Read unit `block_id` into `buf`
    fn read_block(&self, block_id: usize, buf: &mut [u8]) -> Result<(), DeviceError>;
    /// Write `buf` to unit `block_id`
    fn write_block(&self, block_id: usize, buf: &[u8]) -> Result<(), DeviceError>;
    /// Read the fixed 1024-byte superblock region
    fn read_superblock(&self, buf: &mut [u8]) -> Result<(), DeviceError> {
        self.read_block(SUPERBLOCK_OFFSET / SUPERBLOCK_SIZE, &mut buf[..SUPERBLOCK_SIZE])
    }
    /// Flush everything written so far to stable storage
    fn sync(&self) -> Result<(), DeviceError> {
        Ok(())
    }
}
