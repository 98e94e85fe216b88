#![allow(dead_code)]

use ext2_fs::{
    format, BlockDevice, DeviceError, Ext2FileSystem, FormatOptions, MountOptions,
};
use spin::Mutex as SpinMutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// In-memory block device
pub struct RamDisk {
    data: Mutex<Vec<u8>>,
    write_size: usize,
    writes: AtomicUsize,
    fail_writes: AtomicBool,
}

impl RamDisk {
    pub fn new(size: usize, write_size: usize) -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(vec![0u8; size]),
            write_size,
            writes: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
        })
    }

    /// Copy of the whole device
    pub fn image(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }

    /// Overwrite bytes at `offset`
    pub fn poke(&self, offset: usize, bytes: &[u8]) {
        self.data.lock().unwrap()[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn peek(&self, offset: usize, len: usize) -> Vec<u8> {
        self.data.lock().unwrap()[offset..offset + len].to_vec()
    }

    /// Number of device writes so far
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl BlockDevice for RamDisk {
    fn device_size(&self) -> u64 {
        self.data.lock().unwrap().len() as u64
    }
    fn write_size(&self) -> usize {
        self.write_size
    }
    fn read_block(&self, block_id: usize, buf: &mut [u8]) -> Result<(), DeviceError> {
        let data = self.data.lock().unwrap();
        let start = block_id * buf.len();
        let src = data
            .get(start..start + buf.len())
            .ok_or(DeviceError::OutOfRange(block_id))?;
        buf.copy_from_slice(src);
        Ok(())
    }
    fn write_block(&self, block_id: usize, buf: &[u8]) -> Result<(), DeviceError> {
        if self.fail_writes.load(Ordering::SeqCst) || buf.len() < self.write_size {
            return Err(DeviceError::Write);
        }
        let mut data = self.data.lock().unwrap();
        let start = block_id * buf.len();
        data.get_mut(start..start + buf.len())
            .ok_or(DeviceError::OutOfRange(block_id))?
            .copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Format a fresh RAM disk of `blocks` blocks of `block_size` bytes
pub fn fresh_disk(blocks: u32, block_size: usize, write_size: usize) -> Arc<RamDisk> {
    fresh_disk_with(
        write_size,
        FormatOptions {
            block_size,
            blocks: Some(blocks),
            ..FormatOptions::default()
        },
    )
}

/// Format a fresh RAM disk sized for `options.blocks`
pub fn fresh_disk_with(write_size: usize, options: FormatOptions) -> Arc<RamDisk> {
    init_log();
    let blocks = options.blocks.unwrap_or(64) as usize;
    let disk = RamDisk::new(blocks * options.block_size, write_size);
    let device: Arc<dyn BlockDevice> = disk.clone();
    format(&device, &options).unwrap();
    disk
}

/// `blocks` blocks of 1 KiB with room for `inodes` inodes
pub fn roomy_disk(blocks: u32, inodes: u32, write_size: usize) -> Arc<RamDisk> {
    fresh_disk_with(
        write_size,
        FormatOptions {
            blocks: Some(blocks),
            inodes: Some(inodes),
            ..FormatOptions::default()
        },
    )
}

pub fn mount(disk: &Arc<RamDisk>) -> Arc<SpinMutex<Ext2FileSystem>> {
    mount_with(disk, MountOptions::default())
}

pub fn mount_with(disk: &Arc<RamDisk>, options: MountOptions) -> Arc<SpinMutex<Ext2FileSystem>> {
    let device: Arc<dyn BlockDevice> = disk.clone();
    Ext2FileSystem::mount(device, options).unwrap()
}

/// Free blocks according to the superblock
pub fn free_blocks(fs: &Arc<SpinMutex<Ext2FileSystem>>) -> u32 {
    fs.lock().statfs().unwrap().free_blocks
}
