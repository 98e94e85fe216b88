use crate::group::BlockGroup;
use crate::inode::InodePool;
use crate::layout::{
    RoCompatFeatures, EXT2_DYNAMIC_REV, INODE_SIZE, STATE_ERROR, STATE_VALID, SUPPORTED_INCOMPAT,
    SUPPORTED_RO_COMPAT,
};
use crate::{
    BlockCache, BlockDevice, Ext2Error, Inode, MountOptions, Result, SuperBlock, Transport, ROOT_INO,
    SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE,
};
use alloc::sync::Arc;
use alloc::vec::Vec;
use lazy_static::lazy_static;
use log::{debug, error, info, warn};
use spin::Mutex;

lazy_static! {
    /// Devices with a live mount, keyed by the address of the device object
    static ref MOUNTED_DEVICES: Mutex<Vec<usize>> = Mutex::new(Vec::new());
}

pub(crate) fn device_key(device: &Arc<dyn BlockDevice>) -> usize {
    Arc::as_ptr(device) as *const u8 as usize
}

pub(crate) fn is_mounted(device: &Arc<dyn BlockDevice>) -> bool {
    MOUNTED_DEVICES.lock().contains(&device_key(device))
}

/// What to do when on-disk corruption is detected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Log the problem and carry on
    Continue,
    /// Refuse further mutations for the rest of the mount
    ReadOnly,
    /// Halt
    Fatal,
}

impl ErrorPolicy {
    /// Decode the superblock `errors` field, unknown values halt
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            1 => Self::Continue,
            2 => Self::ReadOnly,
            _ => Self::Fatal,
        }
    }
    /// Value stored in the superblock `errors` field
    pub fn as_raw(self) -> u16 {
        match self {
            Self::Continue => 1,
            Self::ReadOnly => 2,
            Self::Fatal => 3,
        }
    }
}

/// Lifecycle of a mount
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountState {
    /// Mutations allowed
    ReadWrite,
    /// Mounted read-only, or downgraded after corruption
    ReadOnly,
    /// Unmounted, every operation fails
    Unmounted,
}

/// Volume statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsStat {
    /// Block size in bytes
    pub block_size: usize,
    /// Total number of blocks
    pub blocks: u32,
    /// Free blocks
    pub free_blocks: u32,
    /// Total number of inodes
    pub inodes: u32,
    /// Free inodes
    pub free_inodes: u32,
    /// Mount state
    pub state: MountState,
    /// Corruption policy in effect
    pub errors: ErrorPolicy,
    /// Volume label, NUL padded
    pub label: [u8; 16],
}

/// A mounted ext2 volume
pub struct Ext2FileSystem {
    /// Real device
    pub(crate) device: Arc<dyn BlockDevice>,
    /// In-memory copy of the superblock, committed after each change
    pub(crate) sb: SuperBlock,
    pub(crate) blocks: BlockCache,
    /// The cached block group
    pub(crate) group: Option<BlockGroup>,
    pub(crate) inodes: InodePool,
    pub(crate) policy: ErrorPolicy,
    pub(crate) state: MountState,
    registered: bool,
}

impl Ext2FileSystem {
    /// Mount the ext2 volume on `device`
    pub fn mount(device: Arc<dyn BlockDevice>, options: MountOptions) -> Result<Arc<Mutex<Self>>> {
        let mut registry = MOUNTED_DEVICES.lock();
        let key = device_key(&device);
        if registry.contains(&key) {
            return Err(Ext2Error::Busy);
        }
        let mut fs = Self::load(device, options)?;
        registry.push(key);
        fs.registered = true;
        Ok(Arc::new(Mutex::new(fs)))
    }

    fn load(device: Arc<dyn BlockDevice>, options: MountOptions) -> Result<Self> {
        let mut raw = [0u8; SUPERBLOCK_SIZE];
        device.read_superblock(&mut raw)?;
        let sb: SuperBlock =
            bytemuck::pod_read_unaligned(&raw[..core::mem::size_of::<SuperBlock>()]);
        let mut read_only = options.read_only;
        Self::validate(&sb, device.as_ref(), &mut read_only)?;
        debug!("mounting {:?}", sb);

        let policy = options
            .errors
            .unwrap_or_else(|| ErrorPolicy::from_raw(sb.errors));
        let blocks = BlockCache::new(
            device.clone(),
            sb.block_size(),
            options.block_buffers,
            options.pages,
        )?;
        let mut fs = Self {
            device,
            sb,
            blocks,
            group: None,
            inodes: InodePool::new(options.inodes),
            policy,
            state: if read_only {
                MountState::ReadOnly
            } else {
                MountState::ReadWrite
            },
            registered: false,
        };
        if fs.sb.state & STATE_VALID == 0 {
            warn!("ext2: volume was not cleanly unmounted");
        }
        if fs.sb.state & STATE_ERROR != 0 {
            warn!("ext2: volume has errors recorded");
        }
        fs.fetch_group(0)?;
        match fs.check_counters() {
            // the policy already moved the mount to read-only
            Err(Ext2Error::Corrupted(_)) if fs.state == MountState::ReadOnly => {}
            other => other?,
        }
        if fs.state == MountState::ReadWrite {
            fs.sb.mnt_count = fs.sb.mnt_count.wrapping_add(1);
            if fs.sb.max_mnt_count != 0 && fs.sb.mnt_count >= fs.sb.max_mnt_count {
                warn!(
                    "ext2: mounted {} times without a check, max is {}",
                    fs.sb.mnt_count, fs.sb.max_mnt_count
                );
            }
            fs.sb.state &= !STATE_VALID;
            fs.commit_superblock()?;
            fs.blocks.sync()?;
        }
        info!(
            "ext2: mounted {} blocks of {} bytes, {:?}",
            fs.sb.blocks_count,
            fs.sb.block_size(),
            fs.state
        );
        Ok(fs)
    }

    fn validate(sb: &SuperBlock, device: &dyn BlockDevice, read_only: &mut bool) -> Result<()> {
        if !sb.is_valid() {
            return Err(Ext2Error::BadMagic);
        }
        if sb.rev_level != EXT2_DYNAMIC_REV {
            return Err(Ext2Error::Unsupported("revision"));
        }
        if sb.inode_size as usize != INODE_SIZE {
            return Err(Ext2Error::Unsupported("inode size"));
        }
        if sb.log_block_size > 6 {
            return Err(Ext2Error::Unsupported("block size"));
        }
        if sb.log_frag_size != sb.log_block_size {
            return Err(Ext2Error::Unsupported("fragment size"));
        }
        if sb.feature_incompat != SUPPORTED_INCOMPAT.bits() {
            return Err(Ext2Error::Unsupported("incompatible features"));
        }
        let ro_compat = RoCompatFeatures::from_bits_truncate(sb.feature_ro_compat);
        if sb.feature_ro_compat & !SUPPORTED_RO_COMPAT.bits() != 0 && !*read_only {
            warn!(
                "ext2: unsupported read-only features {:#x} ({:?}), mounting read-only",
                sb.feature_ro_compat, ro_compat
            );
            *read_only = true;
        }
        if sb.blocks_per_group == 0 || sb.inodes_per_group == 0 {
            return Err(Ext2Error::Corrupted("empty block group"));
        }
        if sb.first_data_block >= sb.blocks_count {
            return Err(Ext2Error::Corrupted("first data block past the volume"));
        }
        if sb.group_count() != 1 || sb.inodes_count != sb.inodes_per_group {
            return Err(Ext2Error::Unsupported("multiple block groups"));
        }
        if sb.blocks_count as u64 * sb.block_size() as u64 > device.device_size() {
            return Err(Ext2Error::Unsupported("volume larger than device"));
        }
        if (SUPERBLOCK_OFFSET + SUPERBLOCK_SIZE) as u64 > device.device_size() {
            return Err(Ext2Error::Unsupported("device too small"));
        }
        Ok(())
    }

    /// Unmount, marking the volume clean
    ///
    /// Fails with [`Ext2Error::Busy`] while inodes are still open.
    pub fn unmount(&mut self) -> Result<()> {
        self.ensure_mounted()?;
        if self.inodes.open_count() > 0 {
            return Err(Ext2Error::Busy);
        }
        if self.state == MountState::ReadWrite {
            self.sb.state |= STATE_VALID;
            self.commit_superblock()?;
        }
        self.release_group();
        self.blocks.sync()?;
        self.state = MountState::Unmounted;
        self.unregister();
        info!("ext2: unmounted");
        Ok(())
    }

    fn unregister(&mut self) {
        if self.registered {
            let key = device_key(&self.device);
            MOUNTED_DEVICES.lock().retain(|k| *k != key);
            self.registered = false;
        }
    }

    /// Current mount state
    pub fn state(&self) -> MountState {
        self.state
    }

    /// Corruption policy in effect
    pub fn error_policy(&self) -> ErrorPolicy {
        self.policy
    }

    /// In-memory superblock
    pub fn superblock(&self) -> &SuperBlock {
        &self.sb
    }

    /// Block size in bytes
    pub fn block_size(&self) -> usize {
        self.blocks.block_size()
    }

    /// How blocks reach the device
    pub fn transport(&self) -> Transport {
        self.blocks.transport()
    }

    /// Volume statistics
    pub fn statfs(&self) -> Result<FsStat> {
        self.ensure_mounted()?;
        Ok(FsStat {
            block_size: self.block_size(),
            blocks: self.sb.blocks_count,
            free_blocks: self.sb.free_blocks_count,
            inodes: self.sb.inodes_count,
            free_inodes: self.sb.free_inodes_count,
            state: self.state,
            errors: self.policy,
            label: self.sb.volume_name,
        })
    }

    /// Flush every cached page and the device
    pub fn sync(&mut self) -> Result<()> {
        self.ensure_mounted()?;
        self.blocks.sync()
    }

    /// Get the root inode of the filesystem
    pub fn root_inode(efs: &Arc<Mutex<Self>>) -> Result<Inode> {
        let handle = efs.lock().inode_get(ROOT_INO)?;
        Ok(Inode::new(handle, ROOT_INO, efs.clone()))
    }

    /// Open the inode at an absolute path
    pub fn open(efs: &Arc<Mutex<Self>>, path: &str) -> Result<Inode> {
        let mut fs = efs.lock();
        let ino = fs.lookup_path(path)?;
        let handle = fs.inode_get(ino)?;
        drop(fs);
        Ok(Inode::new(handle, ino, efs.clone()))
    }

    pub(crate) fn ensure_mounted(&self) -> Result<()> {
        match self.state {
            MountState::Unmounted => Err(Ext2Error::NotMounted),
            _ => Ok(()),
        }
    }

    pub(crate) fn ensure_writable(&self) -> Result<()> {
        match self.state {
            MountState::ReadWrite => Ok(()),
            MountState::ReadOnly => Err(Ext2Error::ReadOnly),
            MountState::Unmounted => Err(Ext2Error::NotMounted),
        }
    }

    /// Report on-disk corruption and apply the error policy
    ///
    /// Returns `Ok` when the caller may go on.
    pub(crate) fn corruption(&mut self, what: &'static str) -> Result<()> {
        error!("ext2: corruption detected: {}", what);
        if self.state == MountState::ReadWrite && self.sb.state & STATE_ERROR == 0 {
            self.sb.state |= STATE_ERROR;
            if let Err(e) = self.commit_superblock() {
                warn!("ext2: failed to record error state: {}", e);
            }
        }
        match self.policy {
            ErrorPolicy::Continue => Ok(()),
            ErrorPolicy::ReadOnly => {
                if self.state == MountState::ReadWrite {
                    warn!("ext2: remounting read-only");
                    self.state = MountState::ReadOnly;
                }
                Err(Ext2Error::Corrupted(what))
            }
            ErrorPolicy::Fatal => panic!("ext2: fatal corruption: {}", what),
        }
    }

    /// Write the in-memory superblock back to disk
    pub(crate) fn commit_superblock(&mut self) -> Result<()> {
        let block_size = self.block_size();
        let block = (SUPERBLOCK_OFFSET / block_size) as u32;
        let offset = SUPERBLOCK_OFFSET % block_size;
        let sb = self.sb;
        self.blocks.with_block(block, |cache, buf| {
            cache.modify(buf, offset, |disk: &mut SuperBlock| *disk = sb)?;
            cache.write(buf)
        })
    }
}

impl Drop for Ext2FileSystem {
    fn drop(&mut self) {
        // a mount that failed half way never marks the volume clean
        if !self.registered || self.state == MountState::Unmounted {
            return;
        }
        if self.inodes.open_count() == 0 {
            if let Err(e) = self.unmount() {
                warn!("ext2: unmount on drop failed: {}", e);
            }
        } else {
            warn!("ext2: dropped with {} open inodes", self.inodes.open_count());
        }
        self.unregister();
    }
}
