use crate::inode::InodeHandle;
use crate::layout::{DirEntryHeader, DIRENT_HEADER_SZ, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG};
use crate::{Ext2Error, Ext2FileSystem, Result, NAME_MAX, ROOT_INO};
use log::{debug, trace};

/// File type tag of a directory entry
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// Not recorded
    Unknown = 0,
    /// Regular file
    Regular = 1,
    /// Directory
    Directory = 2,
    /// Character device
    CharDevice = 3,
    /// Block device
    BlockDevice = 4,
    /// Named pipe
    Fifo = 5,
    /// Socket
    Socket = 6,
    /// Symbolic link
    Symlink = 7,
}

impl FileType {
    /// Decode the on-disk tag
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Regular,
            2 => Self::Directory,
            3 => Self::CharDevice,
            4 => Self::BlockDevice,
            5 => Self::Fifo,
            6 => Self::Socket,
            7 => Self::Symlink,
            _ => Self::Unknown,
        }
    }
    /// Tag matching the type bits of an inode mode
    pub fn from_mode(mode: u16) -> Self {
        match mode & S_IFMT {
            S_IFREG => Self::Regular,
            S_IFDIR => Self::Directory,
            S_IFLNK => Self::Symlink,
            0x2000 => Self::CharDevice,
            0x6000 => Self::BlockDevice,
            0x1000 => Self::Fifo,
            0xC000 => Self::Socket,
            _ => Self::Unknown,
        }
    }
}

/// A directory entry
///
/// On disk the entry takes `rec_len` bytes: an 8-byte header, the name and
/// padding up to the next record.
#[derive(Clone, Copy)]
pub struct DirEntry {
    inode: u32,
    rec_len: u16,
    file_type: FileType,
    name_len: u8,
    name: [u8; NAME_MAX],
}

impl core::fmt::Debug for DirEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DirEntry")
            .field("inode", &self.inode)
            .field("rec_len", &self.rec_len)
            .field("file_type", &self.file_type)
            .field("name", &core::str::from_utf8(self.name_bytes()))
            .finish()
    }
}

/// Bytes a record with a name of `name_len` bytes needs at least
pub(crate) fn min_rec_len(name_len: usize) -> usize {
    (DIRENT_HEADER_SZ + name_len + 3) & !3
}

impl DirEntry {
    /// Create a directory entry from name, inode number and type
    pub fn new(name: &str, inode: u32, file_type: FileType) -> Result<Self> {
        Self::from_bytes(name.as_bytes(), inode, file_type)
    }

    fn from_bytes(name: &[u8], inode: u32, file_type: FileType) -> Result<Self> {
        if name.is_empty() || name.contains(&b'/') || name.contains(&0) {
            return Err(Ext2Error::InvalidArgument("bad file name"));
        }
        if name.len() > NAME_MAX {
            return Err(Ext2Error::NameTooLong);
        }
        let mut bytes = [0u8; NAME_MAX];
        bytes[..name.len()].copy_from_slice(name);
        Ok(Self {
            inode,
            rec_len: min_rec_len(name.len()) as u16,
            file_type,
            name_len: name.len() as u8,
            name: bytes,
        })
    }

    /// Parse the record at `offset` of a directory block
    ///
    /// Returns `None` when the record doesn't fit the block.
    pub(crate) fn parse(block: &[u8], offset: usize) -> Option<Self> {
        let header_end = offset.checked_add(DIRENT_HEADER_SZ)?;
        let header: DirEntryHeader = bytemuck::pod_read_unaligned(block.get(offset..header_end)?);
        let rec_len = header.rec_len as usize;
        let name_len = header.name_len as usize;
        if rec_len < DIRENT_HEADER_SZ
            || rec_len % 4 != 0
            || offset + rec_len > block.len()
            || (header.inode != 0 && min_rec_len(name_len) > rec_len)
        {
            return None;
        }
        let mut name = [0u8; NAME_MAX];
        let stored = name_len.min(rec_len - DIRENT_HEADER_SZ);
        name[..stored].copy_from_slice(&block[header_end..header_end + stored]);
        Some(Self {
            inode: header.inode,
            rec_len: header.rec_len,
            file_type: FileType::from_raw(header.file_type),
            name_len: stored as u8,
            name,
        })
    }

    /// Store the record at `offset` with record length `rec_len`
    pub(crate) fn store(&self, block: &mut [u8], offset: usize, rec_len: usize) {
        let header = DirEntryHeader {
            inode: self.inode,
            rec_len: rec_len as u16,
            name_len: self.name_len,
            file_type: self.file_type as u8,
        };
        let name_start = offset + DIRENT_HEADER_SZ;
        block[offset..name_start].copy_from_slice(bytemuck::bytes_of(&header));
        block[name_start..name_start + self.name_len as usize]
            .copy_from_slice(self.name_bytes());
    }

    /// Get the name of the entry
    pub fn name(&self) -> Option<&str> {
        core::str::from_utf8(self.name_bytes()).ok()
    }
    /// Raw name bytes
    pub fn name_bytes(&self) -> &[u8] {
        &self.name[..self.name_len as usize]
    }
    /// Get inode number of the entry
    pub fn inode(&self) -> u32 {
        self.inode
    }
    /// Type tag of the entry
    pub fn file_type(&self) -> FileType {
        self.file_type
    }
    /// Record length, the smallest one until the entry is stored
    pub fn rec_len(&self) -> usize {
        self.rec_len as usize
    }
    /// Bytes the entry needs at least
    pub fn min_rec_len(&self) -> usize {
        min_rec_len(self.name_len as usize)
    }
    /// Whether the entry is `.` or `..`
    pub fn is_dot(&self) -> bool {
        matches!(self.name_bytes(), b"." | b"..")
    }
}

impl Ext2FileSystem {
    fn ensure_dir(&self, h: InodeHandle) -> Result<()> {
        if self.inodes.get(h)?.disk.is_dir() {
            Ok(())
        } else {
            Err(Ext2Error::NotDir)
        }
    }

    /// Parse the record at `inner` of the block cached for `h`
    fn entry_at(&mut self, h: InodeHandle, inner: usize) -> Result<DirEntry> {
        let data = self.inodes.get(h)?.path.data()?;
        match self
            .blocks
            .read_bytes(data, |block| DirEntry::parse(block, inner))?
        {
            Some(entry) => Ok(entry),
            None => {
                self.corruption("malformed directory entry")?;
                Err(Ext2Error::Corrupted("malformed directory entry"))
            }
        }
    }

    /// First live entry at or after byte `offset` of directory `h`
    ///
    /// Returns the entry with its offset, the next entry starts at
    /// `offset + entry.rec_len()`.
    pub fn dir_read(&mut self, h: InodeHandle, offset: usize) -> Result<Option<(usize, DirEntry)>> {
        self.ensure_mounted()?;
        self.ensure_dir(h)?;
        let size = self.inodes.get(h)?.disk.size as usize;
        let block_size = self.block_size();
        let mut offset = offset;
        while offset < size {
            self.fetch_inode_block(h, (offset / block_size) as u64)?;
            let entry = self.entry_at(h, offset % block_size)?;
            if entry.inode != 0 {
                return Ok(Some((offset, entry)));
            }
            offset += entry.rec_len();
        }
        Ok(None)
    }

    /// Look `name` up in directory `h`
    pub fn dir_find(&mut self, h: InodeHandle, name: &[u8]) -> Result<Option<(usize, DirEntry)>> {
        let mut offset = 0;
        while let Some((at, entry)) = self.dir_read(h, offset)? {
            if entry.name_bytes() == name {
                return Ok(Some((at, entry)));
            }
            offset = at + entry.rec_len();
        }
        Ok(None)
    }

    /// Whether directory `h` holds nothing but `.` and `..`
    pub fn dir_is_empty(&mut self, h: InodeHandle) -> Result<bool> {
        let mut offset = 0;
        while let Some((at, entry)) = self.dir_read(h, offset)? {
            if !entry.is_dot() {
                return Ok(false);
            }
            offset = at + entry.rec_len();
        }
        Ok(true)
    }

    /// Link `entry` into directory `h`
    ///
    /// The entry goes into the first record of the last block with enough
    /// slack, or into a new block appended to the directory.
    pub fn dir_insert(&mut self, h: InodeHandle, entry: &DirEntry) -> Result<()> {
        self.ensure_writable()?;
        self.ensure_dir(h)?;
        let needed = entry.min_rec_len();
        let size = self.inodes.get(h)?.disk.size as usize;
        let block_size = self.block_size();
        if size >= block_size {
            let last = (size / block_size - 1) as u64;
            self.fetch_inode_block(h, last)?;
            let mut inner = 0;
            while inner < block_size {
                let record = self.entry_at(h, inner)?;
                let used = if record.inode == 0 {
                    0
                } else {
                    record.min_rec_len()
                };
                if record.rec_len() - used >= needed {
                    let data = self.inodes.get(h)?.path.data()?;
                    self.blocks.modify_bytes(data, |block| {
                        if used > 0 {
                            record.store(block, inner, used);
                        }
                        entry.store(block, inner + used, record.rec_len() - used);
                    })?;
                    self.blocks.write(data)?;
                    trace!("dir insert at {}", last as usize * block_size + inner + used);
                    return Ok(());
                }
                inner += record.rec_len();
            }
        }
        // no room left, append a block holding only the new entry
        let lblock = (size / block_size) as u64;
        self.fetch_inode_block(h, lblock)?;
        self.assign_inode_path(h)?;
        let data = self.inodes.get(h)?.path.data()?;
        self.blocks
            .modify_bytes(data, |block| entry.store(block, 0, block_size))?;
        self.blocks.write(data)?;
        self.inodes.get_mut(h)?.disk.size += block_size as u32;
        debug!("directory grew to {} blocks", lblock + 1);
        self.inode_commit(h)
    }

    /// Unlink the entry at byte `offset` of directory `h`
    pub fn dir_remove(&mut self, h: InodeHandle, offset: usize) -> Result<()> {
        self.ensure_writable()?;
        self.ensure_dir(h)?;
        let block_size = self.block_size();
        let lblock = (offset / block_size) as u64;
        let target = offset % block_size;
        self.fetch_inode_block(h, lblock)?;
        // find the previous record with a fresh scan
        let mut prev = None;
        let mut inner = 0;
        while inner < target {
            let record = self.entry_at(h, inner)?;
            prev = Some((inner, record));
            inner += record.rec_len();
        }
        if inner != target {
            return Err(Ext2Error::InvalidArgument("no directory entry at offset"));
        }
        let removed = self.entry_at(h, target)?;
        match prev {
            None if removed.rec_len() == block_size => self.dir_release_block(h, lblock),
            None => {
                let next = self.entry_at(h, removed.rec_len())?;
                let data = self.inodes.get(h)?.path.data()?;
                self.blocks.modify_bytes(data, |block| {
                    next.store(block, 0, removed.rec_len() + next.rec_len())
                })?;
                self.blocks.write(data)
            }
            Some((at, record)) => {
                let data = self.inodes.get(h)?.path.data()?;
                self.blocks.modify_bytes(data, |block| {
                    record.store(block, at, record.rec_len() + removed.rec_len())
                })?;
                self.blocks.write(data)
            }
        }
    }

    /// Free directory block `lblock`, moving the last block into its place
    fn dir_release_block(&mut self, h: InodeHandle, lblock: u64) -> Result<()> {
        let block_size = self.block_size() as u64;
        let size = self.inodes.get(h)?.disk.size as u64;
        let last = size / block_size - 1;
        let released = self.inode_block_id(h, lblock)?;
        if lblock != last {
            let moved = self.inode_block_id(h, last)?;
            self.set_inode_block(h, lblock, moved)?;
        }
        self.set_inode_block(h, last, 0)?;
        if released != 0 {
            self.free_block(released)?;
        }
        // drops index blocks left empty past the new end
        self.free_inode_blocks(h, last)?;
        let sectors = self.sectors_per_block();
        let inode = self.inodes.get_mut(h)?;
        inode.disk.size -= block_size as u32;
        if released != 0 {
            inode.disk.blocks = inode.disk.blocks.saturating_sub(sectors);
        }
        debug!("directory shrank to {} blocks", last);
        self.inode_commit(h)
    }

    /// Point the entry at byte `offset` of directory `h` at inode `ino`
    pub fn dir_set_inode(&mut self, h: InodeHandle, offset: usize, ino: u32) -> Result<()> {
        self.ensure_writable()?;
        self.ensure_dir(h)?;
        let block_size = self.block_size();
        self.fetch_inode_block(h, (offset / block_size) as u64)?;
        let inner = offset % block_size;
        let mut entry = self.entry_at(h, inner)?;
        entry.inode = ino;
        let data = self.inodes.get(h)?.path.data()?;
        self.blocks
            .modify_bytes(data, |block| entry.store(block, inner, entry.rec_len()))?;
        self.blocks.write(data)
    }

    /// Resolve an absolute path to an inode number
    pub fn lookup_path(&mut self, path: &str) -> Result<u32> {
        self.ensure_mounted()?;
        let mut ino = ROOT_INO;
        for name in path.split('/').filter(|name| !name.is_empty()) {
            let h = self.inode_get(ino)?;
            let found = match self.ensure_dir(h) {
                Ok(()) => self.dir_find(h, name.as_bytes()),
                Err(e) => Err(e),
            };
            self.inode_drop(h)?;
            ino = found?.ok_or(Ext2Error::NotFound)?.1.inode;
        }
        Ok(ino)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn record_lengths_are_padded() {
        assert_eq!(min_rec_len(1), 12);
        assert_eq!(min_rec_len(4), 12);
        assert_eq!(min_rec_len(5), 16);
        assert_eq!(min_rec_len(255), 264);
        let entry = DirEntry::new("lost+found", 11, FileType::Directory).unwrap();
        assert_eq!(entry.rec_len(), 20);
    }

    #[test]
    fn bad_names_are_rejected() {
        let long = "x".repeat(256);
        assert_eq!(
            DirEntry::new(&long, 12, FileType::Regular).err(),
            Some(Ext2Error::NameTooLong)
        );
        assert!(DirEntry::new("", 12, FileType::Regular).is_err());
        assert!(DirEntry::new("a/b", 12, FileType::Regular).is_err());
    }

    #[test]
    fn stored_entry_parses_back() {
        let mut block = vec![0u8; 1024];
        let entry = DirEntry::new("hello", 42, FileType::Regular).unwrap();
        entry.store(&mut block, 0, 1024);
        let parsed = DirEntry::parse(&block, 0).unwrap();
        assert_eq!(parsed.name(), Some("hello"));
        assert_eq!(parsed.inode(), 42);
        assert_eq!(parsed.file_type(), FileType::Regular);
        assert_eq!(parsed.rec_len(), 1024);
    }

    #[test]
    fn overlong_record_is_malformed() {
        let mut block = vec![0u8; 1024];
        let entry = DirEntry::new("a", 2, FileType::Directory).unwrap();
        entry.store(&mut block, 1000, 40);
        assert!(DirEntry::parse(&block, 1000).is_none());
        entry.store(&mut block, 0, 6);
        assert!(DirEntry::parse(&block, 0).is_none());
    }
}
