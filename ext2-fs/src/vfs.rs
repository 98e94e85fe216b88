use crate::dir::DirEntry;
use crate::inode::InodeHandle;
use crate::layout::{S_IFDIR, S_IFREG};
use crate::{Ext2Error, Ext2FileSystem, FileType, Result, ROOT_INO};
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use log::warn;
use spin::{Mutex, MutexGuard};

/// The state of a inode(file)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    /// inode number
    pub ino: u64,
    /// file type and mode
    pub mode: StatMode,
    /// permission bits
    pub perm: u16,
    /// number of hard links
    pub nlink: u32,
    /// size in bytes
    pub size: u64,
    /// 512-byte sectors holding data
    pub blocks: u64,
}

bitflags! {
    /// The mode of a inode
    /// whether a directory, a file or a symbolic link
    pub struct StatMode: u32 {
        /// null
        const NULL  = 0;
        /// directory
        const DIR   = 0o040000;
        /// ordinary regular file
        const FILE  = 0o100000;
        /// symbolic link
        const LNK   = 0o120000;
    }
}

impl Default for Stat {
    fn default() -> Self {
        Self {
            ino: Default::default(),
            mode: StatMode::NULL,
            perm: Default::default(),
            nlink: Default::default(),
            size: Default::default(),
            blocks: Default::default(),
        }
    }
}

/// An open file or directory of a mounted ext2 volume
///
/// Every method locks the filesystem for its whole duration. Dropping the
/// inode closes it, [`close`](Inode::close) does the same and reports errors.
pub struct Inode {
    handle: InodeHandle,
    ino: u32,
    fs: Arc<Mutex<Ext2FileSystem>>,
    closed: bool,
}

impl Inode {
    /// Wrap an open inode handle
    pub fn new(handle: InodeHandle, ino: u32, fs: Arc<Mutex<Ext2FileSystem>>) -> Self {
        Self {
            handle,
            ino,
            fs,
            closed: false,
        }
    }

    fn lock(&self) -> MutexGuard<Ext2FileSystem> {
        self.fs.lock()
    }

    /// Inode number
    pub fn ino(&self) -> u32 {
        self.ino
    }

    /// Underlying pool handle
    pub fn handle(&self) -> InodeHandle {
        self.handle
    }

    /// Whether the inode is a directory
    pub fn is_dir(&self) -> Result<bool> {
        Ok(self.lock().inode_disk(self.handle)?.is_dir())
    }

    /// Find inode under current inode by name
    pub fn find(&self, name: &str) -> Result<Inode> {
        let mut fs = self.lock();
        let entry = match fs.dir_find(self.handle, name.as_bytes())? {
            Some((_, entry)) => entry,
            None => return Err(Ext2Error::NotFound),
        };
        let handle = fs.inode_get(entry.inode())?;
        Ok(Inode::new(handle, entry.inode(), self.fs.clone()))
    }

    /// Create a regular file under current inode
    pub fn create(&self, name: &str) -> Result<Inode> {
        self.make_node(name, S_IFREG | 0o644)
    }

    /// Create a directory under current inode
    pub fn mkdir(&self, name: &str) -> Result<Inode> {
        self.make_node(name, S_IFDIR | 0o755)
    }

    fn make_node(&self, name: &str, mode: u16) -> Result<Inode> {
        let mut fs = self.lock();
        let (handle, ino) = fs.make_node(self.handle, name, mode)?;
        Ok(Inode::new(handle, ino, self.fs.clone()))
    }

    /// Add a hard link `new_name` to the file `old_name` of this directory
    pub fn link(&self, old_name: &str, new_name: &str) -> Result<()> {
        self.lock().link_node(self.handle, old_name, new_name)
    }

    /// Remove the file `name` from this directory
    ///
    /// The file is freed once its last link is gone and no handle is open.
    pub fn unlink(&self, name: &str) -> Result<()> {
        self.lock().unlink_node(self.handle, name, false)
    }

    /// Remove the empty directory `name` from this directory
    pub fn rmdir(&self, name: &str) -> Result<()> {
        self.lock().unlink_node(self.handle, name, true)
    }

    /// Move `old_name` of this directory to `new_name` of `new_dir`
    pub fn rename(&self, old_name: &str, new_dir: &Inode, new_name: &str) -> Result<()> {
        if !Arc::ptr_eq(&self.fs, &new_dir.fs) {
            return Err(Ext2Error::InvalidArgument("rename across volumes"));
        }
        self.lock()
            .rename_node(self.handle, old_name, new_dir.handle, new_name)
    }

    /// List inodes under current inode
    pub fn ls(&self) -> Result<Vec<String>> {
        Ok(self
            .read_dir()?
            .iter()
            .filter(|entry| !entry.is_dot())
            .map(|entry| String::from_utf8_lossy(entry.name_bytes()).into_owned())
            .collect())
    }

    /// Every live entry of this directory, `.` and `..` included
    pub fn read_dir(&self) -> Result<Vec<DirEntry>> {
        let mut fs = self.lock();
        let mut entries = Vec::new();
        let mut offset = 0;
        while let Some((at, entry)) = fs.dir_read(self.handle, offset)? {
            entries.push(entry);
            offset = at + entry.rec_len();
        }
        Ok(entries)
    }

    /// Read data from current inode
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize> {
        let mut fs = self.lock();
        if fs.inode_disk(self.handle)?.is_dir() {
            return Err(Ext2Error::IsDir);
        }
        fs.inode_read(self.handle, offset, buf)
    }

    /// Write data to current inode
    pub fn write_at(&self, offset: usize, buf: &[u8]) -> Result<usize> {
        let mut fs = self.lock();
        if fs.inode_disk(self.handle)?.is_dir() {
            return Err(Ext2Error::IsDir);
        }
        fs.inode_write(self.handle, offset, buf)
    }

    /// Set the file size
    pub fn truncate(&self, size: u64) -> Result<()> {
        let mut fs = self.lock();
        if fs.inode_disk(self.handle)?.is_dir() {
            return Err(Ext2Error::IsDir);
        }
        fs.inode_truncate(self.handle, size)
    }

    /// Clear the data in current inode
    pub fn clear(&self) -> Result<()> {
        self.truncate(0)
    }

    /// Get the status of the inode
    pub fn stat(&self) -> Result<Stat> {
        let disk = self.lock().inode_disk(self.handle)?;
        let mode = if disk.is_dir() {
            StatMode::DIR
        } else if disk.is_symlink() {
            StatMode::LNK
        } else if disk.is_file() {
            StatMode::FILE
        } else {
            StatMode::NULL
        };
        Ok(Stat {
            ino: self.ino as u64,
            mode,
            perm: disk.mode & 0o7777,
            nlink: disk.links_count as u32,
            size: disk.size as u64,
            blocks: disk.blocks as u64,
        })
    }

    /// Commit the inode and flush the device
    pub fn sync(&self) -> Result<()> {
        self.lock().inode_sync(self.handle)
    }

    /// Open the same inode again
    pub fn try_clone(&self) -> Result<Inode> {
        let handle = self.lock().inode_get(self.ino)?;
        Ok(Inode::new(handle, self.ino, self.fs.clone()))
    }

    /// Close the inode
    ///
    /// Closing the last handle of an unlinked file frees it, which can fail.
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.lock().inode_drop(self.handle)
    }
}

impl Drop for Inode {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.fs.lock().inode_drop(self.handle) {
            warn!("ext2: closing inode {} failed: {}", self.ino, e);
        }
    }
}

impl Ext2FileSystem {
    /// Create `name` in directory `parent` with type and permission bits `mode`
    pub(crate) fn make_node(
        &mut self,
        parent: InodeHandle,
        name: &str,
        mode: u16,
    ) -> Result<(InodeHandle, u32)> {
        self.ensure_writable()?;
        self.ensure_live_dir(parent)?;
        let file_type = FileType::from_mode(mode);
        // validates the name
        DirEntry::new(name, 0, file_type)?;
        if self.dir_find(parent, name.as_bytes())?.is_some() {
            return Err(Ext2Error::Exists);
        }
        let child = self.inode_get(0)?;
        match self.init_node(parent, child, name, mode) {
            Ok(ino) => Ok((child, ino)),
            Err(e) => {
                // frees whatever was allocated for the child
                if self.inode_number(child)? != 0 {
                    self.inodes.get_mut(child)?.disk.links_count = 0;
                    self.inode_set_remove_on_close(child)?;
                }
                self.inode_drop(child)?;
                Err(e)
            }
        }
    }

    fn init_node(
        &mut self,
        parent: InodeHandle,
        child: InodeHandle,
        name: &str,
        mode: u16,
    ) -> Result<u32> {
        let ino = self.alloc_inode()?;
        let inode = self.inodes.get_mut(child)?;
        inode.ino = ino;
        inode.disk.initialize(mode);
        let is_dir = inode.disk.is_dir();
        self.inode_commit(child)?;
        let parent_ino = self.inode_number(parent)?;
        if is_dir {
            self.adjust_used_dirs(1)?;
            self.inodes.get_mut(child)?.disk.links_count = 2;
            self.dir_insert(child, &DirEntry::new(".", ino, FileType::Directory)?)?;
            self.dir_insert(child, &DirEntry::new("..", parent_ino, FileType::Directory)?)?;
        }
        self.dir_insert(parent, &DirEntry::new(name, ino, FileType::from_mode(mode))?)?;
        if is_dir {
            self.inodes.get_mut(parent)?.disk.links_count += 1;
            self.inode_commit(parent)?;
        }
        self.inode_commit(child)?;
        Ok(ino)
    }

    pub(crate) fn link_node(&mut self, dir: InodeHandle, old_name: &str, new_name: &str) -> Result<()> {
        self.ensure_writable()?;
        self.ensure_live_dir(dir)?;
        let (_, entry) = self
            .dir_find(dir, old_name.as_bytes())?
            .ok_or(Ext2Error::NotFound)?;
        if entry.file_type() == FileType::Directory {
            return Err(Ext2Error::IsDir);
        }
        let new_entry = DirEntry::new(new_name, entry.inode(), entry.file_type())?;
        if self.dir_find(dir, new_name.as_bytes())?.is_some() {
            return Err(Ext2Error::Exists);
        }
        let target = self.inode_get(entry.inode())?;
        let ret = self.dir_insert(dir, &new_entry).and_then(|_| {
            self.inodes.get_mut(target)?.disk.links_count += 1;
            self.inode_commit(target)
        });
        self.inode_drop(target)?;
        ret
    }

    /// Remove `name` from `parent`, a directory if `want_dir`
    pub(crate) fn unlink_node(&mut self, parent: InodeHandle, name: &str, want_dir: bool) -> Result<()> {
        self.ensure_writable()?;
        if name == "." || name == ".." {
            return Err(Ext2Error::InvalidArgument("can't unlink dot entries"));
        }
        let (offset, entry) = self
            .dir_find(parent, name.as_bytes())?
            .ok_or(Ext2Error::NotFound)?;
        let child = self.inode_get(entry.inode())?;
        let ret = self.unlink_child(parent, offset, child, want_dir);
        let dropped = self.inode_drop(child);
        ret.and(dropped)
    }

    fn unlink_child(
        &mut self,
        parent: InodeHandle,
        offset: usize,
        child: InodeHandle,
        want_dir: bool,
    ) -> Result<()> {
        let is_dir = self.inode_disk(child)?.is_dir();
        match (want_dir, is_dir) {
            (true, false) => return Err(Ext2Error::NotDir),
            (false, true) => return Err(Ext2Error::IsDir),
            (true, true) if !self.dir_is_empty(child)? => return Err(Ext2Error::NotEmpty),
            _ => {}
        }
        self.dir_remove(parent, offset)?;
        let inode = self.inodes.get_mut(child)?;
        if is_dir {
            // the entry in the parent and `.`
            inode.disk.links_count = 0;
            let parent_inode = self.inodes.get_mut(parent)?;
            parent_inode.disk.links_count = parent_inode.disk.links_count.saturating_sub(1);
            self.inode_commit(parent)?;
        } else {
            inode.disk.links_count = inode.disk.links_count.saturating_sub(1);
        }
        if self.inode_disk(child)?.links_count == 0 {
            self.inode_set_remove_on_close(child)?;
        }
        self.inode_commit(child)
    }

    /// Move `old_name` of `old_parent` to `new_name` of `new_parent`
    ///
    /// An existing file at the destination is replaced, an existing
    /// directory is not.
    pub(crate) fn rename_node(
        &mut self,
        old_parent: InodeHandle,
        old_name: &str,
        new_parent: InodeHandle,
        new_name: &str,
    ) -> Result<()> {
        self.ensure_writable()?;
        for name in [old_name, new_name] {
            if name == "." || name == ".." {
                return Err(Ext2Error::InvalidArgument("can't rename dot entries"));
            }
        }
        self.ensure_live_dir(new_parent)?;
        let (_, entry) = self
            .dir_find(old_parent, old_name.as_bytes())?
            .ok_or(Ext2Error::NotFound)?;
        if old_parent == new_parent && old_name == new_name {
            return Ok(());
        }
        let new_entry = DirEntry::new(new_name, entry.inode(), entry.file_type())?;
        let moving_dir = entry.file_type() == FileType::Directory;
        if moving_dir && old_parent != new_parent {
            self.ensure_not_ancestor(entry.inode(), self.inode_number(new_parent)?)?;
        }
        if let Some((_, existing)) = self.dir_find(new_parent, new_name.as_bytes())? {
            if existing.inode() == entry.inode() {
                return Ok(());
            }
            if existing.file_type() == FileType::Directory {
                return Err(Ext2Error::IsDir);
            }
            if moving_dir {
                return Err(Ext2Error::NotDir);
            }
            self.unlink_node(new_parent, new_name, false)?;
        }
        self.dir_insert(new_parent, &new_entry)?;
        // offsets may have moved, look the old entry up again
        let (offset, _) = self
            .dir_find(old_parent, old_name.as_bytes())?
            .ok_or(Ext2Error::NotFound)?;
        self.dir_remove(old_parent, offset)?;
        if moving_dir && old_parent != new_parent {
            let new_parent_ino = self.inode_number(new_parent)?;
            let child = self.inode_get(entry.inode())?;
            let ret = self
                .dir_find(child, b"..")
                .and_then(|found| found.ok_or(Ext2Error::Corrupted("directory without ..")))
                .and_then(|(dotdot, _)| self.dir_set_inode(child, dotdot, new_parent_ino));
            self.inode_drop(child)?;
            ret?;
            let old = self.inodes.get_mut(old_parent)?;
            old.disk.links_count = old.disk.links_count.saturating_sub(1);
            self.inode_commit(old_parent)?;
            self.inodes.get_mut(new_parent)?.disk.links_count += 1;
            self.inode_commit(new_parent)?;
        }
        Ok(())
    }

    /// Fail unless `h` is a directory that is still linked into the tree
    ///
    /// A directory removed while open only keeps `.` and `..` until closed.
    fn ensure_live_dir(&self, h: InodeHandle) -> Result<()> {
        let disk = self.inode_disk(h)?;
        if !disk.is_dir() {
            return Err(Ext2Error::NotDir);
        }
        if disk.links_count == 0 {
            return Err(Ext2Error::NotFound);
        }
        Ok(())
    }

    /// Fail if directory `dir` is `target` or one of its ancestors
    fn ensure_not_ancestor(&mut self, dir: u32, target: u32) -> Result<()> {
        let mut ino = target;
        loop {
            if ino == dir {
                return Err(Ext2Error::InvalidArgument("directory moved into itself"));
            }
            if ino == ROOT_INO {
                return Ok(());
            }
            let h = self.inode_get(ino)?;
            let found = self.dir_find(h, b"..");
            self.inode_drop(h)?;
            let (_, dotdot) = found?.ok_or(Ext2Error::Corrupted("directory without .."))?;
            ino = dotdot.inode();
        }
    }
}
