pub mod tempfs;

use crate::sync::Mutex;
use alloc::sync::Arc;

pub type INodeNum = u64;
pub type Path = str;

/// Represents an open file
///
/// **IMPORTANT**: the kernel must call [`FileSystem::release`]
/// when it closes its last open file to an inode. Otherwise,
/// the filesystem will have to keep around the file's data indefinitely!
/// [`File`] handles do this automatically on drop.
#[derive(Debug, Clone, Copy)]
pub struct FileHandle {
    /// inode number of this file
    pub inode: INodeNum,
    /// allows filesystem to store its own metadata about open files
    pub fs_data: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// directory entry not found
    NotFound,
    /// operation expecting directory called with something that isn't a directory
    NotDirectory,
    /// operation expecting file called with a directory
    IsDirectory,
    /// no space left on device
    NoSpace,
    /// Target destination already exists
    Exists,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NotFound => write!(f, "not found"),
            Self::NotDirectory => write!(f, "not a directory"),
            Self::IsDirectory => write!(f, "is a directory"),
            Self::NoSpace => write!(f, "no space left on device"),
            Self::Exists => write!(f, "destination already exists"),
        }
    }
}

impl core::error::Error for Error {}

pub type Result<T> = core::result::Result<T, Error>;

/// File or directory information, as returned by stat.
pub struct FileInfo {
    /// Whether this is a file or a directory.
    pub r#type: INodeType,
    /// inode number
    pub inode: INodeNum,
    /// Size in bytes
    pub size: u64,
    /// Number of hard links
    pub nlink: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum INodeType {
    /// Regular file
    File,
    /// Directory
    Directory,
}

/// The file operations the memory subsystem consumes.
///
/// This is the regular-file slice of a full VFS; directory iteration and
/// links live with the (out-of-scope) filesystem servers.
pub trait FileSystem: Send {
    /// Get root inode number
    fn root(&self) -> INodeNum;
    /// Look up directory entry
    fn lookup(&self, parent: FileHandle, name: &Path) -> Result<INodeNum>;
    /// Open an existing file/directory.
    fn open(&mut self, inode: INodeNum) -> Result<FileHandle>;
    /// Create a new file in parent, or open it if it already exists (without truncating).
    ///
    /// The kernel must ensure that `parent` is a directory and that `name` is non-empty.
    fn create(&mut self, parent: FileHandle, name: &Path) -> Result<FileHandle>;
    /// Indicate that there are no more references to an open file/directory.
    ///
    /// If there are no links left to the file, the filesystem can delete it
    /// at this point. The kernel must not use any file handle pointing to
    /// this inode after calling this.
    fn release(&mut self, inode: INodeNum);
    /// Read from file into buf at offset.
    ///
    /// The kernel must ensure that `file` is a regular file before calling this.
    fn read(&self, file: FileHandle, offset: u64, buf: &mut [u8]) -> Result<usize>;
    /// Write to file from buf at offset.
    ///
    /// The kernel must ensure that `file` is a regular file before calling this.
    fn write(&mut self, file: FileHandle, offset: u64, buf: &[u8]) -> Result<usize>;
    /// Get information about an open file/directory.
    fn stat(&self, file: FileHandle) -> Result<FileInfo>;
    /// Set a new file size.
    ///
    /// If this is less than the previous size, the extra data is lost.
    /// If it's larger than the previous size, the extended part should be
    /// filled with null bytes.
    fn truncate(&mut self, file: FileHandle, size: u64) -> Result<()>;
}

/// Shared handle to a mounted filesystem.
pub type FileSystemRef = Arc<Mutex<dyn FileSystem>>;

/// An open file with its own lifetime, independent of any file descriptor
/// table. Memory mappings hold these so a mapping survives the descriptor
/// it was created from.
pub struct File {
    fs: FileSystemRef,
    handle: FileHandle,
}

impl File {
    /// Open an existing file in the root directory.
    pub fn open_path(fs: &FileSystemRef, name: &Path) -> Result<File> {
        Self::open_path_with(fs, name, |guard, root, name| {
            let inode = guard.lookup(root, name)?;
            guard.open(inode)
        })
    }

    /// Create (or open) a file in the root directory.
    pub fn create_path(fs: &FileSystemRef, name: &Path) -> Result<File> {
        Self::open_path_with(fs, name, |guard, root, name| guard.create(root, name))
    }

    fn open_path_with(
        fs: &FileSystemRef,
        name: &Path,
        resolve: impl FnOnce(&mut dyn FileSystem, FileHandle, &Path) -> Result<FileHandle>,
    ) -> Result<File> {
        let handle = {
            let mut guard = fs.lock();
            let root_inode = guard.root();
            let root = guard.open(root_inode)?;
            let result = resolve(&mut *guard, root, name);
            guard.release(root.inode);
            result?
        };
        Ok(File {
            fs: Arc::clone(fs),
            handle,
        })
    }

    /// Open this file again. The new handle has its own lifetime; the
    /// underlying inode stays alive until every handle is dropped.
    pub fn reopen(&self) -> Result<File> {
        let handle = self.fs.lock().open(self.handle.inode)?;
        Ok(File {
            fs: Arc::clone(&self.fs),
            handle,
        })
    }

    /// Current size of the file in bytes.
    pub fn length(&self) -> u64 {
        self.fs
            .lock()
            .stat(self.handle)
            .map(|info| info.size)
            .unwrap_or(0)
    }

    pub fn handle(&self) -> FileHandle {
        self.handle
    }

    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.fs.lock().read(self.handle, offset, buf)
    }

    pub fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        self.fs.lock().write(self.handle, offset, buf)
    }
}

impl Drop for File {
    fn drop(&mut self) {
        self.fs.lock().release(self.handle.inode);
    }
}

impl core::fmt::Debug for File {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("File").field("inode", &self.handle.inode).finish()
    }
}
