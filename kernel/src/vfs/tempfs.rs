use crate::vfs::{Error, FileHandle, FileInfo, FileSystem, INodeNum, INodeType, Path, Result};
use alloc::{collections::BTreeMap, string::String, vec::Vec};
use core::cmp::min;

struct TempFile {
    nlink: u16,
    opens: u32,
    data: Vec<u8>,
}

struct TempDirectory {
    entries: BTreeMap<String, INodeNum>,
    opens: u32,
}

enum TempINode {
    File(TempFile),
    Directory(TempDirectory),
}

/// in-memory filesystem
pub struct TempFs {
    inodes: BTreeMap<INodeNum, TempINode>,
}

const ROOT_INO: INodeNum = 1;

const NO_INODE: &str = "Couldn't find inode; either the kernel is using the filesystem incorrectly or we freed an inode when we shouldn't have.";

impl Default for TempFs {
    fn default() -> Self {
        Self::new()
    }
}

impl TempFs {
    pub fn new() -> TempFs {
        let root = TempINode::Directory(TempDirectory {
            entries: BTreeMap::new(),
            opens: 0,
        });
        let mut inodes = BTreeMap::new();
        inodes.insert(ROOT_INO, root);
        TempFs { inodes }
    }

    fn get_inode(&self, handle: FileHandle) -> &TempINode {
        self.inodes.get(&handle.inode).expect(NO_INODE)
    }

    fn get_inode_mut(&mut self, handle: FileHandle) -> &mut TempINode {
        self.inodes.get_mut(&handle.inode).expect(NO_INODE)
    }

    fn add_inode(&mut self, inode: TempINode) -> INodeNum {
        // Inodes are stored in a BTreeMap, so the last entry is the maximum
        // inode number; one past that is free. A u64 won't realistically
        // overflow here.
        let inode_num = *self
            .inodes
            .last_key_value()
            .expect("filesystem should at least contain root")
            .0
            + 1;
        self.inodes.insert(inode_num, inode);
        inode_num
    }

    // Remove an inode once nothing links to it and nothing has it open.
    fn reap(&mut self, inode_num: INodeNum) {
        let Some(TempINode::File(file)) = self.inodes.get(&inode_num) else {
            return;
        };
        if file.nlink == 0 && file.opens == 0 {
            self.inodes.remove(&inode_num);
        }
    }
}

impl FileSystem for TempFs {
    fn root(&self) -> INodeNum {
        ROOT_INO
    }

    fn lookup(&self, parent: FileHandle, name: &Path) -> Result<INodeNum> {
        let TempINode::Directory(dir) = self.get_inode(parent) else {
            return Err(Error::NotDirectory);
        };
        dir.entries.get(name).copied().ok_or(Error::NotFound)
    }

    fn open(&mut self, inode: INodeNum) -> Result<FileHandle> {
        match self.inodes.get_mut(&inode) {
            Some(TempINode::File(file)) => file.opens += 1,
            Some(TempINode::Directory(dir)) => dir.opens += 1,
            None => return Err(Error::NotFound),
        }
        Ok(FileHandle { inode, fs_data: 0 })
    }

    fn create(&mut self, parent: FileHandle, name: &Path) -> Result<FileHandle> {
        assert!(!name.is_empty(), "create called with empty name");
        if let Ok(existing) = self.lookup(parent, name) {
            return self.open(existing);
        }
        let inode = self.add_inode(TempINode::File(TempFile {
            nlink: 1,
            opens: 1,
            data: Vec::new(),
        }));
        let TempINode::Directory(dir) = self.get_inode_mut(parent) else {
            return Err(Error::NotDirectory);
        };
        dir.entries.insert(String::from(name), inode);
        Ok(FileHandle { inode, fs_data: 0 })
    }

    fn release(&mut self, inode: INodeNum) {
        match self.inodes.get_mut(&inode) {
            Some(TempINode::File(file)) => {
                assert!(file.opens > 0, "release without matching open");
                file.opens -= 1;
            }
            Some(TempINode::Directory(dir)) => {
                assert!(dir.opens > 0, "release without matching open");
                dir.opens -= 1;
            }
            None => panic!("{NO_INODE}"),
        }
        self.reap(inode);
    }

    fn read(&self, file: FileHandle, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let TempINode::File(file) = self.get_inode(file) else {
            return Err(Error::IsDirectory);
        };
        let Ok(offset) = usize::try_from(offset) else {
            return Ok(0);
        };
        if offset >= file.data.len() {
            return Ok(0);
        }
        let n = min(buf.len(), file.data.len() - offset);
        buf[..n].copy_from_slice(&file.data[offset..offset + n]);
        Ok(n)
    }

    fn write(&mut self, file: FileHandle, offset: u64, buf: &[u8]) -> Result<usize> {
        let TempINode::File(file) = self.get_inode_mut(file) else {
            return Err(Error::IsDirectory);
        };
        let offset = usize::try_from(offset).map_err(|_| Error::NoSpace)?;
        let end = offset.checked_add(buf.len()).ok_or(Error::NoSpace)?;
        if file.data.len() < end {
            file.data.resize(end, 0);
        }
        file.data[offset..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn stat(&self, file: FileHandle) -> Result<FileInfo> {
        Ok(match self.get_inode(file) {
            TempINode::File(f) => FileInfo {
                r#type: INodeType::File,
                inode: file.inode,
                size: f.data.len() as u64,
                nlink: f.nlink,
            },
            TempINode::Directory(dir) => FileInfo {
                r#type: INodeType::Directory,
                inode: file.inode,
                size: dir.entries.len() as u64,
                nlink: 1,
            },
        })
    }

    fn truncate(&mut self, file: FileHandle, size: u64) -> Result<()> {
        let TempINode::File(file) = self.get_inode_mut(file) else {
            return Err(Error::IsDirectory);
        };
        let size = usize::try_from(size).map_err(|_| Error::NoSpace)?;
        file.data.resize(size, 0);
        Ok(())
    }
}
