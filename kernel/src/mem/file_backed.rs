//! File-backed pages: the lazily-loaded contents of a memory-mapped file.
//!
//! The durable copy is the file itself. Faulting in reads the page's slice
//! of the file and zero-fills the tail; eviction and destruction write the
//! slice back only when the mapping was dirtied.

use crate::mem::pagedir::PageDirRef;
use crate::mem::{frame_bytes, Result, VmError};
use crate::vfs::File;
use alloc::sync::Arc;
use marrowos_shared::mem::PAGE_FRAME_SIZE;

/// Where in the file one page's contents come from. Built by mmap, carried
/// through the Uninit state, and owned by the materialized page.
pub struct FileMapArgs {
    pub file: Arc<File>,
    pub ofs: u64,
    pub read_bytes: usize,
    pub zero_bytes: usize,
}

impl FileMapArgs {
    /// An independent copy for a forked address space: same window, own
    /// file lifetime.
    pub(crate) fn duplicate(&self) -> Result<Self> {
        let file = self.file.reopen().map_err(|_| VmError::LoadFailed)?;
        Ok(Self {
            file: Arc::new(file),
            ofs: self.ofs,
            read_bytes: self.read_bytes,
            zero_bytes: self.zero_bytes,
        })
    }
}

pub struct FilePage {
    file: Arc<File>,
    ofs: u64,
    read_bytes: usize,
    zero_bytes: usize,
}

impl FilePage {
    pub(crate) fn new(args: FileMapArgs) -> Self {
        debug_assert_eq!(args.read_bytes + args.zero_bytes, PAGE_FRAME_SIZE);
        Self {
            file: args.file,
            ofs: args.ofs,
            read_bytes: args.read_bytes,
            zero_bytes: args.zero_bytes,
        }
    }

    pub(crate) fn map_args(&self) -> FileMapArgs {
        FileMapArgs {
            file: Arc::clone(&self.file),
            ofs: self.ofs,
            read_bytes: self.read_bytes,
            zero_bytes: self.zero_bytes,
        }
    }

    /// Read this page's slice of the file into the frame; everything past
    /// what the file provides is zeroed.
    pub(crate) fn swap_in(&self, kva: usize) -> Result<()> {
        // SAFETY: caller owns the (pinned) frame at `kva`.
        let frame = unsafe { frame_bytes(kva) };
        let n = self
            .file
            .read_at(&mut frame[..self.read_bytes], self.ofs)
            .map_err(|_| VmError::LoadFailed)?;
        frame[n..].fill(0);
        Ok(())
    }

    /// Write the page back to the file if the mapping was dirtied, and
    /// clear the dirty bit. Clean pages cost nothing: the file already
    /// holds their contents.
    pub(crate) fn writeback_if_dirty(&self, pagedir: &PageDirRef, va: usize, kva: usize) {
        let mut dir = pagedir.lock();
        if !dir.is_dirty(va) {
            return;
        }
        // SAFETY: caller owns the frame at `kva`; the page lock is held.
        let frame = unsafe { frame_bytes(kva) };
        match self.file.write_at(&frame[..self.read_bytes], self.ofs) {
            Ok(_) => dir.set_dirty(va, false),
            Err(err) => log::warn!(
                "writeback of mmapped page {va:#x} failed: {err}; contents dropped"
            ),
        }
    }
}
