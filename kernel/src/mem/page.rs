use crate::mem::anon::AnonPage;
use crate::mem::file_backed::{FileMapArgs, FilePage};
use crate::mem::frame_table::FrameIndex;
use crate::mem::pagedir::PageDirRef;
use crate::mem::uninit::UninitPage;
use crate::mem::{frame_bytes, Result, Vm, VmError};
use crate::sync::Mutex;
use alloc::sync::Arc;
use marrowos_shared::mem::is_page_aligned;

/// What an uninitialized page will become on its first fault.
pub enum BackingTarget {
    Anon,
    File(FileMapArgs),
}

impl BackingTarget {
    pub fn kind(&self) -> BackingKind {
        match self {
            BackingTarget::Anon => BackingKind::Anon,
            BackingTarget::File(_) => BackingKind::File,
        }
    }
}

/// Concrete backing type of a page. Uninitialized pages report the type
/// they will become.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackingKind {
    Anon,
    File,
}

/// Extra initialization run against a freshly materialized page, e.g. an
/// executable loader filling a segment. Receives the page and its frame's
/// contents; returns false to fail the fault.
pub type ContentInit = Arc<dyn Fn(&Page, &mut [u8]) -> bool + Send + Sync>;

/// The backing state of a page. Pages are born [`Uninit`](PageBacking::Uninit)
/// and transmute exactly once, on first claim, into one of the concrete
/// variants; there is no reverse transition.
pub enum PageBacking {
    Uninit(UninitPage),
    Anon(AnonPage),
    File(FilePage),
}

impl PageBacking {
    pub fn kind(&self) -> BackingKind {
        match self {
            PageBacking::Uninit(uninit) => uninit.target().kind(),
            PageBacking::Anon(_) => BackingKind::Anon,
            PageBacking::File(_) => BackingKind::File,
        }
    }

    pub fn is_materialized(&self) -> bool {
        !matches!(self, PageBacking::Uninit(_))
    }
}

/// A page's residency: which frame currently holds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSlot {
    pub index: FrameIndex,
    pub kva: usize,
}

/// One virtual page of a process's address space.
pub struct Page {
    va: usize,
    writable: bool,
    backing: PageBacking,
    frame: Option<FrameSlot>,
    pagedir: PageDirRef,
    // Set on the first page of an mmap region: how many contiguous pages
    // the mapping spans, so munmap can find them all.
    mapped_page_count: Option<usize>,
}

/// Pages are owned by their process's supplemental page table and referenced
/// by the frame table; the mutex arbitrates between a claim on the owning
/// side and an eviction on the frame side.
pub type PageRef = Arc<Mutex<Page>>;

impl Page {
    pub(crate) fn new_pending(
        va: usize,
        writable: bool,
        target: BackingTarget,
        init: Option<ContentInit>,
        pagedir: PageDirRef,
    ) -> Page {
        debug_assert!(is_page_aligned(va));
        Page {
            va,
            writable,
            backing: PageBacking::Uninit(UninitPage::new(target, init)),
            frame: None,
            pagedir,
            mapped_page_count: None,
        }
    }

    pub fn va(&self) -> usize {
        self.va
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn kind(&self) -> BackingKind {
        self.backing.kind()
    }

    pub fn backing(&self) -> &PageBacking {
        &self.backing
    }

    pub fn is_resident(&self) -> bool {
        self.frame.is_some()
    }

    pub fn frame(&self) -> Option<FrameSlot> {
        self.frame
    }

    pub(crate) fn set_frame(&mut self, frame: FrameSlot) {
        debug_assert!(self.frame.is_none(), "page already resident in a frame");
        self.frame = Some(frame);
    }

    pub(crate) fn clear_frame(&mut self) {
        self.frame = None;
    }

    pub(crate) fn pagedir(&self) -> &PageDirRef {
        &self.pagedir
    }

    pub fn mapped_page_count(&self) -> Option<usize> {
        self.mapped_page_count
    }

    pub(crate) fn set_mapped_page_count(&mut self, count: usize) {
        self.mapped_page_count = Some(count);
    }

    /// Populate the frame at `kva` with this page's contents. For a page's
    /// first claim this transmutes the pending backing into its concrete
    /// form; afterwards it reads back whatever durable copy the backing
    /// keeps (swap slot or file).
    pub(crate) fn swap_in(&mut self, vm: &Vm, kva: usize) -> Result<()> {
        if !self.backing.is_materialized() {
            return self.materialize(vm, kva);
        }
        match &mut self.backing {
            PageBacking::Anon(anon) => anon.swap_in(vm, kva),
            PageBacking::File(file) => file.swap_in(kva),
            PageBacking::Uninit(_) => unreachable!(),
        }
    }

    /// The one-shot Uninit transition. Builds the concrete backing, fills
    /// the frame the way that backing would on any fault, then runs the
    /// caller's content initializer. Both steps must succeed.
    fn materialize(&mut self, vm: &Vm, kva: usize) -> Result<()> {
        let placeholder = PageBacking::Anon(AnonPage::new());
        let PageBacking::Uninit(uninit) = core::mem::replace(&mut self.backing, placeholder)
        else {
            unreachable!("materialize called twice");
        };
        let (target, init) = uninit.into_parts();
        self.backing = match target {
            BackingTarget::Anon => PageBacking::Anon(AnonPage::new()),
            BackingTarget::File(args) => PageBacking::File(FilePage::new(args)),
        };

        match &mut self.backing {
            PageBacking::Anon(anon) => anon.swap_in(vm, kva)?,
            PageBacking::File(file) => file.swap_in(kva)?,
            PageBacking::Uninit(_) => unreachable!(),
        }

        if let Some(init) = init {
            // SAFETY: the frame is pinned and linked to this page, and we
            // hold the page lock.
            let frame = unsafe { frame_bytes(kva) };
            if !init(self, frame) {
                return Err(VmError::LoadFailed);
            }
        }
        Ok(())
    }

    /// Persist the page's frame contents to durable backing (swap slot, or
    /// the file if dirty), then detach the page from its frame and drop the
    /// address-space mapping.
    pub(crate) fn swap_out(&mut self, vm: &Vm) {
        // A page can lose its frame between victim selection and this call
        // if its owner destroyed it meanwhile; nothing left to do then.
        let Some(frame) = self.frame.take() else {
            return;
        };
        match &mut self.backing {
            PageBacking::Anon(anon) => anon.swap_out(vm, frame.kva),
            PageBacking::File(file) => file.writeback_if_dirty(&self.pagedir, self.va, frame.kva),
            PageBacking::Uninit(_) => unreachable!("uninitialized page cannot be resident"),
        }
        self.pagedir.lock().clear(self.va);
        log::debug!("evicted page {:#x} from frame {}", self.va, frame.index);
    }

    /// Release backing-specific resources. The page record itself belongs
    /// to the supplemental page table, which frees it after this returns.
    pub(crate) fn destroy(&mut self, vm: &Vm) {
        match &mut self.backing {
            PageBacking::Uninit(_) => {}
            PageBacking::Anon(anon) => anon.destroy(vm),
            PageBacking::File(file) => {
                if let Some(frame) = self.frame {
                    file.writeback_if_dirty(&self.pagedir, self.va, frame.kva);
                }
            }
        }
        if let Some(frame) = self.frame.take() {
            vm.frames.lock().unlink(frame.index);
            self.pagedir.lock().clear(self.va);
        }
    }
}
