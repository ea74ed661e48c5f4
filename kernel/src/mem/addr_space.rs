use crate::mem::fault::claim;
use crate::mem::page::{BackingTarget, ContentInit, Page, PageBacking, PageRef};
use crate::mem::pagedir::{PageDirRef, PageDirectory};
use crate::mem::spt::SupplementalPageTable;
use crate::mem::{frame_bytes, Result, Vm, VmError};
use alloc::sync::Arc;
use marrowos_shared::mem::{is_page_aligned, is_user_vaddr, USER_STACK_TOP};

/// A process's view of memory: its supplemental page table plus its mapping
/// table, wired to the shared [`Vm`] services.
///
/// Dropping an address space is process exit: every page is destroyed,
/// dirty mmapped pages are written back, swap slots and frames come free.
pub struct AddressSpace {
    vm: Arc<Vm>,
    spt: SupplementalPageTable,
    pagedir: PageDirRef,
    // Stack pointer last seen on entry to the kernel, consulted when a
    // fault originates from kernel code on the process's behalf.
    user_stack_pointer: usize,
}

impl AddressSpace {
    pub fn new(vm: Arc<Vm>) -> Self {
        Self {
            vm,
            spt: SupplementalPageTable::new(),
            pagedir: PageDirectory::new_ref(),
            user_stack_pointer: USER_STACK_TOP,
        }
    }

    pub fn vm(&self) -> &Arc<Vm> {
        &self.vm
    }

    pub fn pagedir(&self) -> &PageDirRef {
        &self.pagedir
    }

    pub fn spt(&self) -> &SupplementalPageTable {
        &self.spt
    }

    pub fn user_stack_pointer(&self) -> usize {
        self.user_stack_pointer
    }

    pub fn set_user_stack_pointer(&mut self, sp: usize) {
        self.user_stack_pointer = sp;
    }

    /// Register a page at `va` that will materialize as `target` on first
    /// fault, running `init` against the fresh frame if provided. Nothing
    /// is allocated or read until then.
    pub fn alloc_page_with_initializer(
        &mut self,
        target: BackingTarget,
        va: usize,
        writable: bool,
        init: Option<ContentInit>,
    ) -> Result<()> {
        if va == 0 || !is_user_vaddr(va) || !is_page_aligned(va) {
            return Err(VmError::BadAddress);
        }
        let page = Page::new_pending(va, writable, target, init, Arc::clone(&self.pagedir));
        self.spt.insert(page).map(|_| ())
    }

    /// [`Self::alloc_page_with_initializer`] without the initializer.
    pub fn alloc_page(&mut self, target: BackingTarget, va: usize, writable: bool) -> Result<()> {
        self.alloc_page_with_initializer(target, va, writable, None)
    }

    /// Force-resolve the page at `va` into a frame, as a fault would.
    pub fn claim_page(&self, va: usize) -> Result<()> {
        let page = self.spt.find(va).ok_or(VmError::NotMapped)?;
        claim(&self.vm, &page)
    }

    pub fn find_page(&self, va: usize) -> Option<PageRef> {
        self.spt.find(va)
    }

    /// Destroy the page at `va` (writing back a dirty mmapped page) and
    /// forget it. Returns false if nothing lives there.
    pub fn remove_page(&mut self, va: usize) -> bool {
        self.spt.remove(&self.vm, va)
    }

    /// Duplicate this address space for a forked child.
    ///
    /// Per-type policy: pending pages are recreated pending (their
    /// initializer will run for the child separately); anonymous pages get
    /// an eager byte-for-byte copy in their own frame; file-backed pages
    /// get their own reopened file window, plus a byte copy when the parent
    /// copy is resident (it may hold writes not yet in the file).
    ///
    /// Any failure aborts the whole copy; the partially built child tears
    /// itself down on drop.
    pub fn fork(&self) -> Result<AddressSpace> {
        let mut child = AddressSpace::new(Arc::clone(&self.vm));
        child.user_stack_pointer = self.user_stack_pointer;

        for (&va, parent_ref) in self.spt.iter() {
            let parent = parent_ref.lock();
            let writable = parent.writable();
            let mapped_page_count = parent.mapped_page_count();

            match parent.backing() {
                PageBacking::Uninit(uninit) => {
                    let target = match uninit.target() {
                        BackingTarget::Anon => BackingTarget::Anon,
                        BackingTarget::File(args) => BackingTarget::File(args.duplicate()?),
                    };
                    let init = uninit.init().map(Arc::clone);
                    drop(parent);
                    child.alloc_page_with_initializer(target, va, writable, init)?;
                }
                PageBacking::Anon(_) => {
                    drop(parent);
                    child.alloc_page(BackingTarget::Anon, va, writable)?;
                    copy_frame_contents(&self.vm, parent_ref, &child, va)?;
                }
                PageBacking::File(file) => {
                    let target = BackingTarget::File(file.map_args().duplicate()?);
                    let parent_resident = parent.is_resident();
                    drop(parent);
                    child.alloc_page(target, va, writable)?;
                    if parent_resident {
                        copy_frame_contents(&self.vm, parent_ref, &child, va)?;
                    }
                }
            }

            if let Some(count) = mapped_page_count {
                let page = child.spt.find(va).expect("child entry just inserted");
                page.lock().set_mapped_page_count(count);
            }
        }
        Ok(child)
    }

    /// Process exit. Consumes the space; teardown happens in [`Drop`], so
    /// this is just the explicit spelling of it.
    pub fn kill(self) {}
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        log::debug!("tearing down address space ({} pages)", self.spt.len());
        self.spt.kill(&self.vm);
    }
}

/// Byte-copy the source page's frame into the child's copy at `va`,
/// faulting either side back in as needed.
fn copy_frame_contents(vm: &Vm, source: &PageRef, child: &AddressSpace, va: usize) -> Result<()> {
    loop {
        let source_guard = source.lock();
        let Some(source_frame) = source_guard.frame() else {
            // Evicted; bring it back and retry. The claim takes the page
            // lock itself, so ours must go first.
            drop(source_guard);
            claim(vm, source)?;
            continue;
        };

        // Holding the source lock keeps the eviction scan off the source
        // frame (it only takes victims it can try_lock).
        child.claim_page(va)?;
        let child_ref = child.spt.find(va).expect("child entry just inserted");
        let child_guard = child_ref.lock();
        let Some(child_frame) = child_guard.frame() else {
            // Evicted again between the claim and here; go around.
            continue;
        };

        // SAFETY: both frames are resident and their pages are locked.
        unsafe {
            frame_bytes(child_frame.kva).copy_from_slice(frame_bytes(source_frame.kva));
        }
        return Ok(());
    }
}
