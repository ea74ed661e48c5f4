use crate::mem::addr_space::AddressSpace;
use crate::mem::page::{BackingTarget, FrameSlot, PageRef};
use crate::mem::{Result, Vm, VmError};
use alloc::sync::Arc;
use marrowos_shared::mem::{
    is_kernel_vaddr, page_round_down, MAX_STACK_SIZE, USER_STACK_TOP,
};

/// What the trap handler knows about a page fault.
pub struct FaultContext {
    /// Faulting virtual address
    pub addr: usize,
    /// Access was a write
    pub write: bool,
    /// Fault originated in user mode (else kernel code touched user memory)
    pub user: bool,
    /// Fault reason was a missing mapping, not a protection violation
    pub not_present: bool,
    /// User stack pointer captured in the trap frame
    pub esp: usize,
}

/// `push`-family instructions fault this far below the stack pointer they
/// are about to move.
pub const PUSH_SLOP: usize = 8;

/// Whether a fault at `addr` with user stack pointer `esp` looks like the
/// stack growing, rather than a wild access: either a push just below the
/// pointer, or an access between the pointer and the stack top, all within
/// the allowed stack region.
pub fn is_stack_growth(addr: usize, esp: usize) -> bool {
    let limit = USER_STACK_TOP - MAX_STACK_SIZE;
    let push = esp.wrapping_sub(PUSH_SLOP);
    (limit <= push && push == addr && addr <= USER_STACK_TOP)
        || (limit <= esp && esp <= addr && addr <= USER_STACK_TOP)
}

impl AddressSpace {
    /// Resolve a page fault, growing the stack when the address pattern
    /// calls for it. An error here means the fault was not ours to fix and
    /// the faulting process should be killed.
    pub fn handle_fault(&mut self, ctx: &FaultContext) -> Result<()> {
        if ctx.addr == 0 || is_kernel_vaddr(ctx.addr) {
            return Err(VmError::BadAddress);
        }
        // Protection violations never resolve by paging something in.
        if !ctx.not_present {
            return Err(VmError::BadAddress);
        }

        let esp = if ctx.user {
            ctx.esp
        } else {
            self.user_stack_pointer()
        };
        if is_stack_growth(ctx.addr, esp) {
            // Eagerly grow before resolving; if the address was already
            // backed the existing page simply wins.
            let _ = self.alloc_page(BackingTarget::Anon, page_round_down(ctx.addr), true);
        }

        let page = self.find_page(ctx.addr).ok_or(VmError::NotMapped)?;
        if ctx.write && !page.lock().writable() {
            return Err(VmError::ReadOnly);
        }
        claim(self.vm(), &page)
    }
}

/// Claim `page` into a frame: acquire one (evicting if needed), link the
/// two, install the mapping, and let the backing fill the contents.
pub(crate) fn claim(vm: &Vm, page_ref: &PageRef) -> Result<()> {
    let mut page = page_ref.lock();
    if page.is_resident() {
        return Ok(());
    }

    let (index, kva) = vm.acquire_frame();
    page.set_frame(FrameSlot { index, kva });

    if !page.pagedir().lock().install(page.va(), kva, page.writable()) {
        // A mapping with no resident page behind it: the tables are
        // inconsistent. Surrender the frame and fail.
        page.clear_frame();
        vm.frames.lock().unlink(index);
        return Err(VmError::BadAddress);
    }

    match page.swap_in(vm, kva) {
        Ok(()) => {
            vm.frames
                .lock()
                .link(index, Arc::clone(page_ref), page.va(), Arc::clone(page.pagedir()));
            Ok(())
        }
        Err(err) => {
            page.pagedir().lock().clear(page.va());
            page.clear_frame();
            vm.frames.lock().unlink(index);
            Err(err)
        }
    }
}
