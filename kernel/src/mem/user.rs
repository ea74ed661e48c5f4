//! Checked access to user memory from kernel code.
//!
//! Syscalls (and the tests) go through these instead of dereferencing user
//! pointers: the range is checked against the kernel boundary, missing
//! pages are faulted in the way a hardware access would fault them, and the
//! accessed/dirty bits are maintained the way the MMU would maintain them.

use crate::mem::addr_space::AddressSpace;
use crate::mem::fault::FaultContext;
use crate::mem::{frame_bytes, Result, VmError};
use core::cmp::min;
use marrowos_shared::mem::{is_user_vaddr, page_offset, page_round_down, OFFSET, PAGE_FRAME_SIZE};

impl AddressSpace {
    /// Copy `buf` into user memory at `va`.
    pub fn write_user(&mut self, mut va: usize, mut buf: &[u8]) -> Result<()> {
        check_user_range(va, buf.len())?;
        while !buf.is_empty() {
            let kva = self.resolve_user_page(va, true)?;
            let off = page_offset(va);
            let n = min(PAGE_FRAME_SIZE - off, buf.len());
            // SAFETY: the page was just resolved and this thread is the
            // process's only execution context.
            unsafe { frame_bytes(kva)[off..off + n].copy_from_slice(&buf[..n]) };
            va += n;
            buf = &buf[n..];
        }
        Ok(())
    }

    /// Copy user memory at `va` into `buf`.
    pub fn read_user(&mut self, mut va: usize, mut buf: &mut [u8]) -> Result<()> {
        check_user_range(va, buf.len())?;
        while !buf.is_empty() {
            let kva = self.resolve_user_page(va, false)?;
            let off = page_offset(va);
            let n = min(PAGE_FRAME_SIZE - off, buf.len());
            let (head, tail) = core::mem::take(&mut buf).split_at_mut(n);
            // SAFETY: as in `write_user`.
            unsafe { head.copy_from_slice(&frame_bytes(kva)[off..off + n]) };
            va += n;
            buf = tail;
        }
        Ok(())
    }

    /// Translate one user page, faulting it in if needed, and touch its
    /// accessed (and for writes, dirty) bit.
    fn resolve_user_page(&mut self, va: usize, write: bool) -> Result<usize> {
        let base = page_round_down(va);
        loop {
            {
                let mut dir = self.pagedir().lock();
                if let Some(kva) = dir.translate(base) {
                    if write && !dir.is_writable(base) {
                        return Err(VmError::ReadOnly);
                    }
                    dir.set_accessed(base, true);
                    if write {
                        dir.set_dirty(base, true);
                    }
                    return Ok(kva);
                }
            }
            // Not mapped: take the same path a hardware fault would.
            let esp = self.user_stack_pointer();
            self.handle_fault(&FaultContext {
                addr: va,
                write,
                user: true,
                not_present: true,
                esp,
            })?;
        }
    }
}

fn check_user_range(va: usize, len: usize) -> Result<()> {
    if len == 0 {
        return Ok(());
    }
    if !is_user_vaddr(va) {
        return Err(VmError::BadAddress);
    }
    let end = va.checked_add(len).ok_or(VmError::BadAddress)?;
    if end > OFFSET {
        return Err(VmError::BadAddress);
    }
    Ok(())
}
