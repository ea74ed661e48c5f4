//! Anonymous pages: heap, stack, and bss memory with no file behind it.
//!
//! Contents live in a frame while resident and in a swap slot after
//! eviction. A page holds at most one slot, and only while evicted.

use crate::mem::swap::SlotIndex;
use crate::mem::{frame_bytes, Result, Vm};

pub struct AnonPage {
    slot: Option<SlotIndex>,
}

impl AnonPage {
    pub(crate) fn new() -> Self {
        Self { slot: None }
    }

    pub fn slot(&self) -> Option<SlotIndex> {
        self.slot
    }

    /// Fill the frame: from the swap slot if the page was evicted, zeroed
    /// otherwise. Fresh anonymous memory is zeroed so data never leaks
    /// between processes.
    pub(crate) fn swap_in(&mut self, vm: &Vm, kva: usize) -> Result<()> {
        // SAFETY: caller owns the (pinned) frame at `kva`.
        let frame = unsafe { frame_bytes(kva) };
        match self.slot.take() {
            Some(slot) => vm.swap.read_and_free(slot, frame),
            None => frame.fill(0),
        }
        Ok(())
    }

    /// Write the frame contents out to a fresh swap slot.
    pub(crate) fn swap_out(&mut self, vm: &Vm, kva: usize) {
        debug_assert!(self.slot.is_none(), "evicted page already holds a slot");
        // SAFETY: caller owns the (pinned) frame at `kva`.
        let frame = unsafe { frame_bytes(kva) };
        self.slot = Some(vm.swap.allocate_and_write(frame));
    }

    /// Give back the swap slot, if the page dies while evicted.
    pub(crate) fn destroy(&mut self, vm: &Vm) {
        if let Some(slot) = self.slot.take() {
            vm.swap.free(slot);
        }
    }
}
