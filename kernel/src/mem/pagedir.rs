use crate::sync::Mutex;
use alloc::sync::Arc;
use hashbrown::HashMap;
use marrowos_shared::mem::is_user_vaddr;
use marrowos_shared::paging::{PageTableFlags, VirtualAddress};

/// One installed user mapping: the frame's kernel address plus x86-layout
/// flag bits. The hardware-facing layer walks these to build the real
/// two-level tables; the VM code only ever goes through [`PageDirectory`].
#[derive(Clone, Copy)]
struct PageTableEntry {
    kva: usize,
    flags: PageTableFlags,
}

/// A process's address-space mapping table, keyed by virtual page number.
///
/// Carries the accessed and dirty bits the eviction clock and the writeback
/// paths depend on.
pub struct PageDirectory {
    entries: HashMap<usize, PageTableEntry>,
}

/// Shared handle: the owning process uses it for installs, the frame table
/// reads accessed bits through it during victim scans.
pub type PageDirRef = Arc<Mutex<PageDirectory>>;

impl Default for PageDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl PageDirectory {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn new_ref() -> PageDirRef {
        Arc::new(Mutex::new(Self::new()))
    }

    fn entry(&self, va: usize) -> Option<&PageTableEntry> {
        self.entries.get(&VirtualAddress::page_number_of(va))
    }

    fn entry_mut(&mut self, va: usize) -> Option<&mut PageTableEntry> {
        self.entries.get_mut(&VirtualAddress::page_number_of(va))
    }

    /// Map the page containing `va` to the frame at `kva`. Fails (returns
    /// false, no mutation) if a mapping is already present.
    pub fn install(&mut self, va: usize, kva: usize, writable: bool) -> bool {
        debug_assert!(is_user_vaddr(va));
        let vpn = VirtualAddress::page_number_of(va);
        if self.entries.contains_key(&vpn) {
            return false;
        }
        let flags = PageTableFlags::DEFAULT
            .with_present(true)
            .with_user(true)
            .with_writable(writable);
        self.entries.insert(vpn, PageTableEntry { kva, flags });
        true
    }

    /// Drop the mapping for the page containing `va`, if any.
    pub fn clear(&mut self, va: usize) {
        self.entries.remove(&VirtualAddress::page_number_of(va));
    }

    /// Kernel address of the frame backing `va`'s page, if mapped.
    pub fn translate(&self, va: usize) -> Option<usize> {
        self.entry(va).map(|entry| entry.kva)
    }

    pub fn is_mapped(&self, va: usize) -> bool {
        self.entry(va).is_some()
    }

    pub fn is_writable(&self, va: usize) -> bool {
        self.entry(va).is_some_and(|entry| entry.flags.writable())
    }

    pub fn is_accessed(&self, va: usize) -> bool {
        self.entry(va).is_some_and(|entry| entry.flags.accessed())
    }

    pub fn set_accessed(&mut self, va: usize, accessed: bool) {
        if let Some(entry) = self.entry_mut(va) {
            entry.flags = entry.flags.with_accessed(accessed);
        }
    }

    pub fn is_dirty(&self, va: usize) -> bool {
        self.entry(va).is_some_and(|entry| entry.flags.dirty())
    }

    pub fn set_dirty(&mut self, va: usize, dirty: bool) {
        if let Some(entry) = self.entry_mut(va) {
            entry.flags = entry.flags.with_dirty(dirty);
        }
    }

    pub fn mapping_count(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_is_exclusive_per_page() {
        let mut dir = PageDirectory::new();
        assert!(dir.install(0x1000, 0xaaaa_0000, true));
        assert!(!dir.install(0x1234, 0xbbbb_0000, true));
        assert_eq!(dir.translate(0x1fff), Some(0xaaaa_0000));

        dir.clear(0x1000);
        assert!(!dir.is_mapped(0x1000));
        assert!(dir.install(0x1000, 0xbbbb_0000, false));
        assert!(!dir.is_writable(0x1000));
    }

    #[test]
    fn accessed_and_dirty_bits_start_clear() {
        let mut dir = PageDirectory::new();
        dir.install(0x2000, 0xcccc_0000, true);
        assert!(!dir.is_accessed(0x2000));
        assert!(!dir.is_dirty(0x2000));

        dir.set_accessed(0x2000, true);
        dir.set_dirty(0x2000, true);
        assert!(dir.is_accessed(0x2345));
        assert!(dir.is_dirty(0x2345));

        dir.set_accessed(0x2000, false);
        assert!(!dir.is_accessed(0x2000));
        assert!(dir.is_dirty(0x2000));
    }

    #[test]
    fn queries_on_unmapped_pages_are_false() {
        let dir = PageDirectory::new();
        assert!(!dir.is_accessed(0x5000));
        assert!(!dir.is_dirty(0x5000));
        assert!(!dir.is_writable(0x5000));
        assert_eq!(dir.translate(0x5000), None);
    }
}
