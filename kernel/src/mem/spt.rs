use crate::mem::page::{Page, PageRef};
use crate::mem::{Result, Vm, VmError};
use crate::sync::Mutex;
use alloc::sync::Arc;
use hashbrown::HashMap;
use marrowos_shared::mem::page_round_down;

/// Per-process index from virtual page address to [`Page`], supplementing
/// the hardware mapping table with everything demand paging needs to know.
///
/// Owned and mutated only by its process (a forking parent briefly writes
/// the child's table before the child exists); the locks that matter live
/// on the pages and the global services.
pub struct SupplementalPageTable {
    pages: HashMap<usize, PageRef>,
}

impl Default for SupplementalPageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SupplementalPageTable {
    pub fn new() -> Self {
        Self {
            pages: HashMap::new(),
        }
    }

    /// The page owning the address `va`, if any. `va` may point anywhere
    /// inside the page.
    pub fn find(&self, va: usize) -> Option<PageRef> {
        self.pages.get(&page_round_down(va)).map(Arc::clone)
    }

    /// Register a new page. Fails without mutating anything if the page's
    /// address is already occupied.
    pub(crate) fn insert(&mut self, page: Page) -> Result<PageRef> {
        let va = page.va();
        if self.pages.contains_key(&va) {
            return Err(VmError::AllocationConflict);
        }
        let page = Arc::new(Mutex::new(page));
        self.pages.insert(va, Arc::clone(&page));
        Ok(page)
    }

    /// Destroy the page at `va` and drop its record. Returns false if no
    /// page lives there.
    pub(crate) fn remove(&mut self, vm: &Vm, va: usize) -> bool {
        match self.pages.remove(&page_round_down(va)) {
            Some(page) => {
                page.lock().destroy(vm);
                true
            }
            None => false,
        }
    }

    /// Destroy every page and empty the table. Runs once, at process exit.
    pub(crate) fn kill(&mut self, vm: &Vm) {
        for (_, page) in self.pages.drain() {
            page.lock().destroy(vm);
        }
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&usize, &PageRef)> {
        self.pages.iter()
    }
}
