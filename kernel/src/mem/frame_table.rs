use crate::mem::page::PageRef;
use crate::mem::pagedir::PageDirRef;
use crate::mem::Vm;
use alloc::sync::Arc;
use alloc::vec::Vec;

pub type FrameIndex = usize;

/// One physical frame committed to user content.
///
/// `va`/`pagedir` mirror the resident page's identity so the clock scan can
/// read accessed bits without taking any page lock.
struct FrameEntry {
    kva: usize,
    page: Option<PageRef>,
    va: usize,
    pagedir: Option<PageDirRef>,
    // A pinned frame is invisible to the victim scan: it is mid-claim or
    // mid-eviction on some thread.
    pinned: bool,
}

/// Every frame holding (or about to hold) user pages, in registration
/// order. The clock hand walks this list; the whole table is guarded by one
/// lock in [`Vm`].
pub struct FrameTable {
    frames: Vec<FrameEntry>,
    hand: usize,
}

impl FrameTable {
    pub(crate) fn new() -> Self {
        Self {
            frames: Vec::new(),
            hand: 0,
        }
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub(crate) fn kva(&self, index: FrameIndex) -> usize {
        self.frames[index].kva
    }

    pub fn resident_page(&self, index: FrameIndex) -> Option<PageRef> {
        self.frames[index].page.as_ref().map(Arc::clone)
    }

    /// Track a frame freshly carved from the user pool. It starts pinned
    /// and unowned; `link` publishes it.
    fn register(&mut self, kva: usize) -> FrameIndex {
        self.frames.push(FrameEntry {
            kva,
            page: None,
            va: 0,
            pagedir: None,
            pinned: true,
        });
        self.frames.len() - 1
    }

    /// Publish the frame↔page link and make the frame evictable again.
    pub(crate) fn link(&mut self, index: FrameIndex, page: PageRef, va: usize, pagedir: PageDirRef) {
        let entry = &mut self.frames[index];
        debug_assert!(entry.page.is_none(), "frame already owned");
        entry.page = Some(page);
        entry.va = va;
        entry.pagedir = Some(pagedir);
        entry.pinned = false;
    }

    /// Drop the frame↔page link, leaving the frame unowned and evictable
    /// (the scan treats it as an immediate victim).
    pub(crate) fn unlink(&mut self, index: FrameIndex) {
        let entry = &mut self.frames[index];
        entry.page = None;
        entry.pagedir = None;
        entry.pinned = false;
    }

    /// Second-chance scan for an eviction victim.
    ///
    /// An unowned frame is taken immediately. An owned frame whose page was
    /// accessed since the last pass loses its accessed bit and survives; the
    /// first one found with the bit clear is the victim. The victim comes
    /// back pinned, with its page link already severed (the page itself
    /// still believes it is resident until `swap_out` runs).
    fn select_victim(&mut self) -> Option<(FrameIndex, Option<PageRef>)> {
        let len = self.frames.len();
        if len == 0 {
            return None;
        }
        for _ in 0..2 * len {
            let index = self.hand;
            self.hand = (self.hand + 1) % len;
            let entry = &mut self.frames[index];
            if entry.pinned {
                continue;
            }
            let Some(page) = &entry.page else {
                entry.pinned = true;
                return Some((index, None));
            };
            let pagedir = entry
                .pagedir
                .as_ref()
                .expect("owned frame without a directory");
            let mut dir = pagedir.lock();
            if dir.is_accessed(entry.va) {
                dir.set_accessed(entry.va, false);
            } else {
                drop(dir);
                let page = Arc::clone(page);
                entry.page = None;
                entry.pinned = true;
                return Some((index, Some(page)));
            }
        }
        None
    }

    // Undo a victim selection whose page turned out to be locked elsewhere.
    // If the owner destroyed the page in the meantime (the frame is already
    // unlinked), the frame stays unowned.
    fn relink_victim(&mut self, index: FrameIndex, page: PageRef) {
        let entry = &mut self.frames[index];
        if entry.pinned && entry.page.is_none() {
            entry.page = Some(page);
            entry.pinned = false;
        }
    }
}

impl Vm {
    /// Produce a frame able to hold one page: from the user pool while it
    /// lasts, by eviction afterwards. The returned frame is pinned and
    /// unowned; the caller links its page and thereby unpins it.
    ///
    /// The table lock is never held across the victim's disk write, but the
    /// victim frame is pinned for the duration, so its contents are durable
    /// before any new owner can touch it.
    pub(crate) fn acquire_frame(&self) -> (FrameIndex, usize) {
        loop {
            let mut frames = self.frames.lock();
            if let Some(kva) = self.user_pool.lock().alloc_page() {
                let index = frames.register(kva);
                return (index, kva);
            }
            match frames.select_victim() {
                Some((index, None)) => {
                    let kva = frames.kva(index);
                    return (index, kva);
                }
                Some((index, Some(page))) => {
                    let kva = frames.kva(index);
                    drop(frames);
                    if let Some(mut victim) = page.try_lock() {
                        victim.swap_out(self);
                        return (index, kva);
                    }
                    // The page is mid-operation on another thread; put the
                    // frame back and look for a different victim.
                    self.frames.lock().relink_victim(index, page);
                }
                None => {
                    // Every frame is pinned right now.
                    drop(frames);
                    core::hint::spin_loop();
                }
            }
        }
    }
}
