//! Virtual memory: demand paging, anonymous and file-backed pages, swap,
//! and frame eviction.
//!
//! The subsystem is built from three owned services ([`Vm`]) plus one
//! [`AddressSpace`] per process. Everything a process maps lives in its
//! supplemental page table; physical frames and swap slots are global.

pub mod addr_space;
pub mod anon;
pub mod fault;
pub mod file_backed;
pub mod frame_table;
pub mod mmap;
pub mod page;
pub mod pagedir;
pub mod spt;
pub mod swap;
pub mod uninit;
pub mod user;
pub mod user_pool;

pub use addr_space::AddressSpace;
pub use fault::FaultContext;
pub use page::{BackingKind, BackingTarget, ContentInit, Page, PageRef};

use crate::block::block_core::Block;
use crate::sync::Mutex;
use alloc::sync::Arc;
use frame_table::FrameTable;
use marrowos_shared::mem::PAGE_FRAME_SIZE;
use swap::SwapSpace;
use user_pool::UserPool;

/// Error type for virtual-memory operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// The requested virtual address is already occupied in the page table
    AllocationConflict,
    /// No page is registered at the faulting/requested address
    NotMapped,
    /// Write access attempted on a read-only page
    ReadOnly,
    /// Null, kernel-space, or otherwise malformed address
    BadAddress,
    /// The page's backing failed to produce its contents
    LoadFailed,
}

impl core::fmt::Display for VmError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::AllocationConflict => write!(f, "virtual address already in use"),
            Self::NotMapped => write!(f, "no page at address"),
            Self::ReadOnly => write!(f, "write to read-only page"),
            Self::BadAddress => write!(f, "bad address"),
            Self::LoadFailed => write!(f, "failed to load page contents"),
        }
    }
}

impl core::error::Error for VmError {}

pub type Result<T> = core::result::Result<T, VmError>;

/// The kernel's memory services, constructed once at boot and shared by
/// every address space. Whoever owns the `Arc` owns the subsystem; there
/// are no global singletons.
pub struct Vm {
    pub(crate) user_pool: Mutex<UserPool>,
    pub(crate) frames: Mutex<FrameTable>,
    pub(crate) swap: SwapSpace,
}

impl Vm {
    /// Set up the subsystem with `user_pages` frames of physical memory for
    /// user content and `swap_device` as the backing store for evicted
    /// anonymous pages.
    pub fn new(user_pages: usize, swap_device: Block) -> Arc<Vm> {
        Arc::new(Vm {
            user_pool: Mutex::new(UserPool::new(user_pages)),
            frames: Mutex::new(FrameTable::new()),
            swap: SwapSpace::new(swap_device),
        })
    }
}

/// View one physical page as a byte slice.
///
/// # Safety
///
/// `kva` must be the kernel-mapped base address of a live frame, and the
/// caller must have exclusive access to that frame's contents for `'a`.
pub(crate) unsafe fn frame_bytes<'a>(kva: usize) -> &'a mut [u8] {
    core::slice::from_raw_parts_mut(kva as *mut u8, PAGE_FRAME_SIZE)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::Mutex;
    use crate::vfs::tempfs::TempFs;
    use crate::vfs::{File, FileSystemRef};
    use marrowos_shared::mem::{MAX_STACK_SIZE, PAGE_FRAME_SIZE, USER_STACK_TOP};

    const CODE_VA: usize = 0x0800_0000;
    const HEAP_VA: usize = 0x1000_0000;
    const MAP_VA: usize = 0x2000_0000;
    const PAGE: usize = PAGE_FRAME_SIZE;

    // A process's whole life under memory pressure: lazily-loaded file
    // mapping, anonymous heap, stack growth, eviction churn, fork, and exit
    // with writeback. Four frames serve eight-plus pages throughout.
    #[test]
    fn process_lifetime_under_memory_pressure() {
        let vm = testing::vm(4, 16);
        let fs: FileSystemRef = Arc::new(Mutex::new(TempFs::new()));

        let contents: alloc::vec::Vec<u8> = (0..PAGE + 100).map(|i| (i % 253) as u8).collect();
        let file = File::create_path(&fs, "image").expect("create failed");
        file.write_at(&contents, 0).expect("write failed");

        let mut proc = AddressSpace::new(Arc::clone(&vm));

        // Map the file and back four heap pages.
        proc.mmap(MAP_VA, contents.len(), true, &file, 0)
            .expect("mmap failed");
        for i in 0..4 {
            proc.alloc_page(BackingTarget::Anon, HEAP_VA + i * PAGE, true)
                .expect("alloc failed");
        }

        // Touch everything; far more pages than frames.
        let mut buf = alloc::vec![0u8; contents.len()];
        proc.read_user(MAP_VA, &mut buf).expect("read failed");
        assert_eq!(buf, contents);
        for i in 0..4u8 {
            proc.write_user(HEAP_VA + usize::from(i) * PAGE, &[i ^ 0x5a; 200])
                .expect("write failed");
        }

        // Grow the stack with a push-style fault, then use the new page.
        let esp = USER_STACK_TOP - MAX_STACK_SIZE / 2;
        proc.set_user_stack_pointer(esp);
        proc.write_user(esp - fault::PUSH_SLOP, &[0xcd; 8])
            .expect("stack write failed");

        // The heap survives the churn byte-for-byte.
        for i in 0..4u8 {
            let mut heap = [0u8; 200];
            proc.read_user(HEAP_VA + usize::from(i) * PAGE, &mut heap)
                .expect("read failed");
            assert_eq!(heap, [i ^ 0x5a; 200]);
        }

        // Scribble on the mapping, fork, and let the child exit. The child
        // inherits the unflushed scribble; its own writes stay its own.
        proc.write_user(MAP_VA + 8, b"scribble").expect("write failed");
        {
            let mut child = proc.fork().expect("fork failed");
            let mut word = [0u8; 8];
            child.read_user(MAP_VA + 8, &mut word).expect("read failed");
            assert_eq!(&word, b"scribble");
            child.write_user(HEAP_VA, &[0xee; 200]).expect("write failed");
        }
        let mut heap = [0u8; 200];
        proc.read_user(HEAP_VA, &mut heap).expect("read failed");
        assert_eq!(heap, [0x5a; 200]);
        let mut word = [0u8; 8];
        proc.read_user(MAP_VA + 8, &mut word).expect("read failed");
        assert_eq!(&word, b"scribble");

        // Unmap with writeback, then exit.
        proc.munmap(MAP_VA).expect("munmap failed");
        let mut persisted = [0u8; 8];
        file.read_at(&mut persisted, 8).expect("read failed");
        assert_eq!(&persisted, b"scribble");

        drop(proc);
        // No leaked swap slots once every address space is gone.
        assert_eq!(vm.swap.free_slot_count(), vm.swap.slot_count());
    }

    // Two processes hammering a three-frame pool from separate threads:
    // eviction picks victims across both address spaces and nobody sees
    // anyone else's bytes.
    #[test]
    fn eviction_is_safe_across_concurrent_processes() {
        let vm = testing::vm(3, 32);

        let workers: alloc::vec::Vec<_> = (0u8..2)
            .map(|id| {
                let vm = Arc::clone(&vm);
                std::thread::spawn(move || {
                    let mut proc = AddressSpace::new(vm);
                    for i in 0..4 {
                        proc.alloc_page(BackingTarget::Anon, CODE_VA + i * PAGE, true)
                            .expect("alloc failed");
                    }
                    for round in 0..8u8 {
                        for i in 0..4usize {
                            let tag = id
                                .wrapping_mul(101)
                                .wrapping_add(round.wrapping_mul(13))
                                .wrapping_add(i as u8);
                            proc.write_user(CODE_VA + i * PAGE, &[tag; 64])
                                .expect("write failed");
                        }
                        for i in 0..4usize {
                            let tag = id
                                .wrapping_mul(101)
                                .wrapping_add(round.wrapping_mul(13))
                                .wrapping_add(i as u8);
                            let mut buf = [0u8; 64];
                            proc.read_user(CODE_VA + i * PAGE, &mut buf)
                                .expect("read failed");
                            assert_eq!(buf, [tag; 64]);
                        }
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().expect("worker panicked");
        }
        assert_eq!(vm.swap.free_slot_count(), vm.swap.slot_count());
    }
}
