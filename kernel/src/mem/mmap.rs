use crate::mem::addr_space::AddressSpace;
use crate::mem::file_backed::FileMapArgs;
use crate::mem::page::BackingTarget;
use crate::mem::{Result, VmError};
use crate::vfs::File;
use alloc::sync::Arc;
use marrowos_shared::mem::{is_page_aligned, is_user_vaddr, PAGE_FRAME_SIZE};

impl AddressSpace {
    /// Map `length` bytes of `file` starting at `offset` to the pages at
    /// `addr`. Pages are created pending and load lazily; the final page
    /// reads only what the file still has past `offset` and zero-fills the
    /// rest. Returns the mapping's start address.
    ///
    /// The mapping reopens the file, so it outlives whatever descriptor
    /// `file` came from. A failure partway leaves the already-inserted
    /// pages behind; address-space teardown owns that cleanup.
    pub fn mmap(
        &mut self,
        addr: usize,
        length: usize,
        writable: bool,
        file: &File,
        offset: u64,
    ) -> Result<usize> {
        if addr == 0 || !is_page_aligned(addr) {
            return Err(VmError::BadAddress);
        }
        if offset % PAGE_FRAME_SIZE as u64 != 0 {
            return Err(VmError::BadAddress);
        }
        let page_count = if length <= PAGE_FRAME_SIZE {
            1
        } else {
            length.div_ceil(PAGE_FRAME_SIZE)
        };
        let span = page_count
            .checked_mul(PAGE_FRAME_SIZE)
            .and_then(|span| addr.checked_add(span))
            .ok_or(VmError::BadAddress)?;
        if !is_user_vaddr(span - 1) {
            return Err(VmError::BadAddress);
        }

        let file = Arc::new(file.reopen().map_err(|_| VmError::LoadFailed)?);
        let mut read_remaining =
            usize::try_from(file.length().saturating_sub(offset)).unwrap_or(usize::MAX).min(length);
        let mut ofs = offset;
        let mut va = addr;
        for _ in 0..page_count {
            let page_read = read_remaining.min(PAGE_FRAME_SIZE);
            let page_zero = PAGE_FRAME_SIZE - page_read;
            self.alloc_page_with_initializer(
                BackingTarget::File(FileMapArgs {
                    file: Arc::clone(&file),
                    ofs,
                    read_bytes: page_read,
                    zero_bytes: page_zero,
                }),
                va,
                writable,
                None,
            )?;
            read_remaining -= page_read;
            ofs += page_read as u64;
            va += PAGE_FRAME_SIZE;
        }

        // The head page remembers the run length so munmap can find the
        // whole region from just the start address.
        let head = self.find_page(addr).expect("mapping head just inserted");
        head.lock().set_mapped_page_count(page_count);
        log::debug!("mmap: {page_count} page(s) at {addr:#x}");
        Ok(addr)
    }

    /// Tear down the mapping created at `addr`: walk exactly the recorded
    /// number of pages in address order, destroying each one still present
    /// (which writes back the ones that were dirtied).
    pub fn munmap(&mut self, addr: usize) -> Result<()> {
        let head = self.find_page(addr).ok_or(VmError::NotMapped)?;
        let count = head
            .lock()
            .mapped_page_count()
            .ok_or(VmError::BadAddress)?;
        drop(head);

        let mut va = addr;
        for _ in 0..count {
            self.remove_page(va);
            va += PAGE_FRAME_SIZE;
        }
        log::debug!("munmap: {count} page(s) at {addr:#x}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::{testing, AddressSpace};
    use crate::sync::Mutex;
    use crate::vfs::tempfs::TempFs;
    use crate::vfs::FileSystemRef;
    use alloc::vec;
    use alloc::vec::Vec;

    const MAP_VA: usize = 0x3000_0000;
    const PAGE: usize = PAGE_FRAME_SIZE;

    fn file_with(contents: &[u8]) -> (FileSystemRef, File) {
        let fs: FileSystemRef = Arc::new(Mutex::new(TempFs::new()));
        let file = File::create_path(&fs, "mmap.bin").expect("create failed");
        file.write_at(contents, 0).expect("write failed");
        (fs, file)
    }

    fn file_pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn length_rounds_up_to_two_pages() {
        let vm = testing::vm(4, 4);
        let mut aspace = AddressSpace::new(vm);
        let (_fs, file) = file_with(&file_pattern(PAGE + 4));

        let addr = aspace
            .mmap(MAP_VA, PAGE + 4, true, &file, 0)
            .expect("mmap failed");
        assert_eq!(addr, MAP_VA);

        assert!(aspace.find_page(MAP_VA).is_some());
        assert!(aspace.find_page(MAP_VA + PAGE).is_some());
        assert!(aspace.find_page(MAP_VA + 2 * PAGE).is_none());
        assert_eq!(aspace.spt().len(), 2);

        let head = aspace.find_page(MAP_VA).expect("head should exist");
        assert_eq!(head.lock().mapped_page_count(), Some(2));
    }

    #[test]
    fn tiny_length_still_takes_one_page() {
        let vm = testing::vm(4, 4);
        let mut aspace = AddressSpace::new(vm);
        let (_fs, file) = file_with(b"abc");

        aspace.mmap(MAP_VA, 1, true, &file, 0).expect("mmap failed");
        assert_eq!(aspace.spt().len(), 1);
        let head = aspace.find_page(MAP_VA).expect("head should exist");
        assert_eq!(head.lock().mapped_page_count(), Some(1));
    }

    #[test]
    fn pages_load_lazily_with_zero_filled_tail() {
        let vm = testing::vm(4, 4);
        let mut aspace = AddressSpace::new(vm);
        let contents = file_pattern(PAGE + 4);
        let (_fs, file) = file_with(&contents);

        aspace
            .mmap(MAP_VA, PAGE + 4, true, &file, 0)
            .expect("mmap failed");
        // Nothing is read until the first touch.
        assert!(!aspace
            .find_page(MAP_VA)
            .expect("page should exist")
            .lock()
            .is_resident());

        let mut buf = vec![0u8; 2 * PAGE];
        aspace.read_user(MAP_VA, &mut buf).expect("read failed");
        assert_eq!(&buf[..PAGE + 4], &contents[..]);
        assert!(buf[PAGE + 4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn munmap_writes_back_only_dirtied_pages() {
        let vm = testing::vm(4, 4);
        let mut aspace = AddressSpace::new(vm);
        let contents = file_pattern(PAGE + 4);
        let (_fs, file) = file_with(&contents);

        aspace
            .mmap(MAP_VA, PAGE + 4, true, &file, 0)
            .expect("mmap failed");

        // Touch both pages, dirty only the first.
        let mut buf = vec![0u8; 2 * PAGE];
        aspace.read_user(MAP_VA, &mut buf).expect("read failed");
        aspace.write_user(MAP_VA + 10, b"hello").expect("write failed");

        // Change the file behind the second page directly. If munmap wrote
        // that clean page back, this would be clobbered with stale bytes.
        file.write_at(b"Z", PAGE as u64 + 1).expect("write failed");

        aspace.munmap(MAP_VA).expect("munmap failed");

        let mut head = vec![0u8; 16];
        file.read_at(&mut head, 8).expect("read failed");
        assert_eq!(&head[..2], &contents[8..10]);
        assert_eq!(&head[2..7], b"hello");
        let mut tail = [0u8; 1];
        file.read_at(&mut tail, PAGE as u64 + 1).expect("read failed");
        assert_eq!(&tail, b"Z");
    }

    #[test]
    fn munmap_removes_exactly_the_mapping() {
        let vm = testing::vm(4, 4);
        let mut aspace = AddressSpace::new(vm);
        let (_fs, file) = file_with(&file_pattern(PAGE + 4));

        // An unrelated page right after the mapping must survive munmap.
        aspace
            .mmap(MAP_VA, PAGE + 4, true, &file, 0)
            .expect("mmap failed");
        aspace
            .alloc_page(BackingTarget::Anon, MAP_VA + 2 * PAGE, true)
            .expect("alloc failed");

        aspace.munmap(MAP_VA).expect("munmap failed");
        assert!(aspace.find_page(MAP_VA).is_none());
        assert!(aspace.find_page(MAP_VA + PAGE).is_none());
        assert!(aspace.find_page(MAP_VA + 2 * PAGE).is_some());
    }

    #[test]
    fn munmap_skips_gaps_but_honors_the_count() {
        let vm = testing::vm(4, 4);
        let mut aspace = AddressSpace::new(vm);
        let (_fs, file) = file_with(&file_pattern(3 * PAGE));

        aspace
            .mmap(MAP_VA, 3 * PAGE, true, &file, 0)
            .expect("mmap failed");
        // Rip a hole in the middle, then unmap the whole region.
        aspace.remove_page(MAP_VA + PAGE);
        aspace.munmap(MAP_VA).expect("munmap failed");

        for i in 0..3 {
            assert!(aspace.find_page(MAP_VA + i * PAGE).is_none());
        }
    }

    #[test]
    fn mapping_offset_window_reads_the_right_bytes() {
        let vm = testing::vm(4, 4);
        let mut aspace = AddressSpace::new(vm);
        let contents = file_pattern(2 * PAGE);
        let (_fs, file) = file_with(&contents);

        aspace
            .mmap(MAP_VA, PAGE, true, &file, PAGE as u64)
            .expect("mmap failed");

        let mut buf = vec![0u8; PAGE];
        aspace.read_user(MAP_VA, &mut buf).expect("read failed");
        assert_eq!(&buf[..], &contents[PAGE..]);
    }

    #[test]
    fn mapping_past_the_file_is_all_zeroes() {
        let vm = testing::vm(4, 4);
        let mut aspace = AddressSpace::new(vm);
        let (_fs, file) = file_with(b"tiny");

        // The file ends before the mapped window at this offset even
        // starts; the page must come up entirely zeroed.
        aspace
            .mmap(MAP_VA, PAGE, true, &file, PAGE as u64)
            .expect("mmap failed");
        let mut buf = vec![0u8; PAGE];
        aspace.read_user(MAP_VA, &mut buf).expect("read failed");
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn rejects_bad_addresses() {
        let vm = testing::vm(4, 4);
        let mut aspace = AddressSpace::new(vm);
        let (_fs, file) = file_with(b"abc");

        assert_eq!(aspace.mmap(0, 4, true, &file, 0), Err(VmError::BadAddress));
        assert_eq!(
            aspace.mmap(MAP_VA + 3, 4, true, &file, 0),
            Err(VmError::BadAddress)
        );
        assert_eq!(
            aspace.mmap(MAP_VA, 4, true, &file, 7),
            Err(VmError::BadAddress)
        );
        assert_eq!(
            aspace.munmap(MAP_VA),
            Err(VmError::NotMapped)
        );
    }

    #[test]
    fn munmap_of_non_head_page_is_rejected() {
        let vm = testing::vm(4, 4);
        let mut aspace = AddressSpace::new(vm);
        let (_fs, file) = file_with(&file_pattern(PAGE + 4));

        aspace
            .mmap(MAP_VA, PAGE + 4, true, &file, 0)
            .expect("mmap failed");
        assert_eq!(
            aspace.munmap(MAP_VA + PAGE),
            Err(VmError::BadAddress)
        );
    }

    #[test]
    fn mapping_survives_closing_the_callers_handle() {
        let vm = testing::vm(4, 4);
        let mut aspace = AddressSpace::new(vm);
        let contents = file_pattern(8);
        let (_fs, file) = file_with(&contents);

        aspace.mmap(MAP_VA, 8, true, &file, 0).expect("mmap failed");
        drop(file);

        let mut buf = vec![0u8; 8];
        aspace.read_user(MAP_VA, &mut buf).expect("read failed");
        assert_eq!(&buf[..], &contents[..]);
    }
}
