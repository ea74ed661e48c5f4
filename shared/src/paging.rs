// https://wiki.osdev.org/Paging
//
// The mapping tables this kernel keeps per process are software-walked, but
// entries carry the x86 flag layout so the hardware-facing code can install
// them unchanged.

#![allow(clippy::cast_possible_truncation)]

use arbitrary_int::{u12, u20};
use bitbybit::bitfield;

/// Flag bits of a page-table entry, at their x86 positions.
#[bitfield(u8, default = 0)]
pub struct PageTableFlags {
    #[bit(0, rw)]
    present: bool,
    #[bit(1, rw)]
    writable: bool,
    #[bit(2, rw)]
    user: bool,
    #[bit(5, rw)]
    accessed: bool,
    #[bit(6, rw)]
    dirty: bool,
}

#[bitfield(u32)]
pub struct VirtualAddress {
    #[bits(12..=31, r)]
    page_number: u20,
    #[bits(0..=11, r)]
    offset: u12,
}

impl VirtualAddress {
    pub fn page_number_of(addr: usize) -> usize {
        Self::new_with_raw_value(addr as u32).page_number().value() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_bits_are_independent() {
        let flags = PageTableFlags::DEFAULT
            .with_present(true)
            .with_writable(true);
        assert!(flags.present());
        assert!(flags.writable());
        assert!(!flags.accessed());
        assert!(!flags.dirty());

        let flags = flags.with_accessed(true).with_dirty(true);
        assert!(flags.accessed());
        assert!(flags.dirty());

        let flags = flags.with_accessed(false);
        assert!(!flags.accessed());
        assert!(flags.dirty());
    }

    #[test]
    fn address_split() {
        assert_eq!(VirtualAddress::page_number_of(0x1234_5678), 0x12345);
        let va = VirtualAddress::new_with_raw_value(0x1234_5678);
        assert_eq!(va.offset().value(), 0x678);
    }
}
