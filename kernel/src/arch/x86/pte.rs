//! The bit-exact x86 32-bit page directory / page table entry format
//! (spec.md section 3, "Page table entry (x86 32-bit)"), ported from the
//! flag constants in `src/x86/vmm.c` and `hal.h`.
//!
//! A PDE and a PTE share this layout: bit 0 Present, bit 1 Writable, bit 2
//! User, bit 5 Accessed (CPU-set), bit 6 Dirty (CPU-set), and two
//! OS-available bits (9 and 10) repurposed for copy-on-write and execute,
//! since the architecture has no native NX bit at this vintage. The high 20
//! bits hold the aligned physical page (or page-table) number.

use bitflags::bitflags;

use shared::addr::PhysAddress;
use shared::page::{Frame, PAGE_SIZE};
use shared::vmm::PageFlags;

bitflags! {
    #[derive(Clone, Copy, Eq, PartialEq, Debug)]
    pub struct RawFlags: u32 {
        const PRESENT  = 1 << 0;
        const WRITE    = 1 << 1;
        const USER     = 1 << 2;
        const ACCESSED = 1 << 5;
        const DIRTY    = 1 << 6;
        const COW      = 1 << 9;
        const EXECUTE  = 1 << 10;
    }
}

const ADDR_MASK: u32 = 0xFFFF_F000;

/// One page directory or page table slot. `Entry(0)` is "not present" and is
/// the all-zero value every fresh table starts filled with.
#[derive(Clone, Copy, Eq, PartialEq)]
#[repr(transparent)]
pub struct Entry(pub u32);

impl Entry {
    pub const EMPTY: Entry = Entry(0);

    pub fn new(frame: Frame, flags: RawFlags) -> Self {
        let addr = frame.start().as_raw() as u32;
        debug_assert_eq!(addr & !ADDR_MASK, 0, "frame not page-aligned");
        Entry((addr & ADDR_MASK) | flags.bits())
    }

    pub fn present(self) -> bool {
        self.0 & RawFlags::PRESENT.bits() != 0
    }

    pub fn flags(self) -> RawFlags {
        RawFlags::from_bits_truncate(self.0)
    }

    pub fn frame(self) -> Frame {
        Frame::new(PhysAddress::from_raw((self.0 & ADDR_MASK) as u64))
    }

    pub fn with_flags(self, flags: RawFlags) -> Self {
        Entry((self.0 & ADDR_MASK) | flags.bits())
    }
}

/// Translates the architecture-neutral flag set used everywhere else in the
/// memory core into the raw bits this PTE format stores, per
/// `to_x86_flags` in `src/x86/vmm.c`. `PRESENT` is added separately by
/// whoever writes the entry; it isn't part of `PageFlags`.
pub fn to_raw_flags(flags: PageFlags) -> RawFlags {
    let mut raw = RawFlags::empty();
    if flags.contains(PageFlags::WRITE) {
        raw |= RawFlags::WRITE;
    }
    if flags.contains(PageFlags::USER) {
        raw |= RawFlags::USER;
    }
    if flags.contains(PageFlags::EXECUTE) {
        raw |= RawFlags::EXECUTE;
    }
    if flags.contains(PageFlags::COW) {
        raw |= RawFlags::COW;
    }
    raw
}

/// The inverse of [`to_raw_flags`], per `from_x86_flags`.
pub fn from_raw_flags(raw: RawFlags) -> PageFlags {
    let mut flags = PageFlags::empty();
    if raw.contains(RawFlags::WRITE) {
        flags |= PageFlags::WRITE;
    }
    if raw.contains(RawFlags::USER) {
        flags |= PageFlags::USER;
    }
    if raw.contains(RawFlags::EXECUTE) {
        flags |= PageFlags::EXECUTE;
    }
    if raw.contains(RawFlags::COW) {
        flags |= PageFlags::COW;
    }
    flags
}

static_assertions::const_assert_eq!(PAGE_SIZE.as_raw(), 4096);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_roundtrip() {
        let flags = PageFlags::WRITE | PageFlags::USER;
        assert_eq!(from_raw_flags(to_raw_flags(flags)), flags);
    }

    #[test]
    fn cow_page_never_carries_write() {
        let raw = to_raw_flags(PageFlags::COW | PageFlags::WRITE);
        // The caller is responsible for clearing WRITE before mapping a COW
        // page (`map_one_page` does this in the source); this module only
        // translates bits, it doesn't enforce the invariant itself.
        assert!(raw.contains(RawFlags::COW));
        assert!(raw.contains(RawFlags::WRITE));
    }

    #[test]
    fn entry_roundtrips_frame_and_flags() {
        let frame = Frame::new(PhysAddress::from_raw(0x0040_0000));
        let e = Entry::new(frame, RawFlags::PRESENT | RawFlags::WRITE);
        assert_eq!(e.frame(), frame);
        assert!(e.present());
        assert!(e.flags().contains(RawFlags::WRITE));
    }
}
