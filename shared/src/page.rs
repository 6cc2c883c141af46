//! Page- and frame-granular views of the address types in [`crate::addr`].

use crate::addr::{Length, PhysAddress, PhysExtent, VirtAddress, VirtExtent};

pub const PAGE_SIZE: Length = Length::from_raw(4096);
pub const PAGE_SHIFT: u32 = 12;

static_assertions::const_assert!(PAGE_SIZE.as_raw().is_power_of_two());

/// A page-aligned physical memory frame.
#[derive(Clone, Copy, Eq, Ord, PartialEq, PartialOrd, Debug, Hash)]
pub struct Frame {
    start: PhysAddress,
}

impl Frame {
    /// Panics if `start` is not aligned to [`PAGE_SIZE`].
    pub fn new(start: PhysAddress) -> Frame {
        assert!(start.is_aligned_to(PAGE_SIZE.as_raw()));
        Frame { start }
    }

    pub fn containing(addr: PhysAddress) -> Frame {
        Self::new(addr.align_down(PAGE_SIZE.as_raw()))
    }

    pub fn start(self) -> PhysAddress {
        self.start
    }

    pub fn extent(self) -> PhysExtent {
        PhysExtent::new(self.start, PAGE_SIZE)
    }

    pub fn number(self) -> u64 {
        self.start.as_raw() >> PAGE_SHIFT
    }
}

/// A page-aligned virtual memory page.
#[derive(Clone, Copy, Eq, Ord, PartialEq, PartialOrd, Debug, Hash)]
pub struct Page {
    start: VirtAddress,
}

impl Page {
    /// Panics if `start` is not aligned to [`PAGE_SIZE`].
    pub fn new(start: VirtAddress) -> Page {
        assert!(start.is_aligned_to(PAGE_SIZE.as_raw()));
        Page { start }
    }

    pub fn containing(addr: VirtAddress) -> Page {
        Self::new(addr.align_down(PAGE_SIZE.as_raw()))
    }

    pub fn start(self) -> VirtAddress {
        self.start
    }

    pub fn extent(self) -> VirtExtent {
        VirtExtent::new(self.start, PAGE_SIZE)
    }

    pub fn next(self) -> Option<Page> {
        Some(Page {
            start: self.start.offset_by_checked(PAGE_SIZE)?,
        })
    }
}

pub const fn round_to_page_size(bytes: u64) -> u64 {
    (bytes + PAGE_SIZE.as_raw() - 1) & !(PAGE_SIZE.as_raw() - 1)
}

pub const fn bytes_to_pages(bytes: u64) -> u64 {
    round_to_page_size(bytes) >> PAGE_SHIFT
}
