//! Physical memory managers (spec.md 4.3-4.5 / C3-C5): the Early PMM bump
//! allocator that bootstraps the VMM's kernel page tables, and the Full PMM
//! that takes over once the stage machine reaches `Full`. Ported from
//! `src/early_pmm.c` and `src/pmm.c`.

use arrayvec::ArrayVec;

use crate::addr::{Address, AddressType, Length, PhysAddressType, PhysExtent};
use crate::buddy::{self, Buddy};
use crate::cow::FrameSource;
use crate::error::{MemError, MemResult};
use crate::page::{Frame, PAGE_SIZE};
use crate::sync::Spinlock;

const UNDER_1MB: u64 = 1 << 20;
const UNDER_4GB: u64 = 1 << 32;

/// Upper bound on the number of disjoint usable ranges the firmware memory
/// map may report; matches the source's fixed-size range table.
const MAX_EARLY_RANGES: usize = 32;

/// A physical page allocation request, classified by where the result may
/// land. Mirrors the three buddy classes `pmm.c` keeps: memory below 1 MiB
/// (legacy DMA-incapable devices), memory below 4 GiB (32-bit-only DMA), and
/// anywhere.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum PageRequirement {
    Under1Mb,
    Under4Gb,
    Any,
}

/// Splits `range` at `boundary` into `(below, at-or-above)`. Either half is
/// empty if `boundary` falls outside `range`. Used by bring-up code to carve
/// a firmware-reported usable range across the Full PMM's class boundaries.
pub fn split_range<Type: AddressType>(
    range: crate::addr::Range<Type>,
    boundary: Address<Type>,
) -> (crate::addr::Range<Type>, crate::addr::Range<Type>) {
    if boundary <= range.start() {
        return (
            crate::addr::Range::new(range.start(), Length::from_raw(0)),
            range,
        );
    }
    if boundary >= range.end() {
        return (
            range,
            crate::addr::Range::new(range.end(), Length::from_raw(0)),
        );
    }
    let below = crate::addr::Range::new(range.start(), boundary - range.start());
    let above = crate::addr::Range::new(boundary, range.end() - boundary);
    (below, above)
}

/// Bump allocator over the firmware's usable-memory ranges, used only before
/// the Full PMM exists so `init_virtual_memory` can build the kernel's
/// initial page tables. Ranges below 1 MiB (real-mode/BIOS reserved) and at
/// or above 4 GiB (unaddressable until paging is live) are skipped, exactly
/// as `early_alloc_page` does.
pub struct EarlyPmm {
    ranges: ArrayVec<PhysExtent, MAX_EARLY_RANGES>,
}

impl EarlyPmm {
    pub fn new(usable: &[PhysExtent]) -> Self {
        let mut ranges = ArrayVec::new();
        for &r in usable {
            ranges.push(r);
        }
        Self { ranges }
    }

    /// Hands out the next whole page from the lowest usable range that has
    /// one in `[1 MiB, 4 GiB)`, clipping past any that don't.
    pub fn alloc_page(&mut self) -> Option<PhysExtent> {
        for r in self.ranges.iter_mut() {
            loop {
                if r.extent().as_raw() < PAGE_SIZE.as_raw() {
                    break;
                }
                let start = r.start();
                *r = PhysExtent::new(start + PAGE_SIZE, r.extent() - PAGE_SIZE);
                if start.as_raw() < UNDER_1MB || start.as_raw() >= UNDER_4GB {
                    continue;
                }
                return Some(PhysExtent::new(start, PAGE_SIZE));
            }
        }
        None
    }
}

/// Combined size `bitmap_storage` must be for [`FullPmm::init`] given the
/// three class ranges.
pub fn full_pmm_overhead(under_1mb: PhysExtent, under_4gb: PhysExtent, any: PhysExtent) -> usize {
    buddy::overhead(under_1mb.extent())
        + buddy::overhead(under_4gb.extent())
        + buddy::overhead(any.extent())
}

/// The steady-state physical page allocator: three independent buddy
/// allocators, one per [`PageRequirement`] class, each guarded by its own
/// spinlock so allocation can be re-entered from the page-fault handler.
pub struct FullPmm<'a> {
    under_1mb: Spinlock<Buddy<'a, PhysAddressType>>,
    under_4gb: Spinlock<Buddy<'a, PhysAddressType>>,
    any: Spinlock<Buddy<'a, PhysAddressType>>,
}

impl<'a> FullPmm<'a> {
    /// `bitmap_storage` must be at least
    /// `full_pmm_overhead(under_1mb_range, under_4gb_range, any_range)`
    /// bytes. The three buddies start out with nothing free; callers seed
    /// them with [`FullPmm::free_range`] once construction has happened
    /// (so early-allocated pages can be excluded first).
    pub fn init(
        bitmap_storage: &'a mut [u8],
        under_1mb_range: PhysExtent,
        under_4gb_range: PhysExtent,
        any_range: PhysExtent,
    ) -> Self {
        let need_1mb = buddy::overhead(under_1mb_range.extent());
        let need_4gb = buddy::overhead(under_4gb_range.extent());
        let (s1, rest) = bitmap_storage.split_at_mut(need_1mb);
        let (s2, s3) = rest.split_at_mut(need_4gb);
        Self {
            under_1mb: Spinlock::new(Buddy::init(s1, under_1mb_range, false)),
            under_4gb: Spinlock::new(Buddy::init(s2, under_4gb_range, false)),
            any: Spinlock::new(Buddy::init(s3, any_range, false)),
        }
    }

    /// Seeds whichever class buddies overlap `range` as free. `range` may
    /// span class boundaries; each overlapping class only gets its own
    /// slice.
    pub fn free_range(&self, range: PhysExtent) {
        if let Some(overlap) = self.under_1mb.lock().base().overlap(range) {
            self.under_1mb.lock().free_range(overlap);
        }
        if let Some(overlap) = self.under_4gb.lock().base().overlap(range) {
            self.under_4gb.lock().free_range(overlap);
        }
        if let Some(overlap) = self.any.lock().base().overlap(range) {
            self.any.lock().free_range(overlap);
        }
    }

    pub fn alloc_page(&self, requirement: PageRequirement) -> MemResult<Address<PhysAddressType>> {
        self.alloc_pages(requirement, 1)
    }

    /// Allocates `count` contiguous pages satisfying `requirement`, falling
    /// back to more restrictive (lower) classes if the natural one is
    /// exhausted, since a page that satisfies a tighter constraint always
    /// satisfies a looser one.
    pub fn alloc_pages(
        &self,
        requirement: PageRequirement,
        count: u64,
    ) -> MemResult<Address<PhysAddressType>> {
        let size = PAGE_SIZE.as_raw() * count;
        let primary = match requirement {
            PageRequirement::Under1Mb => &self.under_1mb,
            PageRequirement::Under4Gb => &self.under_4gb,
            PageRequirement::Any => &self.any,
        };
        if let Some(addr) = primary.lock().alloc(size) {
            return Ok(addr);
        }
        for class in fallback_chain(requirement, self) {
            if let Some(addr) = class.lock().alloc(size) {
                return Ok(addr);
            }
        }
        Err(MemError::OutOfMemory)
    }

    pub fn free_page(&self, addr: Address<PhysAddressType>, count: u64) {
        self.free_pages(addr, count)
    }

    /// Infers which class owns `addr` from its magnitude and returns
    /// `count` pages to that class's buddy, exactly as `free_page`/
    /// `free_pages` do in the source.
    pub fn free_pages(&self, addr: Address<PhysAddressType>, count: u64) {
        let size = PAGE_SIZE.as_raw() * count;
        if addr.as_raw() < UNDER_1MB {
            self.under_1mb.lock().free(addr, size);
        } else if addr.as_raw() < UNDER_4GB {
            self.under_4gb.lock().free(addr, size);
        } else {
            self.any.lock().free(addr, size);
        }
    }
}

/// Lets a plain `&FullPmm` stand in as a [`FrameSource`] (e.g. for
/// [`crate::vmspace::Vmspace::alloc`]/`free`), since every `FullPmm` method
/// already takes `&self` and locks internally. Kept separate from
/// `FullPmm` itself so callers that need both a `Vmm` and a `FrameSource`
/// in the same call (the `kernel` crate's heap backing) can borrow the PMM
/// through this impl while a *different* object borrows the VMM, rather
/// than aliasing one `&mut` two ways.
impl<'a, 'b> FrameSource for &'b FullPmm<'a> {
    fn alloc_frame(&mut self) -> MemResult<Frame> {
        self.alloc_page(PageRequirement::Any).map(Frame::new)
    }

    fn free_frame(&mut self, frame: Frame) {
        self.free_page(frame.start(), 1);
    }
}

/// `Any` may fall back to the tighter classes once its own buddy is
/// exhausted; `Under4Gb` may fall back to `Under1Mb`; `Under1Mb` has no
/// looser class to fall back to.
fn fallback_chain<'a, 'b>(
    requirement: PageRequirement,
    pmm: &'b FullPmm<'a>,
) -> ArrayVec<&'b Spinlock<Buddy<'a, PhysAddressType>>, 1> {
    let mut v = ArrayVec::new();
    if requirement == PageRequirement::Any {
        v.push(&pmm.under_4gb);
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::PhysAddress;

    #[test]
    fn early_pmm_skips_low_and_high_memory() {
        let mut pmm = EarlyPmm::new(&[
            // First page at or above 1 MiB is the third page of this range.
            PhysExtent::from_raw(0, UNDER_1MB + PAGE_SIZE.as_raw()),
            // Entirely at/above 4 GiB: must never be handed out.
            PhysExtent::from_raw(UNDER_4GB, 2 * PAGE_SIZE.as_raw()),
        ]);

        let first = pmm.alloc_page().unwrap();
        assert_eq!(first.start(), PhysAddress::from_raw(UNDER_1MB));
        // That range had exactly one page left at/above 1 MiB.
        assert!(pmm.alloc_page().is_none());
    }

    #[test]
    fn full_pmm_alloc_free_and_class_fallback() {
        let under_1mb = PhysExtent::from_raw(0, UNDER_1MB);
        let under_4gb = PhysExtent::from_raw(UNDER_1MB, UNDER_4GB - UNDER_1MB);
        let any = PhysExtent::from_raw(UNDER_4GB, 16 * 1024 * 1024);

        let mut storage = vec![0u8; full_pmm_overhead(under_1mb, under_4gb, any)];
        let pmm = FullPmm::init(&mut storage, under_1mb, under_4gb, any);
        pmm.free_range(under_1mb);
        pmm.free_range(under_4gb);
        pmm.free_range(any);

        let a = pmm.alloc_page(PageRequirement::Under1Mb).unwrap();
        assert!(a.as_raw() < UNDER_1MB);
        pmm.free_page(a, 1);

        let b = pmm.alloc_page(PageRequirement::Any).unwrap();
        assert!(b.as_raw() >= UNDER_4GB);
        pmm.free_page(b, 1);
    }
}
