//! Copy-on-write frame refcounting and fault resolution (spec.md 4.6 / C6),
//! ported from `src/cow.c`'s `init_cow_refcnts`/`cow_refcnt_inc`/
//! `cow_refcnt_dec` and the write-fault handling in `src/x86/vmm.c`'s
//! `page_fault`.
//!
//! Written against [`crate::vmm::Vmm`] rather than any concrete page table
//! format, so the same resolution logic runs against the x86 backend and
//! the hosted test backend.

use crate::error::MemError;
use crate::page::{Frame, Page, PAGE_SIZE};
use crate::sync::Spinlock;
use crate::vmm::{PageFlags, Vmm};
use crate::MemResult;

/// A frame-indexed reference count, backed by caller-supplied storage sized
/// for the whole of physical memory at `4 bytes * (top_of_memory >> 12)`.
/// A frame with no entry (never touched since `init`) implicitly has count
/// zero: "not shared", i.e. safe to write in place once mapped.
pub struct CowTable<'a> {
    counts: Spinlock<&'a mut [u32]>,
}

impl<'a> CowTable<'a> {
    /// `storage` must hold one `u32` per frame up to the highest frame
    /// number this table will ever be asked about; it is zeroed on init.
    pub fn init(storage: &'a mut [u32]) -> Self {
        storage.fill(0);
        Self {
            counts: Spinlock::new(storage),
        }
    }

    fn index(frame: Frame) -> usize {
        frame.number() as usize
    }

    pub fn refcount(&self, frame: Frame) -> u32 {
        self.counts.lock()[Self::index(frame)]
    }

    /// Marks `frame` as shared by one more mapping. Called whenever a
    /// second virtual page is mapped to the same frame (cloning an address
    /// space, or forking a COW-tagged page again before the first copy
    /// happens).
    pub fn inc(&self, frame: Frame) {
        let mut counts = self.counts.lock();
        let idx = Self::index(frame);
        counts[idx] += 1;
    }

    /// Marks one fewer mapping of `frame`. Returns the count *after*
    /// decrementing; a caller that drives it to zero owns the frame
    /// outright again (no copy needed on the next write fault).
    pub fn dec(&self, frame: Frame) -> u32 {
        let mut counts = self.counts.lock();
        let idx = Self::index(frame);
        assert!(counts[idx] > 0, "cow refcount underflow on frame {:?}", frame);
        counts[idx] -= 1;
        counts[idx]
    }
}

/// Something that can hand out and take back physical frames, so
/// [`resolve_write_fault`] can allocate the private copy a COW fault needs
/// without depending on a concrete PMM type.
pub trait FrameSource {
    fn alloc_frame(&mut self) -> MemResult<Frame>;
    fn free_frame(&mut self, frame: Frame);
}

/// Copies `PAGE_SIZE` bytes from `src` to `dst`. Implemented per backend,
/// since doing this requires a way to address physical memory directly (a
/// temporary mapping on real hardware, a plain `memcpy` in the hosted
/// simulation).
pub trait PageCopier {
    fn copy_page(&mut self, src: Frame, dst: Frame);
}

/// Resolves a write fault on `page`, per spec.md 4.6:
///
/// 1. If `page` isn't mapped at all, or isn't tagged `COW`, this isn't a
///    copy-on-write fault; the caller should treat it as a genuine
///    protection violation.
/// 2. A fresh frame is allocated and the old frame's contents are copied
///    into it unconditionally — there is no refcount-based shortcut here;
///    every live `COW` mapping was counted by [`CowTable::inc`] when it was
///    created (see [`crate::vmm::Vmm::map`]'s callers), so this frame is
///    always still shared by at least this one mapping.
/// 3. `page` is remapped onto the new frame, writable and no longer `COW`,
///    and the old frame's refcount is decremented.
pub fn resolve_write_fault<V: Vmm + FrameSource + PageCopier>(
    vmm: &mut V,
    cow: &CowTable,
    page: Page,
) -> MemResult<()> {
    let (frame, flags) = match vmm.get_mapping(page) {
        Some(m) if m.1.contains(PageFlags::COW) => m,
        _ => return Err(MemError::OutOfMemory),
    };

    let new_frame = vmm.alloc_frame()?;
    vmm.copy_page(frame, new_frame);
    cow.dec(frame);

    vmm.unmap(page)?;
    let new_flags = (flags | PageFlags::WRITE) - PageFlags::COW;
    vmm.map(page, new_frame, new_flags)?;
    Ok(())
}

/// Builds `into` as a copy-on-write clone of `from`'s address space: every
/// currently-writable user mapping in `from` is downgraded to read-only
/// `COW` in both address spaces and its frame's refcount is bumped; every
/// other mapping (read-only, kernel-only) is shared as-is with no refcount
/// change, since neither side can write it through this mapping anyway.
///
/// Grounded in `clone_address_space` in `src/x86/vmm.c`, generalised from
/// its two-level page table walk to [`Vmm::for_each_mapping_mut`]. Reads
/// and downgrades `from` in a single pass so the two address spaces can
/// never observe a mapping as writable in one and not yet COW in the other.
pub fn clone_address_space_cow<V: Vmm>(from: &mut V, into: &mut V, cow: &CowTable) -> MemResult<()> {
    let mut first_err: Option<MemError> = None;
    from.for_each_mapping_mut(&mut |page, frame, flags| {
        if first_err.is_some() {
            return None;
        }
        if flags.contains(PageFlags::USER) && flags.contains(PageFlags::WRITE) {
            let ro = (flags | PageFlags::COW) - PageFlags::WRITE;
            cow.inc(frame);
            if let Err(e) = into.map(page, frame, ro) {
                first_err = Some(e);
                return None;
            }
            Some(ro)
        } else {
            if let Err(e) = into.map(page, frame, flags) {
                first_err = Some(e);
            }
            None
        }
    });

    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::{PhysAddressType, VirtAddressType};
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    struct FakeVmm {
        table: HashMap<Page, (Frame, PageFlags)>,
        next_frame: u64,
    }

    impl FakeVmm {
        fn new() -> Self {
            Self {
                table: HashMap::new(),
                next_frame: 0x10000,
            }
        }
    }

    impl FrameSource for FakeVmm {
        fn alloc_frame(&mut self) -> MemResult<Frame> {
            let f = Frame::new(PhysAddress::from_raw(self.next_frame));
            self.next_frame += PAGE_SIZE.as_raw();
            Ok(f)
        }
        fn free_frame(&mut self, _frame: Frame) {}
    }

    impl PageCopier for FakeVmm {
        fn copy_page(&mut self, _src: Frame, _dst: Frame) {}
    }

    impl Vmm for FakeVmm {
        fn map(&mut self, vpage: Page, frame: Frame, flags: PageFlags) -> MemResult<()> {
            self.table.insert(vpage, (frame, flags));
            Ok(())
        }
        fn unmap(&mut self, vpage: Page) -> MemResult<()> {
            self.table.remove(&vpage);
            Ok(())
        }
        fn get_mapping(&self, vpage: Page) -> Option<(Frame, PageFlags)> {
            self.table.get(&vpage).copied()
        }
        fn remap_flags(&mut self, vpage: Page, flags: PageFlags) -> MemResult<()> {
            let (frame, _) = self.table.get(&vpage).copied().ok_or(MemError::OutOfMemory)?;
            self.table.insert(vpage, (frame, flags));
            Ok(())
        }
        fn for_each_mapping(&self, f: &mut dyn FnMut(Page, Frame, PageFlags)) {
            for (&page, &(frame, flags)) in self.table.iter() {
                f(page, frame, flags);
            }
        }
        fn for_each_mapping_mut(
            &mut self,
            f: &mut dyn FnMut(Page, Frame, PageFlags) -> Option<PageFlags>,
        ) {
            for (&page, entry) in self.table.iter_mut() {
                if let Some(new_flags) = f(page, entry.0, entry.1) {
                    entry.1 = new_flags;
                }
            }
        }
    }

    fn page(addr: u64) -> Page {
        Page::new(crate::addr::Address::<VirtAddressType>::from_raw(addr))
    }
    fn frame(addr: u64) -> Frame {
        Frame::new(crate::addr::Address::<PhysAddressType>::from_raw(addr))
    }

    #[test]
    fn single_mapper_cow_write_still_copies() {
        // A lone COW mapping still carries refcount 1 (every live COW
        // mapping is counted, not just "extra" sharers), so a write fault
        // against it copies and decrements down to 0 rather than upgrading
        // in place — there is no refcount-based shortcut in this core.
        let mut vmm = FakeVmm::new();
        let mut storage = vec![0u32; 16];
        let cow = CowTable::init(&mut storage);

        let p = page(0x1000);
        let f = frame(0x2000);
        vmm.map(p, f, PageFlags::USER | PageFlags::COW).unwrap();
        cow.inc(f);

        resolve_write_fault(&mut vmm, &cow, p).unwrap();
        let (got_frame, flags) = vmm.get_mapping(p).unwrap();
        assert_ne!(got_frame, f);
        assert!(flags.contains(PageFlags::WRITE));
        assert!(!flags.contains(PageFlags::COW));
        assert_eq!(cow.refcount(f), 0);
    }

    #[test]
    fn shared_cow_copies_and_decrements() {
        let mut vmm = FakeVmm::new();
        let mut storage = vec![0u32; 16];
        let cow = CowTable::init(&mut storage);

        let p = page(0x1000);
        let f = frame(0x2000);
        vmm.map(p, f, PageFlags::USER | PageFlags::COW).unwrap();
        cow.inc(f);
        cow.inc(f);

        resolve_write_fault(&mut vmm, &cow, p).unwrap();
        let (got_frame, flags) = vmm.get_mapping(p).unwrap();
        assert_ne!(got_frame, f);
        assert!(flags.contains(PageFlags::WRITE));
        assert_eq!(cow.refcount(f), 1);
    }

    #[test]
    fn clone_downgrades_writable_mappings_in_both_spaces() {
        let mut from = FakeVmm::new();
        let mut into = FakeVmm::new();
        let mut storage = vec![0u32; 16];
        let cow = CowTable::init(&mut storage);

        let p = page(0x1000);
        let f = frame(0x2000);
        from.map(p, f, PageFlags::USER | PageFlags::WRITE).unwrap();

        clone_address_space_cow(&mut from, &mut into, &cow).unwrap();

        let (from_frame, from_flags) = from.get_mapping(p).unwrap();
        let (into_frame, into_flags) = into.get_mapping(p).unwrap();
        assert_eq!(from_frame, f);
        assert_eq!(into_frame, f);
        assert!(from_flags.contains(PageFlags::COW));
        assert!(into_flags.contains(PageFlags::COW));
        assert!(!from_flags.contains(PageFlags::WRITE));
        assert_eq!(cow.refcount(f), 1);
    }

    #[test]
    #[should_panic]
    fn refcount_underflow_panics() {
        let mut storage = vec![0u32; 4];
        let cow = CowTable::init(&mut storage);
        cow.dec(frame(0x1000));
    }
}
