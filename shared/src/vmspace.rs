//! The virtual address-space allocator (spec.md 4.7 / C7), ported from
//! `src/vmspace.c`. Structurally identical to [`crate::buddy`]: a second
//! buddy instance, this time carved out of a virtual address range instead
//! of physical memory, optionally backed page-by-page by fresh physical
//! frames through a [`Vmm`].

use crate::addr::{Length, VirtAddress, VirtAddressType, VirtExtent};
use crate::buddy::{self, Buddy};
use crate::cow::FrameSource;
use crate::error::MemError;
use crate::page::Page;
use crate::sync::Spinlock;
use crate::vmm::{PageFlags, Vmm};
use crate::MemResult;

pub struct Vmspace<'a> {
    buddy: Spinlock<Buddy<'a, VirtAddressType>>,
}

impl<'a> Vmspace<'a> {
    pub fn overhead(range: VirtExtent) -> usize {
        buddy::overhead(range.extent())
    }

    /// `bitmap_storage` must be at least `Vmspace::overhead(range)` bytes.
    /// The whole range starts out free, per `vmspace_init`.
    pub fn init(bitmap_storage: &'a mut [u8], range: VirtExtent) -> Self {
        Self {
            buddy: Spinlock::new(Buddy::init(bitmap_storage, range, true)),
        }
    }

    /// Reserves a `size`-byte virtual range with no physical backing.
    pub fn alloc_virt(&self, size: Length) -> MemResult<VirtAddress> {
        self.buddy
            .lock()
            .alloc(size.as_raw())
            .ok_or(MemError::OutOfMemory)
    }

    /// Returns a previously reserved virtual range. Does not touch any
    /// mapping; callers that backed the range with physical pages must
    /// unmap and free them first (see [`Vmspace::free`]).
    pub fn free_virt(&self, addr: VirtAddress, size: Length) {
        self.buddy.lock().free(addr, size.as_raw());
    }

    /// Reserves a `size`-byte virtual range and, if `alloc_phys`, backs
    /// every page of it with a freshly allocated physical frame mapped in
    /// with `flags`. Mirrors `vmspace_alloc`'s combined virtual+physical
    /// path. On a mid-way allocation failure, everything already mapped is
    /// torn back down and the virtual range is released.
    pub fn alloc<V: Vmm>(
        &self,
        vmm: &mut V,
        frames: &mut impl FrameSource,
        size: Length,
        flags: PageFlags,
        alloc_phys: bool,
    ) -> MemResult<VirtAddress> {
        let addr = self.alloc_virt(size)?;
        if alloc_phys {
            if let Err(e) = self.back_range(vmm, frames, addr, size, flags) {
                self.free(vmm, frames, addr, size, true);
                return Err(e);
            }
        }
        Ok(addr)
    }

    fn back_range<V: Vmm>(
        &self,
        vmm: &mut V,
        frames: &mut impl FrameSource,
        addr: VirtAddress,
        size: Length,
        flags: PageFlags,
    ) -> MemResult<()> {
        let end = addr + size;
        let mut page = Page::containing(addr);
        while page.start() < end {
            let frame = frames.alloc_frame()?;
            vmm.map(page, frame, flags)?;
            page = page.next().expect("virtual address exhausted while backing a vmspace range");
        }
        Ok(())
    }

    /// Releases a range allocated by [`Vmspace::alloc`]/[`Vmspace::alloc_virt`].
    /// If `free_phys`, every currently mapped page in the range is unmapped
    /// and its frame returned to `frames` first; pages with no mapping
    /// (never touched, or already torn down) are skipped.
    pub fn free<V: Vmm>(
        &self,
        vmm: &mut V,
        frames: &mut impl FrameSource,
        addr: VirtAddress,
        size: Length,
        free_phys: bool,
    ) {
        if free_phys {
            let end = addr + size;
            let mut page = Page::containing(addr);
            while page.start() < end {
                if let Some((frame, _)) = vmm.get_mapping(page) {
                    let _ = vmm.unmap(page);
                    frames.free_frame(frame);
                }
                page = page
                    .next()
                    .expect("virtual address exhausted while freeing a vmspace range");
            }
        }
        self.free_virt(addr, size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::{Address, PhysAddressType};
    use crate::page::{Frame, PAGE_SIZE};
    use std::collections::HashMap;

    #[test]
    fn virt_alloc_free_coalesces() {
        let range = VirtExtent::from_raw(0x1000_0000, 16 * 1024 * 1024);
        let mut storage = vec![0u8; Vmspace::overhead(range)];
        let vs = Vmspace::init(&mut storage, range);

        let a = vs.alloc_virt(Length::from_raw(4096)).unwrap();
        let b = vs.alloc_virt(Length::from_raw(8192)).unwrap();
        vs.free_virt(a, Length::from_raw(4096));
        vs.free_virt(b, Length::from_raw(8192));

        let whole = vs.alloc_virt(Length::from_raw(16 * 1024 * 1024)).unwrap();
        assert_eq!(whole, range.start());
    }

    struct FakeVmm {
        table: HashMap<Page, (Frame, PageFlags)>,
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
            for (&p, &(fr, fl)) in self.table.iter() {
                f(p, fr, fl);
            }
        }
        fn for_each_mapping_mut(
            &mut self,
            f: &mut dyn FnMut(Page, Frame, PageFlags) -> Option<PageFlags>,
        ) {
            for (&p, entry) in self.table.iter_mut() {
                if let Some(nf) = f(p, entry.0, entry.1) {
                    entry.1 = nf;
                }
            }
        }
    }

    struct FakeFrames {
        next: u64,
    }
    impl FrameSource for FakeFrames {
        fn alloc_frame(&mut self) -> MemResult<Frame> {
            let f = Frame::new(Address::<PhysAddressType>::from_raw(self.next));
            self.next += PAGE_SIZE.as_raw();
            Ok(f)
        }
        fn free_frame(&mut self, _frame: Frame) {}
    }

    #[test]
    fn alloc_backs_every_page_and_free_tears_down() {
        let range = VirtExtent::from_raw(0x2000_0000, 4 * 1024 * 1024);
        let mut storage = vec![0u8; Vmspace::overhead(range)];
        let vs = Vmspace::init(&mut storage, range);
        let mut vmm = FakeVmm {
            table: HashMap::new(),
        };
        let mut frames = FakeFrames { next: 0x4000_0000 };

        let size = Length::from_raw(3 * PAGE_SIZE.as_raw());
        let addr = vs
            .alloc(&mut vmm, &mut frames, size, PageFlags::WRITE, true)
            .unwrap();

        let mut page = Page::containing(addr);
        for _ in 0..3 {
            assert!(vmm.is_mapped(page));
            page = page.next().unwrap();
        }

        vs.free(&mut vmm, &mut frames, addr, size, true);
        let mut page = Page::containing(addr);
        for _ in 0..3 {
            assert!(!vmm.is_mapped(page));
            page = page.next().unwrap();
        }
    }
}
