//! A process-memory simulation of [`crate::vmm::Vmm`], used to run the rest
//! of the memory core's tests without real page tables or a real page-fault
//! vector (spec.md section 8's scenario tests; grounded in
//! `src/hosted/vmm.c`, which runs the same C allocators as an ordinary
//! process using `mmap`/`munmap` and a `SIGSEGV` handler to simulate faults).
//!
//! Real hardware isn't available in this crate's test environment (and
//! never will be, under `cargo test`), so this backend fakes physical
//! frames as plain heap buffers and page table entries as a hash map rather
//! than walking real page directories. [`crate::cow::resolve_write_fault`]
//! and [`crate::cow::clone_address_space_cow`] run identically against it
//! and against the `kernel` crate's real x86 implementation, since both are
//! written purely in terms of [`crate::vmm::Vmm`].

use std::collections::HashMap;

use crate::addr::{Address, PhysAddressType};
use crate::cow::{FrameSource, PageCopier};
use crate::error::MemError;
use crate::page::{Frame, Page, PAGE_SIZE};
use crate::slab::SlabBacking;
use crate::vmm::{PageFlags, Vmm};
use crate::MemResult;

/// A simulated frame: just a heap buffer the size of one page. Real
/// physical addresses are never dereferenced in hosted tests; the "frame"
/// returned to callers is an opaque handle used only to look the buffer
/// back up in `backing`.
pub struct HostedVmm {
    table: HashMap<Page, (Frame, PageFlags)>,
    backing: HashMap<Frame, Box<[u8]>>,
    next_frame: u64,
}

impl HostedVmm {
    pub fn new() -> Self {
        Self {
            table: HashMap::new(),
            backing: HashMap::new(),
            // Starts well above zero so `Frame::number() == 0` is never a
            // live frame, matching the convention other modules rely on
            // (e.g. a null/sentinel frame number).
            next_frame: PAGE_SIZE.as_raw(),
        }
    }

    /// Reads the simulated contents of whatever frame `page` is mapped to.
    /// Panics if `page` isn't mapped — this is a test helper, not part of
    /// the `Vmm` contract.
    pub fn read(&self, page: Page) -> &[u8] {
        let (frame, _) = self.table.get(&page).expect("page not mapped");
        &self.backing[frame]
    }

    pub fn write(&mut self, page: Page, data: &[u8]) {
        let (frame, flags) = *self.table.get(&page).expect("page not mapped");
        assert!(flags.contains(PageFlags::WRITE), "page not writable");
        let buf = self.backing.get_mut(&frame).unwrap();
        buf[..data.len()].copy_from_slice(data);
    }
}

impl Default for HostedVmm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vmm for HostedVmm {
    fn map(&mut self, vpage: Page, frame: Frame, flags: PageFlags) -> MemResult<()> {
        assert!(
            !self.table.contains_key(&vpage),
            "double map of {:?}",
            vpage
        );
        self.backing
            .entry(frame)
            .or_insert_with(|| vec![0u8; PAGE_SIZE.as_raw() as usize].into_boxed_slice());
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
        let (frame, _) = self
            .table
            .get(&vpage)
            .copied()
            .ok_or(MemError::OutOfMemory)?;
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

impl FrameSource for HostedVmm {
    fn alloc_frame(&mut self) -> MemResult<Frame> {
        let frame = Frame::new(Address::<PhysAddressType>::from_raw(self.next_frame));
        self.next_frame += PAGE_SIZE.as_raw();
        self.backing
            .insert(frame, vec![0u8; PAGE_SIZE.as_raw() as usize].into_boxed_slice());
        Ok(frame)
    }

    fn free_frame(&mut self, frame: Frame) {
        self.backing.remove(&frame);
    }
}

impl PageCopier for HostedVmm {
    fn copy_page(&mut self, src: Frame, dst: Frame) {
        let src_data = self.backing[&src].clone();
        self.backing.insert(dst, src_data);
    }
}

/// Backs a [`crate::slab::SlabCache`] with plain heap buffers,
/// `SLAB_SIZE`-aligned by over-allocating and rounding the pointer up, for
/// hosted kmalloc/slab tests.
pub struct HostedSlabBacking {
    freed: Vec<u64>,
}

impl HostedSlabBacking {
    pub fn new() -> Self {
        Self { freed: Vec::new() }
    }
}

impl Default for HostedSlabBacking {
    fn default() -> Self {
        Self::new()
    }
}

impl SlabBacking for HostedSlabBacking {
    fn alloc_slab(&mut self) -> MemResult<crate::addr::VirtAddress> {
        use crate::slab::SLAB_SIZE;
        if let Some(addr) = self.freed.pop() {
            return Ok(crate::addr::VirtAddress::from_raw(addr));
        }
        let raw: Box<[u8]> = vec![0u8; 2 * SLAB_SIZE.as_raw() as usize].into_boxed_slice();
        let ptr = Box::into_raw(raw) as *mut u8 as u64;
        let aligned = (ptr + SLAB_SIZE.as_raw() - 1) & !(SLAB_SIZE.as_raw() - 1);
        Ok(crate::addr::VirtAddress::from_raw(aligned))
    }

    fn free_slab(&mut self, addr: crate::addr::VirtAddress) {
        self.freed.push(addr.as_raw());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cow::{clone_address_space_cow, resolve_write_fault, CowTable};
    use crate::page::Page;

    #[test]
    fn map_write_read_roundtrip() {
        let mut vmm = HostedVmm::new();
        let frame = vmm.alloc_frame().unwrap();
        let page = Page::containing(crate::addr::VirtAddress::from_raw(0x4000_0000));
        vmm.map(page, frame, PageFlags::WRITE).unwrap();
        vmm.write(page, b"hello");
        assert_eq!(&vmm.read(page)[..5], b"hello");
    }

    #[test]
    fn clone_then_write_copies_and_diverges() {
        let mut parent = HostedVmm::new();
        let mut child = HostedVmm::new();
        let mut storage = vec![0u32; 64];
        let cow = CowTable::init(&mut storage);

        let frame = parent.alloc_frame().unwrap();
        let page = Page::containing(crate::addr::VirtAddress::from_raw(0x5000_0000));
        parent
            .map(page, frame, PageFlags::USER | PageFlags::WRITE)
            .unwrap();
        parent.write(page, b"original");

        clone_address_space_cow(&mut parent, &mut child, &cow).unwrap();
        assert_eq!(&child.read(page)[..8], b"original");

        // Write through the child: should copy onto a fresh frame and
        // leave the parent's copy untouched.
        resolve_write_fault(&mut child, &cow, page).unwrap();
        child.write(page, b"divergedX");

        assert_eq!(&parent.read(page)[..8], b"original");
        assert_eq!(&child.read(page)[..9], b"divergedX");
    }
}
