//! The concrete x86 virtual memory manager (spec.md section 4.5), ported
//! from `map`/`unmap`/`get_mapping`/`is_mapped`/`clone_address_space`/
//! `switch_address_space` in `src/x86/vmm.c`.
//!
//! [`X86Vmm`] always addresses whichever page directory is currently loaded
//! in `%cr3` through the [`table::RPDT_BASE`] recursive slot — mirroring the
//! source's single `current` address-space pointer. Only
//! [`X86Vmm::clone_address_space`] ever reaches a second, not-yet-current
//! directory, through the transient [`table::RPDT_BASE2`] slot.

use core::arch::asm;

use shared::addr::VirtAddress;
use shared::cow::{CowTable, FrameSource, PageCopier};
use shared::error::MemError;
use shared::page::{Frame, Page, PAGE_SIZE};
use shared::pmm::{FullPmm, PageRequirement};
use shared::vmm::{PageFlags, Vmm};
use shared::MemResult;

use super::pte::{self, Entry, RawFlags};
use super::table::{self, RPDT_BASE, RPDT_BASE2};

/// Two scratch pages reserved at the top of kernel space, just below the
/// `RPDT_BASE2` recursive slot, used only to temporarily address a physical
/// frame by content for [`X86Vmm::copy_page`]. Never visible to
/// `get_mapping`/`for_each_mapping`: they're unmapped again before either
/// function could observe them.
const TEMP_COPY_SRC: u32 = 0xFF7F_E000;
const TEMP_COPY_DST: u32 = 0xFF7F_F000;

/// Invalidates the TLB's cached translation for `v`, per the `invlpg`
/// inline assembly in `unmap_one_page`.
unsafe fn invlpg(v: VirtAddress) {
    let addr = v.as_raw() as u32;
    asm!("invlpg [{0}]", in(reg) addr, options(nostack, preserves_flags));
}

/// Writes `%cr3`, per `switch_address_space`.
unsafe fn write_cr3(value: u32) {
    asm!("mov cr3, {0}", in(reg) value, options(nostack, preserves_flags));
}

unsafe fn read_cr3() -> u32 {
    let value: u32;
    asm!("mov {0}, cr3", out(reg) value, options(nostack, preserves_flags));
    value
}

pub struct X86Vmm<'a> {
    pmm: &'a FullPmm<'a>,
    cow: &'a CowTable<'a>,
}

impl<'a> X86Vmm<'a> {
    pub fn new(pmm: &'a FullPmm<'a>, cow: &'a CowTable<'a>) -> Self {
        Self { pmm, cow }
    }

    /// Allocates and installs a page table for whichever directory slot
    /// covers `v`, if one isn't already present, per
    /// `ensure_page_table_mapped`. The new table's 1024 entries are zeroed
    /// before use.
    fn ensure_page_table_mapped(&mut self, v: VirtAddress) -> MemResult<()> {
        let dir_entry = unsafe { table::page_dir_entry(RPDT_BASE, v) };
        if dir_entry.present() {
            return Ok(());
        }
        let frame = Frame::new(self.pmm.alloc_page(PageRequirement::Under4Gb)?);
        *dir_entry = Entry::new(frame, RawFlags::PRESENT | RawFlags::WRITE | RawFlags::USER);

        let base = table::table_base(v);
        unsafe {
            let first = table::page_table_entry(RPDT_BASE, base) as *mut Entry;
            for i in 0..1024u32 {
                *first.add(i as usize) = Entry::EMPTY;
            }
        }
        Ok(())
    }

    /// Temporarily maps `frame` at the fixed scratch address `at`,
    /// bypassing the double-map check `map` enforces — used only by
    /// [`X86Vmm::copy_page`], which owns both scratch slots exclusively.
    fn map_scratch(&mut self, at: u32, frame: Frame) {
        let addr = VirtAddress::from_raw(at as u64);
        self.ensure_page_table_mapped(addr)
            .expect("out of memory mapping scratch page table for COW copy");
        let entry = unsafe { table::page_table_entry(RPDT_BASE, addr) };
        *entry = Entry::new(frame, RawFlags::PRESENT | RawFlags::WRITE);
        unsafe { invlpg(addr) };
    }

    fn unmap_scratch(&mut self, at: u32) {
        let addr = VirtAddress::from_raw(at as u64);
        let entry = unsafe { table::page_table_entry(RPDT_BASE, addr) };
        *entry = Entry::EMPTY;
        unsafe { invlpg(addr) };
    }

    /// Builds `dest` as a clone of the currently-loaded address space,
    /// per `clone_address_space`. Every user-mode page table is copied
    /// wholesale into a fresh table (kernel-space directory entries are
    /// shared by reference, since the kernel half of every address space is
    /// identical); copy-on-write downgrading of the copied entries is the
    /// caller's job via [`shared::cow::clone_address_space_cow`], which
    /// this type's [`Vmm::for_each_mapping_mut`] drives.
    pub fn clone_address_space(&mut self) -> MemResult<Frame> {
        let dest_dir_frame = Frame::new(self.pmm.alloc_page(PageRequirement::Any)?);

        unsafe {
            *table::page_dir_entry(RPDT_BASE, rpdt2_dir_addr()) =
                Entry::new(dest_dir_frame, RawFlags::PRESENT | RawFlags::WRITE);
            invlpg(rpdt2_dir_addr());
        }

        for dir_idx in 0..RPDT_BASE2 {
            let v = VirtAddress::from_raw((dir_idx as u64) << 22);
            let src_dir_entry = unsafe { table::page_dir_entry(RPDT_BASE, v) };
            let dest_dir_entry = unsafe { table::page_dir_entry(RPDT_BASE2, v) };

            if !src_dir_entry.present() {
                *dest_dir_entry = Entry::EMPTY;
                continue;
            }

            let is_user = src_dir_entry.flags().contains(RawFlags::USER);
            if !is_user {
                // Kernel-space page tables are shared as-is across every
                // address space.
                *dest_dir_entry = *src_dir_entry;
                continue;
            }

            let table_frame = Frame::new(self.pmm.alloc_page(PageRequirement::Under4Gb)?);
            *dest_dir_entry = Entry::new(
                table_frame,
                RawFlags::PRESENT | RawFlags::WRITE | RawFlags::USER,
            );

            for pte_idx in 0..1024u64 {
                let pv = VirtAddress::from_raw((dir_idx as u64) << 22 | pte_idx << 12);
                let src_pte = unsafe { table::page_table_entry(RPDT_BASE, pv) };
                let dest_pte = unsafe { table::page_table_entry(RPDT_BASE2, pv) };
                *dest_pte = *src_pte;
            }
        }

        unsafe {
            *table::page_dir_entry(RPDT_BASE2, rpdt2_dir_addr()) = Entry::EMPTY;
            invlpg(rpdt2_dir_addr());
        }

        Ok(dest_dir_frame)
    }

    /// Loads `dir` into `%cr3`, per `switch_address_space`. The caller must
    /// ensure `dir` was built by [`X86Vmm::clone_address_space`] (or is the
    /// original boot directory) and is a valid page directory frame.
    pub unsafe fn switch_address_space(dir: Frame) {
        write_cr3(dir.start().as_raw() as u32 | 0b11);
    }

    pub unsafe fn current_directory() -> Frame {
        Frame::containing(shared::addr::PhysAddress::from_raw(read_cr3() as u64))
    }
}

/// `RPDT_BASE2`'s own page-directory-entry address under `RPDT_BASE`
/// addressing: the slot in the current directory used to temporarily park
/// the clone's directory while it's being populated.
fn rpdt2_dir_addr() -> VirtAddress {
    VirtAddress::from_raw((RPDT_BASE2 as u64) << 22)
}

impl<'a> Vmm for X86Vmm<'a> {
    fn map(&mut self, vpage: Page, frame: Frame, flags: PageFlags) -> MemResult<()> {
        self.ensure_page_table_mapped(vpage.start())?;
        let entry = unsafe { table::page_table_entry(RPDT_BASE, vpage.start()) };
        assert!(!entry.present(), "tried to map already-mapped page {:?}", vpage);

        // A CoW page must never also be writable (spec.md section 3's
        // invariant on the PTE format).
        let mut raw = pte::to_raw_flags(flags) | RawFlags::PRESENT;
        if flags.contains(PageFlags::COW) {
            raw -= RawFlags::WRITE;
            self.cow.inc(frame);
        }
        *entry = Entry::new(frame, raw);
        unsafe { invlpg(vpage.start()) };
        Ok(())
    }

    fn unmap(&mut self, vpage: Page) -> MemResult<()> {
        let dir_entry = unsafe { table::page_dir_entry(RPDT_BASE, vpage.start()) };
        assert!(
            dir_entry.present(),
            "tried to unmap {:?} whose page table isn't mapped",
            vpage
        );
        let entry = unsafe { table::page_table_entry(RPDT_BASE, vpage.start()) };
        assert!(entry.present(), "tried to unmap unmapped page {:?}", vpage);
        *entry = Entry::EMPTY;
        unsafe { invlpg(vpage.start()) };
        Ok(())
    }

    fn get_mapping(&self, vpage: Page) -> Option<(Frame, PageFlags)> {
        let dir_entry = unsafe { table::page_dir_entry(RPDT_BASE, vpage.start()) };
        if !dir_entry.present() {
            return None;
        }
        let entry = unsafe { table::page_table_entry(RPDT_BASE, vpage.start()) };
        if !entry.present() {
            return None;
        }
        Some((entry.frame(), pte::from_raw_flags(entry.flags())))
    }

    fn remap_flags(&mut self, vpage: Page, flags: PageFlags) -> MemResult<()> {
        let entry = unsafe { table::page_table_entry(RPDT_BASE, vpage.start()) };
        if !entry.present() {
            return Err(MemError::OutOfMemory);
        }
        let frame = entry.frame();
        let mut raw = pte::to_raw_flags(flags) | RawFlags::PRESENT;
        if flags.contains(PageFlags::COW) {
            raw -= RawFlags::WRITE;
        }
        *entry = Entry::new(frame, raw);
        unsafe { invlpg(vpage.start()) };
        Ok(())
    }

    fn for_each_mapping(&self, f: &mut dyn FnMut(Page, Frame, PageFlags)) {
        for dir_idx in 0..RPDT_BASE2 {
            let dv = VirtAddress::from_raw((dir_idx as u64) << 22);
            let dir_entry = unsafe { table::page_dir_entry(RPDT_BASE, dv) };
            if !dir_entry.present() {
                continue;
            }
            for pte_idx in 0..1024u64 {
                let pv = VirtAddress::from_raw((dir_idx as u64) << 22 | pte_idx << 12);
                let entry = unsafe { table::page_table_entry(RPDT_BASE, pv) };
                if entry.present() {
                    f(Page::containing(pv), entry.frame(), pte::from_raw_flags(entry.flags()));
                }
            }
        }
    }

    fn for_each_mapping_mut(
        &mut self,
        f: &mut dyn FnMut(Page, Frame, PageFlags) -> Option<PageFlags>,
    ) {
        for dir_idx in 0..RPDT_BASE2 {
            let dv = VirtAddress::from_raw((dir_idx as u64) << 22);
            let dir_entry = unsafe { table::page_dir_entry(RPDT_BASE, dv) };
            if !dir_entry.present() {
                continue;
            }
            for pte_idx in 0..1024u64 {
                let pv = VirtAddress::from_raw((dir_idx as u64) << 22 | pte_idx << 12);
                let entry = unsafe { table::page_table_entry(RPDT_BASE, pv) };
                if !entry.present() {
                    continue;
                }
                let page = Page::containing(pv);
                let frame = entry.frame();
                let flags = pte::from_raw_flags(entry.flags());
                if let Some(new_flags) = f(page, frame, flags) {
                    let mut raw = pte::to_raw_flags(new_flags) | RawFlags::PRESENT;
                    if new_flags.contains(PageFlags::COW) {
                        raw -= RawFlags::WRITE;
                    }
                    *entry = Entry::new(frame, raw);
                    unsafe { invlpg(pv) };
                }
            }
        }
    }
}

impl<'a> FrameSource for X86Vmm<'a> {
    fn alloc_frame(&mut self) -> MemResult<Frame> {
        Ok(Frame::containing(self.pmm.alloc_page(PageRequirement::Any)?))
    }

    fn free_frame(&mut self, frame: Frame) {
        self.pmm.free_page(frame.start(), 1);
    }
}

impl<'a> PageCopier for X86Vmm<'a> {
    /// Copies one page of physical memory by temporarily mapping both
    /// frames into the two reserved scratch slots, `memcpy`ing between
    /// them, and tearing the mappings back down.
    fn copy_page(&mut self, src: Frame, dst: Frame) {
        self.map_scratch(TEMP_COPY_SRC, src);
        self.map_scratch(TEMP_COPY_DST, dst);
        unsafe {
            core::ptr::copy_nonoverlapping(
                TEMP_COPY_SRC as *const u8,
                TEMP_COPY_DST as *mut u8,
                PAGE_SIZE.as_raw() as usize,
            );
        }
        self.unmap_scratch(TEMP_COPY_SRC);
        self.unmap_scratch(TEMP_COPY_DST);
    }
}
