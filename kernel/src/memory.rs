//! Owns every memory-core singleton behind the `{Start, Early, Full}` stage
//! machine (spec.md section 9), and is the page-fault entry point
//! [`crate::idt`] delegates into.
//!
//! Mirrors `init_virtual_memory`/`init_physical_memory` in
//! `src/x86/vmm.c`/`src/pmm.c`: the early bump allocator bootstraps the
//! kernel's own page tables and the Full PMM's bitmaps, and only once that's
//! done does the three-class buddy PMM take over.

use shared::addr::{PhysAddress, PhysExtent, VirtAddress, VirtExtent};
use shared::cow::CowTable;
use shared::kmalloc::Kmalloc;
use shared::page::Page;
use shared::pmm::{split_range, EarlyPmm, FullPmm};
use shared::stage::{Stage, StageCell};
use shared::sync::Spinlock;
use shared::vmspace::Vmspace;

use crate::arch::x86::X86Vmm;

/// Physical address classes are fixed compile-time windows (spec.md's 1 MiB
/// / 4 GiB boundaries, with the open-ended `Any` class capped here at an 8
/// GiB ceiling) so their buddy bitmaps and the COW refcount table can live
/// in statically-reserved arrays instead of a heap this module is itself
/// responsible for bootstrapping.
const ANY_CLASS_TOP: u64 = 8 * 1024 * 1024 * 1024;

const PMM_BITMAP_BYTES: usize = 4 * 1024 * 1024;
const COW_TABLE_ENTRIES: usize = (ANY_CLASS_TOP / 4096) as usize;
const KERNEL_VMSPACE_BITMAP_BYTES: usize = 64 * 1024;

static mut PMM_BITMAP_STORAGE: [u8; PMM_BITMAP_BYTES] = [0; PMM_BITMAP_BYTES];
static mut COW_STORAGE: [u32; COW_TABLE_ENTRIES] = [0; COW_TABLE_ENTRIES];
static mut KERNEL_VMSPACE_BITMAP: [u8; KERNEL_VMSPACE_BITMAP_BYTES] =
    [0; KERNEL_VMSPACE_BITMAP_BYTES];

pub struct MemoryContext {
    stage: StageCell,
    early_pmm: Spinlock<Option<EarlyPmm>>,
    full_pmm: spin::Once<FullPmm<'static>>,
    cow: spin::Once<CowTable<'static>>,
    kernel_vmspace: spin::Once<Vmspace<'static>>,
    kmalloc: Kmalloc,
}

static CONTEXT: MemoryContext = MemoryContext::new();

impl MemoryContext {
    const fn new() -> Self {
        Self {
            stage: StageCell::new(),
            early_pmm: Spinlock::new(None),
            full_pmm: spin::Once::new(),
            cow: spin::Once::new(),
            kernel_vmspace: spin::Once::new(),
            kmalloc: Kmalloc::new(),
        }
    }

    pub fn get() -> &'static MemoryContext {
        &CONTEXT
    }

    pub fn stage(&self) -> Stage {
        self.stage.get()
    }

    /// `Start -> Early`: builds the bump allocator over the firmware's
    /// usable ranges, so [`MemoryContext::alloc_early_page`] can hand out
    /// pages to build the kernel's own page tables before the Full PMM
    /// exists — breaking the `map` <-> `alloc_page` bootstrap cycle spec.md
    /// section 9 describes.
    pub fn bring_up_early(&self, usable: &[PhysExtent]) {
        *self.early_pmm.lock() = Some(EarlyPmm::new(usable));
        self.stage.advance_to_early();
    }

    /// Hands out one page from the early bump allocator. Panics if called
    /// before [`MemoryContext::bring_up_early`] or after
    /// [`MemoryContext::bring_up_full`] — the early allocator is a
    /// stage-scoped resource, not a permanent one.
    pub fn alloc_early_page(&self) -> Option<PhysExtent> {
        self.early_pmm
            .lock()
            .as_mut()
            .expect("early PMM used outside the Early bring-up stage")
            .alloc_page()
    }

    /// `Early -> Full`: builds the three-class buddy PMM over `usable`,
    /// frees every usable range into it, and brings up the kernel vmspace
    /// and COW refcount table on top of it. `usable` should exclude
    /// whatever the early allocator already handed out for the kernel's
    /// initial page tables.
    pub fn bring_up_full(&self, usable: &[PhysExtent], kernel_range: VirtExtent) {
        let under_1mb_top = PhysAddress::from_raw(1 << 20);
        let under_4gb_top = PhysAddress::from_raw(1 << 32);

        let under_1mb = PhysExtent::from_raw(0, 1 << 20);
        let under_4gb = PhysExtent::from_raw_range_exclusive(1 << 20, 1 << 32);
        let any = PhysExtent::from_raw_range_exclusive(1 << 32, ANY_CLASS_TOP);

        let bitmap: &'static mut [u8] = unsafe { &mut *core::ptr::addr_of_mut!(PMM_BITMAP_STORAGE) };
        let pmm = self
            .full_pmm
            .call_once(|| FullPmm::init(bitmap, under_1mb, under_4gb, any));

        for &range in usable {
            let (below_1mb, rest) = split_range(range, under_1mb_top);
            let (below_4gb, above_4gb) = split_range(rest, under_4gb_top);
            if !below_1mb.is_empty() {
                pmm.free_range(below_1mb);
            }
            if !below_4gb.is_empty() {
                pmm.free_range(below_4gb);
            }
            if !above_4gb.is_empty() {
                pmm.free_range(above_4gb);
            }
        }

        let cow_storage: &'static mut [u32] = unsafe { &mut *core::ptr::addr_of_mut!(COW_STORAGE) };
        self.cow.call_once(|| CowTable::init(cow_storage));

        let vmspace_bitmap: &'static mut [u8] =
            unsafe { &mut *core::ptr::addr_of_mut!(KERNEL_VMSPACE_BITMAP) };
        self.kernel_vmspace
            .call_once(|| Vmspace::init(vmspace_bitmap, kernel_range));

        self.stage.advance_to_full();
    }

    pub fn pmm(&self) -> &FullPmm<'static> {
        self.full_pmm
            .get()
            .expect("physical memory manager not yet brought up to Full stage")
    }

    pub fn cow(&self) -> &CowTable<'static> {
        self.cow
            .get()
            .expect("CoW refcount table not yet brought up to Full stage")
    }

    pub fn kernel_vmspace(&self) -> &Vmspace<'static> {
        self.kernel_vmspace
            .get()
            .expect("kernel vmspace not yet brought up to Full stage")
    }

    pub fn kmalloc(&self) -> &Kmalloc {
        &self.kmalloc
    }

    pub fn vmm(&self) -> X86Vmm<'_> {
        X86Vmm::new(self.pmm(), self.cow())
    }

    /// Resolves a page fault at `faulting_addr` (spec.md section 4.6),
    /// called from [`crate::idt`]'s `page_fault_handler` with the address
    /// read out of `%cr2`. Returns whether it was actually a copy-on-write
    /// fault; the caller treats `false` as a genuine protection violation.
    pub fn handle_page_fault(&self, faulting_addr: VirtAddress) -> bool {
        let mut vmm = self.vmm();
        let page = Page::containing(faulting_addr);
        shared::cow::resolve_write_fault(&mut vmm, self.cow(), page).is_ok()
    }
}
