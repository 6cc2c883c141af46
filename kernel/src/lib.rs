//! Crate root: wires the x86 page-table backend ([`arch`]) and the
//! memory-management core ([`memory`]) into a bootable kernel, alongside the
//! segment/interrupt scaffolding ([`gdt`], [`idt`]) every exception handler
//! (not least the page-fault one) needs loaded first.
#![cfg_attr(not(test), no_std)]
#![feature(abi_x86_interrupt)]

pub mod arch;
pub mod gdt;
pub mod heap;
pub mod idt;
pub mod logging;
pub mod memory;

use shared::addr::{PhysExtent, VirtExtent};

#[cfg(not(test))]
#[global_allocator]
static ALLOCATOR: heap::GlobalAllocator = heap::GlobalAllocator;

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    log::error!("{}", info);
    loop {
        unsafe { core::arch::asm!("hlt") };
    }
}

/// One entry of the firmware-reported usable physical memory map, handed to
/// [`kinit`] by whatever boot stub ran before it (multiboot, a custom
/// bootloader, or a unit-test harness). Kept deliberately minimal: just the
/// extents [`memory::MemoryContext::bring_up_early`]/`bring_up_full` need,
/// not a full multiboot info structure.
#[repr(C)]
pub struct MemoryMapEntry {
    pub base: u64,
    pub length: u64,
}

/// Brings the kernel up to the point where the heap, the full physical
/// memory manager, and copy-on-write fault handling are all live.
///
/// `usable` lists every physical range the bootloader reports as available
/// RAM, in any order, with no required alignment. `kernel_image` is the
/// virtual range backing the kernel's own mappings, used to size the kernel
/// [`shared::vmspace::Vmspace`] that `kmalloc` draws from.
pub fn kinit(usable: &[MemoryMapEntry], kernel_image: VirtExtent) {
    logging::init();
    gdt::init();
    idt::init();

    let extents: alloc_free_extents::Extents = alloc_free_extents::collect(usable);
    let ctx = memory::MemoryContext::get();

    ctx.bring_up_early(extents.as_slice());
    // A real boot stub would carve out and exclude whatever pages
    // `bring_up_early` just handed out to build the kernel's initial page
    // tables before calling this; that handoff lives in the boot stub, not
    // here.
    ctx.bring_up_full(extents.as_slice(), kernel_image);

    log::info!("memory core initialized");
}

/// Converts the boot-supplied memory map into the `[PhysExtent]` slice
/// [`memory::MemoryContext`] wants, using the same fixed-capacity `ArrayVec`
/// `shared` uses for its own early allocator table rather than a heap `Vec`
/// (the heap isn't up yet at this point in `kinit`).
mod alloc_free_extents {
    use arrayvec::ArrayVec;
    use shared::addr::{Address, PhysExtent};

    use super::MemoryMapEntry;

    const MAX_ENTRIES: usize = 64;

    pub struct Extents(ArrayVec<PhysExtent, MAX_ENTRIES>);

    impl Extents {
        pub fn as_slice(&self) -> &[PhysExtent] {
            &self.0
        }
    }

    pub fn collect(entries: &[MemoryMapEntry]) -> Extents {
        let mut v = ArrayVec::new();
        for e in entries {
            v.push(PhysExtent::new(Address::from_raw(e.base), shared::addr::Length::from_raw(e.length)));
        }
        Extents(v)
    }
}
