//! Global heap allocator wiring: binds [`shared::kmalloc::Kmalloc`] to the
//! kernel vmspace and the x86 VMM so ordinary `alloc`/`Box`/`Vec` work
//! (spec.md 4.9 / C9), mirroring the teacher's old `mm::GlobalAllocator`.
//!
//! `Vmspace::alloc`/`free` want a `Vmm` and a `FrameSource` as two separate
//! borrows; [`crate::memory::MemoryContext::vmm`] and the PMM's own
//! `&FullPmm` [`shared::cow::FrameSource`] impl give us two genuinely
//! distinct objects to pass, rather than aliasing one `&mut` twice.

use core::alloc::{GlobalAlloc, Layout};

use shared::addr::{Length, VirtAddress};
use shared::error::MemResult;
use shared::kmalloc::HeapBacking;
use shared::slab::SlabBacking;
use shared::vmm::PageFlags;

use crate::memory::MemoryContext;

struct KernelHeapBacking;

impl SlabBacking for KernelHeapBacking {
    fn alloc_slab(&mut self) -> MemResult<VirtAddress> {
        let ctx = MemoryContext::get();
        let mut vmm = ctx.vmm();
        let mut frames = ctx.pmm();
        ctx.kernel_vmspace().alloc(
            &mut vmm,
            &mut frames,
            shared::slab::SLAB_SIZE,
            PageFlags::WRITE,
            true,
        )
    }

    fn free_slab(&mut self, addr: VirtAddress) {
        let ctx = MemoryContext::get();
        let mut vmm = ctx.vmm();
        let mut frames = ctx.pmm();
        ctx.kernel_vmspace()
            .free(&mut vmm, &mut frames, addr, shared::slab::SLAB_SIZE, true);
    }
}

impl HeapBacking for KernelHeapBacking {
    fn alloc_large(&mut self, size: Length) -> MemResult<VirtAddress> {
        let ctx = MemoryContext::get();
        let mut vmm = ctx.vmm();
        let mut frames = ctx.pmm();
        ctx.kernel_vmspace()
            .alloc(&mut vmm, &mut frames, size, PageFlags::WRITE, true)
    }

    fn free_large(&mut self, addr: VirtAddress, size: Length) {
        let ctx = MemoryContext::get();
        let mut vmm = ctx.vmm();
        let mut frames = ctx.pmm();
        ctx.kernel_vmspace()
            .free(&mut vmm, &mut frames, addr, size, true);
    }
}

/// Installed as `#[global_allocator]` in `lib.rs`. Every call routes through
/// [`MemoryContext::get`], so nothing can allocate before `bring_up_full` has
/// run; doing so panics via [`MemoryContext::kernel_vmspace`]'s `expect`.
pub struct GlobalAllocator;

unsafe impl GlobalAlloc for GlobalAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let mut backing = KernelHeapBacking;
        match MemoryContext::get()
            .kmalloc()
            .alloc(layout.size() as u64, &mut backing)
        {
            Ok(addr) => addr.as_mut_ptr(),
            Err(_) => core::ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let mut backing = KernelHeapBacking;
        MemoryContext::get()
            .kmalloc()
            .free(VirtAddress::from_raw(ptr as u64), &mut backing);
    }
}
