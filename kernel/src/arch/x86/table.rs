//! The recursive page-directory addressing trick (spec.md section 4.5's
//! virtual-memory manager, "Mapping scheme"), ported from the
//! `PAGE_TABLE_ENTRY`/`PAGE_DIR_ENTRY` macros and `RPDT_BASE`/`RPDT_BASE2`
//! constants in `src/x86/vmm.c`.
//!
//! The last page directory entry (1023) is permanently mapped to the
//! directory itself, so re-walking the two-level hierarchy with the
//! directory substituted for its own last page table collapses one level of
//! lookup: indexing through `RPDT_BASE` lands on a page table's contents,
//! and indexing through it twice lands on the directory's own contents.
//! `RPDT_BASE2` (1022) is a second, transient slot reserved for
//! [`super::vmm::X86Vmm::clone_address_space`], which needs to address a
//! second directory and its tables while the first remains current.

use shared::addr::VirtAddress;

use super::pte::Entry;

pub const RPDT_BASE: u32 = 1023;
pub const RPDT_BASE2: u32 = 1022;

const PAGE_SIZE: u32 = 4096;
const PAGE_TABLE_SIZE: u32 = PAGE_SIZE * 1024;

/// Address (within the recursively-mapped region rooted at `base`) of the
/// page table entry that maps `v`. Dereferencing the result only makes
/// sense while `base`'s directory is the one installed in `%cr3`, or is
/// itself reachable through `RPDT_BASE`'s own recursive slot.
fn page_table_entry_ptr(base: u32, v: u32) -> *mut Entry {
    (base * PAGE_TABLE_SIZE + (v >> 12) * 4) as *mut Entry
}

/// Address of the page directory entry covering `v`, i.e. the slot that
/// says whether a page table exists for `v`'s upper 10 bits at all.
fn page_dir_entry_ptr(base: u32, v: u32) -> *mut Entry {
    (base * PAGE_TABLE_SIZE + RPDT_BASE * PAGE_SIZE + (v >> 22) * 4) as *mut Entry
}

/// Safety: the caller must have `base`'s page directory reachable through
/// the recursive self-map (either because it's the current `%cr3`, mapped
/// at `RPDT_BASE`, or temporarily mapped at `RPDT_BASE2` by
/// [`super::vmm::X86Vmm::clone_address_space`]), and must not race another
/// accessor of the same table without holding the owning address space's
/// lock.
pub unsafe fn page_table_entry(base: u32, v: VirtAddress) -> &'static mut Entry {
    &mut *page_table_entry_ptr(base, v.as_raw() as u32)
}

/// Safety: see [`page_table_entry`].
pub unsafe fn page_dir_entry(base: u32, v: VirtAddress) -> &'static mut Entry {
    &mut *page_dir_entry_ptr(base, v.as_raw() as u32)
}

/// The virtual address a page table covering `v` would be entirely
/// addressable from, i.e. `v` with its low 22 bits cleared.
pub fn table_base(v: VirtAddress) -> VirtAddress {
    VirtAddress::from_raw(v.as_raw() & !((1u64 << 22) - 1))
}
