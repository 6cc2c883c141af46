#![cfg_attr(not(any(test, feature = "hosted")), no_std)]

//! Architecture-neutral half of the memory-management core: bitmaps, the
//! buddy allocator, both physical memory managers, the virtual
//! address-space allocator, the slab cache, `kmalloc`, copy-on-write
//! refcounts, and the locks that hold it all together.
//!
//! The `kernel` crate supplies the x86-specific page table format and wires
//! these pieces into a `MemoryContext`. Everything here is also exercised
//! directly, hosted, through the `hosted` module (see `original_source`'s
//! `src/hosted/vmm.c`, which this mirrors).

pub mod addr;
pub mod bitmap;
pub mod buddy;
pub mod cow;
pub mod error;
#[cfg(any(test, feature = "hosted"))]
pub mod hosted;
pub mod kmalloc;
pub mod log;
pub mod page;
pub mod pmm;
pub mod slab;
pub mod stage;
pub mod sync;
pub mod vmm;
pub mod vmspace;

pub use addr::{Length, PhysAddress, PhysExtent, VirtAddress, VirtExtent};
pub use error::MemError;
