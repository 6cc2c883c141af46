//! Architecture-specific glue binding [`shared`]'s neutral memory core to
//! real hardware. Only one backend exists (`x86`); the split mirrors
//! `shared`'s own split between the arch-neutral core and this crate.

pub mod x86;
