pub mod pte;
pub mod table;
pub mod vmm;

pub use vmm::X86Vmm;
