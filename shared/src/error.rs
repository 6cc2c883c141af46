//! The error taxonomy of spec.md section 7.
//!
//! Out-of-memory is the only condition the memory core surfaces to its
//! caller as a value; everything else (heap corruption, double-map,
//! uninitialised stage) is a contract violation and panics where it is
//! detected, exactly as the original C sources `assert()`/`panic()`.

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum MemError {
    /// The buddy allocator, a PMM class, or a vmspace had no free block big
    /// enough to satisfy the request.
    OutOfMemory,
}

pub type MemResult<T> = Result<T, MemError>;
