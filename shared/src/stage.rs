//! The `{Start, Early, Full}` physical-memory bring-up stage machine
//! (spec.md section 9, "Global mutable state"; `pmm_init_stage` in
//! `original_source`'s `hal.h`/`pmm.c`).
//!
//! Transitions are one-way and encapsulated: nothing outside this module can
//! move the stage backwards, and advancing out of order panics exactly as
//! the source's `assert(pmm_init_stage == ...)` guards do.

use core::sync::atomic::{AtomicU8, Ordering};

#[derive(Clone, Copy, Eq, PartialEq, Debug, num_derive::FromPrimitive)]
#[repr(u8)]
pub enum Stage {
    Start = 0,
    Early = 1,
    Full = 2,
}

pub struct StageCell(AtomicU8);

impl StageCell {
    pub const fn new() -> Self {
        Self(AtomicU8::new(Stage::Start as u8))
    }

    pub fn get(&self) -> Stage {
        match self.0.load(Ordering::Acquire) {
            0 => Stage::Start,
            1 => Stage::Early,
            _ => Stage::Full,
        }
    }

    /// Advances `Start -> Early`. Panics if not currently `Start`.
    pub fn advance_to_early(&self) {
        self.transition(Stage::Start, Stage::Early);
    }

    /// Advances `Early -> Full`. Panics if not currently `Early`.
    pub fn advance_to_full(&self) {
        self.transition(Stage::Early, Stage::Full);
    }

    fn transition(&self, from: Stage, to: Stage) {
        let prev = self
            .0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire);
        assert!(
            prev.is_ok(),
            "stage machine: expected {:?}, got {:?}",
            from,
            self.get()
        );
    }
}

impl Default for StageCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test]
    fn forward_only() {
        let s = StageCell::new();
        log::debug!("stage starts at {:?}", s.get());
        assert_eq!(s.get(), Stage::Start);
        s.advance_to_early();
        assert_eq!(s.get(), Stage::Early);
        s.advance_to_full();
        assert_eq!(s.get(), Stage::Full);
    }

    #[test]
    #[should_panic]
    fn double_advance_panics() {
        let s = StageCell::new();
        s.advance_to_early();
        s.advance_to_early();
    }

    #[test]
    #[should_panic]
    fn skip_panics() {
        let s = StageCell::new();
        s.advance_to_full();
    }
}
