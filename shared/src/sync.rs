//! Locks consumed throughout the memory core (spec.md section 4.10 / C10).
//!
//! The allocators themselves only ever use [`Spinlock`]: every allocator
//! entry point may be re-entered from the page-fault handler, which runs
//! with interrupts enabled but must never schedule (spec.md section 5), so
//! nothing in this crate may block on a semaphore. [`Semaphore`]/[`Mutex`]
//! exist because spec.md names them as part of C10, but in this core they
//! are only ever handed to external collaborators (the block cache) that
//! may legitimately block a thread; parking and waking a thread is the
//! scheduler's job, which is out of scope (spec.md Non-goals), so blocking
//! is expressed through the [`Parker`] trait rather than a hand-rolled
//! scheduler.

use core::sync::atomic::{AtomicIsize, Ordering};

pub use spin::{Mutex as Spinlock, MutexGuard as SpinlockGuard};

/// Parks and wakes the calling thread. The memory core never calls this
/// itself; it exists so [`Semaphore`] has somewhere to hand off blocking
/// without owning a scheduler.
pub trait Parker: Sync {
    fn park(&self);
    fn unpark_one(&self);
}

/// A `Parker` that never actually blocks: `park` spins until `unpark_one` is
/// observed to have been called at least once since. Adequate for hosted
/// tests and for any caller that knows it won't contend.
pub struct SpinParker {
    wakeups: AtomicIsize,
}

impl SpinParker {
    pub const fn new() -> Self {
        Self {
            wakeups: AtomicIsize::new(0),
        }
    }
}

impl Default for SpinParker {
    fn default() -> Self {
        Self::new()
    }
}

impl Parker for SpinParker {
    fn park(&self) {
        let seen = self.wakeups.load(Ordering::Acquire);
        while self.wakeups.load(Ordering::Acquire) == seen {
            core::hint::spin_loop();
        }
    }

    fn unpark_one(&self) {
        self.wakeups.fetch_add(1, Ordering::AcqRel);
    }
}

/// A counting semaphore, per spec.md 4.10: `wait` decrements, blocking via
/// `parker` if the count would go negative; `signal` increments and wakes
/// one waiter if any are parked.
pub struct Semaphore<'a, P: Parker> {
    count: AtomicIsize,
    parker: &'a P,
}

impl<'a, P: Parker> Semaphore<'a, P> {
    pub const fn new(initial: isize, parker: &'a P) -> Self {
        Self {
            count: AtomicIsize::new(initial),
            parker,
        }
    }

    pub fn wait(&self) {
        loop {
            let prev = self.count.fetch_sub(1, Ordering::AcqRel);
            if prev > 0 {
                return;
            }
            // We oversubtracted; put it back and park until signalled.
            self.count.fetch_add(1, Ordering::AcqRel);
            self.parker.park();
        }
    }

    pub fn signal(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
        self.parker.unpark_one();
    }
}

/// A mutex is a semaphore initialised to 1, per spec.md 4.10.
pub type Mutex<'a, P> = Semaphore<'a, P>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn semaphore_basic() {
        let parker = SpinParker::new();
        let sem = Semaphore::new(1, &parker);
        sem.wait();
        sem.signal();
        sem.wait();
    }

    #[test]
    fn spinlock_excludes() {
        let lock = Spinlock::new(0u32);
        {
            let mut guard = lock.lock();
            *guard += 1;
        }
        assert_eq!(*lock.lock(), 1);
    }
}
