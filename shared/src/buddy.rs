//! Power-of-two buddy allocator over a single base range (spec.md 4.2 / C2),
//! ported from `src/adt/buddy.c`.
//!
//! One [`Bitmap`] per order tracks which blocks of that order are free and
//! unsplit; a set bit means "free and not further split". Siblings
//! ("buddies") are coalesced the moment both become free, so at any time
//! exactly one representation holds for each offset: either an ancestor
//! block is marked free, or the offset belongs to an allocated descendant.

use arrayvec::ArrayVec;

use crate::addr::{Address, AddressType, Length, Range};
use crate::bitmap::Bitmap;

/// log2 of the smallest block size (4 KiB).
pub const MIN_ORDER: u32 = 12;
/// log2 of the largest block size (256 MiB).
pub const MAX_ORDER: u32 = 28;
pub const NUM_ORDERS: usize = (MAX_ORDER - MIN_ORDER + 1) as usize;

/// Bytes of bitmap storage [`Buddy::init`] needs for a base range of this
/// extent: the sum, over every order, of `ceil(extent / 2^order / 8) + 1`
/// (the `+1` mirrors the source's off-by-one-safe `/8 + 1`).
pub fn overhead(extent: Length) -> usize {
    (MIN_ORDER..=MAX_ORDER)
        .map(|k| ((extent.as_raw() >> k) / 8 + 1) as usize)
        .sum()
}

fn log2_roundup(size: u64) -> u32 {
    assert!(size > 0);
    if size == 1 {
        return 0;
    }
    u64::BITS - (size - 1).leading_zeros()
}

pub struct Buddy<'a, Type: AddressType> {
    start: Address<Type>,
    size: Length,
    orders: ArrayVec<Bitmap<'a>, NUM_ORDERS>,
}

impl<'a, Type: AddressType> Buddy<'a, Type> {
    /// Carves `bitmap_storage` (which must be at least
    /// `overhead(range.extent())` bytes) into one bitmap per order and
    /// initialises a buddy allocator over `range`. If `start_freed` is set,
    /// the whole range is seeded as free via [`Buddy::free_range`].
    pub fn init(bitmap_storage: &'a mut [u8], range: Range<Type>, start_freed: bool) -> Self {
        let start = range.start();
        let size = range.extent();
        let mut orders = ArrayVec::new();

        let mut storage = bitmap_storage;
        for k in MIN_ORDER..=MAX_ORDER {
            let num_blocks = (size.as_raw() >> k) as usize;
            let needed = num_blocks / 8 + 1;
            let (mine, rest) = storage.split_at_mut(needed);
            orders.push(Bitmap::init(mine, num_blocks));
            storage = rest;
        }

        let mut buddy = Buddy {
            start,
            size,
            orders,
        };
        if start_freed {
            buddy.free_range(range);
        }
        buddy
    }

    fn order_bitmap(&mut self, log_sz: u32) -> &mut Bitmap<'a> {
        &mut self.orders[(log_sz - MIN_ORDER) as usize]
    }

    /// Rounds `size` up to a power of two and returns the lowest address of
    /// a free block of at least that size, splitting larger free blocks as
    /// necessary. Returns `None` if no block is available at any order.
    pub fn alloc(&mut self, size: u64) -> Option<Address<Type>> {
        let orig_log = log2_roundup(size);
        assert!(
            orig_log <= MAX_ORDER,
            "buddy_alloc: request larger than the maximum block size"
        );

        let mut log_sz = orig_log;
        let mut idx = loop {
            if let Some(i) = self.order_bitmap(log_sz).first_set() {
                break i as u64;
            }
            if log_sz == MAX_ORDER {
                return None;
            }
            log_sz += 1;
        };

        while log_sz != orig_log {
            self.order_bitmap(log_sz).clear(idx as usize);
            idx <<= 1;
            log_sz -= 1;
            self.order_bitmap(log_sz).set(idx as usize);
            self.order_bitmap(log_sz).set((idx + 1) as usize);
        }

        self.order_bitmap(log_sz).clear(idx as usize);
        Some(self.start + Length::from_raw(idx << log_sz))
    }

    /// Returns a previously allocated `(addr, size)` block to the
    /// allocator, coalescing with its buddy up through higher orders while
    /// possible.
    pub fn free(&mut self, addr: Address<Type>, size: u64) {
        let offs = (addr - self.start).as_raw();
        let mut log_sz = log2_roundup(size);
        let mut idx = offs >> log_sz;

        loop {
            self.order_bitmap(log_sz).set(idx as usize);
            if log_sz == MAX_ORDER {
                break;
            }

            let buddy_idx = idx ^ 1;
            if self.order_bitmap(log_sz).is_clear(buddy_idx as usize) {
                break;
            }
            // FIXME(buddy_free_range upstream): coalescing doesn't check
            // that the combined block stays inside the managed extent at
            // the top of the range; carried over from `src/adt/buddy.c`
            // unmodified, per spec.md's design notes.
            self.order_bitmap(log_sz).clear(idx as usize);
            self.order_bitmap(log_sz).clear(buddy_idx as usize);
            idx >>= 1;
            log_sz += 1;
        }
    }

    /// Seeds the allocator with an arbitrary range of free memory by
    /// greedily peeling off the largest buddy-aligned block that fits at
    /// each step. Used to feed an empty allocator from a firmware memory
    /// map.
    pub fn free_range(&mut self, mut range: Range<Type>) {
        let min_sz = 1u64 << MIN_ORDER;

        if !is_aligned(range.start().as_raw(), MIN_ORDER) {
            if range.extent().as_raw() < min_sz {
                return;
            }
            let aligned = align_down(range.start().as_raw(), MIN_ORDER) + min_sz;
            let consumed = aligned - range.start().as_raw();
            range = Range::new(
                range.start() + Length::from_raw(consumed),
                range.extent() - Length::from_raw(consumed),
            );
        }

        while range.extent().as_raw() >= min_sz && is_aligned(range.start().as_raw(), MIN_ORDER) {
            let mut took = false;
            for k in (MIN_ORDER..=MAX_ORDER).rev() {
                let sz = 1u64 << k;
                let start_rel = (range.start() - self.start).as_raw();
                if sz > range.extent().as_raw() || !is_aligned(start_rel, k) {
                    continue;
                }

                let block_addr = range.start();
                range = Range::new(
                    range.start() + Length::from_raw(sz),
                    range.extent() - Length::from_raw(sz),
                );
                self.free(block_addr, sz);
                took = true;
                break;
            }
            if !took {
                break;
            }
        }
    }

    pub fn base(&self) -> Range<Type> {
        Range::new(self.start, self.size)
    }
}

fn align_down(x: u64, log2: u32) -> u64 {
    x & !((1u64 << log2) - 1)
}

fn is_aligned(x: u64, log2: u32) -> bool {
    x & ((1u64 << log2) - 1) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::PhysAddressType;

    type TestBuddy<'a> = Buddy<'a, PhysAddressType>;

    #[test]
    fn log2_roundup_values() {
        assert_eq!(log2_roundup(1), 0);
        assert_eq!(log2_roundup(2), 1);
        assert_eq!(log2_roundup(3), 2);
        assert_eq!(log2_roundup(4096), 12);
        assert_eq!(log2_roundup(4097), 13);
    }

    #[test]
    fn alloc_free_16mib_full_coalesce() {
        let range = Range::from_raw(0, 16 * 1024 * 1024);
        let mut storage = vec![0u8; overhead(range.extent())];
        let mut b = TestBuddy::init(&mut storage, range, true);

        let a = b.alloc(4096).unwrap();
        let c = b.alloc(8192).unwrap();
        let d = b.alloc(1024 * 1024).unwrap();

        assert!(d.is_aligned_to(1024 * 1024));
        assert_ne!(a, c);

        b.free(d, 1024 * 1024);
        b.free(c, 8192);
        b.free(a, 4096);

        // Full coalescing: the whole range should be allocatable again.
        let whole = b.alloc(16 * 1024 * 1024).unwrap();
        assert_eq!(whole, range.start());
    }

    #[test]
    fn disjoint_allocations() {
        let range = Range::from_raw(0, 1024 * 1024);
        let mut storage = vec![0u8; overhead(range.extent())];
        let mut b = TestBuddy::init(&mut storage, range, true);

        let a = b.alloc(4096).unwrap();
        let c = b.alloc(4096).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn out_of_memory_returns_none() {
        let range = Range::from_raw(0, 4096);
        let mut storage = vec![0u8; overhead(range.extent())];
        let mut b = TestBuddy::init(&mut storage, range, true);

        assert!(b.alloc(4096).is_some());
        assert!(b.alloc(4096).is_none());
    }

    proptest::proptest! {
        /// Every block a sequence of allocations hands out stays inside the
        /// base range, lands aligned to its own (rounded-up) size, and never
        /// overlaps any other live block — the disjointness and containment
        /// properties spec.md section 8 calls for.
        #[test]
        fn allocations_are_disjoint_and_contained(
            sizes in proptest::collection::vec(1u64..=65536, 0..32),
        ) {
            let range = Range::from_raw(0, 4 * 1024 * 1024);
            let mut storage = vec![0u8; overhead(range.extent())];
            let mut b = TestBuddy::init(&mut storage, range, true);

            let mut live: Vec<(u64, u64)> = Vec::new();
            for size in sizes {
                let Some(addr) = b.alloc(size) else { continue };
                let rounded = 1u64 << log2_roundup(size);

                assert!(range.contains_addr(addr));
                assert!(addr.is_aligned_to(rounded));

                for &(other_addr, other_sz) in &live {
                    let a_end = addr.as_raw() + rounded;
                    let b_end = other_addr + other_sz;
                    assert!(
                        addr.as_raw() >= b_end || a_end <= other_addr,
                        "overlap: [{:#x}, {:#x}) vs [{:#x}, {:#x})",
                        addr.as_raw(), a_end, other_addr, b_end,
                    );
                }
                live.push((addr.as_raw(), rounded));
            }
        }

        /// Freeing every block handed out restores the full range to a
        /// single allocatable whole, whatever order the frees happen in
        /// (monotonicity: capacity lost to fragmentation is always
        /// recoverable once every block is returned).
        #[test]
        fn free_in_any_order_restores_full_capacity(
            seed in 0u64..1000,
        ) {
            let range = Range::from_raw(0, 1024 * 1024);
            let mut storage = vec![0u8; overhead(range.extent())];
            let mut b = TestBuddy::init(&mut storage, range, true);

            let sizes = [4096u64, 4096, 8192, 16384, 32768];
            let mut blocks: Vec<(Address<PhysAddressType>, u64)> = sizes
                .iter()
                .map(|&sz| (b.alloc(sz).unwrap(), sz))
                .collect();

            // Deterministic pseudo-shuffle so every `seed` exercises a
            // different free order without pulling in a `rand` dependency.
            let n = blocks.len();
            for i in 0..n {
                let j = ((seed + i as u64) % (n - i) as u64) as usize + i;
                blocks.swap(i, j);
            }

            for (addr, sz) in blocks {
                b.free(addr, sz);
            }

            let whole = b.alloc(1024 * 1024);
            assert_eq!(whole, Some(range.start()));
        }
    }
}
