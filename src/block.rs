//! Sorted blocks of claimable item slots.
//!
//! A [`Block`] stores `(item, expected_version)` pairs in key order, with a
//! capacity that is always a power of two. An item is *owned* by the block
//! if its current version still equals the stored expected version;
//! otherwise it has been claimed by some thread (and possibly reused) and
//! the slot is dead weight that readers skip.
//!
//! Ownership discipline: the owning thread is the only mutator. Foreign
//! threads (spies, shared-snapshot readers) only read slot pairs that were
//! written once before the block became visible to them, plus the `last`
//! watermark published with Release ordering by tail inserts. A foreign
//! reader may observe a stale `first`; that is safe because the order
//! invariant and the per-item version check both still hold.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize};

use crate::item::{Item, Key, Stamp};
use crate::ordering::{READ_ORD, RELAXED, WRITE_ORD};

/// Snapshot of one observed element: enough to attempt a single claim.
///
/// A token does not pin anything; the referenced item may be claimed or
/// recycled at any moment, in which case [`PeekToken::take`] fails.
pub struct PeekToken<V> {
    key: Key,
    item: *const Item<V>,
    /// The slot index within the block the token was minted from.
    index: usize,
    expected_version: u64,
}

impl<V> Clone for PeekToken<V> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<V> Copy for PeekToken<V> {}

// SAFETY: a token is a read-only view plus a claim capability on an `Item`,
// which is itself Sync; the raw pointer only avoids a lifetime parameter.
unsafe impl<V: Copy + Send> Send for PeekToken<V> {}
unsafe impl<V: Copy + Send> Sync for PeekToken<V> {}

impl<V: Copy> PeekToken<V> {
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            key: 0,
            item: std::ptr::null(),
            index: 0,
            expected_version: 0,
        }
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.item.is_null()
    }

    #[inline]
    #[must_use]
    pub fn key(&self) -> Key {
        self.key
    }

    #[inline]
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    #[must_use]
    pub fn expected_version(&self) -> u64 {
        self.expected_version
    }

    /// Token for an item that is not (yet) part of any block, used for the
    /// insert-path cached minimum.
    pub(crate) fn for_item(key: Key, item: *const Item<V>, expected_version: u64) -> Self {
        Self {
            key,
            item,
            index: 0,
            expected_version,
        }
    }

    /// Whether the element has been claimed since the token was minted.
    #[must_use]
    pub fn taken(&self) -> bool {
        debug_assert!(!self.is_empty());
        // SAFETY: tokens are only minted from blocks of a live queue, and
        // items are never deallocated while their queue lives.
        let item: &Item<V> = unsafe { &*self.item };
        item.version() != self.expected_version
    }

    /// Attempt the single claim on the referenced element.
    #[must_use]
    pub fn take(&self) -> Option<(V, Stamp)> {
        debug_assert!(!self.is_empty());
        // SAFETY: see `taken()`.
        let item: &Item<V> = unsafe { &*self.item };
        item.take(self.expected_version)
    }
}

struct Slot<V> {
    item: AtomicPtr<Item<V>>,
    version: AtomicU64,
}

impl<V> Slot<V> {
    fn new() -> Self {
        Self {
            item: AtomicPtr::new(std::ptr::null_mut()),
            version: AtomicU64::new(0),
        }
    }
}

/// A power-of-two-capacity sorted array of `(item, expected_version)` pairs.
pub struct Block<V> {
    /// Capacity stored as a power of two.
    power: u32,
    capacity: usize,

    /// Lowest known filled index. Advanced only by the owner, in `peek()`,
    /// past slots observed unowned.
    first: AtomicUsize,

    /// One past the highest filled index. Counts elements written by the
    /// owner, even if they have since been claimed by other threads, so
    /// `size()` is an upper bound on the live count.
    last: AtomicUsize,

    /// Whether the block is checked out of its pool.
    used: AtomicBool,

    slots: Box<[Slot<V>]>,
}

impl<V: Copy> Block<V> {
    #[must_use]
    pub fn new(power: u32) -> Self {
        let capacity: usize = 1usize << power;
        Self {
            power,
            capacity,
            first: AtomicUsize::new(0),
            last: AtomicUsize::new(0),
            used: AtomicBool::new(false),
            slots: (0..capacity).map(|_| Slot::new()).collect(),
        }
    }

    #[inline]
    #[must_use]
    pub fn power(&self) -> u32 {
        self.power
    }

    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    #[must_use]
    pub fn first(&self) -> usize {
        self.first.load(RELAXED)
    }

    #[inline]
    #[must_use]
    pub fn last(&self) -> usize {
        self.last.load(READ_ORD)
    }

    /// Upper bound on the number of live elements.
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.last().saturating_sub(self.first())
    }

    #[must_use]
    pub fn used(&self) -> bool {
        self.used.load(RELAXED)
    }

    pub fn set_used(&self) {
        self.used.store(true, RELAXED);
    }

    pub fn set_unused(&self) {
        self.used.store(false, RELAXED);
    }

    /// Reset the watermarks for reuse out of a pool. Stale slot contents
    /// are left in place; they are unreachable below the new `last` until
    /// overwritten.
    pub fn clear(&self) {
        self.first.store(0, RELAXED);
        self.last.store(0, RELAXED);
    }

    fn write_slot(&self, ix: usize, item: *mut Item<V>, version: u64) {
        debug_assert!(ix < self.capacity);
        let slot: &Slot<V> = &self.slots[ix];
        slot.item.store(item, RELAXED);
        slot.version.store(version, RELAXED);
    }

    pub(crate) fn load_slot(&self, ix: usize) -> (*mut Item<V>, u64) {
        debug_assert!(ix < self.capacity);
        let slot: &Slot<V> = &self.slots[ix];
        (slot.item.load(READ_ORD), slot.version.load(READ_ORD))
    }

    /// Append a verbatim pair at `last`. Used by the lazy merger while the
    /// block is still private to the building thread.
    pub(crate) fn push_pair(&self, item: *mut Item<V>, version: u64) {
        let last: usize = self.last.load(RELAXED);
        self.write_slot(last, item, version);
        self.last.store(last + 1, RELAXED);
    }

    pub(crate) fn slot_owned(pair: (*mut Item<V>, u64)) -> bool {
        let (item, version) = pair;
        debug_assert!(!item.is_null());
        // SAFETY: slots below `last` always reference pool items, which
        // outlive every block referencing them.
        unsafe { (*item).version() == version }
    }

    fn token_at(&self, ix: usize, pair: (*mut Item<V>, u64)) -> PeekToken<V> {
        let (item, version) = pair;
        // SAFETY: see `slot_owned()`.
        let key: Key = unsafe { (*item).key() };
        PeekToken {
            key,
            item,
            index: ix,
            expected_version: version,
        }
    }

    /// Place the first element into a fresh, empty block.
    ///
    /// Owner only.
    pub fn insert(&self, item: NonNull<Item<V>>, version: u64) {
        debug_assert_eq!(self.last.load(RELAXED), 0, "insert() on non-empty block");
        self.write_slot(0, item.as_ptr(), version);
        self.first.store(0, RELAXED);
        self.last.store(1, WRITE_ORD);
    }

    /// Append at `last`. The caller must have verified there is room and
    /// that the key does not run below the current tail key.
    ///
    /// Owner only. The Release store of `last` publishes the slot pair to
    /// foreign readers.
    pub fn insert_tail(&self, item: NonNull<Item<V>>, version: u64) {
        let last: usize = self.last.load(RELAXED);
        debug_assert!(last < self.capacity, "insert_tail() on full block");

        self.write_slot(last, item.as_ptr(), version);
        self.last.store(last + 1, WRITE_ORD);
    }

    /// Two-way merge of the owned slots of `lhs` and `rhs` into this block,
    /// which must be fresh and large enough. Unowned slots are skipped; on
    /// equal keys `lhs` wins, keeping the merge stable in source order.
    ///
    /// Owner only; `self` must not be visible to foreign readers yet.
    pub fn merge(&self, lhs: &Block<V>, rhs: &Block<V>) {
        debug_assert_eq!(self.last.load(RELAXED), 0, "merge() into non-empty block");

        let mut dst: usize = 0;
        let mut l: usize = lhs.first();
        let mut r: usize = rhs.first();
        let l_last: usize = lhs.last();
        let r_last: usize = rhs.last();

        while l < l_last || r < r_last {
            let l_pair = (l < l_last).then(|| lhs.load_slot(l));
            let l_live = match l_pair {
                Some(pair) if Self::slot_owned(pair) => Some(pair),
                Some(_) => {
                    l += 1;
                    continue;
                }
                None => None,
            };
            let r_pair = (r < r_last).then(|| rhs.load_slot(r));
            let r_live = match r_pair {
                Some(pair) if Self::slot_owned(pair) => Some(pair),
                Some(_) => {
                    r += 1;
                    continue;
                }
                None => None,
            };

            let take_left: bool = match (l_live, r_live) {
                (Some(lp), Some(rp)) => {
                    // SAFETY: see `slot_owned()`.
                    unsafe { (*lp.0).key() <= (*rp.0).key() }
                }
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (None, None) => break,
            };

            let (item, version) = if take_left {
                l += 1;
                l_live.expect("left cursor is live")
            } else {
                r += 1;
                r_live.expect("right cursor is live")
            };

            debug_assert!(dst < self.capacity, "merge overflows target block");
            self.write_slot(dst, item, version);
            dst += 1;
        }

        self.first.store(0, RELAXED);
        self.last.store(dst, WRITE_ORD);
    }

    /// Copy-compact: copy only the owned slots of `src`, in order.
    ///
    /// `src` may belong to another thread (spying); pairs are copied
    /// verbatim so the stolen elements still claim through their original
    /// version protocol.
    pub fn copy(&self, src: &Block<V>) {
        debug_assert_eq!(self.last.load(RELAXED), 0, "copy() into non-empty block");

        let mut dst: usize = 0;
        let last: usize = src.last().min(src.capacity);
        for ix in src.first().min(last)..last {
            let pair = src.load_slot(ix);
            if pair.0.is_null() || !Self::slot_owned(pair) {
                continue;
            }
            if dst == self.capacity {
                // A concurrently growing source can exceed our capacity;
                // the surplus stays with the victim.
                break;
            }
            self.write_slot(dst, pair.0, pair.1);
            dst += 1;
        }

        self.first.store(0, RELAXED);
        self.last.store(dst, WRITE_ORD);
    }

    /// Locate the lowest still-owned slot, advancing `first` past dead
    /// slots along the way.
    ///
    /// Owner only (mutates `first`).
    #[must_use]
    pub fn peek(&self) -> PeekToken<V> {
        let last: usize = self.last();
        let mut ix: usize = self.first.load(RELAXED);

        while ix < last {
            let pair = self.load_slot(ix);
            if Self::slot_owned(pair) {
                return self.token_at(ix, pair);
            }
            ix += 1;
            self.first.store(ix, RELAXED);
        }

        PeekToken::empty()
    }

    /// The key of the highest live slot, scanning back from `last`.
    #[must_use]
    pub fn peek_tail(&self) -> Option<Key> {
        let first: usize = self.first();
        let last: usize = self.last();

        for ix in (first..last).rev() {
            let pair = self.load_slot(ix);
            if Self::slot_owned(pair) {
                // SAFETY: see `slot_owned()`.
                return Some(unsafe { (*pair.0).key() });
            }
        }
        None
    }

    /// Token for the slot at absolute offset `n`, without touching `first`.
    /// The returned token may already be taken; callers check.
    #[must_use]
    pub fn peek_nth(&self, n: usize) -> PeekToken<V> {
        if n >= self.last() {
            return PeekToken::empty();
        }
        let pair = self.load_slot(n);
        if pair.0.is_null() {
            return PeekToken::empty();
        }
        self.token_at(n, pair)
    }

    /// Lazy iterator over the currently live slots. Safe for foreign
    /// threads; used by spying.
    #[must_use]
    pub fn iter(&self) -> SpyIterator<'_, V> {
        SpyIterator {
            block: self,
            next: self.first(),
            last: self.last(),
        }
    }
}

// SAFETY: all shared fields are atomics; slot pairs follow the write-once
// publication discipline described in the module docs.
unsafe impl<V: Copy + Send> Send for Block<V> {}
unsafe impl<V: Copy + Send> Sync for Block<V> {}

/// Non-restartable iterator yielding tokens for live slots.
pub struct SpyIterator<'a, V> {
    block: &'a Block<V>,
    next: usize,
    last: usize,
}

impl<V: Copy> Iterator for SpyIterator<'_, V> {
    type Item = PeekToken<V>;

    fn next(&mut self) -> Option<PeekToken<V>> {
        while self.next < self.last {
            let ix: usize = self.next;
            self.next += 1;

            let pair = self.block.load_slot(ix);
            if !pair.0.is_null() && Block::slot_owned(pair) {
                return Some(self.block.token_at(ix, pair));
            }
        }
        None
    }
}
