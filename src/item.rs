//! Item storage and the version claim protocol.
//!
//! An [`Item`] is a `(key, value)` cell guarded by a 64-bit version counter.
//! The version's parity encodes the item's state: **odd = live, even = free**.
//! Blocks reference items together with the version they expect; a reader
//! holding such a pair claims the element with a single CAS that advances
//! the version from the expected odd value to the next even value.
//!
//! # Concurrency Model
//!
//! 1. Owner: `initialize()` writes key/value/stamp, then advances the
//!    version to a fresh odd value with a Release store.
//! 2. Any thread: `take()` validates the expected version, copies the
//!    payload out, then attempts the claim CAS. On CAS failure the copied
//!    payload is discarded.
//!
//! The counter is 64 bits wide and monotonically increasing, so a stale
//! expected version can never be observed again within the lifetime of any
//! peek token.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, READ_ORD, RELAXED, WRITE_ORD};

/// Priority key. Smaller keys have higher priority.
pub type Key = u64;

/// Identity of an insertion: which thread inserted the element, and the
/// running element count on that thread at the time.
///
/// Stamps travel with the element through claims so that the quality
/// evaluator can match a deletion back to its insertion record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Stamp {
    pub thread_id: u32,
    pub element_id: u32,
}

impl Stamp {
    pub const fn new(thread_id: u32, element_id: u32) -> Self {
        Self {
            thread_id,
            element_id,
        }
    }
}

#[derive(Clone, Copy)]
struct Payload<V> {
    value: V,
    stamp: Stamp,
}

/// A single-claim storage cell.
///
/// Items live in per-thread reuse pools ([`crate::item_alloc::ItemAllocator`])
/// and are never deallocated while the queue lives, so raw item pointers
/// held by blocks and snapshots stay valid until the whole queue drops.
pub struct Item<V> {
    /// Odd = live, even = free. Monotonically increasing.
    version: AtomicU64,
    key: AtomicU64,
    payload: UnsafeCell<MaybeUninit<Payload<V>>>,
}

// SAFETY: the payload cell is written only while the version is even (free),
// and no claim can succeed against a free item. Racy payload reads in
// `take()` are discarded unless the claim CAS confirms the version was
// unchanged, seqlock-style. `V: Copy` keeps the discarded copy trivial.
unsafe impl<V: Copy + Send> Send for Item<V> {}
unsafe impl<V: Copy + Send> Sync for Item<V> {}

impl<V: Copy> Item<V> {
    pub fn new() -> Self {
        Self {
            version: AtomicU64::new(0),
            key: AtomicU64::new(0),
            payload: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Assign a key/value pair and advance the version to a fresh odd value.
    ///
    /// Must only be called by the owning thread on a free (even-version)
    /// item. The Release store publishes key and payload to any thread that
    /// subsequently acquires the version.
    pub fn initialize(&self, key: Key, value: V, stamp: Stamp) {
        let version: u64 = self.version.load(RELAXED);
        debug_assert!(version & 1 == 0, "initialize() called on a live item");

        // SAFETY: the item is free, so no concurrent claim can succeed and
        // the owner is the only writer.
        unsafe {
            (*self.payload.get()).write(Payload { value, stamp });
        }
        self.key.store(key, RELAXED);
        self.version.store(version + 1, WRITE_ORD);
    }

    #[inline]
    #[must_use]
    pub fn key(&self) -> Key {
        self.key.load(READ_ORD)
    }

    #[inline]
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version.load(READ_ORD)
    }

    /// Whether the allocator may hand this item out again.
    ///
    /// A free item has an even version; any token minted for a previous
    /// incarnation holds an older (odd) version and will fail its CAS.
    #[inline]
    #[must_use]
    pub fn is_reusable(&self) -> bool {
        self.version.load(RELAXED) & 1 == 0
    }

    /// Attempt the single claim.
    ///
    /// Returns the value and stamp if the CAS from `expected` to
    /// `expected + 1` succeeds. A failure means another thread already
    /// claimed the element (or the owner recycled the slot), and the
    /// element must be treated as gone.
    pub fn take(&self, expected: u64) -> Option<(V, Stamp)> {
        debug_assert!(expected & 1 == 1, "expected version must be live (odd)");

        if self.version.load(READ_ORD) != expected {
            return None;
        }

        // SAFETY: a racy read; the payload could be concurrently rewritten
        // if the item was claimed and reused since the load above. The copy
        // is returned only if the CAS below confirms the version never
        // moved, in which case the payload read is the one `initialize()`
        // published before the Release store of `expected`. The Release
        // half of the CAS keeps the read from sinking below it.
        let payload: Payload<V> = unsafe { (*self.payload.get()).assume_init() };

        match self
            .version
            .compare_exchange(expected, expected + 1, CAS_SUCCESS, CAS_FAILURE)
        {
            Ok(_) => Some((payload.value, payload.stamp)),
            Err(_) => None,
        }
    }
}

impl<V: Copy> Default for Item<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> std::fmt::Debug for Item<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Item")
            .field("key", &self.key.load(Ordering::Relaxed))
            .field("version", &self.version.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
