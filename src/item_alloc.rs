//! Per-thread item pool with probabilistic reuse.
//!
//! Items are recycled rather than freed: [`ItemAllocator::acquire`] scans
//! forward over a ring of item slots and returns the first whose version is
//! even (no live element, and any outstanding peek token will fail its
//! claim CAS). When a full lap finds nothing reusable, a fresh backing
//! chunk is allocated and the ring grows.
//!
//! Chunks are never deallocated while the allocator lives. This is what
//! makes the raw item pointers stored in blocks and published snapshots
//! valid for the queue's whole lifetime, including pointers held by other
//! threads.

use std::ptr::NonNull;

use crate::item::Item;

/// Backing chunk size for the small pool configuration.
pub const CHUNK_SIZE_SMALL: usize = 512;

/// Backing chunk size for the large pool configuration.
pub const CHUNK_SIZE_LARGE: usize = 8192;

/// A growable ring of reusable [`Item`] slots owned by one thread.
pub struct ItemAllocator<V> {
    chunks: Vec<Box<[Item<V>]>>,
    chunk_size: usize,
    /// Scan cursor over the flattened ring.
    cursor: usize,
}

impl<V: Copy> ItemAllocator<V> {
    #[must_use]
    pub fn new(chunk_size: usize) -> Self {
        assert!(chunk_size > 0);
        Self {
            chunks: Vec::new(),
            chunk_size,
            cursor: 0,
        }
    }

    /// Total number of item slots currently backing the ring.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.chunks.len() * self.chunk_size
    }

    /// Return a free item slot, growing the ring if a full lap finds none.
    ///
    /// The returned item has an even version; the caller must
    /// [`Item::initialize`] it before publishing a reference anywhere.
    pub fn acquire(&mut self) -> NonNull<Item<V>> {
        let total: usize = self.capacity();

        let mut scanned: usize = 0;
        while scanned < total {
            let slot: usize = self.cursor;
            self.cursor = (self.cursor + 1) % total;
            scanned += 1;

            let item: &Item<V> = &self.chunks[slot / self.chunk_size][slot % self.chunk_size];
            if item.is_reusable() {
                return NonNull::from(item);
            }
        }

        // Every slot is still referenced by a live element; grow.
        self.grow()
    }

    fn grow(&mut self) -> NonNull<Item<V>> {
        let chunk: Box<[Item<V>]> = (0..self.chunk_size).map(|_| Item::new()).collect();
        self.chunks.push(chunk);

        let first: &Item<V> = &self.chunks.last().expect("chunk just pushed")[0];
        // Resume scanning after the slot we are about to hand out.
        let handed_out: usize = (self.chunks.len() - 1) * self.chunk_size;
        self.cursor = (handed_out + 1) % self.capacity();
        NonNull::from(first)
    }
}
