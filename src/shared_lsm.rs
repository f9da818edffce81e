//! The shared LSM: one atomic pointer to the current block-array snapshot.
//!
//! Publication is a CAS loop: load the current snapshot, build its
//! successor (see [`BlockArray::with_inserted`]), swap the pointer. Readers
//! never see a snapshot mid-mutation because snapshots are immutable.
//!
//! # Reclamation
//!
//! A replaced snapshot may still be dereferenced by concurrent peeks, so it
//! cannot be freed at the swap. Every reader publishes the pointer it is
//! about to dereference in its thread's reclamation slot (a `seize` guard);
//! a retired snapshot is only physically freed once no slot can still
//! reference it.

use std::sync::atomic::AtomicPtr;

use rand::Rng;
use seize::{Collector, Guard};

use crate::block::{Block, PeekToken};
use crate::block_array::BlockArray;
use crate::item::Stamp;
use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, READ_ORD};
use crate::tracing_helpers::{debug_log, trace_log};

/// How many peek-and-claim rounds `delete_min` attempts before reporting
/// failure. Transient contention is recovered locally; exhaustion is a
/// `None`, never a block.
pub const DELETE_MIN_RETRIES: usize = 8;

/// Atomically swapped pointer to the current published snapshot.
pub struct SharedLsm<V> {
    current: AtomicPtr<BlockArray<V>>,
    collector: Collector,
    rlx: usize,
}

impl<V: Copy> SharedLsm<V> {
    #[must_use]
    pub fn new(rlx: usize) -> Self {
        let empty: *mut BlockArray<V> = Box::into_raw(Box::new(BlockArray::new()));
        Self {
            current: AtomicPtr::new(empty),
            collector: Collector::new(),
            rlx,
        }
    }

    #[must_use]
    pub fn relaxation(&self) -> usize {
        self.rlx
    }

    /// Publish a block. The block's live elements are copied into
    /// snapshot-owned storage; the caller may recycle `block` immediately
    /// after this returns.
    pub fn insert(&self, block: &Block<V>) {
        let guard = self.collector.enter();
        loop {
            let old: *mut BlockArray<V> = guard.protect(&self.current, READ_ORD);
            // SAFETY: `old` is protected by the guard and cannot be freed
            // until the guard drops.
            let next: BlockArray<V> = unsafe { &*old }.with_inserted(block);
            let next_ptr: *mut BlockArray<V> = Box::into_raw(Box::new(next));

            match self
                .current
                .compare_exchange(old, next_ptr, CAS_SUCCESS, CAS_FAILURE)
            {
                Ok(_) => {
                    trace_log!(size = block.size(), "published block to shared lsm");
                    // SAFETY: `old` is unlinked; no new reader can reach it.
                    unsafe { self.collector.retire(old, seize::reclaim::boxed) };
                    return;
                }
                Err(_) => {
                    debug_log!("snapshot swap lost, rebuilding");
                    // SAFETY: `next_ptr` was never published.
                    drop(unsafe { Box::from_raw(next_ptr) });
                }
            }
        }
    }

    /// Observe the current snapshot and return one token chosen uniformly
    /// among the lowest `rlx` live candidates, or an empty token.
    #[must_use]
    pub fn peek<R: Rng>(&self, rng: &mut R) -> PeekToken<V> {
        let guard = self.collector.enter();
        let current: *mut BlockArray<V> = guard.protect(&self.current, READ_ORD);
        // SAFETY: protected by the guard.
        let array: &BlockArray<V> = unsafe { &*current };

        let candidates: Vec<PeekToken<V>> = array.peek_candidates(self.rlx);
        if candidates.is_empty() {
            return PeekToken::empty();
        }
        candidates[rng.gen_range(0..candidates.len())]
    }

    /// Peek then claim, retrying a bounded number of times on CAS misses.
    #[must_use]
    pub fn delete_min<R: Rng>(&self, rng: &mut R) -> Option<(V, Stamp)> {
        for _ in 0..DELETE_MIN_RETRIES {
            let token: PeekToken<V> = self.peek(rng);
            if token.is_empty() {
                return None;
            }
            if let Some(claimed) = token.take() {
                return Some(claimed);
            }
            // Claim lost to another thread; re-observe and try again.
        }
        None
    }

    /// Number of blocks in the current snapshot.
    #[must_use]
    pub fn snapshot_len(&self) -> usize {
        let guard = self.collector.enter();
        let current: *mut BlockArray<V> = guard.protect(&self.current, READ_ORD);
        // SAFETY: protected by the guard.
        unsafe { &*current }.len()
    }

    /// Upper bound on the number of live published elements.
    #[must_use]
    pub fn size(&self) -> usize {
        let guard = self.collector.enter();
        let current: *mut BlockArray<V> = guard.protect(&self.current, READ_ORD);
        // SAFETY: protected by the guard.
        unsafe { &*current }.size()
    }
}

impl<V> Drop for SharedLsm<V> {
    fn drop(&mut self) {
        let current: *mut BlockArray<V> = *self.current.get_mut();
        // SAFETY: exclusive access; retired snapshots are freed by the
        // collector's own drop.
        drop(unsafe { Box::from_raw(current) });
    }
}
