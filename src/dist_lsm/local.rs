//! Per-thread state of the distributed LSM.
//!
//! A [`DistLsmLocal`] is single-writer: only the thread registered on the
//! slot mutates it. Two kinds of state coexist:
//!
//! - The block list (`blocks`, `size`): atomics, because *spying* peers
//!   read them concurrently. The owner publishes with Release stores;
//!   spies load with Acquire and tolerate any staleness - every element
//!   they copy still has to win its claim CAS.
//! - Everything else (`OwnerState`): pools, the cached best token, the
//!   RNG, quality logs. Behind an `UnsafeCell`, touched exclusively by the
//!   owner thread.
//!
//! # Safety
//!
//! All `&self` methods that reach into `OwnerState` must only be called
//! from the owning thread. The queue facade guarantees this by routing
//! every operation through the calling thread's own registry slot.

use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::block::{Block, PeekToken};
use crate::block_pool::BlockPool;
use crate::item::{Item, Key, Stamp};
use crate::item_alloc::ItemAllocator;
use crate::ordering::{READ_ORD, RELAXED, WRITE_ORD};
use crate::quality::{DeletionRecord, InsertionRecord, ThreadLog};
use crate::shared_lsm::SharedLsm;
use crate::tracing_helpers::trace_log;

use super::{DistLsm, LocalConfig};

/// Capacity of the per-thread block list. The merge discipline keeps the
/// list to one block per power of two; the headroom beyond that absorbs
/// spied blocks until the next peek folds them in.
pub const MAX_LOCAL_BLOCKS: usize = 64;

/// Owner-private state; see the module docs for the access discipline.
struct OwnerState<V> {
    items: ItemAllocator<V>,
    pool: BlockPool<V>,
    cached_best: PeekToken<V>,
    rng: SmallRng,
    thread_id: u32,
    next_element_id: u32,
    rlx: usize,
    logging: bool,
    max_spy_blocks: usize,
    insertions: Vec<InsertionRecord>,
    deletions: Vec<DeletionRecord>,
}

/// One thread's pile of sorted blocks, in strictly decreasing capacity
/// order (largest first), plus its allocation pools.
pub struct DistLsmLocal<V> {
    blocks: [AtomicPtr<Block<V>>; MAX_LOCAL_BLOCKS],
    size: AtomicUsize,
    registered: AtomicBool,
    owner: UnsafeCell<OwnerState<V>>,
}

// SAFETY: the shared fields are atomics with the publication discipline
// described above; `OwnerState` is only accessed by the registered owner
// thread (or through `&mut self`).
unsafe impl<V: Copy + Send> Send for DistLsmLocal<V> {}
unsafe impl<V: Copy + Send> Sync for DistLsmLocal<V> {}

impl<V: Copy + Send> DistLsmLocal<V> {
    pub(crate) fn new() -> Self {
        Self {
            blocks: std::array::from_fn(|_| AtomicPtr::new(std::ptr::null_mut())),
            size: AtomicUsize::new(0),
            registered: AtomicBool::new(false),
            owner: UnsafeCell::new(OwnerState {
                items: ItemAllocator::new(crate::item_alloc::CHUNK_SIZE_SMALL),
                pool: BlockPool::new(),
                cached_best: PeekToken::empty(),
                rng: SmallRng::seed_from_u64(0),
                thread_id: 0,
                next_element_id: 0,
                rlx: 0,
                logging: false,
                max_spy_blocks: 0,
                insertions: Vec::new(),
                deletions: Vec::new(),
            }),
        }
    }

    /// # Safety
    /// Caller must be the registered owner thread (or hold `&mut self`).
    #[allow(clippy::mut_from_ref)]
    unsafe fn owner_mut(&self) -> &mut OwnerState<V> {
        unsafe { &mut *self.owner.get() }
    }

    pub(crate) fn init(&self, thread_id: u32, config: &LocalConfig) {
        // SAFETY: called by the thread registering this slot, before any
        // other access from it.
        let owner: &mut OwnerState<V> = unsafe { self.owner_mut() };
        owner.thread_id = thread_id;
        owner.rlx = config.rlx;
        owner.logging = config.logging;
        owner.max_spy_blocks = config.max_spy_blocks;
        if owner.items.capacity() == 0 {
            owner.items = ItemAllocator::new(config.item_chunk);
        }
        owner.rng = SmallRng::from_entropy();
        self.registered.store(true, WRITE_ORD);
    }

    pub(crate) fn is_registered(&self) -> bool {
        self.registered.load(READ_ORD)
    }

    pub(crate) fn list_size(&self) -> usize {
        self.size.load(READ_ORD)
    }

    pub(crate) fn list_block(&self, ix: usize) -> *mut Block<V> {
        self.blocks[ix].load(READ_ORD)
    }

    /// Insert a new element. Fast path appends to the tail block; otherwise
    /// a fresh size-1 block is allocated and cascaded through
    /// `merge_insert`.
    ///
    /// Owner thread only.
    pub(crate) fn insert(
        &self,
        key: Key,
        value: V,
        slsm: Option<&SharedLsm<V>>,
        ticks: &AtomicU64,
    ) {
        // SAFETY: owner thread per the module contract.
        let owner: &mut OwnerState<V> = unsafe { self.owner_mut() };

        let stamp: Stamp = Stamp::new(owner.thread_id, owner.next_element_id);
        owner.next_element_id = owner.next_element_id.wrapping_add(1);

        let item_ptr: NonNull<Item<V>> = owner.items.acquire();
        // SAFETY: pool items live as long as this local.
        let item: &Item<V> = unsafe { item_ptr.as_ref() };
        item.initialize(key, value, stamp);
        let version: u64 = item.version();

        if owner.logging {
            owner.insertions.push(InsertionRecord {
                key,
                thread_id: stamp.thread_id,
                element_id: stamp.element_id,
                tick: ticks.fetch_add(1, RELAXED),
            });
        }

        // Keep the cached minimum coherent with the insert.
        if owner.cached_best.is_empty() || key < owner.cached_best.key() {
            owner.cached_best = PeekToken::for_item(key, item_ptr.as_ptr(), version);
        } else if owner.cached_best.taken() {
            owner.cached_best = PeekToken::empty();
        }

        // Fast path: append to the tail block when order permits.
        let size: usize = self.size.load(RELAXED);
        if size > 0 {
            // SAFETY: list entries below `size` are valid pool blocks.
            let tail: &Block<V> = unsafe { &*self.blocks[size - 1].load(RELAXED) };
            if tail.last() < tail.capacity() {
                if let Some(tail_key) = tail.peek_tail() {
                    if tail_key <= key {
                        tail.insert_tail(item_ptr, version);
                        return;
                    }
                }
            }
        }

        let new_block: NonNull<Block<V>> = owner.pool.get_block(0);
        // SAFETY: fresh pool block.
        unsafe { new_block.as_ref() }.insert(item_ptr, version);
        self.merge_insert(owner, new_block, slsm);
    }

    /// Cascade-merge `new_block` with same-capacity predecessors. When the
    /// merged block reaches `(rlx + 1) / 2` elements and a shared LSM is
    /// given, the block is published there instead of installed locally.
    fn merge_insert(
        &self,
        owner: &mut OwnerState<V>,
        new_block: NonNull<Block<V>>,
        slsm: Option<&SharedLsm<V>>,
    ) {
        let old_size: usize = self.size.load(RELAXED);
        let mut other_ix: isize = old_size as isize - 1;

        let mut insert_ptr: NonNull<Block<V>> = new_block;
        let mut delete_block: Option<NonNull<Block<V>>> = None;

        loop {
            // SAFETY: pool blocks are valid for the local's lifetime.
            let insert_block: &Block<V> = unsafe { insert_ptr.as_ref() };
            if other_ix < 0 {
                break;
            }
            let other_ptr: *mut Block<V> = self.blocks[other_ix as usize].load(RELAXED);
            // SAFETY: list entries below `size` are valid pool blocks.
            let other: &Block<V> = unsafe { &*other_ptr };
            if insert_block.capacity() != other.capacity() {
                break;
            }

            // Merge into the same power when both candidates fit, so
            // sparse piles do not balloon into huge mostly-empty blocks.
            let merged_power: u32 =
                if insert_block.size() + other.size() <= insert_block.capacity() {
                    insert_block.power()
                } else {
                    insert_block.power() + 1
                };
            let merged_ptr: NonNull<Block<V>> = owner.pool.get_block(merged_power);
            // SAFETY: fresh pool block.
            unsafe { merged_ptr.as_ref() }.merge(insert_block, other);

            insert_block.set_unused();
            insert_ptr = merged_ptr;
            delete_block = Some(NonNull::new(other_ptr).expect("list blocks are non-null"));
            other_ix -= 1;
        }

        // SAFETY: as above.
        let insert_block: &Block<V> = unsafe { insert_ptr.as_ref() };
        let publish_threshold: usize = (owner.rlx + 1) / 2;

        match slsm {
            Some(shared) if insert_block.size() >= publish_threshold => {
                trace_log!(
                    size = insert_block.size(),
                    "publishing merged block to shared lsm"
                );
                shared.insert(insert_block);
                insert_block.set_unused();
                self.size.store((other_ix + 1) as usize, WRITE_ORD);
            }
            _ => {
                let slot: usize = (other_ix + 1) as usize;
                debug_assert!(slot < MAX_LOCAL_BLOCKS, "block list overflow");
                self.blocks[slot].store(insert_ptr.as_ptr(), WRITE_ORD);
                self.size.store(slot + 1, WRITE_ORD);
            }
        }

        if let Some(d) = delete_block {
            // SAFETY: as above.
            unsafe { d.as_ref() }.set_unused();
        }
        for ix in self.size.load(RELAXED)..old_size {
            // SAFETY: entries below `old_size` were valid list blocks.
            unsafe { &*self.blocks[ix].load(RELAXED) }.set_unused();
        }
    }

    fn remove_block_at(&self, ix: usize) {
        let size: usize = self.size.load(RELAXED);
        for j in ix..size - 1 {
            let next: *mut Block<V> = self.blocks[j + 1].load(RELAXED);
            self.blocks[j].store(next, WRITE_ORD);
        }
        self.size.store(size - 1, WRITE_ORD);
    }

    /// Find the smallest live element across the pile.
    ///
    /// Along the way, blocks that have drained below half capacity are
    /// compacted into the next lower power (and opportunistically re-merged
    /// with their neighbor), and empty blocks are dropped from the list.
    ///
    /// Owner thread only.
    fn peek(&self, owner: &mut OwnerState<V>) -> PeekToken<V> {
        if !owner.cached_best.is_empty() && !owner.cached_best.taken() {
            return owner.cached_best;
        }

        let mut best: PeekToken<V> = PeekToken::empty();

        let mut ix: usize = 0;
        'outer: while ix < self.size.load(RELAXED) {
            // SAFETY: list entries below `size` are valid pool blocks.
            let mut block: &Block<V> = unsafe { &*self.blocks[ix].load(RELAXED) };
            let mut candidate: PeekToken<V> = block.peek();

            while block.size() * 2 <= block.capacity() {
                if block.size() == 0 {
                    self.remove_block_at(ix);
                    block.set_unused();
                    continue 'outer;
                }

                // Shrink into the next lower power.
                let shrunk_ptr: NonNull<Block<V>> = owner.pool.get_block(block.power() - 1);
                // SAFETY: fresh pool block.
                let shrunk: &Block<V> = unsafe { &*shrunk_ptr.as_ptr() };
                shrunk.copy(block);
                block.set_unused();

                let mut new_ptr: NonNull<Block<V>> = shrunk_ptr;
                let mut new_block: &Block<V> = shrunk;

                // Re-merge with the neighbor if shrinking made them equal.
                let next_ix: usize = ix + 1;
                if next_ix < self.size.load(RELAXED) {
                    // SAFETY: as above.
                    let next: &Block<V> = unsafe { &*self.blocks[next_ix].load(RELAXED) };
                    if new_block.capacity() == next.capacity() {
                        let merged_ptr: NonNull<Block<V>> =
                            owner.pool.get_block(new_block.power() + 1);
                        // SAFETY: fresh pool block.
                        let merged: &Block<V> = unsafe { &*merged_ptr.as_ptr() };
                        merged.merge(new_block, next);
                        next.set_unused();
                        new_block.set_unused();
                        new_ptr = merged_ptr;
                        new_block = merged;
                        self.remove_block_at(next_ix);
                    }
                }

                self.blocks[ix].store(new_ptr.as_ptr(), WRITE_ORD);
                block = new_block;
                candidate = block.peek();
            }

            if best.is_empty() || (!candidate.is_empty() && candidate.key() < best.key()) {
                best = candidate;
            }
            ix += 1;
        }

        owner.cached_best = best;
        best
    }

    /// Remove an element.
    ///
    /// Peeks the local pile and the shared snapshot, claims whichever
    /// candidate carries the smaller key. A lost claim on the local side is
    /// a failed `delete_min` (retrying would stretch the relaxation bound);
    /// the shared side retries its peek-and-claim a bounded number of
    /// times. When both sides look empty, one spy attempt may replenish
    /// the local pile.
    ///
    /// Owner thread only.
    pub(crate) fn delete_min(
        &self,
        parent: &DistLsm<V>,
        slsm: Option<&SharedLsm<V>>,
        ticks: &AtomicU64,
    ) -> Option<V> {
        // SAFETY: owner thread per the module contract.
        let owner: &mut OwnerState<V> = unsafe { self.owner_mut() };

        let local_best: PeekToken<V> = self.peek(owner);
        let shared_best: PeekToken<V> = match slsm {
            Some(shared) => shared.peek(&mut owner.rng),
            None => PeekToken::empty(),
        };

        let prefer_shared: bool = match (local_best.is_empty(), shared_best.is_empty()) {
            (_, true) => false,
            (true, false) => true,
            (false, false) => shared_best.key() < local_best.key(),
        };

        if prefer_shared {
            if let Some((value, stamp)) = shared_best.take() {
                Self::record_deletion(owner, stamp, ticks);
                return Some(value);
            }
            // Claim lost; fall back to the shared retry loop.
            if let Some(shared) = slsm {
                if let Some((value, stamp)) = shared.delete_min(&mut owner.rng) {
                    Self::record_deletion(owner, stamp, ticks);
                    return Some(value);
                }
            }
            return None;
        }

        if !local_best.is_empty() {
            return Self::finish_take(owner, local_best, ticks);
        }

        if self.spy(owner, parent) > 0 {
            let best: PeekToken<V> = self.peek(owner);
            if !best.is_empty() {
                return Self::finish_take(owner, best, ticks);
            }
        }

        None
    }

    fn finish_take(owner: &mut OwnerState<V>, token: PeekToken<V>, ticks: &AtomicU64) -> Option<V> {
        let (value, stamp) = token.take()?;
        Self::record_deletion(owner, stamp, ticks);
        Some(value)
    }

    fn record_deletion(owner: &mut OwnerState<V>, stamp: Stamp, ticks: &AtomicU64) {
        if owner.logging {
            owner.deletions.push(DeletionRecord {
                thread_id: stamp.thread_id,
                element_id: stamp.element_id,
                tick: ticks.fetch_add(1, RELAXED),
            });
        }
    }

    /// Best-effort theft: copy-compact the blocks of one random peer into
    /// our own pile. Pairs are copied verbatim, so stolen elements still
    /// claim through their original items.
    ///
    /// Returns the number of elements copied.
    fn spy(&self, owner: &mut OwnerState<V>, parent: &DistLsm<V>) -> usize {
        let peers: usize = parent.num_registered();
        if peers < 2 || owner.max_spy_blocks == 0 {
            return 0;
        }

        let me: usize = owner.thread_id as usize;
        let mut victim: usize = owner.rng.gen_range(0..peers - 1);
        if victim >= me {
            victim += 1;
        }
        let victim_local: &DistLsmLocal<V> = parent.local_at(victim);
        if !victim_local.is_registered() {
            return 0;
        }

        let mut spied: usize = 0;
        let mut copied_blocks: usize = 0;
        let victim_size: usize = victim_local.list_size().min(MAX_LOCAL_BLOCKS);

        for vix in 0..victim_size {
            if copied_blocks >= owner.max_spy_blocks {
                break;
            }
            let my_size: usize = self.size.load(RELAXED);
            if my_size >= MAX_LOCAL_BLOCKS / 2 {
                break;
            }

            let victim_ptr: *mut Block<V> = victim_local.list_block(vix);
            if victim_ptr.is_null() {
                continue;
            }
            // SAFETY: peer pool blocks are never deallocated while the
            // queue lives; the copy tolerates concurrent mutation.
            let victim_block: &Block<V> = unsafe { &*victim_ptr };

            let copy_ptr: NonNull<Block<V>> = owner.pool.get_block(victim_block.power());
            // SAFETY: fresh pool block.
            let copy: &Block<V> = unsafe { &*copy_ptr.as_ptr() };
            copy.copy(victim_block);
            if copy.size() == 0 {
                copy.set_unused();
                continue;
            }

            spied += copy.size();
            copied_blocks += 1;
            self.blocks[my_size].store(copy_ptr.as_ptr(), WRITE_ORD);
            self.size.store(my_size + 1, WRITE_ORD);
        }

        trace_log!(spied, victim, "spied peer blocks");
        spied
    }

    /// Drain the quality logs. Takes `&mut self`, so the borrow checker
    /// guarantees no concurrent queue operation.
    pub(crate) fn take_logs(&mut self) -> ThreadLog {
        let owner: &mut OwnerState<V> = self.owner.get_mut();
        ThreadLog {
            insertions: std::mem::take(&mut owner.insertions),
            deletions: std::mem::take(&mut owner.deletions),
        }
    }
}
