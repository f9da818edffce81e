//! Per-thread block reuse pool.
//!
//! Blocks are cached in free lists indexed by their power of two.
//! [`BlockPool::get_block`] returns an unused block of the requested
//! capacity, allocating one when the list has none; [`Block::set_unused`]
//! returns a block to circulation.
//!
//! Backing allocations are never released while the pool lives: a foreign
//! thread may still be reading a block that its owner has already recycled
//! (a spy racing a merge, or a reader of a stale snapshot). Such readers
//! observe recycled slot pairs whose claim CAS can no longer succeed, so
//! keeping the memory alive is all that is required.

use std::ptr::NonNull;

use crate::block::Block;

/// Largest supported block power. Key space is 64-bit, but a single queue
/// never accumulates more than `2^MAX_POWER` elements in one thread's pile.
pub const MAX_POWER: u32 = 34;

/// Power-of-two indexed free lists of blocks owned by one thread.
pub struct BlockPool<V> {
    lists: Vec<Vec<Box<Block<V>>>>,
}

impl<V: Copy> BlockPool<V> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            lists: (0..=MAX_POWER as usize).map(|_| Vec::new()).collect(),
        }
    }

    /// Check out an unused block of capacity `2^power`, cleared and marked
    /// used.
    ///
    /// The returned pointer stays valid for the pool's lifetime; the block
    /// is handed back by calling [`Block::set_unused`] on it.
    pub fn get_block(&mut self, power: u32) -> NonNull<Block<V>> {
        assert!(power <= MAX_POWER, "block power {power} out of range");
        let list: &mut Vec<Box<Block<V>>> = &mut self.lists[power as usize];

        for block in list.iter() {
            if !block.used() {
                block.set_used();
                block.clear();
                return NonNull::from(block.as_ref());
            }
        }

        let block: Box<Block<V>> = Box::new(Block::new(power));
        block.set_used();
        list.push(block);
        NonNull::from(list.last().expect("block just pushed").as_ref())
    }

    /// Number of blocks currently backing the given power's list.
    #[must_use]
    pub fn allocated(&self, power: u32) -> usize {
        self.lists[power as usize].len()
    }
}

impl<V: Copy> Default for BlockPool<V> {
    fn default() -> Self {
        Self::new()
    }
}
