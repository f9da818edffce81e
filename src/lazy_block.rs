//! Lazy k-way block merging.
//!
//! The shared LSM coalesces runs of equal-capacity blocks when it builds a
//! successor snapshot. Rather than merging pairwise, sources are merely
//! collected ([`LazyMerge::merge`]) and physically combined once, in
//! [`LazyMerge::finalize`], with a min-heap keyed on each source's
//! currently-lowest owned key.
//!
//! Unowned slots are skipped as cursors advance, so the merged block is
//! also a compaction. Ties between equal keys are broken by source order,
//! keeping the merge stable.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;

use crate::block::Block;
use crate::item::{Item, Key};

/// The head of one source block: its lowest not-yet-consumed owned slot.
struct Head<V> {
    key: Key,
    source: usize,
    ix: usize,
    item: *mut Item<V>,
    version: u64,
}

impl<V> PartialEq for Head<V> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.source == other.source
    }
}
impl<V> Eq for Head<V> {}

impl<V> Ord for Head<V> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed so the max-heap pops the smallest (key, source) first.
        (other.key, other.source).cmp(&(self.key, self.source))
    }
}
impl<V> PartialOrd for Head<V> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// Accumulates equal-capacity source blocks for a single physical merge.
pub struct LazyMerge<'a, V> {
    power: u32,
    sources: Vec<&'a Block<V>>,
}

impl<'a, V: Copy> LazyMerge<'a, V> {
    #[must_use]
    pub fn new(block: &'a Block<V>) -> Self {
        Self {
            power: block.power(),
            sources: vec![block],
        }
    }

    /// Add a source block. The target capacity doubles per addition, so a
    /// run of `n` equal-power-`p` sources finalizes into a block of power
    /// `p + ceil(log2(n))`.
    pub fn merge(&mut self, block: &'a Block<V>) {
        self.power = self.power.max(block.power()) + 1;
        self.sources.push(block);
    }

    #[must_use]
    pub fn power(&self) -> u32 {
        self.power
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        1usize << self.power
    }

    fn next_head(block: &Block<V>, from: usize, source: usize) -> Option<Head<V>> {
        let last: usize = block.last();
        let mut ix: usize = from;
        while ix < last {
            let pair = block.load_slot(ix);
            if !pair.0.is_null() && Block::slot_owned(pair) {
                // SAFETY: items outlive every block referencing them.
                let key: Key = unsafe { (*pair.0).key() };
                return Some(Head {
                    key,
                    source,
                    ix,
                    item: pair.0,
                    version: pair.1,
                });
            }
            ix += 1;
        }
        None
    }

    /// Perform the multi-way merge into a freshly allocated block.
    #[must_use]
    pub fn finalize(self) -> Block<V> {
        let target: Block<V> = Block::new(self.power);

        let mut heap: BinaryHeap<Head<V>> = BinaryHeap::with_capacity(self.sources.len());
        for (source, block) in self.sources.iter().enumerate() {
            if let Some(head) = Self::next_head(block, block.first(), source) {
                heap.push(head);
            }
        }

        while let Some(head) = heap.pop() {
            target.push_pair(head.item, head.version);
            if let Some(next) = Self::next_head(self.sources[head.source], head.ix + 1, head.source)
            {
                heap.push(next);
            }
        }

        target
    }
}
