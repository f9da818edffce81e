//! Quality evaluation: rank error of the relaxed queue against a
//! sequential reference.
//!
//! When quality logging is enabled, every thread records its insertions
//! `(key, thread_id, element_id, tick)` and deletions
//! `(thread_id, element_id, tick)`. [`evaluate`] merges the per-thread
//! streams into two globally tick-ordered sequences and replays them
//! against an exact priority queue, measuring for each deletion how many
//! strictly-better elements were alive at that moment.
//!
//! The replay contract: at each step, apply all insertions whose tick is
//! at most the next deletion's tick, then all deletions whose tick is
//! below the next insertion's tick. This is what defines "rank error at
//! the time of the operation".
//!
//! # Reference representation
//!
//! Elements are renumbered densely (from 1) in `(key, tick)` order. Two
//! insert-only [`IntervalTree`]s over that numbering - one for replayed
//! insertions, one for replayed deletions - then answer the rank query:
//!
//! ```text
//! rank(x) = taken_before(inserted, x) - taken_before(deleted, x)
//! ```
//!
//! i.e. the number of live elements ordered strictly before `x`.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use thiserror::Error;

use crate::interval_tree::IntervalTree;
use crate::item::Key;

/// One logged insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertionRecord {
    pub key: Key,
    pub thread_id: u32,
    pub element_id: u32,
    pub tick: u64,
}

/// One logged successful delete, identifying the claimed element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeletionRecord {
    pub thread_id: u32,
    pub element_id: u32,
    pub tick: u64,
}

/// The two logs one thread accumulated.
#[derive(Debug, Clone, Default)]
pub struct ThreadLog {
    pub insertions: Vec<InsertionRecord>,
    pub deletions: Vec<DeletionRecord>,
}

/// Rank-error distribution of a run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankStats {
    pub mean: f64,
    pub max: u64,
    pub stddev: f64,
}

impl RankStats {
    const ZERO: Self = Self {
        mean: 0.0,
        max: 0,
        stddev: 0.0,
    };
}

/// Malformed log input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EvalError {
    #[error("two insertions share the id (thread {thread_id}, element {element_id})")]
    DuplicateElement { thread_id: u32, element_id: u32 },

    #[error("deletion references unknown element (thread {thread_id}, element {element_id})")]
    UnknownElement { thread_id: u32, element_id: u32 },

    #[error("deletion of (thread {thread_id}, element {element_id}) precedes its insertion")]
    DeletionBeforeInsertion { thread_id: u32, element_id: u32 },

    #[error("element (thread {thread_id}, element {element_id}) deleted twice")]
    DuplicateDeletion { thread_id: u32, element_id: u32 },
}

/// K-way merge of per-thread tick-sorted streams into one global stream.
fn merge_by_tick<T: Copy>(streams: &[&[T]], tick_of: impl Fn(&T) -> u64) -> Vec<T> {
    let total: usize = streams.iter().map(|s| s.len()).sum();
    let mut out: Vec<T> = Vec::with_capacity(total);

    let mut cursors: Vec<usize> = vec![0; streams.len()];
    let mut heap: BinaryHeap<Reverse<(u64, usize)>> = BinaryHeap::with_capacity(streams.len());
    for (ix, stream) in streams.iter().enumerate() {
        if let Some(head) = stream.first() {
            heap.push(Reverse((tick_of(head), ix)));
        }
    }

    while let Some(Reverse((_, ix))) = heap.pop() {
        let cursor: usize = cursors[ix];
        cursors[ix] += 1;
        out.push(streams[ix][cursor]);

        if let Some(next) = streams[ix].get(cursor + 1) {
            heap.push(Reverse((tick_of(next), ix)));
        }
    }

    out
}

/// Replay the logs and compute the rank-error distribution.
///
/// # Errors
/// See [`EvalError`]; all variants indicate logs that no correct queue run
/// can produce.
pub fn evaluate(logs: &[ThreadLog]) -> Result<RankStats, EvalError> {
    let insertion_streams: Vec<&[InsertionRecord]> =
        logs.iter().map(|l| l.insertions.as_slice()).collect();
    let global_insertions: Vec<InsertionRecord> = merge_by_tick(&insertion_streams, |r| r.tick);

    let deletion_streams: Vec<&[DeletionRecord]> =
        logs.iter().map(|l| l.deletions.as_slice()).collect();
    let global_deletions: Vec<DeletionRecord> = merge_by_tick(&deletion_streams, |r| r.tick);

    if global_deletions.is_empty() {
        return Ok(RankStats::ZERO);
    }

    // Dense numbering in (key, tick) order; ties on equal keys resolve by
    // insertion time, like the sequential reference container would.
    let mut order: Vec<(Key, u64, u32, u32)> = global_insertions
        .iter()
        .map(|r| (r.key, r.tick, r.thread_id, r.element_id))
        .collect();
    order.sort_unstable();

    let mut sorted_ix: HashMap<(u32, u32), u64> = HashMap::with_capacity(order.len());
    for (ix, &(_, _, thread_id, element_id)) in order.iter().enumerate() {
        if sorted_ix
            .insert((thread_id, element_id), ix as u64 + 1)
            .is_some()
        {
            return Err(EvalError::DuplicateElement {
                thread_id,
                element_id,
            });
        }
    }

    let mut inserted: IntervalTree = IntervalTree::new();
    let mut deleted: IntervalTree = IntervalTree::new();
    let mut ranks: Vec<u64> = Vec::with_capacity(global_deletions.len());

    let mut ins_ix: usize = 0;
    let mut del_ix: usize = 0;
    while del_ix < global_deletions.len() {
        let next_del_tick: u64 = global_deletions[del_ix].tick;

        // All insertions up to the next deletion.
        while ins_ix < global_insertions.len() && global_insertions[ins_ix].tick <= next_del_tick {
            let rec: &InsertionRecord = &global_insertions[ins_ix];
            ins_ix += 1;
            let ix: u64 = sorted_ix[&(rec.thread_id, rec.element_id)];
            inserted
                .insert(ix)
                .expect("dense numbering is duplicate-free");
        }
        let next_ins_tick: u64 = global_insertions
            .get(ins_ix)
            .map_or(u64::MAX, |r| r.tick);

        // All deletions up to the next insertion.
        while del_ix < global_deletions.len() && global_deletions[del_ix].tick < next_ins_tick {
            let rec: &DeletionRecord = &global_deletions[del_ix];
            del_ix += 1;

            let id = (rec.thread_id, rec.element_id);
            let ix: u64 = *sorted_ix.get(&id).ok_or(EvalError::UnknownElement {
                thread_id: rec.thread_id,
                element_id: rec.element_id,
            })?;
            if !inserted.contains(ix) {
                return Err(EvalError::DeletionBeforeInsertion {
                    thread_id: rec.thread_id,
                    element_id: rec.element_id,
                });
            }
            if deleted.contains(ix) {
                return Err(EvalError::DuplicateDeletion {
                    thread_id: rec.thread_id,
                    element_id: rec.element_id,
                });
            }

            let rank: u64 = inserted.taken_before(ix) - deleted.taken_before(ix);
            ranks.push(rank);
            deleted.insert(ix).expect("duplicate checked above");
        }
    }

    let n: f64 = ranks.len() as f64;
    let mean: f64 = ranks.iter().sum::<u64>() as f64 / n;
    let max: u64 = ranks.iter().copied().max().unwrap_or(0);
    let stddev: f64 = (ranks
        .iter()
        .map(|&r| (r as f64 - mean).powi(2))
        .sum::<f64>()
        / n)
        .sqrt();

    Ok(RankStats { mean, max, stddev })
}
