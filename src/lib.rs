//! # klsm
//!
//! A relaxed concurrent priority queue keyed on unsigned integers
//! (smaller = higher priority).
//!
//! `delete_min` is allowed to return any element whose key is within a
//! bounded rank distance `RLX` of the true minimum. Relaxation is the lever
//! that removes the sequential bottleneck a strict priority queue imposes
//! under contention: instead of all threads fighting over one head element,
//! consumers claim uniformly among the current top-`RLX` candidates.
//!
//! ## Design
//!
//! The queue is a two-level log-structured merge structure:
//!
//! - Each thread owns a *distributed LSM*: a pile of power-of-two-sized
//!   sorted blocks. Inserts append or trigger cascading merges of
//!   equal-sized blocks, exactly like an LSM tree's compaction.
//! - Once a merged block holds `(RLX + 1) / 2` elements it is published to
//!   the *shared LSM*: a single atomic pointer to an immutable block-array
//!   snapshot, replaced wholesale by CAS.
//!
//! Elements are claimed through a per-item version protocol: a single CAS
//! flips an item from live to free, so an element observed through any
//! stale snapshot or spied block can still be claimed exactly once.
//!
//! ## Concurrency model
//!
//! - Per-thread state is single-writer; foreign threads read only
//!   write-once `(item, version)` slot pairs.
//! - The shared snapshot pointer is the only shared mutable cell and is
//!   updated only by CAS. Retired snapshots are reclaimed through `seize`.
//! - `delete_min` never blocks; it may return `None` under contention or
//!   when no element is observable to the caller.

pub mod block;
pub mod block_array;
pub mod block_pool;
pub mod dist_lsm;
pub mod interval_tree;
pub mod item;
pub mod item_alloc;
pub mod klsm;
pub mod lazy_block;
pub mod ordering;
pub mod quality;
pub mod shared_lsm;

mod tracing_helpers;

pub use crate::item::Key;
pub use crate::klsm::{
    Config, Klsm, Klsm128, Klsm16, Klsm256, Klsm4096, PoolCapacity, QualityLogging, RelaxedQueue,
};
