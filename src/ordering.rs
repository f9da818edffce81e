//! Standard memory orderings for concurrent queue access.
//!
//! These constants ensure consistent ordering usage across the codebase
//! and make the intent clear at each access point.

use std::sync::atomic::Ordering;

/// Ordering for reading slot pairs, item versions and the snapshot pointer.
/// Pairs with writer's Release stores.
pub const READ_ORD: Ordering = Ordering::Acquire;

/// Ordering for publishing slot pairs, block lists and list lengths.
/// Pairs with reader's Acquire loads.
pub const WRITE_ORD: Ordering = Ordering::Release;

/// Ordering for CAS success (item claim, snapshot swap).
pub const CAS_SUCCESS: Ordering = Ordering::AcqRel;

/// Ordering for CAS failure.
/// Only need to see the current value.
pub const CAS_FAILURE: Ordering = Ordering::Acquire;

/// Ordering for relaxed accesses (owner-private counters, statistics).
/// Safe because the owning thread is the only writer.
pub const RELAXED: Ordering = Ordering::Relaxed;
