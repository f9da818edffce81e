//! The combined relaxed priority queue: per-thread dist LSMs feeding a
//! shared LSM.
//!
//! [`Klsm`] is the public queue type. The relaxation bound is a const
//! parameter; [`Klsm16`], [`Klsm128`], [`Klsm256`] and [`Klsm4096`] are the
//! standard instantiations.
//!
//! ```
//! use klsm::{Klsm256, RelaxedQueue};
//!
//! let queue: Klsm256<u64> = Klsm256::new();
//! queue.init_thread(1);
//! queue.insert(3, 30);
//! queue.insert(1, 10);
//! assert!(queue.delete_min().is_some());
//! ```

#[cfg(test)]
mod shuttle_tests;

use std::sync::atomic::AtomicU64;

use crate::dist_lsm::{DistLsm, LocalConfig};
use crate::item::Key;
use crate::item_alloc::{CHUNK_SIZE_LARGE, CHUNK_SIZE_SMALL};
use crate::quality::ThreadLog;
use crate::shared_lsm::SharedLsm;

/// The capability set every queue variant exposes to a benchmark harness.
pub trait RelaxedQueue<V> {
    /// Register the calling thread. Must be called once per thread per
    /// queue before any other operation.
    fn init_thread(&self, num_threads: usize);

    /// Insert an element. Never fails.
    fn insert(&self, key: Key, value: V);

    /// Remove some element within the relaxation window of the minimum.
    /// `None` means no element is currently observable to the caller.
    fn delete_min(&self) -> Option<V>;

    /// Whether the structure tolerates more than one thread.
    fn supports_concurrency(&self) -> bool;
}

/// Sizing of the per-thread item pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoolCapacity {
    Small,
    #[default]
    Large,
}

impl PoolCapacity {
    fn chunk_size(self) -> usize {
        match self {
            Self::Small => CHUNK_SIZE_SMALL,
            Self::Large => CHUNK_SIZE_LARGE,
        }
    }
}

/// Whether threads record insertion/deletion logs for the quality
/// evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QualityLogging {
    #[default]
    Off,
    On,
}

/// Queue construction parameters. The relaxation bound itself is the
/// `RLX` const parameter of [`Klsm`].
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub pool_capacity: PoolCapacity,
    pub quality_logging: QualityLogging,
    /// Upper bound on blocks copied per spy attempt; 0 disables spying.
    pub max_spy_blocks: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pool_capacity: PoolCapacity::default(),
            quality_logging: QualityLogging::default(),
            max_spy_blocks: 8,
        }
    }
}

/// Relaxed concurrent priority queue with rank error bounded by `RLX`
/// (per observable element set; see the crate docs).
pub struct Klsm<V, const RLX: usize = 256> {
    dist: DistLsm<V>,
    shared: SharedLsm<V>,
    /// Monotonic operation clock for quality logging.
    ticks: AtomicU64,
    config: Config,
}

pub type Klsm16<V> = Klsm<V, 16>;
pub type Klsm128<V> = Klsm<V, 128>;
pub type Klsm256<V> = Klsm<V, 256>;
pub type Klsm4096<V> = Klsm<V, 4096>;

impl<V: Copy + Send, const RLX: usize> Klsm<V, RLX> {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    #[must_use]
    pub fn with_config(config: Config) -> Self {
        Self {
            dist: DistLsm::new(),
            shared: SharedLsm::new(RLX),
            ticks: AtomicU64::new(1),
            config,
        }
    }

    /// The configured relaxation bound.
    #[must_use]
    pub const fn relaxation(&self) -> usize {
        RLX
    }

    /// Upper bound on the number of live elements currently published to
    /// the shared LSM (excludes unpublished per-thread piles).
    #[must_use]
    pub fn published_size(&self) -> usize {
        self.shared.size()
    }

    fn local_config(&self) -> LocalConfig {
        LocalConfig {
            rlx: RLX,
            item_chunk: self.config.pool_capacity.chunk_size(),
            logging: self.config.quality_logging == QualityLogging::On,
            max_spy_blocks: self.config.max_spy_blocks,
        }
    }

    /// Drain the per-thread quality logs accumulated so far.
    ///
    /// Takes `&mut self`: call after the worker threads are done.
    pub fn take_logs(&mut self) -> Vec<ThreadLog> {
        self.dist.take_logs()
    }
}

impl<V: Copy + Send, const RLX: usize> RelaxedQueue<V> for Klsm<V, RLX> {
    fn init_thread(&self, num_threads: usize) {
        self.dist.init_thread(num_threads, &self.local_config());
    }

    fn insert(&self, key: Key, value: V) {
        self.dist
            .local()
            .insert(key, value, Some(&self.shared), &self.ticks);
    }

    fn delete_min(&self) -> Option<V> {
        self.dist
            .local()
            .delete_min(&self.dist, Some(&self.shared), &self.ticks)
    }

    fn supports_concurrency(&self) -> bool {
        true
    }
}

impl<V: Copy + Send, const RLX: usize> Default for Klsm<V, RLX> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn unrelaxed_single_thread_is_exact() {
        // With a relaxation far above the element count nothing gets
        // published, so a single thread drains in strict order.
        let queue: Klsm4096<u64> = Klsm4096::new();
        queue.init_thread(1);

        for key in [3u64, 1, 4, 1, 5, 9, 2, 6] {
            queue.insert(key, key);
        }

        let mut drained: Vec<u64> = Vec::new();
        while let Some(v) = queue.delete_min() {
            drained.push(v);
        }
        assert_eq!(drained, vec![1, 1, 2, 3, 4, 5, 6, 9]);
    }

    #[test]
    fn conservation_single_thread() {
        use rand::{Rng, SeedableRng};

        let queue: Klsm16<u64> = Klsm16::new();
        queue.init_thread(1);

        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(0xC0FFEE);
        let keys: Vec<u64> = (0..200).map(|_| rng.gen_range(0..101u64)).collect();
        for &k in &keys {
            queue.insert(k, k);
        }

        let mut drained: Vec<u64> = Vec::new();
        while let Some(v) = queue.delete_min() {
            drained.push(v);
        }

        let mut expected = keys.clone();
        expected.sort_unstable();
        drained.sort_unstable();
        assert_eq!(drained, expected);
    }

    #[test]
    fn rank_error_is_bounded_single_thread() {
        const RLX: usize = 16;
        let queue: Klsm<u64, RLX> = Klsm::new();
        queue.init_thread(1);

        // Reference multiset of live keys.
        let mut live: BTreeMap<u64, usize> = BTreeMap::new();
        let mut next_key: u64 = 0;

        for round in 0..600usize {
            if round % 3 != 2 {
                let key: u64 = (next_key * 53) % 997;
                next_key += 1;
                queue.insert(key, key);
                *live.entry(key).or_insert(0) += 1;
            } else {
                let got: u64 = queue.delete_min().expect("queue is non-empty");
                let rank: usize = live
                    .range(..got)
                    .map(|(_, count)| count)
                    .sum();
                assert!(
                    rank <= RLX,
                    "returned key {got} has rank {rank} > {RLX}"
                );
                let count = live.get_mut(&got).expect("returned key must be live");
                *count -= 1;
                if *count == 0 {
                    live.remove(&got);
                }
            }
        }
    }

    #[test]
    fn single_element_two_consumers_single_claim() {
        let queue: Klsm16<u64> = Klsm16::new();
        queue.init_thread(3);
        queue.insert(7, 700);

        let wins = AtomicUsize::new(0);
        std::thread::scope(|scope| {
            for _ in 0..2 {
                let queue = &queue;
                let wins = &wins;
                scope.spawn(move || {
                    queue.init_thread(3);
                    if queue.delete_min().is_some() {
                        wins.fetch_add(1, Ordering::Relaxed);
                    }
                });
            }
        });

        let total: usize =
            wins.load(Ordering::Relaxed) + usize::from(queue.delete_min().is_some());
        assert_eq!(total, 1, "exactly one claim must succeed overall");
    }

    #[test]
    fn producer_consumer_conservation() {
        const N: u64 = 20_000;
        const CONSUMERS: usize = 3;

        let queue: Klsm256<u64> = Klsm256::new();
        queue.init_thread(CONSUMERS + 1);

        let deleted = AtomicUsize::new(0);
        let mut per_consumer: Vec<Vec<u64>> = Vec::new();

        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..CONSUMERS)
                .map(|_| {
                    let queue = &queue;
                    let deleted = &deleted;
                    scope.spawn(move || {
                        queue.init_thread(CONSUMERS + 1);
                        let mut got: Vec<u64> = Vec::new();
                        while deleted.load(Ordering::Relaxed) < N as usize {
                            if let Some(v) = queue.delete_min() {
                                got.push(v);
                                deleted.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        got
                    })
                })
                .collect();

            for key in 1..=N {
                queue.insert(key, key);
            }

            for handle in handles {
                per_consumer.push(handle.join().expect("consumer panicked"));
            }
        });

        let mut all: Vec<u64> = per_consumer.into_iter().flatten().collect();
        assert_eq!(all.len(), N as usize);
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), N as usize, "no element may be claimed twice");
        assert_eq!(all.first(), Some(&1));
        assert_eq!(all.last(), Some(&N));
    }

    #[test]
    fn quality_logs_replay_within_relaxation() {
        const RLX: usize = 16;
        let mut queue: Klsm<u64, RLX> = Klsm::with_config(Config {
            quality_logging: QualityLogging::On,
            ..Config::default()
        });
        queue.init_thread(1);

        for key in 0..64u64 {
            queue.insert(key, key);
        }
        for _ in 0..64 {
            assert!(queue.delete_min().is_some());
        }

        let logs = queue.take_logs();
        let total_insertions: usize = logs.iter().map(|l| l.insertions.len()).sum();
        let total_deletions: usize = logs.iter().map(|l| l.deletions.len()).sum();
        assert_eq!(total_insertions, 64);
        assert_eq!(total_deletions, 64);

        let stats = quality::evaluate(&logs).expect("logs are well-formed");
        assert!(
            stats.max <= RLX as u64,
            "replayed rank error {} exceeds relaxation {RLX}",
            stats.max
        );
    }

    #[test]
    fn delete_on_empty_returns_none() {
        let queue: Klsm16<u32> = Klsm16::new();
        queue.init_thread(1);
        assert!(queue.delete_min().is_none());

        queue.insert(1, 1);
        assert!(queue.delete_min().is_some());
        assert!(queue.delete_min().is_none());
    }

    #[test]
    fn interleaved_reuse_keeps_conservation() {
        let queue: Klsm16<u64> = Klsm16::new();
        queue.init_thread(1);

        let mut inserted: Vec<u64> = Vec::new();
        let mut drained: Vec<u64> = Vec::new();
        for wave in 0..8u64 {
            for i in 0..50u64 {
                let key = wave * 1000 + (i * 13) % 50;
                queue.insert(key, key);
                inserted.push(key);
            }
            for _ in 0..25 {
                drained.push(queue.delete_min().expect("non-empty"));
            }
        }
        while let Some(v) = queue.delete_min() {
            drained.push(v);
        }

        inserted.sort_unstable();
        drained.sort_unstable();
        assert_eq!(drained, inserted);
    }
}
