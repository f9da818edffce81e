//! Benchmarks for the relaxed priority queue using Divan.
//!
//! Run with: `cargo bench --bench queue`

use divan::{Bencher, black_box};
use klsm::{Klsm, RelaxedQueue};

fn main() {
    divan::main();
}

const N: usize = 10_000;

fn prefill<const RLX: usize>(n: usize) -> Klsm<u64, RLX> {
    let queue: Klsm<u64, RLX> = Klsm::new();
    queue.init_thread(1);
    for i in 0..n as u64 {
        queue.insert((i * 0x9e37_79b9) % (n as u64), i);
    }
    queue
}

// =============================================================================
// Insert
// =============================================================================

#[divan::bench_group]
mod insert {
    use super::{Bencher, Klsm, N, RelaxedQueue, black_box};

    #[divan::bench(consts = [16, 256, 4096])]
    fn ascending<const RLX: usize>(bencher: Bencher) {
        bencher
            .with_inputs(|| {
                let queue: Klsm<u64, RLX> = Klsm::new();
                queue.init_thread(1);
                queue
            })
            .bench_local_values(|queue| {
                for i in 0..N as u64 {
                    queue.insert(black_box(i), i);
                }
                queue
            });
    }

    #[divan::bench(consts = [16, 256, 4096])]
    fn scattered<const RLX: usize>(bencher: Bencher) {
        bencher
            .with_inputs(|| {
                let queue: Klsm<u64, RLX> = Klsm::new();
                queue.init_thread(1);
                queue
            })
            .bench_local_values(|queue| {
                for i in 0..N as u64 {
                    queue.insert(black_box((i * 0x9e37_79b9) % (N as u64)), i);
                }
                queue
            });
    }
}

// =============================================================================
// Delete-min
// =============================================================================

#[divan::bench_group]
mod delete_min {
    use super::{Bencher, N, RelaxedQueue, black_box, prefill};

    #[divan::bench(consts = [16, 256, 4096])]
    fn drain<const RLX: usize>(bencher: Bencher) {
        bencher
            .with_inputs(|| prefill::<RLX>(N))
            .bench_local_values(|queue| {
                while let Some(v) = queue.delete_min() {
                    black_box(v);
                }
                queue
            });
    }
}

// =============================================================================
// Mixed workload
// =============================================================================

#[divan::bench_group]
mod mixed {
    use super::{Bencher, N, RelaxedQueue, black_box, prefill};

    /// Alternating insert / delete_min over a prefilled queue.
    #[divan::bench(consts = [16, 256, 4096])]
    fn alternating<const RLX: usize>(bencher: Bencher) {
        bencher
            .with_inputs(|| prefill::<RLX>(N))
            .bench_local_values(|queue| {
                for i in 0..N as u64 {
                    if i & 1 == 0 {
                        queue.insert(black_box(i % 512), i);
                    } else {
                        black_box(queue.delete_min());
                    }
                }
                queue
            });
    }
}
