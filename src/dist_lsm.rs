//! Distributed-LSM facade: thread registry and dispatch.
//!
//! Every queue instance owns a registry of [`DistLsmLocal`] slots indexed
//! by a stable small thread id. A thread claims its id the first time it
//! calls `init_thread` on a given queue; the id is remembered thread-local
//! per queue instance, so subsequent operations are a map lookup plus an
//! array index. Slots are never deregistered while the queue lives, which
//! is what keeps spied block and item pointers valid.

mod local;

pub use local::{DistLsmLocal, MAX_LOCAL_BLOCKS};

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::quality::ThreadLog;

/// Upper bound on concurrently registered threads per queue instance.
pub const MAX_THREADS: usize = 128;

/// Per-thread settings handed down from the queue configuration.
pub(crate) struct LocalConfig {
    pub rlx: usize,
    pub item_chunk: usize,
    pub logging: bool,
    pub max_spy_blocks: usize,
}

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    /// Maps queue instance id -> this thread's registry slot on it.
    static THREAD_IDS: RefCell<HashMap<u64, u32>> = RefCell::new(HashMap::new());
}

/// Thread registry plus dispatch for the per-thread LSM piles.
pub struct DistLsm<V> {
    locals: Box<[DistLsmLocal<V>]>,
    instance_id: u64,
    next_thread_id: AtomicUsize,
    registration: Mutex<()>,
}

impl<V: Copy + Send> DistLsm<V> {
    pub(crate) fn new() -> Self {
        Self {
            locals: (0..MAX_THREADS).map(|_| DistLsmLocal::new()).collect(),
            instance_id: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
            next_thread_id: AtomicUsize::new(0),
            registration: Mutex::new(()),
        }
    }

    /// Register the calling thread, assigning it a stable slot on first
    /// call and (re)initializing the slot's pools.
    ///
    /// # Panics
    /// Panics when more than [`MAX_THREADS`] distinct threads register.
    pub(crate) fn init_thread(&self, num_threads: usize, config: &LocalConfig) {
        assert!(
            num_threads <= MAX_THREADS,
            "at most {MAX_THREADS} threads are supported"
        );

        let thread_id: u32 = THREAD_IDS.with(|ids| {
            let mut ids = ids.borrow_mut();
            *ids.entry(self.instance_id).or_insert_with(|| {
                let _registration = self.registration.lock();
                let id: usize = self.next_thread_id.fetch_add(1, Ordering::Relaxed);
                assert!(id < MAX_THREADS, "thread limit exceeded");
                id as u32
            })
        });

        self.locals[thread_id as usize].init(thread_id, config);
    }

    /// The calling thread's registry slot.
    ///
    /// # Panics
    /// Panics if the thread never called `init_thread` on this queue.
    pub(crate) fn local(&self) -> &DistLsmLocal<V> {
        let thread_id: u32 = THREAD_IDS.with(|ids| {
            ids.borrow()
                .get(&self.instance_id)
                .copied()
                .expect("init_thread() must be called before using the queue")
        });
        &self.locals[thread_id as usize]
    }

    pub(crate) fn local_at(&self, thread_id: usize) -> &DistLsmLocal<V> {
        &self.locals[thread_id]
    }

    /// Number of slots handed out so far; spy victims are drawn from this
    /// range.
    pub(crate) fn num_registered(&self) -> usize {
        self.next_thread_id.load(Ordering::Relaxed).min(MAX_THREADS)
    }

    /// Drain every slot's quality logs, indexed by thread id.
    pub(crate) fn take_logs(&mut self) -> Vec<ThreadLog> {
        let registered: usize = self.num_registered();
        self.locals[..registered]
            .iter_mut()
            .map(DistLsmLocal::take_logs)
            .collect()
    }
}
