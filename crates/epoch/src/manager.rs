//! The centralized epoch manager.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, trace};

use tephra_core::{Cid, EpochId};

use crate::retire::RetirementQueue;

/// Minimum gap, in epochs, between the current epoch and the queue tail,
/// and between the queue tail and the reclaim tail. Keeps a reader that
/// sampled the head (or the queue tail) from racing a tail advance into
/// its own epoch.
pub const SAFETY_INTERVAL: u64 = 2;

/// One slot of the epoch ring.
///
/// Padded out to a cache line; the ref counts are the hottest words in
/// the engine and false sharing between neighboring epochs shows up
/// directly in transaction throughput.
#[repr(align(64))]
struct EpochSlot {
    ro_refs: AtomicI32,
    rw_refs: AtomicI32,
    max_cid: AtomicU64,
}

impl EpochSlot {
    fn new() -> Self {
        Self {
            ro_refs: AtomicI32::new(0),
            rw_refs: AtomicI32::new(0),
            max_cid: AtomicU64::new(0),
        }
    }

    fn reset(&self) {
        self.ro_refs.store(0, Ordering::Relaxed);
        self.rw_refs.store(0, Ordering::Relaxed);
        self.max_cid.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time view of the manager's counters, for monitoring and
/// tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochWatermarks {
    pub current_epoch: EpochId,
    pub queue_tail: EpochId,
    pub reclaim_tail: EpochId,
    pub max_cid_ro: Cid,
    pub max_cid_gc: Cid,
}

/// Ring-buffer epoch manager.
///
/// Entering and exiting epochs is wait-free: one atomic load, one
/// fetch-add, one bounded max-update. Tail advances are guarded by a
/// cooperative-exclusive token per tail; a thread that loses the token
/// race simply returns, some other thread is already advancing.
pub struct EpochManager {
    slots: Box<[EpochSlot]>,

    current_epoch: AtomicU64,
    queue_tail: AtomicU64,
    reclaim_tail: AtomicU64,

    queue_tail_token: AtomicBool,
    reclaim_tail_token: AtomicBool,

    max_cid_ro: AtomicU64,
    max_cid_gc: AtomicU64,

    running: AtomicBool,
}

impl EpochManager {
    pub fn new(ring_size: usize) -> Arc<Self> {
        assert!(
            ring_size as u64 > 2 * SAFETY_INTERVAL,
            "epoch ring too small"
        );

        let slots = (0..ring_size).map(|_| EpochSlot::new()).collect();

        Arc::new(Self {
            slots,
            current_epoch: AtomicU64::new(0),
            queue_tail: AtomicU64::new(0),
            reclaim_tail: AtomicU64::new(0),
            queue_tail_token: AtomicBool::new(true),
            reclaim_tail_token: AtomicBool::new(true),
            max_cid_ro: AtomicU64::new(0),
            max_cid_gc: AtomicU64::new(0),
            running: AtomicBool::new(true),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop handing out epochs. Callers must have quiesced all worker
    /// threads first.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Join the current epoch as a read-write transaction.
    pub fn enter_epoch(&self, begin_cid: Cid) -> EpochId {
        assert!(self.is_running(), "enter_epoch on a stopped epoch manager");

        let epoch = self.current_epoch.load(Ordering::Acquire);
        let slot = self.slot(epoch);

        slot.rw_refs.fetch_add(1, Ordering::AcqRel);
        atomic_max(&slot.max_cid, begin_cid);

        epoch
    }

    pub fn exit_epoch(&self, epoch: EpochId) {
        debug_assert!(epoch >= self.queue_tail.load(Ordering::Relaxed));
        debug_assert!(epoch <= self.current_epoch.load(Ordering::Relaxed));

        let before = self.slot(epoch).rw_refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(before > 0, "exit_epoch without a matching enter");
    }

    /// Join the queue tail as a read-only transaction: it reads the
    /// committed state as of the moment the tail was sampled.
    pub fn enter_read_only(&self, begin_cid: Cid) -> EpochId {
        assert!(
            self.is_running(),
            "enter_read_only on a stopped epoch manager"
        );

        let epoch = self.queue_tail.load(Ordering::Acquire);
        let slot = self.slot(epoch);

        slot.ro_refs.fetch_add(1, Ordering::AcqRel);
        atomic_max(&slot.max_cid, begin_cid);

        epoch
    }

    pub fn exit_read_only(&self, epoch: EpochId) {
        debug_assert!(epoch >= self.reclaim_tail.load(Ordering::Relaxed));
        debug_assert!(epoch <= self.queue_tail.load(Ordering::Relaxed));

        let before = self.slot(epoch).ro_refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(before > 0, "exit_read_only without a matching enter");
    }

    /// Highest cid below which versions are safe to garbage-collect.
    /// Advances both tails as a side effect.
    pub fn max_committed_cid(&self) -> Cid {
        self.advance_queue_tail();
        self.advance_reclaim_tail();

        self.max_cid_gc.load(Ordering::Acquire)
    }

    /// The watermark at which read-only transactions read consistently.
    /// Advances the queue tail as a side effect.
    pub fn read_only_cid(&self) -> Cid {
        self.advance_queue_tail();

        self.max_cid_ro.load(Ordering::Acquire)
    }

    /// Oldest epoch that might still hold a live rw transaction; the
    /// stamp recorded on retired memory.
    pub fn queue_tail(&self) -> EpochId {
        self.queue_tail.load(Ordering::Acquire)
    }

    /// Oldest epoch that might still hold a live ro transaction; memory
    /// retired before this is free to go.
    pub fn reclaim_tail(&self) -> EpochId {
        self.reclaim_tail.load(Ordering::Acquire)
    }

    pub fn watermarks(&self) -> EpochWatermarks {
        EpochWatermarks {
            current_epoch: self.current_epoch.load(Ordering::Acquire),
            queue_tail: self.queue_tail.load(Ordering::Acquire),
            reclaim_tail: self.reclaim_tail.load(Ordering::Acquire),
            max_cid_ro: self.max_cid_ro.load(Ordering::Acquire),
            max_cid_gc: self.max_cid_gc.load(Ordering::Acquire),
        }
    }

    /// One epoch advance step. Normally driven by the ticker; tests may
    /// drive it directly.
    pub fn tick(&self) {
        let ring = self.slots.len() as u64;
        let current = self.current_epoch.load(Ordering::Relaxed);

        let next_idx = (current + 1) % ring;
        let reclaim_idx = self.reclaim_tail.load(Ordering::Relaxed) % ring;

        if next_idx == reclaim_idx {
            // Ring overflow: hold the head still and push on the tails
            // instead. The system keeps making progress, retired memory
            // is just held a little longer.
            trace!(current, "epoch ring overflow, advancing tails only");
            self.advance_queue_tail();
            self.advance_reclaim_tail();
            return;
        }

        // The slot must be clean before the new epoch becomes visible,
        // otherwise an entering transaction could observe stale counts.
        self.slots[next_idx as usize].reset();
        self.current_epoch.store(current + 1, Ordering::Release);

        self.advance_queue_tail();
        self.advance_reclaim_tail();
    }

    fn slot(&self, epoch: EpochId) -> &EpochSlot {
        &self.slots[(epoch % self.slots.len() as u64) as usize]
    }

    fn advance_queue_tail(&self) {
        if self
            .queue_tail_token
            .compare_exchange(true, false, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            // Someone else is advancing this tail right now.
            return;
        }

        let limit = self.current_epoch.load(Ordering::Acquire);
        let mut tail = self.queue_tail.load(Ordering::Relaxed);

        while tail + SAFETY_INTERVAL < limit {
            let slot = self.slot(tail);

            if slot.rw_refs.load(Ordering::Acquire) > 0 {
                break;
            }

            atomic_max(&self.max_cid_ro, slot.max_cid.load(Ordering::Relaxed));
            tail += 1;
        }

        self.queue_tail.store(tail, Ordering::Release);
        self.queue_tail_token.store(true, Ordering::Release);
    }

    fn advance_reclaim_tail(&self) {
        if self
            .reclaim_tail_token
            .compare_exchange(true, false, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        let limit = self.queue_tail.load(Ordering::Acquire);
        let mut tail = self.reclaim_tail.load(Ordering::Relaxed);

        while tail + SAFETY_INTERVAL < limit {
            let slot = self.slot(tail);

            if slot.ro_refs.load(Ordering::Acquire) > 0 {
                break;
            }

            atomic_max(&self.max_cid_gc, slot.max_cid.load(Ordering::Relaxed));
            tail += 1;
        }

        self.reclaim_tail.store(tail, Ordering::Release);
        self.reclaim_tail_token.store(true, Ordering::Release);
    }
}

fn atomic_max(target: &AtomicU64, value: u64) {
    let mut current = target.load(Ordering::Relaxed);
    while current < value {
        match target.compare_exchange_weak(current, value, Ordering::Relaxed, Ordering::Relaxed)
        {
            Ok(_) => return,
            Err(actual) => current = actual,
        }
    }
}

/// Owns the dedicated thread that advances epochs on a timer and drains
/// the retirement queue opportunistically.
pub struct EpochTicker {
    manager: Arc<EpochManager>,
    handle: Option<JoinHandle<()>>,
}

impl EpochTicker {
    pub fn spawn(
        manager: Arc<EpochManager>,
        retirement: Option<Arc<RetirementQueue>>,
        period: Duration,
    ) -> Self {
        let ticker_manager = manager.clone();

        let handle = thread::Builder::new()
            .name("tephra-epoch-ticker".into())
            .spawn(move || {
                debug!(?period, "epoch ticker started");

                while ticker_manager.is_running() {
                    thread::sleep(period);
                    ticker_manager.tick();

                    if let Some(queue) = &retirement {
                        queue.reclaim();
                    }
                }

                debug!("epoch ticker stopped");
            })
            .expect("failed to spawn epoch ticker thread");

        Self {
            manager,
            handle: Some(handle),
        }
    }

    /// Stop the manager and join the ticker thread.
    pub fn stop(mut self) {
        self.stop_inner();
    }

    fn stop_inner(&mut self) {
        self.manager.shutdown();

        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.stop_inner();
    }
}
