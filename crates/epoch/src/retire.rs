//! Deferred reclamation of detached index nodes.

use std::collections::VecDeque;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tephra_core::EpochId;

use crate::manager::EpochManager;

type FreeFn = Box<dyn FnOnce() + Send>;

struct RetiredNode {
    epoch: EpochId,
    free: Option<FreeFn>,
    next: *mut RetiredNode,
}

/// Point-in-time counters for the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetirementStats {
    pub retired: u64,
    pub freed: u64,
    pub pending: u64,
}

/// Multi-producer retirement queue.
///
/// Producers push retired entries stamped with the queue tail at
/// retirement time onto a lock-free inbox; one drainer at a time (guarded
/// by a flag, not a lock) moves the inbox into a FIFO stash and frees the
/// prefix whose stamp has fallen below the reclaim tail.
///
/// Reclamation is opportunistic: the ticker calls it every epoch, commit
/// paths may call it whenever convenient, and a thread holding no epoch
/// can always drain. Progress never depends on any particular thread.
pub struct RetirementQueue {
    epochs: Arc<EpochManager>,
    inbox: AtomicPtr<RetiredNode>,
    draining: AtomicBool,
    stash: Mutex<VecDeque<(EpochId, FreeFn)>>,
    retired_total: AtomicU64,
    freed_total: AtomicU64,
}

// The raw inbox pointer is only ever exchanged through atomics, and
// popped nodes are owned exclusively by the draining thread.
unsafe impl Send for RetirementQueue {}
unsafe impl Sync for RetirementQueue {}

impl RetirementQueue {
    pub fn new(epochs: Arc<EpochManager>) -> Arc<Self> {
        Arc::new(Self {
            epochs,
            inbox: AtomicPtr::new(ptr::null_mut()),
            draining: AtomicBool::new(false),
            stash: Mutex::new(VecDeque::new()),
            retired_total: AtomicU64::new(0),
            freed_total: AtomicU64::new(0),
        })
    }

    /// Record a detached object for deferred freeing.
    ///
    /// The closure runs once the reclaim tail has moved past the queue
    /// tail observed here, i.e. when no transaction in any epoch up to
    /// the current one can still hold a reference.
    pub fn retire(&self, free: FreeFn) {
        let epoch = self.epochs.queue_tail();

        let node = Box::into_raw(Box::new(RetiredNode {
            epoch,
            free: Some(free),
            next: ptr::null_mut(),
        }));

        let mut head = self.inbox.load(Ordering::Relaxed);
        loop {
            unsafe { (*node).next = head };

            match self
                .inbox
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(observed) => head = observed,
            }
        }

        self.retired_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Retire an owned object; it is dropped when its epoch expires.
    pub fn defer_drop<T: Send + 'static>(&self, garbage: T) {
        self.retire(Box::new(move || drop(garbage)));
    }

    /// Free every entry whose retire epoch has fallen below the reclaim
    /// tail. Returns the number of entries freed; returns immediately
    /// with 0 when another thread is already draining.
    pub fn reclaim(&self) -> usize {
        if self
            .draining
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return 0;
        }

        let reclaim_tail = self.epochs.reclaim_tail();
        let ready = self.collect_ready(Some(reclaim_tail));

        let freed = ready.len();
        for (_, free) in ready {
            free();
        }

        self.freed_total.fetch_add(freed as u64, Ordering::Relaxed);
        self.draining.store(false, Ordering::Release);

        freed
    }

    /// Free everything unconditionally. Only valid once all index users
    /// have quiesced; the engine calls this during shutdown.
    pub fn drain_all(&self) -> usize {
        while self
            .draining
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }

        let ready = self.collect_ready(None);

        let freed = ready.len();
        for (_, free) in ready {
            free();
        }

        self.freed_total.fetch_add(freed as u64, Ordering::Relaxed);
        self.draining.store(false, Ordering::Release);

        freed
    }

    pub fn stats(&self) -> RetirementStats {
        let retired = self.retired_total.load(Ordering::Relaxed);
        let freed = self.freed_total.load(Ordering::Relaxed);

        RetirementStats {
            retired,
            freed,
            pending: retired - freed,
        }
    }

    /// Move the inbox into the stash and split off the freeable prefix.
    /// `before` of None takes everything. Caller must hold the draining
    /// flag.
    fn collect_ready(&self, before: Option<EpochId>) -> Vec<(EpochId, FreeFn)> {
        // Take the whole inbox chain. Push order was LIFO, so reverse to
        // restore retirement order.
        let mut head = self.inbox.swap(ptr::null_mut(), Ordering::Acquire);
        let mut incoming = Vec::new();

        while !head.is_null() {
            let mut node = unsafe { Box::from_raw(head) };
            head = node.next;

            let free = node.free.take().expect("retired entry consumed twice");
            incoming.push((node.epoch, free));
        }

        incoming.reverse();

        let mut ready = Vec::new();
        let mut stash = self.stash.lock().expect("retirement stash poisoned");
        stash.extend(incoming);

        match before {
            Some(limit) => {
                // Strictly below the reclaim tail: an entry retired at
                // the tail itself may still be observable.
                while stash.front().is_some_and(|entry| entry.0 < limit) {
                    ready.push(stash.pop_front().expect("checked front"));
                }
            }
            None => ready.extend(stash.drain(..)),
        }

        ready
    }
}

impl Drop for RetirementQueue {
    fn drop(&mut self) {
        self.drain_all();
    }
}
