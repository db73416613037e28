//! Per-node write latch with an obsolete flag.
//!
//! Readers never touch the latch: structural nodes are immutable after
//! publication (child links are separate atomics), so a reader either
//! sees the old node or the new one, and retired nodes stay valid until
//! the epoch queue frees them. Writers take the latch to serialize
//! mutations of one node and mark it obsolete when they replace it, which
//! bounces any writer still spinning on the old copy back to a restart.
//!
//! The word layout is the classic optimistic-lock-coupling one (version,
//! lock bit, obsolete bit); the version is not consulted on the read path
//! but is kept for debugging and for the delete-state discipline: a
//! node's lifecycle is visible in its latch word rather than in stolen
//! pointer bits.

use std::sync::atomic::{AtomicU64, Ordering};

const OBSOLETE_BIT: u64 = 0b01;
const LOCK_BIT: u64 = 0b10;
const VERSION_STEP: u64 = 0b100;

/// The node this latch guards has been replaced; restart from the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Obsolete;

#[derive(Debug, Default)]
pub struct NodeLatch(AtomicU64);

impl NodeLatch {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Acquire the latch, spinning with bounded backoff.
    ///
    /// Fails once the node has been marked obsolete; the caller must
    /// revalidate its path from the root.
    pub fn lock(&self) -> Result<(), Obsolete> {
        let mut spins: u32 = 0;

        loop {
            let word = self.0.load(Ordering::Acquire);

            if word & OBSOLETE_BIT != 0 {
                return Err(Obsolete);
            }

            if word & LOCK_BIT == 0
                && self
                    .0
                    .compare_exchange_weak(
                        word,
                        word | LOCK_BIT,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            {
                return Ok(());
            }

            spins += 1;
            if spins % 64 == 0 {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
    }

    /// Release the latch, bumping the version.
    pub fn unlock(&self) {
        let word = self.0.load(Ordering::Relaxed);
        debug_assert!(word & LOCK_BIT != 0, "unlock of an unlocked latch");

        self.0
            .store((word + VERSION_STEP) & !LOCK_BIT, Ordering::Release);
    }

    /// Release the latch and mark the node replaced.
    pub fn unlock_obsolete(&self) {
        let word = self.0.load(Ordering::Relaxed);
        debug_assert!(word & LOCK_BIT != 0, "unlock of an unlocked latch");

        self.0.store(
            ((word + VERSION_STEP) & !LOCK_BIT) | OBSOLETE_BIT,
            Ordering::Release,
        );
    }

    pub fn is_obsolete(&self) -> bool {
        self.0.load(Ordering::Acquire) & OBSOLETE_BIT != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_roundtrip_bumps_version() {
        let latch = NodeLatch::new();

        latch.lock().unwrap();
        latch.unlock();

        latch.lock().unwrap();
        latch.unlock();

        assert_eq!(latch.0.load(Ordering::Relaxed), 2 * VERSION_STEP);
    }

    #[test]
    fn obsolete_latch_refuses_lock() {
        let latch = NodeLatch::new();

        latch.lock().unwrap();
        latch.unlock_obsolete();

        assert!(latch.is_obsolete());
        assert_eq!(latch.lock(), Err(Obsolete));
    }

    #[test]
    fn contended_lock_excludes() {
        use std::sync::atomic::AtomicU32;
        use std::sync::Arc;

        let latch = Arc::new(NodeLatch::new());
        let counter = Arc::new(AtomicU32::new(0));

        std::thread::scope(|scope| {
            for _ in 0..4 {
                let latch = latch.clone();
                let counter = counter.clone();

                scope.spawn(move || {
                    for _ in 0..1000 {
                        latch.lock().unwrap();
                        let seen = counter.fetch_add(1, Ordering::Relaxed);
                        assert_eq!(seen, 0);
                        counter.fetch_sub(1, Ordering::Relaxed);
                        latch.unlock();
                    }
                });
            }
        });
    }
}
