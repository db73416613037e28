//! The engine facade: one explicitly-owned value that wires the epoch
//! manager, the retirement queue and the index registry together.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tracing::{debug, info};

use tephra_core::codec::KeyLoader;
use tephra_core::{Cid, EngineConfig, EpochId, IndexError, IndexMetadata, Oid, RowIndex};
use tephra_epoch::{EpochManager, EpochTicker, EpochWatermarks, RetirementQueue, RetirementStats};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("an index with oid {0} already exists")]
    DuplicateIndex(Oid),

    #[error("no index with oid {0}")]
    UnknownIndex(Oid),

    #[error(transparent)]
    Index(#[from] IndexError),
}

/// Point-in-time engine health snapshot.
#[derive(Debug, Clone, Copy)]
pub struct EngineVitals {
    pub epochs: EpochWatermarks,
    pub retirement: RetirementStats,
    pub index_count: usize,
}

/// The storage engine core.
///
/// Owns the epoch machinery and every index built through it. There is
/// no global instance: whoever constructs the engine owns it and passes
/// it (or its parts) down by reference.
pub struct Engine {
    epochs: Arc<EpochManager>,
    retirement: Arc<RetirementQueue>,
    ticker: Option<EpochTicker>,
    indexes: RwLock<HashMap<Oid, Arc<dyn RowIndex>>>,
}

impl Engine {
    /// Construct the engine and start the epoch ticker thread.
    pub fn start(config: EngineConfig) -> Self {
        let epochs = EpochManager::new(config.epoch_ring_size);
        let retirement = RetirementQueue::new(epochs.clone());
        let ticker = EpochTicker::spawn(
            epochs.clone(),
            Some(retirement.clone()),
            config.epoch_tick(),
        );

        info!(
            ring = config.epoch_ring_size,
            tick_ms = config.epoch_tick_ms,
            "engine started"
        );

        Self {
            epochs,
            retirement,
            ticker: Some(ticker),
            indexes: RwLock::new(HashMap::new()),
        }
    }

    /// Construct without a ticker thread; tests drive epochs manually.
    pub fn start_manual(config: EngineConfig) -> Self {
        let epochs = EpochManager::new(config.epoch_ring_size);
        let retirement = RetirementQueue::new(epochs.clone());

        Self {
            epochs,
            retirement,
            ticker: None,
            indexes: RwLock::new(HashMap::new()),
        }
    }

    pub fn epochs(&self) -> &Arc<EpochManager> {
        &self.epochs
    }

    pub fn retirement(&self) -> &Arc<RetirementQueue> {
        &self.retirement
    }

    // ============ Transaction manager interface ============

    pub fn enter_epoch(&self, begin_cid: Cid) -> EpochId {
        self.epochs.enter_epoch(begin_cid)
    }

    pub fn exit_epoch(&self, epoch: EpochId) {
        self.epochs.exit_epoch(epoch)
    }

    pub fn enter_read_only(&self, begin_cid: Cid) -> EpochId {
        self.epochs.enter_read_only(begin_cid)
    }

    pub fn exit_read_only(&self, epoch: EpochId) {
        self.epochs.exit_read_only(epoch)
    }

    pub fn max_committed_cid(&self) -> Cid {
        self.epochs.max_committed_cid()
    }

    pub fn read_only_cid(&self) -> Cid {
        self.epochs.read_only_cid()
    }

    // ============ Catalog interface ============

    /// Build the index described by the metadata and register it under
    /// its oid. The radix shape needs a key loader.
    pub fn build_index(
        &self,
        metadata: Arc<IndexMetadata>,
        loader: Option<Arc<dyn KeyLoader>>,
    ) -> Result<Arc<dyn RowIndex>, EngineError> {
        let oid = metadata.index_oid;

        let mut indexes = self.indexes.write().expect("index registry poisoned");
        if indexes.contains_key(&oid) {
            return Err(EngineError::DuplicateIndex(oid));
        }

        let index = tephra_index::build_index(metadata, self.retirement.clone(), loader)?;
        indexes.insert(oid, index.clone());

        Ok(index)
    }

    /// Unregister an index. Outstanding handles keep it alive; its
    /// retained nodes drain through the shared retirement queue.
    pub fn drop_index(&self, oid: Oid) -> Result<(), EngineError> {
        let mut indexes = self.indexes.write().expect("index registry poisoned");

        match indexes.remove(&oid) {
            Some(index) => {
                debug!(index = %index.metadata().name, oid, "index dropped");
                Ok(())
            }
            None => Err(EngineError::UnknownIndex(oid)),
        }
    }

    pub fn index(&self, oid: Oid) -> Option<Arc<dyn RowIndex>> {
        self.indexes
            .read()
            .expect("index registry poisoned")
            .get(&oid)
            .cloned()
    }

    pub fn vitals(&self) -> EngineVitals {
        EngineVitals {
            epochs: self.epochs.watermarks(),
            retirement: self.retirement.stats(),
            index_count: self.indexes.read().expect("index registry poisoned").len(),
        }
    }

    /// Stop the ticker and free everything still pending retirement.
    /// Callers must have quiesced all worker threads first.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.stop();
        } else {
            self.epochs.shutdown();
        }

        let freed = self.retirement.drain_all();
        debug!(freed, "engine shut down");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}
