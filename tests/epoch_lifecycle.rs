//! Epoch and reclamation lifecycle, driven with manual ticks so the
//! assertions are deterministic.

use std::sync::Arc;

use tephra::{
    Engine, EngineConfig, EngineVitals, EpochManager, IndexShape, RowIndex, RetirementQueue,
    ScanDirection, SAFETY_INTERVAL,
};
use tephra_testing::{int_varchar_key, int_varchar_schema, index_metadata, loc, MapKeyLoader};

fn manual_engine(ring: usize) -> Engine {
    tephra_testing::init_tracing();

    Engine::start_manual(EngineConfig {
        epoch_ring_size: ring,
        ..EngineConfig::default()
    })
}

fn tick(engine: &Engine, times: usize) {
    for _ in 0..times {
        engine.epochs().tick();
    }
}

#[test]
fn watermark_invariants_hold_at_every_observation() {
    let engine = manual_engine(64);

    let mut queue_tail_prev = 0;
    for round in 0..200u64 {
        if round % 3 == 0 {
            let epoch = engine.enter_epoch(round);
            engine.exit_epoch(epoch);
        }

        tick(&engine, 1);

        let marks = engine.vitals().epochs;
        assert!(marks.reclaim_tail <= marks.queue_tail);
        assert!(marks.queue_tail <= marks.current_epoch);
        assert!(marks.queue_tail >= queue_tail_prev, "tail regressed");
        queue_tail_prev = marks.queue_tail;
    }
}

#[test]
fn held_epoch_blocks_reclamation_until_exit() {
    let engine = manual_engine(64);
    let loader = MapKeyLoader::new();

    let index = engine
        .build_index(
            index_metadata(IndexShape::BTree, int_varchar_schema(), false),
            Some(loader.clone()),
        )
        .unwrap();
    let schema = index.metadata().key_schema().clone();

    // Settle the tails before the interesting part.
    tick(&engine, 10);

    // Thread A holds an epoch across the mutation.
    let held = engine.enter_epoch(1);

    // Thread B inserts then deletes a key, which unlinks structure
    // nodes into the retirement queue.
    let key = int_varchar_key(&schema, 42, "k");
    let epoch_b = engine.enter_epoch(2);
    assert!(index.insert(&key, loc(1, 0)).unwrap());
    assert!(index.delete(&key, loc(1, 0)).unwrap());
    engine.exit_epoch(epoch_b);

    let pending_before = engine.vitals().retirement.pending;
    assert!(pending_before > 0, "mutation retired nothing");

    // Two advances with A still inside: nothing may be freed.
    tick(&engine, 2);
    assert_eq!(engine.retirement().reclaim(), 0);
    assert_eq!(engine.vitals().retirement.pending, pending_before);

    // Even many more advances do not help while A holds its epoch.
    tick(&engine, 20);
    assert_eq!(engine.retirement().reclaim(), 0);

    // A exits; the tails pass its epoch and reclamation drains.
    engine.exit_epoch(held);
    tick(&engine, SAFETY_INTERVAL as usize * 2 + 1);

    assert_eq!(
        engine.retirement().reclaim() as u64,
        pending_before,
        "everything retired before the exit must free"
    );
    assert_eq!(engine.vitals().retirement.pending, 0);
}

#[test]
fn ring_overflow_keeps_tails_at_the_safety_distance() {
    let engine = manual_engine(16);

    // No readers at all: the head may lap the ring several times and
    // the tails must track it at exactly the safety interval.
    tick(&engine, 100);

    let marks = engine.vitals().epochs;
    assert!(marks.current_epoch > 16);
    assert_eq!(marks.queue_tail, marks.current_epoch - SAFETY_INTERVAL);
    assert_eq!(marks.reclaim_tail, marks.queue_tail - SAFETY_INTERVAL);
}

#[test]
fn read_only_transactions_pin_the_reclaim_tail_only() {
    let engine = manual_engine(64);
    tick(&engine, 10);

    let reader = engine.enter_read_only(5);
    let joined = engine.vitals().epochs.queue_tail;

    tick(&engine, 30);

    let marks = engine.vitals().epochs;
    // rw progress is unaffected...
    assert_eq!(marks.queue_tail, marks.current_epoch - SAFETY_INTERVAL);
    // ...but reclamation cannot pass the reader.
    assert_eq!(marks.reclaim_tail, joined);

    engine.exit_read_only(reader);
    tick(&engine, 3);
    assert!(engine.vitals().epochs.reclaim_tail > joined);
}

#[test]
fn cid_watermarks_feed_the_transaction_manager() {
    let engine = manual_engine(64);

    let epoch = engine.enter_epoch(17);
    engine.exit_epoch(epoch);

    tick(&engine, 5);

    assert_eq!(engine.read_only_cid(), 17);
    assert_eq!(engine.max_committed_cid(), 17);
}

#[test]
fn ticker_thread_drives_reclamation_end_to_end() {
    // Full engine with the real ticker: retire something, then wait for
    // the background thread to free it.
    let engine = Engine::start(EngineConfig {
        epoch_ring_size: 64,
        epoch_tick_ms: 1,
    });

    let epochs: &Arc<EpochManager> = engine.epochs();
    let retirement: &Arc<RetirementQueue> = engine.retirement();

    let epoch = epochs.enter_epoch(1);
    retirement.defer_drop(vec![0u8; 64]);
    epochs.exit_epoch(epoch);

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    while retirement.stats().pending > 0 {
        assert!(
            std::time::Instant::now() < deadline,
            "ticker never freed the retired allocation"
        );
        std::thread::sleep(std::time::Duration::from_millis(1));
    }

    engine.shutdown();
}

#[test]
fn dropped_index_memory_drains_through_the_shared_queue() {
    let engine = manual_engine(64);
    let loader = MapKeyLoader::new();

    let metadata = index_metadata(IndexShape::SkipList, int_varchar_schema(), false);
    let index: Arc<dyn RowIndex> = engine.build_index(metadata, Some(loader)).unwrap();
    let schema = index.metadata().key_schema().clone();

    for i in 0..100 {
        let key = int_varchar_key(&schema, i, "m");
        index.insert(&key, loc(i as u32, 0)).unwrap();
    }
    for i in 0..100 {
        let key = int_varchar_key(&schema, i, "m");
        index.delete(&key, loc(i as u32, 0)).unwrap();
    }

    assert!(index.scan_all(ScanDirection::Forward).unwrap().is_empty());
    engine.drop_index(index.metadata().index_oid).unwrap();

    tick(&engine, 10);
    let freed = engine.retirement().reclaim();
    assert!(freed > 0, "unlinked nodes never reached the queue");

    let vitals: EngineVitals = engine.vitals();
    assert_eq!(vitals.index_count, 0);
}
