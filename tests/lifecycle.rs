//! Enable/disable/resize and index-drop lifecycle, including under
//! concurrency

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::*;
use crossbeam::channel::bounded;
use leafhash::prelude::*;
use rand::{rngs::StdRng, Rng, SeedableRng};

#[test]
fn test_disable_enable_round_trip_repopulates() {
    let db = db(128, true);
    for k in 0..600u64 {
        expect_ok("insert", db.tree.insert(&row(k)));
    }
    warm(&db, 42, 200);
    assert!(db.index.search_info.ref_count.load(Ordering::Relaxed) >= 1);

    db.engine.search().disable(db.engine.pool(), db.engine.dict());
    assert_eq!(db.index.search_info.ref_count.load(Ordering::Relaxed), 0);

    // Traffic keeps working and, once re-enabled, rebuilds the hash
    // without touching tree contents
    db.engine.search().enable(db.engine.pool(), false);
    warm(&db, 42, 200);
    assert_eq!(db.index.search_info.ref_count.load(Ordering::Relaxed), 1);
    for k in (0..600u64).step_by(37) {
        assert!(db.tree.get(&key(k)).is_some());
    }
}

#[test]
fn test_concurrent_lookups_against_disable_enable() {
    let db = Arc::new(db(128, true));
    for k in 0..800u64 {
        expect_ok("insert", db.tree.insert(&row(k)));
    }
    warm(&db, 400, 200);

    let stop = Arc::new(AtomicBool::new(false));
    let (err_tx, err_rx) = bounded::<String>(16);

    let mut workers = Vec::new();
    for seed in 0..4u64 {
        let db = db.clone();
        let stop = stop.clone();
        let err_tx = err_tx.clone();
        workers.push(thread::spawn(move || {
            let mut rng = StdRng::seed_from_u64(seed);
            while !stop.load(Ordering::Acquire) {
                let k = rng.gen_range(0..800u64);
                if db.tree.get(&key(k)).is_none() {
                    let _ = err_tx.send(format!("row {k} vanished"));
                    return;
                }
                if db.tree.get(&key(800 + k)).is_some() {
                    let _ = err_tx.send(format!("phantom row {}", 800 + k));
                    return;
                }
            }
        }));
    }

    // Toggle the whole subsystem under the readers' feet. A reader
    // mid-guess either completes against the pre-disable state or fails
    // the hash and falls back to the tree; it must never misread.
    for _ in 0..10 {
        db.engine.search().disable(db.engine.pool(), db.engine.dict());
        thread::sleep(Duration::from_millis(5));
        db.engine.search().enable(db.engine.pool(), false);
        thread::sleep(Duration::from_millis(5));
    }

    stop.store(true, Ordering::Release);
    for w in workers {
        w.join().expect("reader thread panicked");
    }
    if let Ok(err) = err_rx.try_recv() {
        panic!("reader observed wrong data: {err}");
    }
    let kill = AtomicBool::new(false);
    assert!(db.engine.search().validate(db.engine.pool(), &kill));
}

#[test]
fn test_freed_index_metadata_released_by_last_page_drop() {
    let db = db(128, true);
    let table = db.index.table.upgrade().unwrap();
    // Grow to at least two leaves, then hash both directly
    let mut k = 0u64;
    while db.tree.leaf_pages().len() < 2 {
        expect_ok("insert", db.tree.insert(&row(k)));
        k += 1;
    }
    let pages = db.tree.leaf_pages();
    let pool = db.engine.pool();
    for no in &pages[..2] {
        let block = pool.get_page(*no).unwrap();
        block.lock_s();
        db.engine
            .search()
            .build_page_hash_index(pool, &db.index, block, 1, 0, true);
        unsafe { block.unlock_s() };
        assert!(block.is_hashed());
    }
    assert_eq!(db.index.search_info.ref_count.load(Ordering::Relaxed), 2);

    db.engine.drop_index(&db.index);
    assert!(db.index.freed());
    assert_eq!(table.freed_indexes.lock().len(), 1);

    // Lookups between the drops must not crash or misread
    assert!(db.tree.get(&key(0)).is_some());

    let b0 = pool.get_page(pages[0]).unwrap();
    db.engine.search().drop_page_hash_index(pool, b0, false);
    assert_eq!(
        table.freed_indexes.lock().len(),
        1,
        "metadata must survive while one page still references it"
    );
    assert!(db.tree.get(&key(1)).is_some());

    let b1 = pool.get_page(pages[1]).unwrap();
    db.engine.search().drop_page_hash_index(pool, b1, false);
    assert!(
        table.freed_indexes.lock().is_empty(),
        "last reference releases the metadata exactly once"
    );
    assert_eq!(db.index.search_info.ref_count.load(Ordering::Relaxed), 0);
}

#[test]
fn test_pool_resize_rebuilds_with_proportional_cells() {
    let db = db(256, true);
    for k in 0..500u64 {
        expect_ok("insert", db.tree.insert(&row(k)));
    }
    warm(&db, 99, 200);
    let cells_before = db.engine.search().n_cells().unwrap();
    assert!(db.index.search_info.ref_count.load(Ordering::Relaxed) >= 1);

    // Shrink: pending resize gates re-enablement to the resizer itself
    db.engine.pool().resize_begin(64);
    db.engine.search().disable(db.engine.pool(), db.engine.dict());
    db.engine.search().enable(db.engine.pool(), false);
    assert!(!db.engine.search().enabled(), "pending resize blocks enable");

    db.engine.pool().resize_commit();
    db.engine.search().enable(db.engine.pool(), true);
    assert!(db.engine.search().enabled());

    let cells_after = db.engine.search().n_cells().unwrap();
    assert!(
        cells_after < cells_before,
        "cells track pool size: {cells_after} vs {cells_before}"
    );

    // All prior entries are gone; traffic repopulates
    assert_eq!(db.index.search_info.ref_count.load(Ordering::Relaxed), 0);
    warm(&db, 99, 250);
    assert_eq!(db.index.search_info.ref_count.load(Ordering::Relaxed), 1);
}

#[test]
fn test_shutdown_after_heavy_traffic_releases_slab() {
    let db = db(128, true);
    for k in 0..700u64 {
        expect_ok("insert", db.tree.insert(&row(k)));
    }
    warm(&db, 1, 150);
    warm(&db, 699, 150);

    db.engine.shutdown();
    assert!(!db.engine.search().enabled());

    // Every borrowed slab block went back: the pool can hand out its
    // remaining capacity again
    let pool = db.engine.pool();
    let mut grabbed = Vec::new();
    while let Some(b) = pool.alloc_block() {
        grabbed.push(b);
    }
    let pages = db.tree.leaf_pages().len();
    assert_eq!(grabbed.len() + pages, pool.capacity());
    for b in grabbed {
        pool.free_block(b);
    }
}
