//! Per-page hash build, teardown, and coherence across mutations

mod common;

use std::sync::atomic::{AtomicBool, Ordering};

use common::*;
use leafhash::prelude::*;

#[test]
fn test_collision_group_delete_keeps_coherence() {
    let db = db_two_col(32);
    // One collision group under signature (1, 0): three rows share the
    // first column; a fourth row stands alone
    for b in 1..=3u64 {
        expect_ok("insert", db.tree.insert(&row2(7, b)));
    }
    expect_ok("insert", db.tree.insert(&row2(9, 1)));

    let page_no = db.tree.leaf_pages()[0];
    let block = db.engine.pool().get_page(page_no).unwrap();
    block.lock_s();
    db.engine
        .search()
        .build_page_hash_index(db.engine.pool(), &db.index, block, 1, 0, true);
    unsafe { block.unlock_s() };
    assert_eq!(block.curr_sig(), (1, 0, true));

    // Two fold groups -> two entries
    #[cfg(debug_assertions)]
    assert_eq!(block.n_pointers.load(Ordering::Relaxed), 2);

    // Deleting the group's leftmost record (its representative) removes
    // exactly one entry
    expect_ok("delete", db.tree.delete(&row2(7, 1)));
    #[cfg(debug_assertions)]
    assert_eq!(block.n_pointers.load(Ordering::Relaxed), 1);

    // Survivors answer correctly; the group re-covers itself lazily
    assert!(db.tree.get(&row2(7, 2)).is_some());
    assert!(db.tree.get(&row2(7, 3)).is_some());
    assert!(db.tree.get(&row2(7, 1)).is_none());
    assert!(db.tree.get(&row2(9, 1)).is_some());

    // Emptying the group removes the remaining coverage without a trace
    expect_ok("delete", db.tree.delete(&row2(7, 2)));
    expect_ok("delete", db.tree.delete(&row2(7, 3)));
    assert!(db.tree.get(&row2(7, 2)).is_none());

    let kill = AtomicBool::new(false);
    assert!(db.engine.search().validate(db.engine.pool(), &kill));
}

#[test]
fn test_split_propagates_signature_and_entries() {
    let db = db(128, true);
    // Fill most of the root page, then warm a key so its hash is built
    for k in 0..500u64 {
        expect_ok("insert", db.tree.insert(&row(k)));
    }
    warm(&db, 100, 150);

    let src_no = db.tree.leaf_pages()[0];
    let src = db.engine.pool().get_page(src_no).unwrap();
    assert!(src.is_hashed(), "warmup must have built the page hash");
    let sig = src.curr_sig();
    assert_eq!(db.index.search_info.ref_count.load(Ordering::Relaxed), 1);

    // Keep inserting until the hashed page splits
    let mut k = 500u64;
    while db.tree.leaf_pages().len() == 1 {
        expect_ok("insert", db.tree.insert(&row(k)));
        k += 1;
        assert!(k < 2000, "split never happened");
    }

    let pages = db.tree.leaf_pages();
    assert_eq!(pages.len(), 2);
    let dst = db.engine.pool().get_page(pages[1]).unwrap();

    // The destination inherited the source signature and its own entries
    assert!(dst.is_hashed());
    assert_eq!(dst.curr_sig(), sig);
    assert!(src.is_hashed());
    assert_eq!(src.curr_sig(), sig);
    assert_eq!(db.index.search_info.ref_count.load(Ordering::Relaxed), 2);

    // Entries cover exactly the records now on each page: the moved
    // records' source entries are gone
    #[cfg(debug_assertions)]
    unsafe {
        use leafhash::page;
        let src_recs = page::n_recs(src.frame() as *const u8) as u32;
        let dst_recs = page::n_recs(dst.frame() as *const u8) as u32;
        assert_eq!(dst.n_pointers.load(Ordering::Relaxed), dst_recs);
        assert_eq!(src.n_pointers.load(Ordering::Relaxed), src_recs);
    }

    // Both halves keep answering
    for probe in (0..k).step_by(13) {
        assert!(db.tree.get(&key(probe)).is_some(), "row {probe} lost");
    }
    let kill = AtomicBool::new(false);
    assert!(db.engine.search().validate(db.engine.pool(), &kill));
}

#[test]
fn test_drop_page_hash_when_freed_via_page_number() {
    let db = db(64, true);
    for k in 0..200u64 {
        expect_ok("insert", db.tree.insert(&row(k)));
    }
    warm(&db, 50, 150);

    let page_no = db.tree.leaf_pages()[0];
    let block = db.engine.pool().get_page(page_no).unwrap();
    assert!(block.is_hashed());

    db.engine
        .search()
        .drop_page_hash_when_freed(db.engine.pool(), page_no);
    assert!(!block.is_hashed());
    assert_eq!(db.index.search_info.ref_count.load(Ordering::Relaxed), 0);
    assert!(!block.is_latched());

    // The tree keeps working and may re-learn the page
    assert!(db.tree.get(&key(50)).is_some());
}

#[test]
fn test_stats_track_build_and_drop_activity() {
    let db = db(64, true);
    for k in 0..300u64 {
        expect_ok("insert", db.tree.insert(&row(k)));
    }
    warm(&db, 10, 200);

    let snap = db.engine.search().stats.snapshot();
    assert!(snap.pages_added >= 1);
    assert!(snap.rows_added as usize >= 250);

    db.engine.search().disable(db.engine.pool(), db.engine.dict());
    let snap = db.engine.search().stats.snapshot();
    assert_eq!(snap.pages_removed, 0, "disable clears wholesale, not per page");
}
