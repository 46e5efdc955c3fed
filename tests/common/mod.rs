#![allow(dead_code)]

use std::sync::Arc;

use leafhash::config::EngineConfig;
use leafhash::dict::{ColMeta, IndexMeta};
use leafhash::prelude::*;
use leafhash::record::RowFormat;

pub struct TestDb {
    pub engine: Engine,
    pub index: Arc<IndexMeta>,
    pub tree: Arc<Tree>,
}

/// Engine + single-column unique tree, the workhorse fixture
pub fn db(buffer_pool_blocks: usize, adaptive_hash_enabled: bool) -> TestDb {
    let engine = Engine::new(EngineConfig {
        buffer_pool_blocks,
        adaptive_hash_enabled,
    });
    let table = engine.create_table("t");
    let index = engine.create_index(
        &table,
        "pk",
        1,
        vec![ColMeta::new(8, false), ColMeta::new(16, true)],
        RowFormat::Compact,
    );
    let tree = Arc::new(engine.create_tree(&index).expect("pool can hold a root"));
    TestDb {
        engine,
        index,
        tree,
    }
}

/// Two-column fixture where the first column alone is the unique prefix
/// is NOT unique: n_uniq = 2
pub fn db_two_col(buffer_pool_blocks: usize) -> TestDb {
    let engine = Engine::new(EngineConfig {
        buffer_pool_blocks,
        adaptive_hash_enabled: true,
    });
    let table = engine.create_table("t2");
    let index = engine.create_index(
        &table,
        "pk",
        2,
        vec![ColMeta::new(8, false), ColMeta::new(8, false)],
        RowFormat::Compact,
    );
    let tree = Arc::new(engine.create_tree(&index).expect("pool can hold a root"));
    TestDb {
        engine,
        index,
        tree,
    }
}

pub fn row(k: u64) -> Tuple {
    Tuple::new(vec![
        Some(k.to_be_bytes().to_vec()),
        Some(format!("value-{k:08}").into_bytes()),
    ])
}

pub fn key(k: u64) -> Tuple {
    Tuple::new(vec![Some(k.to_be_bytes().to_vec())])
}

pub fn row2(a: u64, b: u64) -> Tuple {
    Tuple::new(vec![
        Some(a.to_be_bytes().to_vec()),
        Some(b.to_be_bytes().to_vec()),
    ])
}

pub fn expect_ok(ctx: &'static str, s: Status) {
    assert_eq!(s, Status::Ok, "{ctx} failed: {s}");
}

/// Drive point lookups until the page hash for `k` is built and the
/// success hint is set
pub fn warm(db: &TestDb, k: u64, iterations: usize) {
    for _ in 0..iterations {
        assert!(db.tree.get(&key(k)).is_some(), "warmup key {k} must exist");
    }
}
