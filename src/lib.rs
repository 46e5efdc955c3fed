//! leafhash - adaptive hash acceleration for B-tree point lookups
//!
//! An in-memory, self-tuning secondary index: the engine's B-tree descents
//! are observed, leaf pages whose searches show a stable key-prefix
//! signature get a hash index built over selected records, and later
//! equality lookups jump straight to a candidate record, re-validating it
//! against the page before trusting it.
//!
//! The crate bundles the minimal host the index needs to run for real: a
//! chunked buffer pool with stable page frames, a leaf-page record heap, a
//! small dictionary with index metadata, and a two-level tree harness that
//! drives descents, splits and deletes through the hash maintenance
//! callbacks.
//!
//! # Quick start
//!
//! ```rust,ignore
//! use leafhash::prelude::*;
//!
//! let engine = Engine::new(EngineConfig::default());
//! let table = engine.create_table("t");
//! let index = engine.create_index(&table, "pk", 1, vec![ColMeta::new(8, false)],
//!                                 RowFormat::Compact);
//! let tree = engine.create_tree(&index).unwrap();
//!
//! tree.insert(&Tuple::from_key(&42u64.to_be_bytes()));
//! let tuple = Tuple::from_key(&42u64.to_be_bytes());
//! let mut mtr = MiniTransaction::new();
//! let cursor = tree.search(&tuple, SearchMode::GreaterOrEqual,
//!                          LatchMode::SearchLeaf, &mut mtr);
//! ```

#![warn(missing_docs)]
#![allow(dead_code)]

pub mod config;
pub mod cursor;
pub mod dict;
pub mod engine;
pub mod fold;
pub mod mtr;
pub mod page;
pub mod pool;
pub mod record;
pub mod search;
pub mod stats;
pub mod status;
pub mod tree;
mod utility;

pub use cursor::Cursor;
pub use engine::Engine;
pub use mtr::MiniTransaction;
pub use record::Tuple;
pub use search::SearchSystem;
pub use status::{CursorFlag, LatchMode, SearchMode, Status};

/// Constants used throughout the library
pub mod constants {
    /// Size of one buffer-pool page frame in bytes
    pub const PAGE_SIZE: usize = 1 << 14;

    /// log2 of [`PAGE_SIZE`]
    pub const PAGE_SHIFT: u32 = 14;

    /// A page's hash index is built once the page-local helpfulness
    /// counter exceeds `n_recs / PAGE_BUILD_LIMIT`
    pub const PAGE_BUILD_LIMIT: u32 = 16;

    /// Consecutive potentially successful hash searches required before
    /// hash index building is started
    pub const BUILD_LIMIT: u32 = 100;

    /// Cap applied to the potential counter on the lookup path only
    pub const POTENTIAL_CAP: u32 = BUILD_LIMIT + 5;

    /// Upper bound on hash entries pointing into a single page frame
    pub const MAX_N_POINTERS: u32 = (PAGE_SIZE / 5) as u32;

    /// Cells validated per latch hold in the validator sweep
    pub const VALIDATE_CHUNK: usize = 10_000;
}

/// Prelude module for common imports
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::cursor::Cursor;
    pub use crate::dict::{ColMeta, IndexMeta, TableMeta};
    pub use crate::engine::Engine;
    pub use crate::mtr::MiniTransaction;
    pub use crate::record::{RowFormat, Tuple};
    pub use crate::search::SearchSystem;
    pub use crate::status::{CursorFlag, LatchMode, SearchMode, Status};
    pub use crate::tree::Tree;
}
