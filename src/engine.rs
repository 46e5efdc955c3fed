//! Engine: the buffer pool, dictionary and search system wired together
//!
//! There is no process-wide singleton; an [`Engine`] is an explicit
//! registry the caller owns and passes around, which keeps every piece
//! independently testable.

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::dict::{ColMeta, Dictionary, IndexMeta, TableMeta};
use crate::pool::BufferPool;
use crate::record::RowFormat;
use crate::search::SearchSystem;
use crate::tree::Tree;

/// A running engine instance
pub struct Engine {
    pool: Arc<BufferPool>,
    dict: Arc<Dictionary>,
    search: Arc<SearchSystem>,
}

impl Engine {
    /// Bring up an engine from its configuration
    pub fn new(config: EngineConfig) -> Self {
        let pool = Arc::new(BufferPool::new(config.buffer_pool_blocks));
        let dict = Arc::new(Dictionary::new());
        let search = Arc::new(SearchSystem::new());
        if config.adaptive_hash_enabled {
            search.enable(&pool, false);
        }
        Self { pool, dict, search }
    }

    /// The buffer pool
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// The dictionary
    pub fn dict(&self) -> &Arc<Dictionary> {
        &self.dict
    }

    /// The adaptive search system
    pub fn search(&self) -> &Arc<SearchSystem> {
        &self.search
    }

    /// Register a table
    pub fn create_table(&self, name: &str) -> Arc<TableMeta> {
        self.dict.create_table(name)
    }

    /// Register an index on `table`
    pub fn create_index(
        &self,
        table: &Arc<TableMeta>,
        name: &str,
        n_uniq: u16,
        cols: Vec<ColMeta>,
        row_format: RowFormat,
    ) -> Arc<IndexMeta> {
        self.dict.create_index(table, name, n_uniq, cols, row_format)
    }

    /// Materialize a tree for an index
    pub fn create_tree(&self, index: &Arc<IndexMeta>) -> Option<Tree> {
        Tree::create(self.pool.clone(), self.search.clone(), index.clone())
    }

    /// Detach an index from the catalog; pages still hashed for it keep
    /// the metadata alive until their hash is dropped
    pub fn drop_index(&self, index: &Arc<IndexMeta>) {
        self.dict.drop_index(index);
    }

    /// Tear down the search system at shutdown
    pub fn shutdown(&self) {
        self.search.free(&self.pool);
    }
}
