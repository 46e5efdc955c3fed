//! Dictionary: table and index metadata consumed by the search system
//!
//! The dictionary is deliberately small: the search system needs an index
//! iterator for the disable-time catalog scan, a per-index search-info
//! block, a `freed` flag with the lazy-free protocol, and a freeze latch
//! that holds the catalog stable while reference counts are being zeroed.
//!
//! None of the search-info fields are latched; they are relaxed atomics
//! that readers may observe torn as a pair. Every consumer either
//! re-verifies under the partition latch before mutating shared state or
//! tolerates a spurious miss.

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock, RwLockReadGuard};

use crate::record::RowFormat;

/// Per-column metadata the fold function needs
#[derive(Debug, Clone, Copy)]
pub struct ColMeta {
    /// Fixed length of the column, also the size of the zeroed NULL
    /// placeholder in the redundant row format
    pub fixed_len: u16,
    /// Whether the column accepts NULL
    pub nullable: bool,
}

impl ColMeta {
    /// Create a column description
    pub fn new(fixed_len: u16, nullable: bool) -> Self {
        Self { fixed_len, nullable }
    }
}

/// Search heuristic state of one index.
///
/// All fields are advisory. `ref_count` is the exception: it counts leaf
/// pages currently carrying a hash built for this index and is kept exact
/// under the partition latch.
#[derive(Debug, Default)]
pub struct SearchInfo {
    /// Recommended number of complete fields to fold
    pub n_fields: AtomicU16,
    /// Recommended number of bytes of the next field to fold
    pub n_bytes: AtomicU16,
    /// Whether the leftmost record of a fold group represents it
    pub left_side: AtomicBool,
    /// Consecutive descents the recommendation would have served
    pub n_hash_potential: AtomicU32,
    /// Hint that the next lookup should try the hash first
    pub last_hash_succ: AtomicBool,
    /// Number of leaf pages carrying a hash built for this index
    pub ref_count: AtomicU32,
    /// Successful hash lookups (optimistically counted)
    pub n_hash_succ: AtomicU64,
    /// Failed hash lookups
    pub n_hash_fail: AtomicU64,
}

impl SearchInfo {
    /// Zero the recommendation while a new one is being formed
    pub fn hash_analysis_reset(&self) {
        self.n_fields.store(0, Ordering::Relaxed);
        self.n_bytes.store(0, Ordering::Relaxed);
    }

    /// Snapshot of the recommendation (may be torn; advisory only)
    pub fn recommendation(&self) -> (u16, u16, bool) {
        (
            self.n_fields.load(Ordering::Relaxed),
            self.n_bytes.load(Ordering::Relaxed),
            self.left_side.load(Ordering::Relaxed),
        )
    }
}

/// Metadata of one B-tree index
#[derive(Debug)]
pub struct IndexMeta {
    /// Stable index id, folded into every hash value
    pub id: u64,
    /// Index name, for diagnostics only
    pub name: String,
    /// Owning table
    pub table: Weak<TableMeta>,
    /// Number of fields that make a key unique in the tree
    pub n_uniq: u16,
    /// Key columns in index order
    pub cols: Vec<ColMeta>,
    /// Row format of the owning table
    pub row_format: RowFormat,
    /// Adaptive search state
    pub search_info: SearchInfo,
    freed: AtomicBool,
}

impl IndexMeta {
    pub(crate) fn new(
        id: u64,
        name: &str,
        table: &Arc<TableMeta>,
        n_uniq: u16,
        cols: Vec<ColMeta>,
        row_format: RowFormat,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: name.to_owned(),
            table: Arc::downgrade(table),
            n_uniq,
            cols,
            row_format,
            search_info: SearchInfo::default(),
            freed: AtomicBool::new(false),
        })
    }

    /// Whether the index metadata has been detached from the catalog and
    /// awaits its last hash reference before being destroyed
    #[inline]
    pub fn freed(&self) -> bool {
        self.freed.load(Ordering::Acquire)
    }

    pub(crate) fn set_freed(&self) {
        self.freed.store(true, Ordering::Release);
    }
}

/// Metadata of one table
#[derive(Debug)]
pub struct TableMeta {
    /// Stable table id
    pub id: u64,
    /// Table name
    pub name: String,
    /// Live indexes
    pub indexes: Mutex<Vec<Arc<IndexMeta>>>,
    /// Indexes detached from the catalog but still referenced by hash
    /// entries on some page
    pub freed_indexes: Mutex<Vec<Arc<IndexMeta>>>,
}

impl TableMeta {
    fn new(id: u64, name: &str) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: name.to_owned(),
            indexes: Mutex::new(Vec::new()),
            freed_indexes: Mutex::new(Vec::new()),
        })
    }
}

/// The catalog: a registry of tables plus the freeze latch
#[derive(Debug)]
pub struct Dictionary {
    latch: RwLock<()>,
    tables: Mutex<Vec<Arc<TableMeta>>>,
    next_table_id: AtomicU64,
    next_index_id: AtomicU64,
}

impl Default for Dictionary {
    fn default() -> Self {
        Self::new()
    }
}

impl Dictionary {
    /// Create an empty dictionary
    pub fn new() -> Self {
        Self {
            latch: RwLock::new(()),
            tables: Mutex::new(Vec::new()),
            next_table_id: AtomicU64::new(1),
            next_index_id: AtomicU64::new(1),
        }
    }

    /// Freeze the catalog: no index may be added or dropped while the
    /// returned guard lives. Multiple freezers may coexist.
    pub fn freeze(&self) -> RwLockReadGuard<'_, ()> {
        self.latch.read()
    }

    /// Register a new table
    pub fn create_table(&self, name: &str) -> Arc<TableMeta> {
        let _x = self.latch.write();
        let table = TableMeta::new(self.next_table_id.fetch_add(1, Ordering::Relaxed), name);
        self.tables.lock().push(table.clone());
        table
    }

    /// Register a new index on `table`
    pub fn create_index(
        &self,
        table: &Arc<TableMeta>,
        name: &str,
        n_uniq: u16,
        cols: Vec<ColMeta>,
        row_format: RowFormat,
    ) -> Arc<IndexMeta> {
        let _x = self.latch.write();
        let index = IndexMeta::new(
            self.next_index_id.fetch_add(1, Ordering::Relaxed),
            name,
            table,
            n_uniq,
            cols,
            row_format,
        );
        table.indexes.lock().push(index.clone());
        index
    }

    /// Detach an index from the catalog. While hash entries still
    /// reference it the metadata lingers on the table's freed list; the
    /// last dropped page reference releases it via [`lazy_free`].
    pub fn drop_index(&self, index: &Arc<IndexMeta>) {
        let _x = self.latch.write();
        index.set_freed();
        if let Some(table) = index.table.upgrade() {
            let mut live = table.indexes.lock();
            if let Some(pos) = live.iter().position(|i| Arc::ptr_eq(i, index)) {
                let detached = live.remove(pos);
                table.freed_indexes.lock().push(detached);
            }
        }
    }

    /// Snapshot the table list
    pub fn tables(&self) -> Vec<Arc<TableMeta>> {
        self.tables.lock().clone()
    }
}

/// Release detached index metadata once its last hash reference is gone.
///
/// Unlinks the index from its table's freed list; dropping that strong
/// reference is what destroys the metadata. Idempotent against races: a
/// second caller finds the list entry already gone.
pub fn lazy_free(index: &Arc<IndexMeta>) {
    debug_assert!(index.freed());
    let Some(table) = index.table.upgrade() else {
        return;
    };
    let mut freed = table.freed_indexes.lock();
    if let Some(pos) = freed.iter().position(|i| Arc::ptr_eq(i, index)) {
        freed.remove(pos);
        tracing::debug!(index = index.id, "released detached index metadata");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dict_with_index() -> (Dictionary, Arc<TableMeta>, Arc<IndexMeta>) {
        let dict = Dictionary::new();
        let table = dict.create_table("t");
        let index = dict.create_index(
            &table,
            "pk",
            1,
            vec![ColMeta::new(8, false)],
            RowFormat::Compact,
        );
        (dict, table, index)
    }

    #[test]
    fn test_create_and_list() {
        let (dict, table, index) = dict_with_index();
        assert_eq!(dict.tables().len(), 1);
        assert_eq!(table.indexes.lock().len(), 1);
        assert!(!index.freed());
        assert!(Arc::ptr_eq(&index.table.upgrade().unwrap(), &table));
    }

    #[test]
    fn test_drop_index_moves_to_freed_list() {
        let (dict, table, index) = dict_with_index();
        dict.drop_index(&index);
        assert!(index.freed());
        assert!(table.indexes.lock().is_empty());
        assert_eq!(table.freed_indexes.lock().len(), 1);
    }

    #[test]
    fn test_lazy_free_is_idempotent() {
        let (dict, table, index) = dict_with_index();
        dict.drop_index(&index);
        lazy_free(&index);
        assert!(table.freed_indexes.lock().is_empty());
        lazy_free(&index);
        assert!(table.freed_indexes.lock().is_empty());
    }

    #[test]
    fn test_search_info_reset() {
        let info = SearchInfo::default();
        info.n_fields.store(3, Ordering::Relaxed);
        info.n_bytes.store(4, Ordering::Relaxed);
        info.hash_analysis_reset();
        assert_eq!(info.recommendation(), (0, 0, false));
    }
}
