//! Minimal leaf-paged tree driving the adaptive search system
//!
//! Two levels: an in-memory routing table of (separator key, page number)
//! pairs over a chain of leaf pages. Enough tree to produce real descents
//! with bracketing match pairs, page splits, and record deletes, which is
//! exactly the surface the hash index integrates with.
//!
//! Searches try the hash shortcut first; a miss descends and reports the
//! outcome to the heuristic. Inserts split by moving the upper half of a
//! full page to a fresh one, routing the hash-entry move before erasing
//! the moved source records. Separator keys may go stale when their record
//! is deleted; a stale separator is a looser lower bound and never routes
//! a search wrong.

use std::cmp::Ordering as Ord2;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::cursor::{search_leaf_page, Cursor};
use crate::dict::IndexMeta;
use crate::mtr::MiniTransaction;
use crate::page::{self, RecStatus, INFIMUM, NO_PAGE};
use crate::pool::BufferPool;
use crate::record::{cmp_with_match, Tuple};
use crate::search::SearchSystem;
use crate::status::{LatchMode, SearchMode, Status};

/// A single-index tree over buffer-pool leaf pages
pub struct Tree {
    pool: Arc<BufferPool>,
    search: Arc<SearchSystem>,
    index: Arc<IndexMeta>,
    routing: RwLock<Vec<(Tuple, u32)>>,
}

fn cmp_to_key(tuple: &Tuple, key: &Tuple, n_cmp: usize) -> Ord2 {
    let fields: Vec<Option<&[u8]>> = key.iter().collect();
    cmp_with_match(tuple, &fields, n_cmp).0
}

impl Tree {
    /// Create a tree with one empty leaf page
    pub fn create(
        pool: Arc<BufferPool>,
        search: Arc<SearchSystem>,
        index: Arc<IndexMeta>,
    ) -> Option<Self> {
        let (page_no, _) = pool.create_page(index.id)?;
        // The first separator is an empty key: every tuple sorts at or
        // after it
        let routing = RwLock::new(vec![(Tuple::new(Vec::new()), page_no)]);
        Some(Self {
            pool,
            search,
            index,
            routing,
        })
    }

    /// The index this tree materializes
    pub fn index(&self) -> &Arc<IndexMeta> {
        &self.index
    }

    /// Page numbers of all leaves, left to right
    pub fn leaf_pages(&self) -> Vec<u32> {
        self.routing.read().iter().map(|(_, no)| *no).collect()
    }

    fn leaf_slot_for(&self, routing: &[(Tuple, u32)], tuple: &Tuple) -> usize {
        let n_cmp = self.index.n_uniq as usize;
        let mut chosen = 0;
        for (i, (key, _)) in routing.iter().enumerate().skip(1) {
            if cmp_to_key(tuple, key, n_cmp) != Ord2::Less {
                chosen = i;
            } else {
                break;
            }
        }
        chosen
    }

    /// Latch the leaf a tuple routes to and position within it
    fn descend(
        &self,
        tuple: &Tuple,
        mode: SearchMode,
        latch_mode: LatchMode,
        cursor: &mut Cursor,
        mtr: &mut MiniTransaction,
    ) {
        let routing = self.routing.read();
        let slot = self.leaf_slot_for(&routing, tuple);
        let page_no = routing[slot].1;
        let block = self
            .pool
            .get_page(page_no)
            .expect("routing references a live page");
        match latch_mode {
            LatchMode::SearchLeaf => block.lock_s(),
            _ => block.lock_x(),
        }
        block.fix();
        mtr.memo_push(block, latch_mode);
        drop(routing);

        self.pool
            .stat
            .n_page_gets
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let pos = unsafe { search_leaf_page(block.frame() as *const u8, &self.index, tuple, mode) };
        cursor.position(block, page::rec_ptr(block.frame(), pos.rec_off));
        cursor.low_match = pos.low.fields;
        cursor.low_bytes = pos.low.bytes;
        cursor.up_match = pos.up.fields;
        cursor.up_bytes = pos.up.bytes;
    }

    /// Position a cursor on the tuple, hash shortcut first, tree descent
    /// as fallback. The landed page stays latched through `mtr`.
    pub fn search(
        &self,
        tuple: &Tuple,
        mode: SearchMode,
        latch_mode: LatchMode,
        mtr: &mut MiniTransaction,
    ) -> Cursor {
        let mut cursor = Cursor::new(self.index.clone());
        if self
            .search
            .guess_on_hash(&self.pool, &self.index, tuple, mode, latch_mode, &mut cursor, mtr)
        {
            return cursor;
        }
        self.descend(tuple, mode, latch_mode, &mut cursor, mtr);
        self.search.search_info_update(&self.pool, &cursor);
        cursor
    }

    fn is_duplicate(&self, cursor: &Cursor, tuple: &Tuple) -> bool {
        let block = cursor.block();
        let off = cursor.rec_offset();
        unsafe {
            if page::rec_status(block.frame() as *const u8, off) != RecStatus::Ordinary {
                return false;
            }
            let fields = page::rec_fields(block.frame() as *const u8, off);
            cmp_with_match(tuple, &fields, self.index.n_uniq as usize).0 == Ord2::Equal
        }
    }

    /// Insert a full row. Returns [`Status::KeyExists`] for a duplicate
    /// unique prefix.
    pub fn insert(&self, tuple: &Tuple) -> Status {
        debug_assert_eq!(tuple.n_fields(), self.index.cols.len());
        let mut mtr = MiniTransaction::new();
        let mut cursor = Cursor::new(self.index.clone());
        if !self.search.guess_on_hash(
            &self.pool,
            &self.index,
            tuple,
            SearchMode::LessOrEqual,
            LatchMode::ModifyLeaf,
            &mut cursor,
            &mut mtr,
        ) {
            self.descend(
                tuple,
                SearchMode::LessOrEqual,
                LatchMode::ModifyLeaf,
                &mut cursor,
                &mut mtr,
            );
            self.search.search_info_update(&self.pool, &cursor);
        }

        if self.is_duplicate(&cursor, tuple) {
            return Status::KeyExists;
        }

        let block = cursor.block();
        let fields: Vec<Option<&[u8]>> = tuple.iter().collect();
        let inserted = unsafe {
            page::insert_after(
                block.frame(),
                cursor.rec_offset(),
                &fields,
                RecStatus::Ordinary,
            )
        };
        if inserted.is_some() {
            self.search.update_hash_node_on_insert(&self.pool, &cursor);
            return Status::Ok;
        }

        // Page full: release everything and retry under the routing
        // write lock
        mtr.commit();
        drop(cursor);
        self.insert_with_split(tuple)
    }

    fn insert_with_split(&self, tuple: &Tuple) -> Status {
        let mut routing = self.routing.write();
        let mut mtr = MiniTransaction::new();

        let slot = self.leaf_slot_for(&routing, tuple);
        let page_no = routing[slot].1;
        let block = self
            .pool
            .get_page(page_no)
            .expect("routing references a live page");
        block.lock_x();
        block.fix();
        mtr.memo_push(block, LatchMode::ModifyLeaf);

        let frame = block.frame();
        let pos = unsafe { search_leaf_page(frame as *const u8, &self.index, tuple, SearchMode::LessOrEqual) };
        let mut cursor = Cursor::new(self.index.clone());
        cursor.position(block, page::rec_ptr(frame, pos.rec_off));
        if self.is_duplicate(&cursor, tuple) {
            return Status::KeyExists;
        }

        let fields: Vec<Option<&[u8]>> = tuple.iter().collect();
        // A concurrent split may have made room since we released
        if unsafe { page::insert_after(frame, pos.rec_off, &fields, RecStatus::Ordinary) }
            .is_some()
        {
            self.search.update_hash_on_insert(&self.pool, &cursor);
            return Status::Ok;
        }
        drop(cursor);

        let offs = unsafe { page::user_rec_offsets(frame) };
        if offs.len() < 2 {
            return Status::OutOfMemory;
        }
        let mid = offs.len() / 2;

        let Some((new_no, new_block)) = self.pool.create_page(self.index.id) else {
            return Status::OutOfMemory;
        };
        new_block.lock_x();
        new_block.fix();
        mtr.memo_push(new_block, LatchMode::ModifyLeaf);

        unsafe {
            // Copy the upper half to the new page
            let mut prev = INFIMUM;
            for off in &offs[mid..] {
                let rec_fields = page::rec_fields(frame, *off);
                prev = page::insert_after(new_block.frame(), prev, &rec_fields, RecStatus::Ordinary)
                    .expect("fresh page holds half a page");
            }
            // Stitch the leaf chain
            let old_next = page::next_page(frame);
            page::set_next_page(frame, new_no);
            page::set_prev_page(new_block.frame(), page_no);
            page::set_next_page(new_block.frame(), old_next);
            if old_next != NO_PAGE {
                if let Some(right) = self.pool.get_page(old_next) {
                    page::set_prev_page(right.frame(), new_no);
                }
            }
        }

        // Hash maintenance: the destination inherits the signature, then
        // the moved source records lose their entries
        self.search
            .move_or_delete_hash_entries(&self.pool, new_block, block);
        unsafe {
            for off in &offs[mid..] {
                let mut moved = Cursor::new(self.index.clone());
                moved.position(block, page::rec_ptr(frame, *off));
                self.search.update_hash_on_delete(&self.pool, &moved);
                page::unlink(frame, *off);
            }
        }

        let first_fields = unsafe {
            page::rec_fields(
                new_block.frame() as *const u8,
                page::first_rec(new_block.frame() as *const u8),
            )
        };
        let separator = Tuple::new(
            first_fields
                .iter()
                .map(|f| f.map(|b| b.to_vec()))
                .collect(),
        );
        tracing::debug!(
            from = page_no,
            to = new_no,
            moved = offs.len() - mid,
            "split leaf page"
        );
        let goes_right = cmp_to_key(tuple, &separator, self.index.n_uniq as usize) != Ord2::Less;
        routing.insert(slot + 1, (separator, new_no));

        let target = if goes_right { new_block } else { block };
        let pos = unsafe {
            search_leaf_page(
                target.frame() as *const u8,
                &self.index,
                tuple,
                SearchMode::LessOrEqual,
            )
        };
        let inserted =
            unsafe { page::insert_after(target.frame(), pos.rec_off, &fields, RecStatus::Ordinary) };
        if inserted.is_none() {
            // A single row larger than half a page
            return Status::OutOfMemory;
        }
        let mut cursor = Cursor::new(self.index.clone());
        cursor.position(target, page::rec_ptr(target.frame(), pos.rec_off));
        self.search.update_hash_on_insert(&self.pool, &cursor);
        Status::Ok
    }

    /// Delete the row matching the tuple's unique prefix
    pub fn delete(&self, tuple: &Tuple) -> Status {
        let mut mtr = MiniTransaction::new();
        let mut cursor = Cursor::new(self.index.clone());
        if !self.search.guess_on_hash(
            &self.pool,
            &self.index,
            tuple,
            SearchMode::LessOrEqual,
            LatchMode::ModifyLeaf,
            &mut cursor,
            &mut mtr,
        ) {
            self.descend(
                tuple,
                SearchMode::LessOrEqual,
                LatchMode::ModifyLeaf,
                &mut cursor,
                &mut mtr,
            );
            self.search.search_info_update(&self.pool, &cursor);
        }

        if !self.is_duplicate(&cursor, tuple) {
            return Status::NotFound;
        }
        let block = cursor.block();
        self.search.update_hash_on_delete(&self.pool, &cursor);
        unsafe {
            page::unlink(block.frame(), cursor.rec_offset());
        }
        Status::Ok
    }

    /// Fetch the full row for an exact key, or `None`
    pub fn get(&self, tuple: &Tuple) -> Option<Vec<Option<Vec<u8>>>> {
        let mut mtr = MiniTransaction::new();
        let cursor = self.search(
            tuple,
            SearchMode::GreaterOrEqual,
            LatchMode::SearchLeaf,
            &mut mtr,
        );
        let block = cursor.block();
        let off = cursor.rec_offset();
        unsafe {
            if page::rec_status(block.frame() as *const u8, off) != RecStatus::Ordinary {
                return None;
            }
            let fields = page::rec_fields(block.frame() as *const u8, off);
            if cmp_with_match(tuple, &fields, self.index.n_uniq as usize).0 != Ord2::Equal {
                return None;
            }
            Some(fields.iter().map(|f| f.map(|b| b.to_vec())).collect())
        }
    }

    /// Number of user rows across all leaves
    pub fn count(&self) -> usize {
        let routing = self.routing.read();
        let mut total = 0;
        for (_, page_no) in routing.iter() {
            if let Some(block) = self.pool.get_page(*page_no) {
                block.lock_s();
                total += unsafe { page::n_recs(block.frame() as *const u8) } as usize;
                unsafe { block.unlock_s() };
            }
        }
        total
    }
}
