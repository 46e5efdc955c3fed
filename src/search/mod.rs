//! The adaptive search system
//!
//! Observes tree descents through [`SearchSystem::search_info_update`],
//! learns a per-index prefix signature, builds per-page hash indexes once
//! a page has proven helpful, and serves
//! [`SearchSystem::guess_on_hash`] lookups that bypass the descent
//! entirely. Every answer the hash gives is revalidated against the
//! latched page; a wrong or stale entry costs one failed guess, never a
//! wrong result.
//!
//! Heuristic state (per-index recommendation, per-block candidate
//! signature) is deliberately unlatched; consumers re-verify under the
//! partition latch before mutating shared structures, or tolerate a
//! spurious miss.

mod partition;

pub use partition::{HashTable, Partition};

use std::cmp::Ordering as Ord2;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLockWriteGuard;
use tracing::{debug, error, info, warn};

use crate::constants::{BUILD_LIMIT, PAGE_BUILD_LIMIT, POTENTIAL_CAP, VALIDATE_CHUNK};
use crate::cursor::Cursor;
use crate::dict::{self, Dictionary, IndexMeta, SearchInfo};
use crate::fold::{fold_fields, fold_tuple};
use crate::mtr::MiniTransaction;
use crate::page::{self, page_align, RecStatus, NO_PAGE};
use crate::pool::{page_state, Block, BufferPool};
use crate::record::{cmp_with_match, pair_cmp, Tuple};
use crate::stats::SearchStats;
use crate::status::{CursorFlag, LatchMode, SearchMode};

type TableGuard<'a> = RwLockWriteGuard<'a, Option<HashTable>>;

/// Fold the record at `off` under the given signature.
///
/// # Safety
/// `page` must designate a live frame; `off` a record with at least
/// `n_fields + (n_bytes > 0)` fields.
unsafe fn fold_rec(
    index: &IndexMeta,
    page: *const u8,
    off: u16,
    n_fields: u16,
    n_bytes: u16,
) -> u32 {
    let fields = page::rec_fields(page, off);
    fold_fields(index, &fields, n_fields, n_bytes)
}

#[inline]
fn bump_potential(info: &SearchInfo) {
    let p = info.n_hash_potential.load(Ordering::Relaxed);
    info.n_hash_potential.store(p.saturating_add(1), Ordering::Relaxed);
}

/// Update the index recommendation from the match pairs of one descent.
///
/// None of the fields touched here are latched; concurrent updates may
/// interleave arbitrarily. The recommendation is only ever a hint.
fn info_update_hash(cursor: &Cursor) {
    let index = &cursor.index;
    let info = &index.search_info;
    let n_unique = index.n_uniq;

    if info.n_hash_potential.load(Ordering::Relaxed) != 0 {
        // Would the search have succeeded using the recommended prefix?
        if info.n_fields.load(Ordering::Relaxed) >= n_unique && cursor.up_match >= n_unique {
            bump_potential(info);
            return;
        }

        let left_side = info.left_side.load(Ordering::Relaxed);
        let nf = info.n_fields.load(Ordering::Relaxed);
        let nb = info.n_bytes.load(Ordering::Relaxed);
        let favored = |cmp: Ord2| {
            if left_side {
                cmp != Ord2::Greater
            } else {
                cmp == Ord2::Greater
            }
        };

        let cmp = pair_cmp(nf, nb, cursor.low_match, cursor.low_bytes);
        if !favored(cmp) {
            let cmp = pair_cmp(nf, nb, cursor.up_match, cursor.up_bytes);
            if favored(cmp) {
                bump_potential(info);
                return;
            }
        }
    }

    // Set a new recommendation; analysis restarts from scratch so a
    // transiently unstable pattern does not burn CPU
    info.hash_analysis_reset();

    let cmp = pair_cmp(
        cursor.up_match,
        cursor.up_bytes,
        cursor.low_match,
        cursor.low_bytes,
    );
    info.left_side.store(cmp != Ord2::Less, Ordering::Relaxed);
    match cmp {
        Ord2::Equal => {
            info.n_hash_potential.store(0, Ordering::Relaxed);
            info.n_fields.store(1, Ordering::Relaxed);
            info.n_bytes.store(0, Ordering::Relaxed);
        }
        Ord2::Greater => {
            info.n_hash_potential.store(1, Ordering::Relaxed);
            if cursor.up_match >= n_unique {
                info.n_fields.store(n_unique, Ordering::Relaxed);
                info.n_bytes.store(0, Ordering::Relaxed);
            } else if cursor.low_match < cursor.up_match {
                info.n_fields.store(cursor.low_match + 1, Ordering::Relaxed);
                info.n_bytes.store(0, Ordering::Relaxed);
            } else {
                info.n_fields.store(cursor.low_match, Ordering::Relaxed);
                info.n_bytes.store(cursor.low_bytes + 1, Ordering::Relaxed);
            }
        }
        Ord2::Less => {
            info.n_hash_potential.store(1, Ordering::Relaxed);
            if cursor.low_match >= n_unique {
                info.n_fields.store(n_unique, Ordering::Relaxed);
                info.n_bytes.store(0, Ordering::Relaxed);
            } else if cursor.low_match > cursor.up_match {
                info.n_fields.store(cursor.up_match + 1, Ordering::Relaxed);
                info.n_bytes.store(0, Ordering::Relaxed);
            } else {
                info.n_fields.store(cursor.up_match, Ordering::Relaxed);
                info.n_bytes.store(cursor.up_bytes + 1, Ordering::Relaxed);
            }
        }
    }
}

/// Update the block's helpfulness counter and candidate signature.
/// Returns whether building a (new) hash index on the block is
/// recommended.
fn update_block_hash_info(info: &SearchInfo, block: &Block) -> bool {
    debug_assert!(block.is_latched());
    info.last_hash_succ.store(false, Ordering::Relaxed);

    let rec = info.recommendation();
    let potential = info.n_hash_potential.load(Ordering::Relaxed);
    let helps = block.n_hash_helps.load(Ordering::Relaxed);

    if helps > 0 && potential > 0 && block.candidate_sig() == rec {
        if block.is_hashed() && block.curr_sig() == rec {
            // The search would presumably have succeeded using the hash
            info.last_hash_succ.store(true, Ordering::Relaxed);
        }
        block
            .n_hash_helps
            .store(helps.saturating_add(1), Ordering::Relaxed);
    } else {
        block.n_hash_helps.store(1, Ordering::Relaxed);
        block.n_fields.store(rec.0, Ordering::Relaxed);
        block.n_bytes.store(rec.1, Ordering::Relaxed);
        block.left_side.store(rec.2, Ordering::Relaxed);
    }

    let n_recs = unsafe { page::n_recs(block.frame() as *const u8) } as u32;
    let helps = block.n_hash_helps.load(Ordering::Relaxed);
    if helps > n_recs / PAGE_BUILD_LIMIT && potential >= BUILD_LIMIT {
        if !block.is_hashed() || helps > 2 * n_recs || block.candidate_sig() != block.curr_sig() {
            return true;
        }
    }
    false
}

/// Verify that a guessed cursor position is right.
///
/// Compares the tuple to the record under the cursor and, depending on the
/// mode, to the previous or next record, to confirm that the cursor truly
/// brackets the tuple. When `can_only_compare_to_cursor_rec` is set the
/// neighbors are off limits and an inconclusive comparison fails.
fn check_guess(
    cursor: &mut Cursor,
    can_only_compare_to_cursor_rec: bool,
    tuple: &Tuple,
    mode: SearchMode,
) -> bool {
    let n_unique = cursor.index.n_uniq as usize;
    let frame = page_align(cursor.rec);
    let off = page::offset_of(frame, cursor.rec);

    unsafe {
        if page::rec_status(frame, off) != RecStatus::Ordinary || !page::is_leaf(frame) {
            return false;
        }

        let fields = page::rec_fields(frame, off);
        let (cmp, m) = cmp_with_match(tuple, &fields, n_unique);

        match mode {
            SearchMode::GreaterOrEqual => {
                if cmp == Ord2::Greater {
                    return false;
                }
                cursor.up_match = m.fields;
                if (m.fields as usize) >= n_unique {
                    return true;
                }
            }
            SearchMode::LessOrEqual => {
                if cmp == Ord2::Less {
                    return false;
                }
                cursor.low_match = m.fields;
            }
            SearchMode::Greater => {
                if cmp != Ord2::Less {
                    return false;
                }
            }
            SearchMode::Less => {
                if cmp != Ord2::Greater {
                    return false;
                }
            }
        }

        if can_only_compare_to_cursor_rec {
            return false;
        }

        match mode {
            SearchMode::Greater | SearchMode::GreaterOrEqual => {
                let prev = page::rec_prev(frame, off);
                match page::rec_status(frame, prev) {
                    RecStatus::Infimum => return page::prev_page(frame) == NO_PAGE,
                    // The hidden metadata row precedes every user record
                    RecStatus::Metadata => return true,
                    _ => {}
                }
                let pfields = page::rec_fields(frame, prev);
                let (pcmp, _) = cmp_with_match(tuple, &pfields, n_unique);
                if mode == SearchMode::GreaterOrEqual {
                    pcmp == Ord2::Greater
                } else {
                    pcmp != Ord2::Less
                }
            }
            SearchMode::Less | SearchMode::LessOrEqual => {
                let next = page::rec_next(frame, off);
                if next == 0 {
                    return false;
                }
                if page::rec_status(frame, next) == RecStatus::Supremum {
                    if page::next_page(frame) == NO_PAGE {
                        cursor.up_match = 0;
                        return true;
                    }
                    return false;
                }
                let nfields = page::rec_fields(frame, next);
                let (ncmp, nm) = cmp_with_match(tuple, &nfields, n_unique);
                if mode == SearchMode::LessOrEqual {
                    cursor.up_match = nm.fields;
                    ncmp == Ord2::Less
                } else {
                    ncmp != Ord2::Greater
                }
            }
        }
    }
}

/// The adaptive hash index system
pub struct SearchSystem {
    enabled: AtomicBool,
    /// The single hash partition
    pub(crate) part: Partition,
    /// Opaque event sinks
    pub stats: SearchStats,
}

impl Default for SearchSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl SearchSystem {
    /// Create the search system with no table allocated and hashing off
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            part: Partition::new(),
            stats: SearchStats::default(),
        }
    }

    /// Whether adaptive hashing is currently on
    #[inline]
    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Allocate the hash table with an explicit cell-count request
    pub fn alloc(&self, hash_size: usize) {
        let mut guard = self.part.latch.write();
        *guard = Some(HashTable::new(hash_size));
    }

    /// Tear down all hash state at shutdown
    pub fn free(&self, pool: &BufferPool) {
        let mut guard = self.part.latch.write();
        self.enabled.store(false, Ordering::Release);
        if guard.is_some() {
            self.part.clear(&mut guard, pool);
        }
    }

    /// Number of hash cells, if the table is allocated
    pub fn n_cells(&self) -> Option<usize> {
        self.part.latch.read().as_ref().map(|t| t.n_cells())
    }

    /// Enable the adaptive hash system.
    ///
    /// `resize` marks the buffer-pool resizer as the caller; anyone else
    /// backs off while a pool resize is pending. Idempotent.
    pub fn enable(&self, pool: &BufferPool, resize: bool) {
        if !resize && pool.size_changed() {
            return;
        }
        let mut guard = self.part.latch.write();
        let hash_size = pool.curr_size_bytes() / std::mem::size_of::<*const u8>() / 64;
        if guard.is_some() {
            debug_assert!(self.enabled());
            return;
        }
        *guard = Some(HashTable::new(hash_size));
        self.enabled.store(true, Ordering::Release);
        info!(
            cells = guard.as_ref().map(|t| t.n_cells()).unwrap_or(0),
            "adaptive hash index enabled"
        );
    }

    /// Disable the adaptive hash system and empty the index.
    ///
    /// Freezes the dictionary, zeroes every index's page reference count,
    /// clears each block's hash state, and frees the table and slab.
    /// Idempotent and safe under traffic.
    pub fn disable(&self, pool: &BufferPool, dict: &Dictionary) {
        let freeze = dict.freeze();
        let mut guard = self.part.latch.write();
        if !self.enabled() {
            return;
        }
        self.enabled.store(false, Ordering::Release);

        // Clear every ref_count in the catalog
        for table in dict.tables() {
            for index in table.indexes.lock().iter() {
                index.search_info.ref_count.store(0, Ordering::Relaxed);
            }
            for index in table.freed_indexes.lock().iter() {
                index.search_info.ref_count.store(0, Ordering::Relaxed);
            }
        }
        drop(freeze);

        let garbage = pool.clear_hash_index();
        self.part.clear(&mut guard, pool);
        drop(guard);

        for index in &garbage {
            dict::lazy_free(index);
        }
        info!("adaptive hash index disabled");
    }

    fn guess_fail(&self, index: &IndexMeta, cursor: &mut Cursor) -> bool {
        cursor.flag = CursorFlag::HashFail;
        let info = &index.search_info;
        info.n_hash_fail.fetch_add(1, Ordering::Relaxed);
        // The success counter was bumped optimistically before the probe
        let succ = info.n_hash_succ.load(Ordering::Relaxed);
        if succ > 0 {
            info.n_hash_succ.store(succ - 1, Ordering::Relaxed);
        }
        info.last_hash_succ.store(false, Ordering::Relaxed);
        false
    }

    /// Try to position `cursor` by a hash lookup instead of a descent.
    ///
    /// On success the cursor is positioned on a revalidated record and the
    /// page latch is registered with `mtr`. On failure the caller falls
    /// back to the tree; the `HashFail` flag asks the following
    /// `search_info_update` to repair the stale entry.
    #[allow(clippy::too_many_arguments)]
    pub fn guess_on_hash(
        &self,
        pool: &BufferPool,
        index: &Arc<IndexMeta>,
        tuple: &Tuple,
        mode: SearchMode,
        latch_mode: LatchMode,
        cursor: &mut Cursor,
        mtr: &mut MiniTransaction,
    ) -> bool {
        debug_assert!(mtr.is_active());
        let info = &index.search_info;

        // Gate the hint before doing any work
        if latch_mode > LatchMode::ModifyLeaf
            || !info.last_hash_succ.load(Ordering::Relaxed)
            || info.n_hash_potential.load(Ordering::Relaxed) == 0
            || tuple.has_min_rec_flag()
        {
            return false;
        }

        cursor.n_fields = info.n_fields.load(Ordering::Relaxed);
        cursor.n_bytes = info.n_bytes.load(Ordering::Relaxed);
        let n_probe = cursor.probe_n_fields();
        if n_probe == 0 || (tuple.n_fields() as u16) < n_probe {
            return false;
        }

        let index_id = index.id;
        info.n_hash_succ.fetch_add(1, Ordering::Relaxed);

        let fold = fold_tuple(tuple, index, cursor.n_fields, cursor.n_bytes);
        cursor.fold = fold;
        cursor.flag = CursorFlag::Hash;

        let guard = self.part.latch.read();
        let (rec, got_latch) = {
            let Some(table) = guard.as_ref() else {
                drop(guard);
                return self.guess_fail(index, cursor);
            };
            if !self.enabled() {
                drop(guard);
                return self.guess_fail(index, cursor);
            }

            let rec = unsafe {
                let mut node = table.head(table.cell_index(fold));
                loop {
                    if node.is_null() {
                        break None;
                    }
                    if (*node).fold == fold {
                        break Some((*node).rec);
                    }
                    node = (*node).next;
                }
            };
            let Some(rec) = rec else {
                drop(guard);
                return self.guess_fail(index, cursor);
            };

            let block = pool.block_from_ptr(rec);
            // The page-hash latch protects the try-latch against a
            // concurrent relocation of the block
            let got = {
                let _page_hash = pool.page_hash_guard();
                match latch_mode {
                    LatchMode::SearchLeaf => block.try_lock_s(),
                    _ => block.try_lock_x(),
                }
            };
            (rec, got)
        };

        if !got_latch {
            drop(guard);
            return self.guess_fail(index, cursor);
        }

        let block = pool.block_from_ptr(rec);
        let unlatch = |block: &Block| unsafe {
            match latch_mode {
                LatchMode::SearchLeaf => block.unlock_s(),
                _ => block.unlock_x(),
            }
        };

        let state = block.state();
        if state < page_state::UNFIXED {
            debug_assert_eq!(state, page_state::REMOVE_HASH);
            unlatch(block);
            drop(guard);
            return self.guess_fail(index, cursor);
        }

        // An index that was dropped and re-created keeps its id; entries
        // of the freed incarnation must not serve the new one
        match block.ahi_index() {
            Some(block_index) => {
                if !Arc::ptr_eq(&block_index, index) && block_index.id == index_id {
                    debug_assert!(block_index.freed());
                    unlatch(block);
                    drop(guard);
                    return self.guess_fail(index, cursor);
                }
            }
            None => {
                unlatch(block);
                drop(guard);
                return self.guess_fail(index, cursor);
            }
        }

        block.fix();
        pool.make_young(block);
        drop(guard);

        pool.stat.n_page_gets.fetch_add(1, Ordering::Relaxed);
        mtr.memo_push(block, latch_mode);

        cursor.position(block, rec);

        // Revalidate within the latched page
        let page_ok = unsafe { page::index_id(block.frame() as *const u8) } == index_id;
        if !page_ok || !check_guess(cursor, false, tuple, mode) {
            mtr.release_last_page();
            return self.guess_fail(index, cursor);
        }

        let p = info.n_hash_potential.load(Ordering::Relaxed);
        if p < POTENTIAL_CAP {
            info.n_hash_potential.store(p + 1, Ordering::Relaxed);
        }
        info.last_hash_succ.store(true, Ordering::Relaxed);
        true
    }

    /// Feed the outcome of a tree descent into the heuristic; may build a
    /// page hash or repair a stale entry after a failed guess.
    pub fn search_info_update(&self, pool: &BufferPool, cursor: &Cursor) {
        debug_assert!(cursor.flag != CursorFlag::Hash);
        if !self.enabled() {
            return;
        }

        info_update_hash(cursor);
        let block = cursor.block();
        let build = update_block_hash_info(&cursor.index.search_info, block);

        if build || cursor.flag == CursorFlag::HashFail {
            self.part.prepare_insert(pool, &self.enabled);
        }
        if cursor.flag == CursorFlag::HashFail {
            self.update_hash_ref(pool, cursor);
        }
        if build {
            let (n_fields, n_bytes, left_side) = block.candidate_sig();
            self.build_page_hash_index(pool, &cursor.index, block, n_fields, n_bytes, left_side);
        }
    }

    /// Overwrite a stale hash entry after a guess failed on a page whose
    /// signature still matches the recommendation. Page-boundary effects
    /// and fold collisions leave misleading entries behind; this fixes
    /// them lazily.
    fn update_hash_ref(&self, pool: &BufferPool, cursor: &Cursor) {
        debug_assert_eq!(cursor.flag, CursorFlag::HashFail);
        let block = cursor.block();
        debug_assert!(block.is_latched());
        debug_assert!(std::ptr::eq(
            page_align(cursor.rec),
            block.frame() as *const u8
        ));

        let Some(index) = block.ahi_index() else {
            return;
        };
        if index.search_info.n_hash_potential.load(Ordering::Relaxed) == 0 {
            return;
        }
        if !Arc::ptr_eq(&index, &cursor.index) {
            debug_assert_eq!(index.id, cursor.index.id);
            self.drop_page_hash_index(pool, block, false);
            return;
        }

        let mut guard = self.part.latch.write();
        let still_ours = block
            .ahi_index()
            .map_or(false, |i| Arc::ptr_eq(&i, &index));
        let frame = block.frame() as *const u8;
        let off = cursor.rec_offset();
        let on_user_rec = unsafe { page::rec_status(frame, off) } == RecStatus::Ordinary;

        if still_ours
            && block.curr_sig() == index.search_info.recommendation()
            && on_user_rec
            && self.enabled()
        {
            if let Some(table) = guard.as_mut() {
                let (n_fields, n_bytes, _) = block.curr_sig();
                let fold = unsafe { fold_rec(&index, frame, off, n_fields, n_bytes) };
                if self.part.insert(table, fold, cursor.rec, block) {
                    self.stats.rows_added.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Build a hash index on a page under the given signature. An existing
    /// hash with a different signature is dropped first. The page must be
    /// latched (shared or exclusive).
    pub fn build_page_hash_index(
        &self,
        pool: &BufferPool,
        index: &Arc<IndexMeta>,
        block: &Block,
        n_fields: u16,
        n_bytes: u16,
        left_side: bool,
    ) {
        if !self.enabled() {
            return;
        }
        debug_assert!(block.is_latched());

        // Signature race pre-check under the shared latch
        let rebuild = {
            let guard = self.part.latch.read();
            if guard.is_none() || !self.enabled() {
                return;
            }
            block.is_hashed() && block.curr_sig() != (n_fields, n_bytes, left_side)
        };
        if rebuild {
            self.drop_page_hash_index(pool, block, false);
        }

        // The candidate values travel unlatched; check they make sense
        if n_fields == 0 && n_bytes == 0 {
            return;
        }
        if index.n_uniq < n_fields + u16::from(n_bytes > 0) {
            return;
        }

        let frame = block.frame() as *const u8;
        let mut n_recs = unsafe { page::n_recs(frame) };
        if n_recs == 0 {
            return;
        }
        debug_assert_eq!(unsafe { page::index_id(frame) }, index.id);

        // Fold all user records, emitting one representative per run of
        // equal folds: the leftmost on the left side, else the rightmost
        let mut folds: Vec<u32> = Vec::with_capacity(n_recs as usize);
        let mut offs: Vec<u16> = Vec::with_capacity(n_recs as usize);
        unsafe {
            let mut off = page::first_rec(frame);
            if off != 0 && page::rec_status(frame, off) == RecStatus::Metadata {
                off = page::rec_next(frame, off);
                n_recs -= 1;
                if n_recs == 0 {
                    return;
                }
            }
            if off == 0 || page::rec_status(frame, off) == RecStatus::Supremum {
                return;
            }

            let mut fold = fold_rec(index, frame, off, n_fields, n_bytes);
            if left_side {
                folds.push(fold);
                offs.push(off);
            }
            loop {
                let next = page::rec_next(frame, off);
                if next == 0 || page::rec_status(frame, next) == RecStatus::Supremum {
                    if !left_side {
                        folds.push(fold);
                        offs.push(off);
                    }
                    break;
                }
                let next_fold = fold_rec(index, frame, next, n_fields, n_bytes);
                if fold != next_fold {
                    if left_side {
                        folds.push(next_fold);
                        offs.push(next);
                    } else {
                        folds.push(fold);
                        offs.push(off);
                    }
                }
                off = next;
                fold = next_fold;
            }
        }

        self.part.prepare_insert(pool, &self.enabled);

        let mut guard = self.part.latch.write();
        if !self.enabled() {
            return;
        }
        let Some(table) = guard.as_mut() else {
            return;
        };

        // ref_count is decremented on every page drop and incremented
        // here; a rebuild of an already-hashed page must not double count
        if !block.is_hashed() {
            #[cfg(debug_assertions)]
            debug_assert_eq!(block.n_pointers.load(Ordering::Relaxed), 0);
            index.search_info.ref_count.fetch_add(1, Ordering::AcqRel);
        } else if block.curr_sig() != (n_fields, n_bytes, left_side) {
            // Raced against a concurrent builder with other parameters
            return;
        }

        block.n_hash_helps.store(0, Ordering::Relaxed);
        block.curr_n_fields.store(n_fields, Ordering::Relaxed);
        block.curr_n_bytes.store(n_bytes, Ordering::Relaxed);
        block.curr_left_side.store(left_side, Ordering::Relaxed);
        block.set_ahi_index(Some(index.clone()));

        let mut added = 0u64;
        for (fold, off) in folds.iter().zip(offs.iter()) {
            if self
                .part
                .insert(table, *fold, page::rec_ptr(frame, *off), block)
            {
                added += 1;
            }
        }

        self.stats.pages_added.fetch_add(1, Ordering::Relaxed);
        self.stats.add_rows(added);
        debug!(
            page = block.page_no(),
            index = index.id,
            entries = added,
            "built page hash index"
        );
    }

    /// Drop all hash entries pointing into a page.
    ///
    /// The block must be latched, unreachable (buffer-fix count zero), or
    /// already detached from the page map. With `garbage_collect` the drop
    /// only proceeds when the owning index is marked freed.
    pub fn drop_page_hash_index(&self, pool: &BufferPool, block: &Block, garbage_collect: bool) {
        'retry: loop {
            if !block.is_hashed() {
                return;
            }
            let frame = block.frame() as *const u8;
            let index_id = unsafe { page::index_id(frame) };
            debug_assert!(unsafe { page::is_leaf(frame) });

            // Snapshot the signature under the shared latch; a freed index
            // forces the exclusive latch so the lazy free cannot race
            let mut rd_guard = Some(self.part.latch.read());
            let Some(index) = block.ahi_index() else {
                return;
            };
            let mut wr_guard: Option<TableGuard<'_>> = None;
            if index.freed() {
                rd_guard = None;
                let wr = self.part.latch.write();
                if !block.ahi_index().map_or(false, |i| Arc::ptr_eq(&i, &index)) {
                    continue 'retry;
                }
                wr_guard = Some(wr);
            } else if garbage_collect {
                return;
            }
            if !self.enabled() {
                return;
            }
            debug_assert_eq!(index_id, index.id);

            let n_fields = block.curr_n_fields.load(Ordering::Relaxed);
            let n_bytes = block.curr_n_bytes.load(Ordering::Relaxed);
            // Block hash fields must not be read once the latch is gone
            drop(rd_guard);
            debug_assert!(n_fields > 0 || n_bytes > 0);

            let mut n_recs = unsafe { page::n_recs(frame) };
            if n_recs == 0 {
                warn!(page = block.page_no(), "hashed page without records");
                return;
            }

            // Fold every user record into a local array for fast deletion
            let mut folds: Vec<u32> = Vec::new();
            unsafe {
                let mut off = page::first_rec(frame);
                if off != 0 && page::rec_status(frame, off) == RecStatus::Metadata {
                    off = page::rec_next(frame, off);
                    n_recs -= 1;
                }
                folds.reserve(n_recs as usize);
                let mut prev_fold: u32 = 0;
                while off != 0
                    && page::rec_status(frame, off) != RecStatus::Supremum
                    && folds.len() < n_recs as usize
                {
                    let fold = fold_rec(&index, frame, off, n_fields, n_bytes);
                    if !(fold == prev_fold && prev_fold != 0) {
                        folds.push(fold);
                    }
                    prev_fold = fold;
                    off = page::rec_next(frame, off);
                }
            }

            let mut wr = match wr_guard.take() {
                Some(g) => g,
                None => {
                    let g = self.part.latch.write();
                    match block.ahi_index() {
                        // Someone else dropped the hash meanwhile
                        None => return,
                        Some(i) => debug_assert!(Arc::ptr_eq(&i, &index)),
                    }
                    g
                }
            };

            if block.curr_n_fields.load(Ordering::Relaxed) != n_fields
                || block.curr_n_bytes.load(Ordering::Relaxed) != n_bytes
            {
                // Someone rebuilt the page hash with other parameters
                drop(wr);
                continue 'retry;
            }

            let Some(table) = wr.as_mut() else {
                return;
            };
            let mut removed = 0u64;
            for fold in &folds {
                removed += self
                    .part
                    .remove_all_nodes_to_page(table, *fold, frame, pool);
            }

            let prev = index.search_info.ref_count.fetch_sub(1, Ordering::AcqRel);
            debug_assert!(prev != 0, "page hash ref_count underflow");
            if prev == 1 && index.freed() {
                dict::lazy_free(&index);
            }

            block.set_ahi_index(None);
            self.stats.pages_removed.fetch_add(1, Ordering::Relaxed);
            self.stats.remove_rows(removed);
            debug!(
                page = block.page_no(),
                index = index.id,
                entries = removed,
                "dropped page hash index"
            );
            return;
        }
    }

    /// Drop a page's hash entries when the page is evicted or its file
    /// extent is freed. Takes an exclusive peek latch on the page.
    pub fn drop_page_hash_when_freed(&self, pool: &BufferPool, page_no: u32) {
        let mut mtr = MiniTransaction::new();
        if let Some(block) = pool.get_page(page_no) {
            block.lock_x();
            block.fix();
            mtr.memo_push(block, LatchMode::ModifyLeaf);
            if block.is_hashed() {
                self.drop_page_hash_index(pool, block, false);
            }
        }
        mtr.commit();
    }

    fn lock_for_block<'a>(
        &'a self,
        guard: &mut Option<TableGuard<'a>>,
        block: &Block,
        index: &Arc<IndexMeta>,
    ) -> bool {
        if guard.is_none() {
            let g = self.part.latch.write();
            let alive = self.enabled()
                && g.is_some()
                && block.ahi_index().map_or(false, |i| Arc::ptr_eq(&i, index));
            *guard = Some(g);
            if !alive {
                return false;
            }
        }
        true
    }

    fn insert_locked(
        &self,
        guard: &mut Option<TableGuard<'_>>,
        fold: u32,
        rec: *const u8,
        block: &Block,
    ) {
        let table = guard
            .as_mut()
            .and_then(|g| g.as_mut())
            .expect("insert without table");
        if self.part.insert(table, fold, rec, block) {
            self.stats.rows_added.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Update the page hash after a record insert. The cursor is still
    /// positioned on the record the new one was inserted after; the page
    /// is exclusively latched.
    ///
    /// Folds the inserted record and its neighbors first and takes the
    /// write latch only when a group boundary actually moved.
    pub fn update_hash_on_insert(&self, pool: &BufferPool, cursor: &Cursor) {
        if !self.enabled() {
            return;
        }
        let block = cursor.block();
        debug_assert!(block.is_latched());
        let Some(index) = block.ahi_index() else {
            return;
        };
        if !Arc::ptr_eq(&index, &cursor.index) {
            debug_assert_eq!(index.id, cursor.index.id);
            self.drop_page_hash_index(pool, block, false);
            return;
        }

        let (n_fields, n_bytes, left_side) = block.curr_sig();
        let frame = block.frame() as *const u8;
        let rec_off = cursor.rec_offset();

        unsafe {
            let ins_off = page::rec_next(frame, rec_off);
            if ins_off == 0 {
                self.drop_page_hash_index(pool, block, false);
                return;
            }
            let next_off = page::rec_next(frame, ins_off);
            if next_off == 0 {
                self.drop_page_hash_index(pool, block, false);
                return;
            }

            let ins_fold = fold_rec(&index, frame, ins_off, n_fields, n_bytes);
            let next_is_supremum = page::rec_status(frame, next_off) == RecStatus::Supremum;
            let next_fold = if next_is_supremum {
                0
            } else {
                fold_rec(&index, frame, next_off, n_fields, n_bytes)
            };

            self.part.prepare_insert(pool, &self.enabled);

            let mut guard: Option<TableGuard<'_>> = None;
            let mut done = false;

            let status = page::rec_status(frame, rec_off);
            if status == RecStatus::Infimum || status == RecStatus::Metadata {
                // The inserted record became the leftmost user record
                if left_side {
                    if self.lock_for_block(&mut guard, block, &index) {
                        self.insert_locked(&mut guard, ins_fold, page::rec_ptr(frame, ins_off), block);
                    } else {
                        done = true;
                    }
                }
            } else {
                let fold = fold_rec(&index, frame, rec_off, n_fields, n_bytes);
                if fold != ins_fold {
                    if self.lock_for_block(&mut guard, block, &index) {
                        if left_side {
                            self.insert_locked(
                                &mut guard,
                                ins_fold,
                                page::rec_ptr(frame, ins_off),
                                block,
                            );
                        } else {
                            self.insert_locked(&mut guard, fold, page::rec_ptr(frame, rec_off), block);
                        }
                    } else {
                        done = true;
                    }
                }
            }

            if !done && next_is_supremum {
                // The inserted record became the rightmost user record
                if !left_side && self.lock_for_block(&mut guard, block, &index) {
                    self.insert_locked(&mut guard, ins_fold, page::rec_ptr(frame, ins_off), block);
                }
                done = true;
            }

            if !done && ins_fold != next_fold && self.lock_for_block(&mut guard, block, &index) {
                if left_side {
                    self.insert_locked(&mut guard, next_fold, page::rec_ptr(frame, next_off), block);
                } else {
                    self.insert_locked(&mut guard, ins_fold, page::rec_ptr(frame, ins_off), block);
                }
            }
        }
    }

    /// Fast path for an insert that directly follows a hash-resolved
    /// search: retarget the existing node to the new record when the fold
    /// parameters still match and grouping is right-side. Falls back to
    /// the general insert update otherwise.
    pub fn update_hash_node_on_insert(&self, pool: &BufferPool, cursor: &Cursor) {
        if !self.enabled() {
            return;
        }
        let block = cursor.block();
        debug_assert!(block.is_latched());
        let Some(index) = block.ahi_index() else {
            return;
        };
        if !Arc::ptr_eq(&index, &cursor.index) {
            debug_assert_eq!(index.id, cursor.index.id);
            self.drop_page_hash_index(pool, block, false);
            return;
        }

        let mut guard = self.part.latch.write();
        if !self.enabled()
            || guard.is_none()
            || !block.ahi_index().map_or(false, |i| Arc::ptr_eq(&i, &index))
        {
            return;
        }

        let (n_fields, n_bytes, left_side) = block.curr_sig();
        if cursor.flag == CursorFlag::Hash
            && cursor.n_fields == n_fields
            && cursor.n_bytes == n_bytes
            && !left_side
        {
            let frame = block.frame() as *const u8;
            let new_off = unsafe { page::rec_next(frame, cursor.rec_offset()) };
            if new_off == 0 {
                debug_assert!(false, "corrupted page");
                return;
            }
            let table = guard.as_mut().expect("checked above");
            if self.part.search_and_update_if_found(
                table,
                cursor.fold,
                cursor.rec,
                page::rec_ptr(frame, new_off),
                block,
            ) {
                self.stats.rows_updated.fetch_add(1, Ordering::Relaxed);
            }
        } else {
            drop(guard);
            self.update_hash_on_insert(pool, cursor);
        }
    }

    /// Erase the hash entry of a record about to be deleted. The cursor is
    /// positioned on the record; the page is exclusively latched. A
    /// missing entry is silently accepted.
    pub fn update_hash_on_delete(&self, pool: &BufferPool, cursor: &Cursor) {
        if !self.enabled() {
            return;
        }
        let block = cursor.block();
        debug_assert!(block.is_latched());
        let Some(index) = block.ahi_index() else {
            return;
        };
        if !Arc::ptr_eq(&index, &cursor.index) {
            self.drop_page_hash_index(pool, block, false);
            return;
        }

        let (n_fields, n_bytes, _) = block.curr_sig();
        debug_assert!(n_fields > 0 || n_bytes > 0);
        let frame = block.frame() as *const u8;
        let fold = unsafe { fold_rec(&index, frame, cursor.rec_offset(), n_fields, n_bytes) };

        let mut guard = self.part.latch.write();
        let mut freed = None;
        if self.enabled() && block.ahi_index().map_or(false, |i| Arc::ptr_eq(&i, &index)) {
            if let Some(table) = guard.as_mut() {
                let (found, f) = self.part.erase(table, fold, cursor.rec);
                freed = f;
                if found {
                    self.stats.rows_removed.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.stats
                        .rows_remove_not_found
                        .fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        drop(guard);
        // The emptied slab block goes back to the pool after the latch
        if let Some(b) = freed {
            pool.free_block(unsafe { b.as_ref() });
        }
    }

    /// Split/merge notification: move or delete hash entries for records
    /// copied from `block` to `new_block`. If the destination is already
    /// hashed the source hash is dropped; otherwise the source signature
    /// propagates and a hash is built on the destination. Both pages must
    /// be exclusively latched.
    pub fn move_or_delete_hash_entries(
        &self,
        pool: &BufferPool,
        new_block: &Block,
        block: &Block,
    ) {
        debug_assert!(block.is_latched());
        debug_assert!(new_block.is_latched());
        if !self.enabled() {
            return;
        }

        let index = match block.ahi_index() {
            Some(i) => {
                debug_assert!(new_block
                    .ahi_index()
                    .map_or(true, |ni| Arc::ptr_eq(&ni, &i)));
                Some(i)
            }
            None => new_block.ahi_index(),
        };

        if new_block.is_hashed() {
            self.drop_page_hash_index(pool, block, false);
            return;
        }
        let Some(index) = index else {
            return;
        };

        let sig = {
            let guard = self.part.latch.read();
            if guard.is_none() {
                return;
            }
            if index.freed() {
                drop(guard);
                self.drop_page_hash_index(pool, block, false);
                return;
            }
            if !block.is_hashed() {
                return;
            }
            let sig = block.curr_sig();
            // The destination inherits the source signature as candidate
            new_block.n_fields.store(sig.0, Ordering::Relaxed);
            new_block.n_bytes.store(sig.1, Ordering::Relaxed);
            new_block.left_side.store(sig.2, Ordering::Relaxed);
            sig
        };

        debug_assert!(sig.0 > 0 || sig.1 > 0);
        self.build_page_hash_index(pool, &index, new_block, sig.0, sig.1, sig.2);
    }

    /// Validate the hash structure: every node must reside in the cell
    /// its fold selects and carry the fold its record currently hashes to.
    /// Releases all latches and yields between chunks; `kill` aborts the
    /// sweep.
    pub fn validate(&self, pool: &BufferPool, kill: &AtomicBool) -> bool {
        let mut ok = true;
        let mut guard = self.part.latch.write();
        if guard.is_none() || !self.enabled() || kill.load(Ordering::Acquire) {
            return ok;
        }

        let mut cell_count = guard.as_ref().map(|t| t.n_cells()).unwrap_or(0);
        let mut i = 0usize;
        while i < cell_count {
            if i != 0 && i % VALIDATE_CHUNK == 0 {
                // Give other threads a chance to run
                drop(guard);
                std::thread::yield_now();
                guard = self.part.latch.write();
                if !self.enabled() || kill.load(Ordering::Acquire) {
                    return ok;
                }
                let Some(table) = guard.as_ref() else {
                    return ok;
                };
                cell_count = table.n_cells();
                if i >= cell_count {
                    break;
                }
            }

            let table = guard.as_ref().expect("validated above");
            unsafe {
                let mut node = table.head(i);
                while !node.is_null() {
                    if table.cell_index((*node).fold) != i {
                        error!(
                            fold = (*node).fold,
                            cell = i,
                            "hash node fold does not match its cell"
                        );
                        ok = false;
                    }

                    let block = pool.block_from_ptr((*node).rec);
                    match block.ahi_index() {
                        Some(index) => {
                            let (n_fields, n_bytes, _) = block.curr_sig();
                            let frame = block.frame() as *const u8;
                            let off = page::offset_of(frame, (*node).rec);
                            let fold = fold_rec(&index, frame, off, n_fields, n_bytes);
                            if fold != (*node).fold {
                                error!(
                                    page = block.page_no(),
                                    node_fold = (*node).fold,
                                    rec_fold = fold,
                                    "hash node fold does not match its record"
                                );
                                ok = false;
                            }
                        }
                        None => {
                            error!(
                                page = block.page_no(),
                                "hash node points into a page without hash state"
                            );
                            ok = false;
                        }
                    }
                    node = (*node).next;
                }
            }
            i += 1;
        }
        ok
    }
}
