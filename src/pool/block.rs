//! Buffer-pool block: one page frame plus its control state
//!
//! A block is either a data page (owned by the pool, addressed through the
//! page map) or a slab page borrowed by a hash partition; the partition
//! keeps its own side bookkeeping for the latter, so the two roles never
//! alias inside the block itself.
//!
//! The adaptive-hash fields fall into two groups. The candidate signature
//! and `n_hash_helps` are unlatched relaxed atomics that any descent may
//! update; readers tolerate torn pairs. The current (materialized)
//! signature and the owning index are written only under the partition's
//! exclusive latch and read under at least its shared latch.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::lock_api::RawRwLock as RawRwLockApi;
use parking_lot::{Mutex, RawRwLock};

use crate::dict::IndexMeta;

/// Page state constants, ordered so that `>= UNFIXED` means the page is
/// live in the pool. The low bits above [`page_state::UNFIXED`] count
/// buffer fixes.
pub mod page_state {
    /// Block sits on the free list
    pub const NOT_USED: u32 = 0;
    /// Block was handed out as plain memory (hash partition slab)
    pub const MEMORY: u32 = 1;
    /// Page was detached from the page map and awaits hash teardown
    pub const REMOVE_HASH: u32 = 2;
    /// Page is live; state minus this base is the buffer-fix count
    pub const UNFIXED: u32 = 8;
}

/// One buffer-pool block
pub struct Block {
    frame: NonNull<u8>,
    page_no: AtomicU32,
    state: AtomicU32,
    pub(crate) latch: RawRwLock,

    /// Candidate prefix length seen by recent descents
    pub n_fields: AtomicU16,
    /// Candidate byte count seen by recent descents
    pub n_bytes: AtomicU16,
    /// Candidate side seen by recent descents
    pub left_side: AtomicBool,
    /// Descents on this page that agreed with the index recommendation
    pub n_hash_helps: AtomicU32,

    /// Materialized prefix length, valid while `index` is set
    pub curr_n_fields: AtomicU16,
    /// Materialized byte count, valid while `index` is set
    pub curr_n_bytes: AtomicU16,
    /// Materialized side, valid while `index` is set
    pub curr_left_side: AtomicBool,

    index: Mutex<Option<Arc<IndexMeta>>>,

    /// Exact count of hash entries pointing into this frame
    #[cfg(debug_assertions)]
    pub n_pointers: AtomicU32,
}

impl Block {
    pub(crate) fn new(frame: NonNull<u8>) -> Self {
        Self {
            frame,
            page_no: AtomicU32::new(crate::page::NO_PAGE),
            state: AtomicU32::new(page_state::NOT_USED),
            latch: <RawRwLock as RawRwLockApi>::INIT,
            n_fields: AtomicU16::new(0),
            n_bytes: AtomicU16::new(0),
            left_side: AtomicBool::new(false),
            n_hash_helps: AtomicU32::new(0),
            curr_n_fields: AtomicU16::new(0),
            curr_n_bytes: AtomicU16::new(0),
            curr_left_side: AtomicBool::new(false),
            index: Mutex::new(None),
            #[cfg(debug_assertions)]
            n_pointers: AtomicU32::new(0),
        }
    }

    /// Base pointer of the page frame
    #[inline]
    pub fn frame(&self) -> *mut u8 {
        self.frame.as_ptr()
    }

    /// Page number while the block is a data page
    #[inline]
    pub fn page_no(&self) -> u32 {
        self.page_no.load(Ordering::Acquire)
    }

    pub(crate) fn set_page_no(&self, no: u32) {
        self.page_no.store(no, Ordering::Release);
    }

    /// Current page state word
    #[inline]
    pub fn state(&self) -> u32 {
        self.state.load(Ordering::Acquire)
    }

    pub(crate) fn set_state(&self, s: u32) {
        self.state.store(s, Ordering::Release);
    }

    /// Buffer-fix the page, pinning it in the pool
    #[inline]
    pub fn fix(&self) {
        let prev = self.state.fetch_add(1, Ordering::AcqRel);
        debug_assert!(prev >= page_state::UNFIXED);
    }

    /// Release one buffer fix
    #[inline]
    pub fn unfix(&self) {
        let prev = self.state.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > page_state::UNFIXED);
    }

    /// Index owning this page's hash entries, if any
    pub fn ahi_index(&self) -> Option<Arc<IndexMeta>> {
        self.index.lock().clone()
    }

    /// Whether the page currently carries hash entries
    pub fn is_hashed(&self) -> bool {
        self.index.lock().is_some()
    }

    pub(crate) fn set_ahi_index(&self, v: Option<Arc<IndexMeta>>) {
        *self.index.lock() = v;
    }

    /// Snapshot of the candidate signature (may be torn)
    pub fn candidate_sig(&self) -> (u16, u16, bool) {
        (
            self.n_fields.load(Ordering::Relaxed),
            self.n_bytes.load(Ordering::Relaxed),
            self.left_side.load(Ordering::Relaxed),
        )
    }

    /// Snapshot of the materialized signature (read under partition latch)
    pub fn curr_sig(&self) -> (u16, u16, bool) {
        (
            self.curr_n_fields.load(Ordering::Relaxed),
            self.curr_n_bytes.load(Ordering::Relaxed),
            self.curr_left_side.load(Ordering::Relaxed),
        )
    }

    // Page latch plumbing. Raw latches let a mini-transaction release
    // them outside the acquiring scope.

    /// Acquire the page latch shared
    #[inline]
    pub fn lock_s(&self) {
        self.latch.lock_shared();
    }

    /// Try to acquire the page latch shared
    #[inline]
    pub fn try_lock_s(&self) -> bool {
        self.latch.try_lock_shared()
    }

    /// Release a shared page latch.
    ///
    /// # Safety
    /// The caller must hold a shared latch on this block.
    #[inline]
    pub unsafe fn unlock_s(&self) {
        self.latch.unlock_shared();
    }

    /// Acquire the page latch exclusive
    #[inline]
    pub fn lock_x(&self) {
        self.latch.lock_exclusive();
    }

    /// Try to acquire the page latch exclusive
    #[inline]
    pub fn try_lock_x(&self) -> bool {
        self.latch.try_lock_exclusive()
    }

    /// Release an exclusive page latch.
    ///
    /// # Safety
    /// The caller must hold the exclusive latch on this block.
    #[inline]
    pub unsafe fn unlock_x(&self) {
        self.latch.unlock_exclusive();
    }

    /// Whether any latch is held (debug assertions only)
    #[inline]
    pub fn is_latched(&self) -> bool {
        self.latch.is_locked()
    }
}

// Safety: the frame pointer designates pool-owned memory whose access is
// mediated by the page latch and page state; all control fields are
// atomics or locks.
unsafe impl Send for Block {}
unsafe impl Sync for Block {}
